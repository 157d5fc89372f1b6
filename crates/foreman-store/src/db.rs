// Database handle and schema
// One SQLite connection behind a mutex; WAL mode; schema applied on open.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    original_prompt  TEXT NOT NULL,
    workspace_path   TEXT NOT NULL,
    config_json      TEXT NOT NULL,
    state            TEXT NOT NULL,
    plan_json        TEXT,
    graph_snapshot   TEXT,
    resume_state     TEXT,
    branch_name      TEXT,
    pr_url           TEXT,
    error            TEXT,
    total_iterations INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    paused_at        TEXT,
    completed_at     TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    id                 TEXT PRIMARY KEY,
    run_id             TEXT NOT NULL REFERENCES runs(id),
    title              TEXT NOT NULL,
    description        TEXT NOT NULL,
    agent_id           TEXT NOT NULL,
    depends_on_json    TEXT NOT NULL,
    quality_gates_json TEXT NOT NULL,
    target_files_json  TEXT NOT NULL,
    priority           INTEGER NOT NULL DEFAULT 0,
    max_attempts       INTEGER NOT NULL DEFAULT 3,
    skippable          INTEGER NOT NULL DEFAULT 0,
    status             TEXT NOT NULL,
    final_commit       TEXT,
    error              TEXT,
    created_at         TEXT NOT NULL,
    started_at         TEXT,
    completed_at       TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks(run_id);

CREATE TABLE IF NOT EXISTS attempts (
    id                TEXT PRIMARY KEY,
    task_id           TEXT NOT NULL REFERENCES tasks(id),
    number            INTEGER NOT NULL,
    started_at        TEXT NOT NULL,
    completed_at      TEXT,
    success           INTEGER NOT NULL DEFAULT 0,
    agent_response    TEXT NOT NULL DEFAULT '',
    gate_results_json TEXT NOT NULL DEFAULT '{}',
    commit_ref        TEXT,
    feedback          TEXT,
    created_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attempts_task ON attempts(task_id);

CREATE TABLE IF NOT EXISTS artifacts (
    id           TEXT PRIMARY KEY,
    run_id       TEXT NOT NULL,
    task_id      TEXT NOT NULL,
    name         TEXT NOT NULL,
    kind         TEXT NOT NULL,
    path         TEXT,
    content      TEXT,
    content_hash TEXT,
    produced_by  TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id);

CREATE TABLE IF NOT EXISTS task_logs (
    id                   TEXT PRIMARY KEY,
    run_id               TEXT NOT NULL,
    task_id              TEXT NOT NULL,
    message              TEXT NOT NULL,
    tool_invocation_json TEXT,
    created_at           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id);

CREATE TABLE IF NOT EXISTS audit_events (
    id            TEXT PRIMARY KEY,
    category      TEXT NOT NULL,
    action        TEXT NOT NULL,
    session_id    TEXT,
    task_id       TEXT,
    agent_id      TEXT,
    success       INTEGER NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_tool (
    id                   TEXT PRIMARY KEY,
    tool_name            TEXT NOT NULL,
    tool_action          TEXT,
    params_redacted_json TEXT NOT NULL,
    params_hash          TEXT NOT NULL,
    session_id           TEXT,
    task_id              TEXT,
    agent_id             TEXT,
    success              INTEGER,
    output_length        INTEGER,
    output_hash          TEXT,
    error                TEXT,
    duration_ms          REAL,
    policy_blocked       INTEGER NOT NULL DEFAULT 0,
    sandbox_violation    INTEGER NOT NULL DEFAULT 0,
    budget_exceeded      INTEGER NOT NULL DEFAULT 0,
    approval_rejected    INTEGER NOT NULL DEFAULT 0,
    created_at           TEXT NOT NULL,
    completed_at         TEXT
);

CREATE TABLE IF NOT EXISTS audit_file (
    id              TEXT PRIMARY KEY,
    path            TEXT NOT NULL,
    operation       TEXT NOT NULL,
    before_hash     TEXT,
    after_hash      TEXT,
    diff_compressed BLOB,
    lines_added     INTEGER NOT NULL DEFAULT 0,
    lines_removed   INTEGER NOT NULL DEFAULT 0,
    in_workspace    INTEGER NOT NULL,
    blocked         INTEGER NOT NULL,
    approval_id     TEXT,
    success         INTEGER NOT NULL,
    error           TEXT,
    session_id      TEXT,
    task_id         TEXT,
    agent_id        TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_llm (
    id             TEXT PRIMARY KEY,
    direction      TEXT NOT NULL,
    content_hash   TEXT NOT NULL,
    content_length INTEGER NOT NULL,
    content_body   TEXT,
    session_id     TEXT,
    task_id        TEXT,
    agent_id       TEXT,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_budget (
    id          TEXT PRIMARY KEY,
    budget_kind TEXT NOT NULL,
    current_value REAL NOT NULL,
    limit_value REAL NOT NULL,
    exceeded    INTEGER NOT NULL,
    session_id  TEXT,
    task_id     TEXT,
    agent_id    TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id                 TEXT PRIMARY KEY,
    agent_id           TEXT NOT NULL,
    title              TEXT,
    channel            TEXT NOT NULL,
    external_thread_id TEXT NOT NULL,
    external_user_id   TEXT,
    external_user_name TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    UNIQUE(channel, external_thread_id)
);

CREATE TABLE IF NOT EXISTS channel_threads (
    channel            TEXT NOT NULL,
    external_thread_id TEXT NOT NULL,
    session_id         TEXT NOT NULL REFERENCES sessions(id),
    created_at         TEXT NOT NULL,
    PRIMARY KEY (channel, external_thread_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id                  TEXT PRIMARY KEY,
    session_id          TEXT NOT NULL REFERENCES sessions(id),
    role                TEXT NOT NULL,
    content             TEXT NOT NULL,
    source_channel      TEXT NOT NULL,
    external_message_id TEXT,
    sender_id           TEXT,
    sender_name         TEXT,
    attachments_json    TEXT NOT NULL DEFAULT '[]',
    redacted            INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
"#;

/// Shared database handle. Repositories clone the inner connection handle;
/// writes are serialized by the mutex.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("database lock poisoned")
    }
}
