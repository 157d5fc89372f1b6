// Session resolver
// Maps (channel, external thread id) to exactly one persistent session and
// persists channel-neutral message history. Content passes through the
// redaction pipeline before it is stored.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use foreman_guard::RedactionPipeline;
use foreman_types::{ChannelKind, MessageEnvelope, MessageRole, Session, StoredMessage};

use crate::db::{Database, StoreError};
use crate::Result;

/// Result of resolving an envelope to a session.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub session_id: String,
    pub is_new: bool,
    pub channel: ChannelKind,
    pub external_thread_id: String,
}

#[derive(Clone)]
pub struct SessionResolver {
    db: Database,
    redaction: Arc<RedactionPipeline>,
}

impl SessionResolver {
    pub fn new(db: Database, redaction: Arc<RedactionPipeline>) -> Self {
        Self { db, redaction }
    }

    /// Look up the session bound to the envelope's (channel, thread) pair,
    /// creating one when the thread is unknown. The pair is unique across
    /// all sessions.
    pub fn resolve_or_create(
        &self,
        envelope: &MessageEnvelope,
        default_agent_id: &str,
    ) -> Result<ResolvedSession> {
        let channel = envelope.channel.as_str();

        let existing: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT session_id FROM channel_threads
                 WHERE channel = ?1 AND external_thread_id = ?2",
                params![channel, envelope.external_thread_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(session_id) = existing {
            return Ok(ResolvedSession {
                session_id,
                is_new: false,
                channel: envelope.channel,
                external_thread_id: envelope.external_thread_id.clone(),
            });
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let title = envelope.text.chars().take(60).collect::<String>();

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sessions (id, agent_id, title, channel, external_thread_id,
                                   external_user_id, external_user_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session_id,
                default_agent_id,
                title,
                channel,
                envelope.external_thread_id,
                envelope.sender_id,
                envelope.sender_name,
                now,
                now,
            ],
        )?;
        tx.execute(
            "INSERT INTO channel_threads (channel, external_thread_id, session_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![channel, envelope.external_thread_id, session_id, now],
        )?;
        tx.commit()?;

        tracing::info!(
            "created session {} for {}:{}",
            session_id,
            channel,
            envelope.external_thread_id
        );

        Ok(ResolvedSession {
            session_id,
            is_new: true,
            channel: envelope.channel,
            external_thread_id: envelope.external_thread_id.clone(),
        })
    }

    /// Persist a message into a session. The envelope supplies the source
    /// channel and external ids; internally generated messages default to
    /// the web channel. Redaction pre-hooks run before the write.
    pub fn persist_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        envelope: Option<&MessageEnvelope>,
    ) -> Result<StoredMessage> {
        let (redacted_content, was_redacted) = self.redaction.apply_pre(content);

        let message = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: redacted_content,
            source_channel: envelope.map(|e| e.channel).unwrap_or(ChannelKind::Web),
            external_message_id: envelope.map(|e| e.external_message_id.clone()),
            sender_id: envelope.map(|e| e.sender_id.clone()),
            sender_name: envelope.and_then(|e| e.sender_name.clone()),
            attachments: envelope.map(|e| e.attachments.clone()).unwrap_or_default(),
            redacted: was_redacted,
            created_at: Utc::now(),
        };

        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO messages (id, session_id, role, content, source_channel,
                                   external_message_id, sender_id, sender_name, attachments_json,
                                   redacted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id,
                message.session_id,
                message.role.as_str(),
                message.content,
                message.source_channel.as_str(),
                message.external_message_id,
                message.sender_id,
                message.sender_name,
                serde_json::to_string(&message.attachments)?,
                message.redacted,
                message.created_at,
            ],
        )?;
        conn.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
            params![session_id, message.created_at],
        )?;

        Ok(message)
    }

    /// Chronological history for a session. Channel is not a filter here;
    /// history is keyed by session id alone.
    pub fn session_history(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, source_channel, external_message_id,
                    sender_id, sender_name, attachments_json, redacted, created_at
             FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], message_from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Apply the post-retrieval redaction filters to message content.
    pub fn filter_for_egress(&self, content: &str) -> String {
        self.redaction.apply_post(content)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, title, channel, external_thread_id, external_user_id,
                    external_user_name, created_at, updated_at
             FROM sessions WHERE id = ?1",
        )?;
        stmt.query_row(params![session_id], session_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(format!("session {}", session_id))
                }
                other => StoreError::Sqlite(other),
            })
    }

    /// List sessions, optionally filtered by channel. The channel filter is
    /// an orthogonal dimension over the same session set.
    pub fn list_channel_sessions(&self, channel: Option<ChannelKind>) -> Result<Vec<Session>> {
        let conn = self.db.conn();
        let mut sessions = Vec::new();
        match channel {
            Some(channel) => {
                let mut stmt = conn.prepare(
                    "SELECT id, agent_id, title, channel, external_thread_id, external_user_id,
                            external_user_name, created_at, updated_at
                     FROM sessions WHERE channel = ?1 ORDER BY updated_at DESC",
                )?;
                let rows = stmt.query_map(params![channel.as_str()], session_from_row)?;
                for row in rows {
                    sessions.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, agent_id, title, channel, external_thread_id, external_user_id,
                            external_user_name, created_at, updated_at
                     FROM sessions ORDER BY updated_at DESC",
                )?;
                let rows = stmt.query_map([], session_from_row)?;
                for row in rows {
                    sessions.push(row?);
                }
            }
        }
        Ok(sessions)
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let channel_str: String = row.get(3)?;
    Ok(Session {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        title: row.get(2)?,
        channel: ChannelKind::parse(&channel_str).unwrap_or(ChannelKind::Web),
        external_thread_id: row.get(4)?,
        external_user_id: row.get(5)?,
        external_user_name: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role_str: String = row.get(2)?;
    let channel_str: String = row.get(4)?;
    let attachments_json: String = row.get(8)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: MessageRole::parse(&role_str).unwrap_or(MessageRole::System),
        content: row.get(3)?,
        source_channel: ChannelKind::parse(&channel_str).unwrap_or(ChannelKind::Web),
        external_message_id: row.get(5)?,
        sender_id: row.get(6)?,
        sender_name: row.get(7)?,
        attachments: serde_json::from_str(&attachments_json).unwrap_or_default(),
        redacted: row.get(9)?,
        created_at: row.get(10)?,
    })
}

// ============================================================================
// Tests
// ============================================================================
