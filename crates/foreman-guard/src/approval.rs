// Diff-first approvals
// High-impact actions (write/delete/shell) block until a human approves,
// rejects, or the request expires. The proposed content is hashed at
// creation so tampering between approval and execution is detectable.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use similar::TextDiff;
use thiserror::Error;
use tokio::sync::{watch, RwLock};

use crate::audit::hash_content;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Write,
    Delete,
    Shell,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Shell => "shell",
        }
    }
}

/// A pending high-impact action awaiting a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub action: ActionKind,
    /// File path for write/delete, command for shell
    pub target: String,
    /// sha256 of the proposed content (or command), for tamper detection
    pub content_hash: String,
    /// Unified diff shown to the approver
    pub diff: String,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub timeout_secs: u64,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Approval not found: {0}")]
    NotFound(String),
    #[error("Approval {0} is not pending")]
    NotPending(String),
    #[error("Approval channel closed for {0}")]
    ChannelClosed(String),
}

type CreatedHook = Box<dyn Fn(&PendingApproval) + Send + Sync>;

// ============================================================================
// Manager
// ============================================================================

/// Process-local approval store. Waits use a watch channel keyed by
/// approval id.
#[derive(Clone, Default)]
pub struct ApprovalManager {
    approvals: Arc<RwLock<HashMap<String, PendingApproval>>>,
    waiters: Arc<RwLock<HashMap<String, watch::Sender<ApprovalStatus>>>>,
    created_hooks: Arc<RwLock<Vec<CreatedHook>>>,
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked when an approval is created (e.g. to
    /// surface it to observers).
    pub async fn on_created(&self, hook: CreatedHook) {
        self.created_hooks.write().await.push(hook);
    }

    pub async fn create_write_approval(
        &self,
        session_id: &str,
        agent_id: &str,
        task_id: Option<&str>,
        file_path: &str,
        original_content: Option<&str>,
        new_content: &str,
        timeout_secs: u64,
    ) -> PendingApproval {
        let diff = unified_diff(original_content.unwrap_or(""), new_content, file_path);
        self.insert(PendingApproval {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            task_id: task_id.map(str::to_string),
            action: ActionKind::Write,
            target: file_path.to_string(),
            content_hash: hash_content(new_content),
            diff,
            status: ApprovalStatus::Pending,
            note: None,
            created_at: chrono::Utc::now(),
            timeout_secs,
        })
        .await
    }

    pub async fn create_delete_approval(
        &self,
        session_id: &str,
        agent_id: &str,
        task_id: Option<&str>,
        file_path: &str,
        original_content: Option<&str>,
        timeout_secs: u64,
    ) -> PendingApproval {
        let original = original_content.unwrap_or("");
        let diff = unified_diff(original, "", file_path);
        self.insert(PendingApproval {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            task_id: task_id.map(str::to_string),
            action: ActionKind::Delete,
            target: file_path.to_string(),
            content_hash: hash_content(original),
            diff,
            status: ApprovalStatus::Pending,
            note: None,
            created_at: chrono::Utc::now(),
            timeout_secs,
        })
        .await
    }

    pub async fn create_shell_approval(
        &self,
        session_id: &str,
        agent_id: &str,
        task_id: Option<&str>,
        command: &str,
        workdir: Option<&str>,
        timeout_secs: u64,
    ) -> PendingApproval {
        let diff = match workdir {
            Some(dir) => format!("$ {}  (in {})", command, dir),
            None => format!("$ {}", command),
        };
        self.insert(PendingApproval {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            task_id: task_id.map(str::to_string),
            action: ActionKind::Shell,
            target: command.to_string(),
            content_hash: hash_content(command),
            diff,
            status: ApprovalStatus::Pending,
            note: None,
            created_at: chrono::Utc::now(),
            timeout_secs,
        })
        .await
    }

    async fn insert(&self, approval: PendingApproval) -> PendingApproval {
        let (tx, _rx) = watch::channel(ApprovalStatus::Pending);
        self.waiters.write().await.insert(approval.id.clone(), tx);
        self.approvals
            .write()
            .await
            .insert(approval.id.clone(), approval.clone());
        for hook in self.created_hooks.read().await.iter() {
            hook(&approval);
        }
        approval
    }

    pub async fn get(&self, id: &str) -> Option<PendingApproval> {
        self.approvals.read().await.get(id).cloned()
    }

    pub async fn pending_for_session(&self, session_id: &str) -> Vec<PendingApproval> {
        self.approvals
            .read()
            .await
            .values()
            .filter(|a| a.session_id == session_id && a.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn approve(&self, id: &str, note: Option<String>) -> Result<(), ApprovalError> {
        self.resolve(id, ApprovalStatus::Approved, note).await
    }

    pub async fn reject(&self, id: &str, note: Option<String>) -> Result<(), ApprovalError> {
        self.resolve(id, ApprovalStatus::Rejected, note).await
    }

    async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        note: Option<String>,
    ) -> Result<(), ApprovalError> {
        {
            let mut approvals = self.approvals.write().await;
            let approval = approvals
                .get_mut(id)
                .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
            if approval.status != ApprovalStatus::Pending {
                return Err(ApprovalError::NotPending(id.to_string()));
            }
            approval.status = status;
            approval.note = note;
        }
        if let Some(tx) = self.waiters.read().await.get(id) {
            let _ = tx.send(status);
        }
        Ok(())
    }

    /// Block until the approval is decided or its timeout elapses. On
    /// timeout the approval is marked expired.
    pub async fn wait(&self, id: &str) -> Result<ApprovalStatus, ApprovalError> {
        let (timeout_secs, mut rx) = {
            let approvals = self.approvals.read().await;
            let approval = approvals
                .get(id)
                .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
            if approval.status != ApprovalStatus::Pending {
                return Ok(approval.status);
            }
            let waiters = self.waiters.read().await;
            let tx = waiters
                .get(id)
                .ok_or_else(|| ApprovalError::ChannelClosed(id.to_string()))?;
            (approval.timeout_secs, tx.subscribe())
        };

        let deadline = tokio::time::Duration::from_secs(timeout_secs);
        let wait = async {
            loop {
                if *rx.borrow() != ApprovalStatus::Pending {
                    return *rx.borrow();
                }
                if rx.changed().await.is_err() {
                    return ApprovalStatus::Expired;
                }
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(status) => Ok(status),
            Err(_) => {
                let mut approvals = self.approvals.write().await;
                if let Some(approval) = approvals.get_mut(id) {
                    if approval.status == ApprovalStatus::Pending {
                        approval.status = ApprovalStatus::Expired;
                    }
                    Ok(approval.status)
                } else {
                    Ok(ApprovalStatus::Expired)
                }
            }
        }
    }

    /// Re-hash content at execution time and compare to the hash stored at
    /// creation. A mismatch means the payload changed after approval.
    pub async fn verify_content(&self, id: &str, content: &str) -> Result<bool, ApprovalError> {
        let approvals = self.approvals.read().await;
        let approval = approvals
            .get(id)
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
        Ok(approval.content_hash == hash_content(content))
    }
}

/// Unified diff for display in the approval UI.
fn unified_diff(original: &str, new: &str, path: &str) -> String {
    TextDiff::from_lines(original, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", path), &format!("b/{}", path))
        .to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn write_approval_generates_diff_and_hash() {
        let manager = ApprovalManager::new();
        let approval = manager
            .create_write_approval(
                "s1",
                "coder",
                Some("t1"),
                "src/lib.rs",
                Some("old line\n"),
                "new line\n",
                60,
            )
            .await;
        assert_eq!(approval.action, ActionKind::Write);
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert!(approval.diff.contains("-old line"));
        assert!(approval.diff.contains("+new line"));
        assert_eq!(approval.content_hash, hash_content("new line\n"));
    }

    #[tokio::test]
    async fn approve_sets_status_and_wakes_waiter() {
        let manager = ApprovalManager::new();
        let approval = manager
            .create_write_approval("s1", "coder", None, "f.txt", None, "content", 60)
            .await;

        let waiter = {
            let manager = manager.clone();
            let id = approval.id.clone();
            tokio::spawn(async move { manager.wait(&id).await })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        manager
            .approve(&approval.id, Some("looks good".to_string()))
            .await
            .unwrap();
        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status, ApprovalStatus::Approved);
        let stored = manager.get(&approval.id).await.unwrap();
        assert_eq!(stored.note.as_deref(), Some("looks good"));
    }

    #[tokio::test]
    async fn reject_resolves_wait() {
        let manager = ApprovalManager::new();
        let approval = manager
            .create_delete_approval("s1", "coder", None, "f.txt", Some("bye"), 60)
            .await;
        manager.reject(&approval.id, None).await.unwrap();
        let status = manager.wait(&approval.id).await.unwrap();
        assert_eq!(status, ApprovalStatus::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_to_expired() {
        let manager = ApprovalManager::new();
        let approval = manager
            .create_shell_approval("s1", "devops", None, "rm -rf build", None, 1)
            .await;
        let status = manager.wait(&approval.id).await.unwrap();
        assert_eq!(status, ApprovalStatus::Expired);
        let stored = manager.get(&approval.id).await.unwrap();
        assert_eq!(stored.status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn double_resolution_is_rejected() {
        let manager = ApprovalManager::new();
        let approval = manager
            .create_write_approval("s1", "coder", None, "f.txt", None, "x", 60)
            .await;
        manager.approve(&approval.id, None).await.unwrap();
        let err = manager.reject(&approval.id, None).await.unwrap_err();
        assert!(matches!(err, ApprovalError::NotPending(_)));
    }

    #[tokio::test]
    async fn pending_filtered_by_session() {
        let manager = ApprovalManager::new();
        manager
            .create_write_approval("s1", "coder", None, "a.txt", None, "x", 60)
            .await;
        manager
            .create_write_approval("s2", "coder", None, "b.txt", None, "y", 60)
            .await;
        let pending = manager.pending_for_session("s1").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, "a.txt");
    }

    #[tokio::test]
    async fn tamper_detection_via_hash() {
        let manager = ApprovalManager::new();
        let approval = manager
            .create_write_approval("s1", "coder", None, "f.txt", None, "approved content", 60)
            .await;
        assert!(manager
            .verify_content(&approval.id, "approved content")
            .await
            .unwrap());
        assert!(!manager
            .verify_content(&approval.id, "tampered content")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn created_hook_fires() {
        let manager = ApprovalManager::new();
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        manager
            .on_created(Box::new(|_| {
                COUNT.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        manager
            .create_write_approval("s1", "coder", None, "f.txt", None, "x", 60)
            .await;
        assert_eq!(COUNT.load(Ordering::SeqCst), 1);
    }
}
