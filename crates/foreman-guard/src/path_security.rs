// Path security
// Validates every filesystem path before an operation runs: traversal
// patterns (in several encodings), null bytes, unicode lookalikes, symlink
// escapes, and containment in the allowed directories.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// Violations
// ============================================================================

/// Kinds of security violations detected during path validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    PathTraversal,
    SymlinkEscape,
    NullByte,
    UnicodeAttack,
    OutsideAllowed,
    InvalidPath,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PathTraversal => "path_traversal",
            Self::SymlinkEscape => "symlink_escape",
            Self::NullByte => "null_byte",
            Self::UnicodeAttack => "unicode_attack",
            Self::OutsideAllowed => "outside_allowed",
            Self::InvalidPath => "invalid_path",
        }
    }
}

/// Details about a rejected path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub kind: ViolationKind,
    pub original_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Filesystem operation categories for auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    Read,
    Write,
    Delete,
    List,
    Exists,
    Copy,
    CreateDir,
}

impl FileOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Exists => "exists",
            Self::Copy => "copy",
            Self::CreateDir => "create_dir",
        }
    }

    /// Operations that mutate the filesystem and therefore go through the jail.
    pub fn is_mutation(self) -> bool {
        matches!(self, Self::Write | Self::Delete | Self::Copy | Self::CreateDir)
    }
}

// ============================================================================
// In-memory security audit (hot path; durable audit goes through AuditSink)
// ============================================================================

/// One validated (or denied) filesystem operation.
#[derive(Debug, Clone, Serialize)]
pub struct AuditedOperation {
    pub operation: FileOp,
    pub path: String,
    pub resolved_path: String,
    pub success: bool,
    pub allowed: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ring-buffered log of operations and violations.
pub struct SecurityAudit {
    entries: RwLock<VecDeque<AuditedOperation>>,
    violations: RwLock<VecDeque<SecurityViolation>>,
    max_entries: usize,
    max_violations: usize,
}

impl Default for SecurityAudit {
    fn default() -> Self {
        Self::new(1000, 500)
    }
}

impl SecurityAudit {
    pub fn new(max_entries: usize, max_violations: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            violations: RwLock::new(VecDeque::new()),
            max_entries,
            max_violations,
        }
    }

    pub fn log_operation(&self, entry: AuditedOperation) {
        if entry.success && entry.allowed {
            tracing::info!(
                "fs {}: {} -> {} [ok]",
                entry.operation.as_str(),
                entry.path,
                entry.resolved_path
            );
        } else {
            tracing::warn!(
                "fs {}: {} -> {} [denied: {}]",
                entry.operation.as_str(),
                entry.path,
                entry.resolved_path,
                entry.error.as_deref().unwrap_or("unknown")
            );
        }
        let mut entries = self.entries.write().expect("audit lock poisoned");
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn log_violation(&self, violation: SecurityViolation) -> SecurityViolation {
        tracing::warn!(
            "security violation [{}]: {} path={} resolved={:?}",
            violation.kind.as_str(),
            violation.message,
            violation.original_path,
            violation.resolved_path
        );
        let mut violations = self.violations.write().expect("audit lock poisoned");
        while violations.len() >= self.max_violations {
            violations.pop_front();
        }
        violations.push_back(violation.clone());
        violation
    }

    pub fn recent_operations(
        &self,
        limit: usize,
        operation: Option<FileOp>,
        success: Option<bool>,
    ) -> Vec<AuditedOperation> {
        let entries = self.entries.read().expect("audit lock poisoned");
        entries
            .iter()
            .filter(|e| operation.map_or(true, |op| e.operation == op))
            .filter(|e| success.map_or(true, |s| e.success == s))
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn recent_violations(
        &self,
        limit: usize,
        kind: Option<ViolationKind>,
    ) -> Vec<SecurityViolation> {
        let violations = self.violations.read().expect("audit lock poisoned");
        violations
            .iter()
            .filter(|v| kind.map_or(true, |k| v.kind == k))
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> serde_json::Value {
        let entries = self.entries.read().expect("audit lock poisoned");
        let violations = self.violations.read().expect("audit lock poisoned");
        let failed = entries.iter().filter(|e| !e.success).count();
        let denied = entries.iter().filter(|e| !e.allowed).count();
        serde_json::json!({
            "total_operations": entries.len(),
            "failed_operations": failed,
            "denied_operations": denied,
            "total_violations": violations.len(),
        })
    }
}

// ============================================================================
// Pattern tables
// ============================================================================

static TRAVERSAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\.\.[\\/]",
        r"[\\/]\.\.",
        r"^\.\.",
        r"(?i)%2e%2e",
        r"(?i)%252e%252e",
        r"(?i)\.%2e",
        r"(?i)%2e\.",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("traversal pattern"))
    .collect()
});

static NULL_BYTE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"\x00", r"%00", r"\\0"]
        .iter()
        .map(|p| Regex::new(p).expect("null byte pattern"))
        .collect()
});

/// Characters that can mask traversal after NFKC normalization: one-dot
/// leader, two-dot leader, ellipsis, fullwidth '.', '/', '\'.
const UNICODE_DANGEROUS: [char; 6] = [
    '\u{2024}', '\u{2025}', '\u{2026}', '\u{ff0e}', '\u{ff0f}', '\u{ff3c}',
];

// ============================================================================
// Path validator
// ============================================================================

/// Validates paths before filesystem operations.
pub struct PathValidator {
    allowed_dirs: Vec<PathBuf>,
    workspace: PathBuf,
    follow_symlinks: bool,
    max_symlink_depth: usize,
}

impl PathValidator {
    pub fn new(allowed_dirs: Vec<PathBuf>, workspace: PathBuf) -> Self {
        Self {
            allowed_dirs: allowed_dirs.iter().map(|d| realpath_lossy(d)).collect(),
            workspace: realpath_lossy(&workspace),
            follow_symlinks: true,
            max_symlink_depth: 10,
        }
    }

    pub fn with_max_symlink_depth(mut self, depth: usize) -> Self {
        self.max_symlink_depth = depth;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Validate a path for the given operation. `require_allowed_dir` is set
    /// for mutations; reads are validated but not jailed.
    pub fn validate(
        &self,
        path_str: &str,
        _operation: FileOp,
        require_allowed_dir: bool,
        agent_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<PathBuf, SecurityViolation> {
        self.check_null_bytes(path_str, agent_id, session_id)?;
        self.check_unicode(path_str, agent_id, session_id)?;
        self.check_traversal(path_str, agent_id, session_id)?;

        let expanded = if Path::new(path_str).is_absolute() {
            PathBuf::from(path_str)
        } else {
            self.workspace.join(path_str)
        };

        let resolved = self.safe_resolve(&expanded, path_str, agent_id, session_id)?;

        if require_allowed_dir && !self.is_within_allowed(&resolved) {
            return Err(self.violation(
                ViolationKind::OutsideAllowed,
                path_str,
                Some(resolved.display().to_string()),
                format!(
                    "Path {} is outside allowed directories",
                    resolved.display()
                ),
                agent_id,
                session_id,
            ));
        }

        Ok(resolved)
    }

    fn check_null_bytes(
        &self,
        path_str: &str,
        agent_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<(), SecurityViolation> {
        for pattern in NULL_BYTE_PATTERNS.iter() {
            if pattern.is_match(path_str) {
                return Err(self.violation(
                    ViolationKind::NullByte,
                    path_str,
                    None,
                    "Null byte detected in path".to_string(),
                    agent_id,
                    session_id,
                ));
            }
        }
        Ok(())
    }

    fn check_unicode(
        &self,
        path_str: &str,
        agent_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<(), SecurityViolation> {
        let normalized: String = path_str.nfkc().collect();
        if normalized != path_str {
            for ch in UNICODE_DANGEROUS {
                if path_str.contains(ch) {
                    return Err(self.violation(
                        ViolationKind::UnicodeAttack,
                        path_str,
                        None,
                        format!("Suspicious unicode character detected: U+{:04X}", ch as u32),
                        agent_id,
                        session_id,
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_traversal(
        &self,
        path_str: &str,
        agent_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<(), SecurityViolation> {
        for pattern in TRAVERSAL_PATTERNS.iter() {
            if pattern.is_match(path_str) {
                return Err(self.violation(
                    ViolationKind::PathTraversal,
                    path_str,
                    None,
                    format!("Path traversal pattern detected: {}", pattern.as_str()),
                    agent_id,
                    session_id,
                ));
            }
        }
        Ok(())
    }

    /// Follow symlinks with a depth ceiling and loop detection. Nodes under
    /// inspection form the gray set; revisiting one is a loop.
    fn safe_resolve(
        &self,
        path: &Path,
        original: &str,
        agent_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<PathBuf, SecurityViolation> {
        if !self.follow_symlinks {
            return Ok(realpath_lossy(path));
        }

        let mut current = path.to_path_buf();
        let mut gray: HashSet<PathBuf> = HashSet::new();
        let mut depth = 0usize;

        while depth < self.max_symlink_depth {
            if !current.is_symlink() {
                return Ok(realpath_lossy(&current));
            }
            if !gray.insert(current.clone()) {
                return Err(self.violation(
                    ViolationKind::SymlinkEscape,
                    original,
                    Some(current.display().to_string()),
                    "Symlink loop detected".to_string(),
                    agent_id,
                    session_id,
                ));
            }
            let target = std::fs::read_link(&current).map_err(|e| {
                self.violation(
                    ViolationKind::InvalidPath,
                    original,
                    Some(current.display().to_string()),
                    format!("Error resolving symlink: {}", e),
                    agent_id,
                    session_id,
                )
            })?;
            current = if target.is_absolute() {
                target
            } else {
                current
                    .parent()
                    .map(|p| p.join(&target))
                    .unwrap_or(target)
            };
            depth += 1;
        }

        Err(self.violation(
            ViolationKind::SymlinkEscape,
            original,
            Some(current.display().to_string()),
            format!("Symlink depth exceeded ({})", self.max_symlink_depth),
            agent_id,
            session_id,
        ))
    }

    /// Separator-aware containment check against the allowed directories.
    fn is_within_allowed(&self, resolved: &Path) -> bool {
        let resolved = realpath_lossy(resolved);
        let resolved_str = resolved.to_string_lossy();

        for allowed in &self.allowed_dirs {
            let allowed_str = allowed.to_string_lossy();
            if resolved_str == allowed_str {
                return true;
            }
            if resolved_str.starts_with(&format!("{}{}", allowed_str, MAIN_SEPARATOR)) {
                return true;
            }
        }
        false
    }

    fn violation(
        &self,
        kind: ViolationKind,
        original: &str,
        resolved: Option<String>,
        message: String,
        agent_id: Option<&str>,
        session_id: Option<&str>,
    ) -> SecurityViolation {
        SecurityViolation {
            kind,
            original_path: original.to_string(),
            resolved_path: resolved,
            message,
            timestamp: chrono::Utc::now(),
            agent_id: agent_id.map(str::to_string),
            session_id: session_id.map(str::to_string),
        }
    }
}

/// Resolve as much of the path as exists on disk, keeping the non-existent
/// tail verbatim. Unlike `fs::canonicalize` this works for paths about to be
/// created, which is the common case for write validation.
fn realpath_lossy(path: &Path) -> PathBuf {
    if let Ok(real) = path.canonicalize() {
        return real;
    }
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    let mut head = path.to_path_buf();
    loop {
        if let Ok(real) = head.canonicalize() {
            let mut out = real;
            for component in tail.iter().rev() {
                out.push(component);
            }
            return out;
        }
        match (head.parent(), head.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                head = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Last-resort sanitization. Rejection is preferred over sanitization.
pub fn sanitize_path(path_str: &str) -> String {
    let mut sanitized: String = path_str.nfkc().collect();
    sanitized = sanitized.replace('\u{0}', "");
    for ch in UNICODE_DANGEROUS {
        sanitized = sanitized.replace(ch, "");
    }
    sanitized
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn validator(workspace: &Path) -> PathValidator {
        PathValidator::new(vec![workspace.to_path_buf()], workspace.to_path_buf())
    }

    #[test]
    fn traversal_patterns_detected() {
        let temp = tempdir().unwrap();
        let v = validator(temp.path());
        for malicious in [
            "../etc/passwd",
            "..\\windows\\system32",
            "foo/../../etc/shadow",
            "%2e%2e/secret",
            "%252e%252e/secret",
            "..",
        ] {
            let err = v
                .validate(malicious, FileOp::Write, true, None, None)
                .unwrap_err();
            assert_eq!(err.kind, ViolationKind::PathTraversal, "path: {malicious}");
        }
    }

    #[test]
    fn safe_paths_not_flagged() {
        let temp = tempdir().unwrap();
        let v = validator(temp.path());
        for safe in ["notes.txt", "src/main.rs", "a.b.c/file.tar.gz"] {
            assert!(v.validate(safe, FileOp::Write, true, None, None).is_ok());
        }
    }

    #[test]
    fn null_bytes_blocked() {
        let temp = tempdir().unwrap();
        let v = validator(temp.path());
        for bad in ["file\u{0}.txt", "file%00.txt", "file\\0.txt"] {
            let err = v.validate(bad, FileOp::Write, true, None, None).unwrap_err();
            assert_eq!(err.kind, ViolationKind::NullByte);
        }
    }

    #[test]
    fn fullwidth_unicode_blocked() {
        let temp = tempdir().unwrap();
        let v = validator(temp.path());
        // Fullwidth full stops normalize to '.' under NFKC.
        let err = v
            .validate("\u{ff0e}\u{ff0e}/etc/passwd", FileOp::Write, true, None, None)
            .unwrap_err();
        assert_eq!(err.kind, ViolationKind::UnicodeAttack);
    }

    #[test]
    fn relative_path_resolves_into_workspace() {
        let temp = tempdir().unwrap();
        let v = validator(temp.path());
        let resolved = v
            .validate("sub/file.txt", FileOp::Write, true, None, None)
            .unwrap();
        assert!(resolved.starts_with(temp.path().canonicalize().unwrap()));
    }

    #[test]
    fn absolute_path_outside_allowed_blocked() {
        let temp = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let v = validator(temp.path());
        let target = outside.path().join("file.txt");
        let err = v
            .validate(&target.display().to_string(), FileOp::Write, true, None, None)
            .unwrap_err();
        assert_eq!(err.kind, ViolationKind::OutsideAllowed);
    }

    #[test]
    fn reads_outside_workspace_are_not_jailed() {
        let temp = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let v = validator(temp.path());
        let target = outside.path().join("file.txt");
        assert!(v
            .validate(&target.display().to_string(), FileOp::Read, false, None, None)
            .is_ok());
    }

    #[test]
    fn sibling_prefix_directory_is_not_contained() {
        // /tmp/ws-evil must not pass a containment check for /tmp/ws.
        let temp = tempdir().unwrap();
        let ws = temp.path().join("ws");
        let evil = temp.path().join("ws-evil");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&evil).unwrap();
        let v = PathValidator::new(vec![ws.clone()], ws);
        let err = v
            .validate(
                &evil.join("file.txt").display().to_string(),
                FileOp::Write,
                true,
                None,
                None,
            )
            .unwrap_err();
        assert_eq!(err.kind, ViolationKind::OutsideAllowed);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_blocked() {
        let temp = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let ws = temp.path();
        let link = ws.join("sneaky");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();
        let v = validator(ws);
        let err = v
            .validate(
                &link.join("file.txt").display().to_string(),
                FileOp::Write,
                true,
                None,
                None,
            )
            .unwrap_err();
        assert_eq!(err.kind, ViolationKind::OutsideAllowed);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loop_detected() {
        let temp = tempdir().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::os::unix::fs::symlink(&b, &a).unwrap();
        std::os::unix::fs::symlink(&a, &b).unwrap();
        let v = validator(temp.path());
        let err = v
            .validate(&a.display().to_string(), FileOp::Write, true, None, None)
            .unwrap_err();
        assert_eq!(err.kind, ViolationKind::SymlinkEscape);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_depth_limit_enforced() {
        let temp = tempdir().unwrap();
        let depth = 4usize;
        // Chain of depth + 1 links ending at a real file.
        let real = temp.path().join("real.txt");
        std::fs::write(&real, "x").unwrap();
        let mut prev = real.clone();
        for i in 0..=depth {
            let link = temp.path().join(format!("link{}", i));
            std::os::unix::fs::symlink(&prev, &link).unwrap();
            prev = link;
        }
        let v = validator(temp.path()).with_max_symlink_depth(depth);
        let err = v
            .validate(&prev.display().to_string(), FileOp::Write, true, None, None)
            .unwrap_err();
        assert_eq!(err.kind, ViolationKind::SymlinkEscape);
    }

    #[test]
    fn audit_caps_and_stats() {
        let audit = SecurityAudit::new(3, 2);
        for i in 0..5 {
            audit.log_operation(AuditedOperation {
                operation: FileOp::Read,
                path: format!("p{}", i),
                resolved_path: format!("p{}", i),
                success: i % 2 == 0,
                allowed: true,
                timestamp: chrono::Utc::now(),
                agent_id: None,
                error: None,
            });
        }
        assert_eq!(audit.recent_operations(10, None, None).len(), 3);
        assert_eq!(audit.recent_operations(10, None, Some(false)).len(), 1);

        for i in 0..4 {
            audit.log_violation(SecurityViolation {
                kind: ViolationKind::NullByte,
                original_path: format!("v{}", i),
                resolved_path: None,
                message: "test".to_string(),
                timestamp: chrono::Utc::now(),
                agent_id: None,
                session_id: None,
            });
        }
        assert_eq!(audit.recent_violations(10, None).len(), 2);
        let stats = audit.stats();
        assert_eq!(stats["total_violations"], 2);
    }

    #[test]
    fn sanitize_strips_dangerous_chars() {
        let sanitized = sanitize_path("file\u{0}\u{ff0e}\u{ff0e}name");
        assert!(!sanitized.contains('\u{0}'));
        assert!(!sanitized.contains('\u{ff0e}'));
    }
}
