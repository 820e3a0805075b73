//! Core identifier and shared types

use serde::{Deserialize, Serialize};

use crate::error::{AngelError, AngelResult};

/// Session identifier.
///
/// The identifier is an opaque string with two structural conventions:
/// a leading `.` marks a temporary session, and an inner `.` marks a
/// sub-agent session whose parent is the prefix before the last dot.
/// The portion before the *first* dot (ignoring a temporary leading dot)
/// selects the database file the session lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a fresh main-session identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a fresh temporary-session identifier (leading dot)
    pub fn generate_temporary() -> Self {
        Self(format!(".{}", uuid::Uuid::new_v4()))
    }

    /// Parse and validate an identifier supplied by a client
    pub fn parse(s: &str) -> AngelResult<Self> {
        if s.is_empty() || s == "." {
            return Err(AngelError::validation("empty session id"));
        }
        if s.contains('/') || s.contains('\\') || s.contains('\0') {
            return Err(AngelError::validation(format!(
                "session id contains path characters: {s:?}"
            )));
        }
        // A temporary marker is a single leading dot; ".." would collapse
        // into a path traversal once mapped to a database file name.
        if s.starts_with("..") {
            return Err(AngelError::validation("session id may not start with '..'"));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a temporary session (leading dot)
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with('.')
    }

    /// Whether this is a sub-agent session (dot after the first character)
    pub fn is_sub_agent(&self) -> bool {
        self.trimmed().contains('.')
    }

    /// Identifier of the parent session, if this is a sub-agent
    pub fn parent(&self) -> Option<SessionId> {
        let trimmed = self.trimmed();
        let idx = trimmed.rfind('.')?;
        let prefix_len = self.0.len() - trimmed.len();
        Some(SessionId(self.0[..prefix_len + idx].to_string()))
    }

    /// The main-session prefix that names the database file: everything
    /// before the first dot (a temporary leading dot is part of the name).
    pub fn db_key(&self) -> String {
        let trimmed = self.trimmed();
        let prefix_len = self.0.len() - trimmed.len();
        match trimmed.find('.') {
            Some(idx) => self.0[..prefix_len + idx].to_string(),
            None => self.0.clone(),
        }
    }

    /// The identifier local to the session database: everything after the
    /// first dot, or the empty string for the main session itself.
    pub fn local_id(&self) -> String {
        let trimmed = self.trimmed();
        match trimmed.find('.') {
            Some(idx) => trimmed[idx + 1..].to_string(),
            None => String::new(),
        }
    }

    /// Rebuild a full identifier from a db key and a local identifier
    pub fn from_parts(db_key: &str, local_id: &str) -> Self {
        if local_id.is_empty() {
            Self(db_key.to_string())
        } else {
            Self(format!("{db_key}.{local_id}"))
        }
    }

    /// Whether `other` is this session or one of its sub-agents
    pub fn covers(&self, other: &SessionId) -> bool {
        other.0 == self.0 || other.0.starts_with(&format!("{}.", self.0))
    }

    fn trimmed(&self) -> &str {
        self.0.strip_prefix('.').unwrap_or(&self.0)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier, dense and monotonic within one session database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Branch identifier within one session database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId(pub i64);

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workspace identifier in the catalog database
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_session() {
        let id = SessionId::parse("abc123").unwrap();
        assert!(!id.is_temporary());
        assert!(!id.is_sub_agent());
        assert_eq!(id.db_key(), "abc123");
        assert_eq!(id.local_id(), "");
        assert_eq!(id.parent(), None);
    }

    #[test]
    fn test_temporary_session() {
        let id = SessionId::parse(".abc123").unwrap();
        assert!(id.is_temporary());
        assert!(!id.is_sub_agent());
        assert_eq!(id.db_key(), ".abc123");
        assert_eq!(id.local_id(), "");
    }

    #[test]
    fn test_sub_agent() {
        let id = SessionId::parse("abc.sub1").unwrap();
        assert!(id.is_sub_agent());
        assert_eq!(id.db_key(), "abc");
        assert_eq!(id.local_id(), "sub1");
        assert_eq!(id.parent().unwrap().as_str(), "abc");
    }

    #[test]
    fn test_nested_sub_agent() {
        let id = SessionId::parse("abc.sub1.sub2").unwrap();
        assert_eq!(id.db_key(), "abc");
        assert_eq!(id.local_id(), "sub1.sub2");
        assert_eq!(id.parent().unwrap().as_str(), "abc.sub1");
    }

    #[test]
    fn test_temporary_sub_agent() {
        let id = SessionId::parse(".abc.sub1").unwrap();
        assert!(id.is_temporary());
        assert!(id.is_sub_agent());
        assert_eq!(id.db_key(), ".abc");
        assert_eq!(id.local_id(), "sub1");
        assert_eq!(id.parent().unwrap().as_str(), ".abc");
    }

    #[test]
    fn test_from_parts_round_trip() {
        for raw in ["abc", ".abc", "abc.s1", ".abc.s1.s2"] {
            let id = SessionId::parse(raw).unwrap();
            let rebuilt = SessionId::from_parts(&id.db_key(), &id.local_id());
            assert_eq!(rebuilt, id);
        }
    }

    #[test]
    fn test_covers_prefix() {
        let parent = SessionId::parse("abc").unwrap();
        assert!(parent.covers(&SessionId::parse("abc").unwrap()));
        assert!(parent.covers(&SessionId::parse("abc.sub").unwrap()));
        assert!(!parent.covers(&SessionId::parse("abcd").unwrap()));
    }

    #[test]
    fn test_rejects_bad_ids() {
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("..").is_err());
        assert!(SessionId::parse("a/b").is_err());
        assert!(SessionId::parse("..evil").is_err());
    }
}
