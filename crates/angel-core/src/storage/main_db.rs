//! Catalog database
//!
//! One file per installation (`<data-dir>/angel.db`). Holds the session
//! catalog, workspaces, provider configuration, credentials, app-scoped
//! key/value state, and the cross-session full-text search index. Session
//! content itself lives in the per-session databases; rows here refer to it
//! by identifier only.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{AngelError, AngelResult};
use crate::types::SessionId;

// Schema version (increment when changing table definitions)
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    workspace_id TEXT,
    name TEXT,
    created_at INTEGER NOT NULL,
    last_updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_workspace ON sessions(workspace_id);
CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(last_updated_at DESC);

CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    root_path TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS provider_configs (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    base_url TEXT NOT NULL,
    config TEXT
);

CREATE TABLE IF NOT EXISTS credentials (
    provider TEXT PRIMARY KEY,
    secret TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS app_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Canonical search index. The FTS5 tables below are projections of this
-- table and are kept in sync purely by the triggers that follow, so any
-- writer (including the session DBs reaching across an attachment) only
-- ever touches messages_searchable.
CREATE TABLE IF NOT EXISTS messages_searchable (
    session_id TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    workspace_id TEXT,
    text TEXT NOT NULL,
    PRIMARY KEY (session_id, message_id)
);

CREATE VIRTUAL TABLE IF NOT EXISTS message_stems
    USING fts5(text, session_id UNINDEXED, message_id UNINDEXED, tokenize='porter unicode61');
CREATE VIRTUAL TABLE IF NOT EXISTS message_trigrams
    USING fts5(text, session_id UNINDEXED, message_id UNINDEXED, tokenize='trigram');

CREATE TRIGGER IF NOT EXISTS searchable_insert AFTER INSERT ON messages_searchable
BEGIN
    INSERT INTO message_stems(rowid, text, session_id, message_id)
        VALUES (new.rowid, new.text, new.session_id, new.message_id);
    INSERT INTO message_trigrams(rowid, text, session_id, message_id)
        VALUES (new.rowid, new.text, new.session_id, new.message_id);
END;

CREATE TRIGGER IF NOT EXISTS searchable_update AFTER UPDATE OF text ON messages_searchable
BEGIN
    UPDATE message_stems SET text = new.text WHERE rowid = old.rowid;
    UPDATE message_trigrams SET text = new.text WHERE rowid = old.rowid;
END;

CREATE TRIGGER IF NOT EXISTS searchable_delete AFTER DELETE ON messages_searchable
BEGIN
    DELETE FROM message_stems WHERE rowid = old.rowid;
    DELETE FROM message_trigrams WHERE rowid = old.rowid;
END;
"#;

/// Catalog row for one session
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub workspace_id: Option<String>,
    pub name: Option<String>,
    pub created_at: i64,
    pub last_updated_at: i64,
}

/// One workspace
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkspaceRecord {
    pub id: String,
    pub name: String,
    pub root_path: Option<String>,
    pub created_at: i64,
}

/// A full-text search hit; the caller opens the owning session database to
/// fetch the full row
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub session_id: String,
    pub message_id: i64,
    pub snippet: String,
}

/// Handle to the catalog database
pub struct MainDb {
    conn: Mutex<Connection>,
    path: std::path::PathBuf,
}

impl MainDb {
    /// Open or create the catalog database
    pub fn open(path: &Path) -> AngelResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    fn init(conn: &Connection) -> AngelResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])?;
        Ok(())
    }

    /// Path of the catalog file, used by session connections for ATTACH
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure against the raw connection
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> AngelResult<T>) -> AngelResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    // =========================================================================
    // Session catalog
    // =========================================================================

    /// Register or refresh a session in the catalog
    pub fn upsert_session(
        &self,
        id: &SessionId,
        workspace_id: Option<&str>,
        name: Option<&str>,
        now: i64,
    ) -> AngelResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, workspace_id, name, created_at, last_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 workspace_id = COALESCE(?2, workspace_id),
                 name = COALESCE(?3, name),
                 last_updated_at = ?4",
            params![id.as_str(), workspace_id, name, now],
        )?;
        Ok(())
    }

    /// Bump a session's activity timestamp
    pub fn touch_session(&self, id: &SessionId, now: i64) -> AngelResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET last_updated_at = ?2 WHERE id = ?1",
            params![id.as_str(), now],
        )?;
        Ok(())
    }

    /// Update a session's display name
    pub fn rename_session(&self, id: &SessionId, name: &str) -> AngelResult<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE sessions SET name = ?2 WHERE id = ?1",
            params![id.as_str(), name],
        )?;
        if n == 0 {
            return Err(AngelError::not_found(format!("session {id}")));
        }
        Ok(())
    }

    /// List sessions, optionally restricted to one workspace. Sub-agent
    /// sessions are excluded: they are surfaced through their parents.
    pub fn list_sessions(&self, workspace_id: Option<&str>) -> AngelResult<Vec<SessionSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, name, created_at, last_updated_at
             FROM sessions
             WHERE (?1 IS NULL OR workspace_id = ?1)
             ORDER BY last_updated_at DESC",
        )?;
        let rows = stmt.query_map(params![workspace_id], |row| {
            Ok(SessionSummary {
                id: row.get(0)?,
                workspace_id: row.get(1)?,
                name: row.get(2)?,
                created_at: row.get(3)?,
                last_updated_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            let row = row?;
            if !SessionId(row.id.clone()).is_sub_agent() {
                out.push(row);
            }
        }
        Ok(out)
    }

    pub fn get_session(&self, id: &SessionId) -> AngelResult<Option<SessionSummary>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, workspace_id, name, created_at, last_updated_at
                 FROM sessions WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(SessionSummary {
                        id: row.get(0)?,
                        workspace_id: row.get(1)?,
                        name: row.get(2)?,
                        created_at: row.get(3)?,
                        last_updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Remove the catalog rows of a session and every sub-agent below it,
    /// including their search-index entries
    pub fn forget_session_tree(&self, id: &SessionId) -> AngelResult<()> {
        let prefix = format!("{}.", id.as_str());
        let like = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM sessions WHERE id = ?1 OR id LIKE ?2 ESCAPE '\\'",
            params![id.as_str(), like],
        )?;
        conn.execute(
            "DELETE FROM messages_searchable WHERE session_id = ?1 OR session_id LIKE ?2 ESCAPE '\\'",
            params![id.as_str(), like],
        )?;
        Ok(())
    }

    /// Temporary sessions (leading dot) idle since before `cutoff`
    pub fn stale_temporary_sessions(&self, cutoff: i64) -> AngelResult<Vec<SessionId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM sessions WHERE id LIKE '.%' AND last_updated_at < ?1",
        )?;
        let ids = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids
            .into_iter()
            .map(SessionId)
            .filter(|id| !id.is_sub_agent())
            .collect())
    }

    // =========================================================================
    // Workspaces
    // =========================================================================

    pub fn upsert_workspace(&self, ws: &WorkspaceRecord) -> AngelResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO workspaces (id, name, root_path, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = ?2, root_path = ?3",
            params![ws.id, ws.name, ws.root_path, ws.created_at],
        )?;
        Ok(())
    }

    pub fn list_workspaces(&self) -> AngelResult<Vec<WorkspaceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, root_path, created_at FROM workspaces ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(WorkspaceRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    root_path: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_workspace(&self, id: &str) -> AngelResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM workspaces WHERE id = ?1", params![id])?;
        Ok(())
    }

    // =========================================================================
    // App key/value (CSRF key and friends)
    // =========================================================================

    /// Fetch a key, initializing it with `init` on first use
    pub fn get_or_init_kv(&self, key: &str, init: impl FnOnce() -> String) -> AngelResult<String> {
        let conn = self.conn.lock();
        if let Some(value) = conn
            .query_row(
                "SELECT value FROM app_kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        {
            return Ok(value);
        }
        let value = init();
        conn.execute(
            "INSERT INTO app_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO NOTHING",
            params![key, value],
        )?;
        // Another writer may have won the race; read back the stored value.
        let stored = conn.query_row(
            "SELECT value FROM app_kv WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )?;
        Ok(stored)
    }

    // =========================================================================
    // Full-text search
    // =========================================================================

    /// Token (stemmed) search across all sessions
    pub fn search_stems(&self, query: &str, limit: usize) -> AngelResult<Vec<SearchHit>> {
        self.search_fts("message_stems", query, limit)
    }

    /// Substring (trigram) search across all sessions
    pub fn search_trigrams(&self, query: &str, limit: usize) -> AngelResult<Vec<SearchHit>> {
        self.search_fts("message_trigrams", query, limit)
    }

    fn search_fts(&self, table: &str, query: &str, limit: usize) -> AngelResult<Vec<SearchHit>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT session_id, message_id, snippet({table}, 0, '', '', '…', 16)
             FROM {table}
             WHERE {table} MATCH ?1
             ORDER BY rank
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![query, limit as i64], |row| {
                Ok(SearchHit {
                    session_id: row.get(0)?,
                    message_id: row.get(1)?,
                    snippet: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of index rows for one session (validation and tests)
    pub fn searchable_count(&self, session_id: &str) -> AngelResult<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM messages_searchable WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, MainDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = MainDb::open(&dir.path().join("angel.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_session_catalog_round_trip() {
        let (_dir, db) = open_temp();
        let id = SessionId("s1".to_string());
        db.upsert_session(&id, Some("ws"), Some("First"), 100).unwrap();

        let got = db.get_session(&id).unwrap().unwrap();
        assert_eq!(got.name.as_deref(), Some("First"));
        assert_eq!(got.workspace_id.as_deref(), Some("ws"));

        db.touch_session(&id, 200).unwrap();
        let got = db.get_session(&id).unwrap().unwrap();
        assert_eq!(got.last_updated_at, 200);
    }

    #[test]
    fn test_list_excludes_sub_agents() {
        let (_dir, db) = open_temp();
        db.upsert_session(&SessionId("a".into()), None, None, 1).unwrap();
        db.upsert_session(&SessionId("a.sub".into()), None, None, 2).unwrap();

        let listed = db.list_sessions(None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "a");
    }

    #[test]
    fn test_list_filters_by_workspace() {
        let (_dir, db) = open_temp();
        db.upsert_session(&SessionId("a".into()), Some("w1"), None, 1).unwrap();
        db.upsert_session(&SessionId("b".into()), Some("w2"), None, 2).unwrap();

        let listed = db.list_sessions(Some("w1")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "a");
    }

    #[test]
    fn test_fts_insert_and_delete_via_canonical_table() {
        let (_dir, db) = open_temp();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages_searchable (session_id, message_id, workspace_id, text)
                 VALUES ('s1', 1, NULL, 'the quick brown fox jumps')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let hits = db.search_stems("jumping", 10).unwrap();
        assert_eq!(hits.len(), 1, "porter stemming should match 'jumps'");
        assert_eq!(hits[0].session_id, "s1");

        let hits = db.search_trigrams("uick bro", 10).unwrap();
        assert_eq!(hits.len(), 1, "trigram search should match substrings");

        db.forget_session_tree(&SessionId("s1".into())).unwrap();
        assert!(db.search_stems("jumping", 10).unwrap().is_empty());
        assert!(db.search_trigrams("uick bro", 10).unwrap().is_empty());
    }

    #[test]
    fn test_forget_session_tree_scopes_by_prefix() {
        let (_dir, db) = open_temp();
        db.upsert_session(&SessionId("a".into()), None, None, 1).unwrap();
        db.upsert_session(&SessionId("a.sub".into()), None, None, 1).unwrap();
        db.upsert_session(&SessionId("ab".into()), None, None, 1).unwrap();

        db.forget_session_tree(&SessionId("a".into())).unwrap();
        assert!(db.get_session(&SessionId("a".into())).unwrap().is_none());
        assert!(db.get_session(&SessionId("a.sub".into())).unwrap().is_none());
        assert!(db.get_session(&SessionId("ab".into())).unwrap().is_some());
    }

    #[test]
    fn test_kv_initializes_once() {
        let (_dir, db) = open_temp();
        let first = db.get_or_init_kv("csrf", || "one".to_string()).unwrap();
        let second = db.get_or_init_kv("csrf", || "two".to_string()).unwrap();
        assert_eq!(first, "one");
        assert_eq!(second, "one");
    }

    #[test]
    fn test_stale_temporary_sessions() {
        let (_dir, db) = open_temp();
        db.upsert_session(&SessionId(".tmp1".into()), None, None, 50).unwrap();
        db.upsert_session(&SessionId(".tmp2".into()), None, None, 500).unwrap();
        db.upsert_session(&SessionId("keep".into()), None, None, 10).unwrap();

        let stale = db.stale_temporary_sessions(100).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].as_str(), ".tmp1");
    }
}
