//! Per-session-group database
//!
//! One file per main session (`<data-dir>/sessions/<db-key>.db`). The main
//! session and all of its sub-agents share the file and store *local*
//! identifiers: the empty string for the main session, the suffix after the
//! first dot for sub-agents.
//!
//! Every connection attaches the catalog database under the fixed alias
//! `catalog` and installs TEMP triggers that mirror indexed message text
//! into the catalog's search index. TEMP triggers are used deliberately:
//! they are the only trigger form whose body may reference an attached
//! schema, so the mirror is active exactly while a session connection is
//! open. Blob reference counting, by contrast, is purely intra-database and
//! uses persistent triggers: application code never adjusts a refcount.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use sha2::{Digest, Sha512_256};

use crate::error::{AngelError, AngelResult};
use crate::storage::message::{
    attachments_from_json, attachments_to_json, Attachment, MessageKind, MessageRecord, NewMessage,
};
use crate::types::{BranchId, MessageId};

pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    local_id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    last_updated_at INTEGER NOT NULL,
    system_prompt TEXT,
    name TEXT,
    workspace_id TEXT,
    primary_branch_id INTEGER,
    chosen_first_id INTEGER
);

CREATE TABLE IF NOT EXISTS branches (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    parent_branch_id INTEGER,
    branch_from_message_id INTEGER,
    created_at INTEGER NOT NULL,
    pending_confirmation TEXT
);
CREATE INDEX IF NOT EXISTS idx_branches_session ON branches(session_id);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    branch_id INTEGER NOT NULL,
    parent_id INTEGER,
    chosen_next_id INTEGER,
    kind TEXT NOT NULL,
    text TEXT NOT NULL DEFAULT '',
    attachments TEXT,
    cumul_tokens INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    model TEXT,
    env_generation INTEGER NOT NULL DEFAULT 0,
    aux TEXT,
    indexed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_branch ON messages(branch_id, id);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);

CREATE TABLE IF NOT EXISTS session_envs (
    session_id TEXT NOT NULL,
    generation INTEGER NOT NULL,
    roots TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (session_id, generation)
);

CREATE TABLE IF NOT EXISTS shell_commands (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    command TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    stdout TEXT NOT NULL DEFAULT '',
    stderr TEXT NOT NULL DEFAULT '',
    exit_code INTEGER,
    last_polled_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_shell_session ON shell_commands(session_id);

CREATE TABLE IF NOT EXISTS blobs (
    hash TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    ref_count INTEGER NOT NULL DEFAULT 0
);

-- Blob reference counting. The attachment column is a JSON array of
-- {hash, file_name, mime_type, omitted}; the triggers apply the multiset
-- delta of hashes and sweep rows that reach zero. A freshly inserted blob
-- row with ref_count 0 survives until a message referencing it lands in
-- the same transaction or the transaction rolls back.
CREATE TRIGGER IF NOT EXISTS messages_blob_ref_insert
AFTER INSERT ON messages
WHEN new.attachments IS NOT NULL
BEGIN
    UPDATE blobs SET ref_count = ref_count + (
        SELECT COUNT(*) FROM json_each(new.attachments) a
        WHERE json_extract(a.value, '$.hash') = blobs.hash
    )
    WHERE hash IN (SELECT json_extract(a.value, '$.hash') FROM json_each(new.attachments) a);
END;

CREATE TRIGGER IF NOT EXISTS messages_blob_ref_update
AFTER UPDATE OF attachments ON messages
BEGIN
    UPDATE blobs SET ref_count = ref_count
        + (SELECT COUNT(*) FROM json_each(COALESCE(new.attachments, '[]')) a
           WHERE json_extract(a.value, '$.hash') = blobs.hash)
        - (SELECT COUNT(*) FROM json_each(COALESCE(old.attachments, '[]')) a
           WHERE json_extract(a.value, '$.hash') = blobs.hash)
    WHERE hash IN (
        SELECT json_extract(a.value, '$.hash') FROM json_each(COALESCE(new.attachments, '[]')) a
        UNION
        SELECT json_extract(a.value, '$.hash') FROM json_each(COALESCE(old.attachments, '[]')) a
    );
    DELETE FROM blobs WHERE ref_count <= 0 AND hash IN (
        SELECT json_extract(a.value, '$.hash') FROM json_each(COALESCE(old.attachments, '[]')) a
    );
END;

CREATE TRIGGER IF NOT EXISTS messages_blob_ref_delete
AFTER DELETE ON messages
WHEN old.attachments IS NOT NULL
BEGIN
    UPDATE blobs SET ref_count = ref_count - (
        SELECT COUNT(*) FROM json_each(old.attachments) a
        WHERE json_extract(a.value, '$.hash') = blobs.hash
    )
    WHERE hash IN (SELECT json_extract(a.value, '$.hash') FROM json_each(old.attachments) a);
    DELETE FROM blobs WHERE ref_count <= 0 AND hash IN (
        SELECT json_extract(a.value, '$.hash') FROM json_each(old.attachments) a
    );
END;
"#;

/// Session metadata row local to this database
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub local_id: String,
    pub created_at: i64,
    pub last_updated_at: i64,
    pub system_prompt: Option<String>,
    pub name: Option<String>,
    pub workspace_id: Option<String>,
    pub primary_branch_id: BranchId,
    pub chosen_first_id: Option<MessageId>,
}

/// One branch row
#[derive(Debug, Clone)]
pub struct BranchRow {
    pub id: BranchId,
    pub session_id: String,
    pub parent_branch_id: Option<BranchId>,
    pub branch_from_message_id: Option<MessageId>,
    pub created_at: i64,
    pub pending_confirmation: Option<serde_json::Value>,
}

/// Persisted state of a long-running subprocess
#[derive(Debug, Clone)]
pub struct ShellCommandRow {
    pub id: i64,
    pub session_id: String,
    pub command: String,
    pub status: ShellCommandStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub last_polled_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellCommandStatus {
    Running,
    Complete,
    Failed,
}

impl ShellCommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "complete" => Self::Complete,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

/// Handle to one session-group database
pub struct SessionDb {
    conn: Mutex<Connection>,
    db_key: String,
    path: PathBuf,
}

impl SessionDb {
    /// Open or create the database for `db_key`, attaching the catalog
    pub fn open(sessions_dir: &Path, db_key: &str, catalog_path: &Path) -> AngelResult<Self> {
        std::fs::create_dir_all(sessions_dir)?;
        let path = sessions_dir.join(format!("{db_key}.db"));
        let conn = Connection::open(&path)?;
        Self::init(&conn, db_key, catalog_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_key: db_key.to_string(),
            path,
        })
    }

    fn init(conn: &Connection, db_key: &str, catalog_path: &Path) -> AngelResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])?;
        conn.execute(
            "ATTACH DATABASE ?1 AS catalog",
            params![catalog_path.to_string_lossy()],
        )?;
        conn.execute_batch(&search_mirror_triggers(db_key))?;
        Ok(())
    }

    pub fn db_key(&self) -> &str {
        &self.db_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure against the raw connection (tests and migration)
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> AngelResult<T>) -> AngelResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Create a session row plus its initial branch
    pub fn create_session(
        &self,
        local_id: &str,
        system_prompt: Option<&str>,
        name: Option<&str>,
        workspace_id: Option<&str>,
        now: i64,
    ) -> AngelResult<BranchId> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT local_id FROM sessions WHERE local_id = ?1",
                params![local_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(AngelError::conflict(format!(
                "session {:?} already exists in {}",
                local_id, self.db_key
            )));
        }
        tx.execute(
            "INSERT INTO sessions (local_id, created_at, last_updated_at, system_prompt, name, workspace_id)
             VALUES (?1, ?2, ?2, ?3, ?4, ?5)",
            params![local_id, now, system_prompt, name, workspace_id],
        )?;
        tx.execute(
            "INSERT INTO branches (session_id, created_at) VALUES (?1, ?2)",
            params![local_id, now],
        )?;
        let branch = BranchId(tx.last_insert_rowid());
        tx.execute(
            "UPDATE sessions SET primary_branch_id = ?2 WHERE local_id = ?1",
            params![local_id, branch.0],
        )?;
        tx.commit()?;
        Ok(branch)
    }

    pub fn session_row(&self, local_id: &str) -> AngelResult<Option<SessionRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT local_id, created_at, last_updated_at, system_prompt, name,
                        workspace_id, primary_branch_id, chosen_first_id
                 FROM sessions WHERE local_id = ?1",
                params![local_id],
                |row| {
                    Ok(SessionRow {
                        local_id: row.get(0)?,
                        created_at: row.get(1)?,
                        last_updated_at: row.get(2)?,
                        system_prompt: row.get(3)?,
                        name: row.get(4)?,
                        workspace_id: row.get(5)?,
                        primary_branch_id: BranchId(row.get(6)?),
                        chosen_first_id: row.get::<_, Option<i64>>(7)?.map(MessageId),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Session row or a not-found error
    pub fn require_session(&self, local_id: &str) -> AngelResult<SessionRow> {
        self.session_row(local_id)?.ok_or_else(|| {
            AngelError::not_found(format!("session {:?} in {}", local_id, self.db_key))
        })
    }

    pub fn set_session_name(&self, local_id: &str, name: &str) -> AngelResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET name = ?2 WHERE local_id = ?1",
            params![local_id, name],
        )?;
        Ok(())
    }

    pub fn set_system_prompt(&self, local_id: &str, prompt: &str) -> AngelResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET system_prompt = ?2 WHERE local_id = ?1",
            params![local_id, prompt],
        )?;
        Ok(())
    }

    /// Local identifiers of every session stored in this file
    pub fn all_local_ids(&self) -> AngelResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT local_id FROM sessions ORDER BY local_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Delete one session's rows. Messages go first so the blob and search
    /// triggers observe every row individually.
    pub fn delete_session_rows(&self, local_id: &str) -> AngelResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        // Per-row deletes keep the refcount and search mirror triggers honest.
        let ids: Vec<i64> = {
            let mut stmt =
                tx.prepare("SELECT id FROM messages WHERE session_id = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map(params![local_id], |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            ids
        };
        for id in ids {
            tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        }
        tx.execute("DELETE FROM branches WHERE session_id = ?1", params![local_id])?;
        tx.execute(
            "DELETE FROM session_envs WHERE session_id = ?1",
            params![local_id],
        )?;
        tx.execute(
            "DELETE FROM shell_commands WHERE session_id = ?1",
            params![local_id],
        )?;
        tx.execute("DELETE FROM sessions WHERE local_id = ?1", params![local_id])?;
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Branches
    // =========================================================================

    /// Create a branch with no fork point: a fresh root timeline for the
    /// session (used by `/clear` and by edits of the very first message)
    pub fn create_detached_branch(&self, local_id: &str, now: i64) -> AngelResult<BranchRow> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO branches (session_id, created_at) VALUES (?1, ?2)",
            params![local_id, now],
        )?;
        Ok(BranchRow {
            id: BranchId(conn.last_insert_rowid()),
            session_id: local_id.to_string(),
            parent_branch_id: None,
            branch_from_message_id: None,
            created_at: now,
            pending_confirmation: None,
        })
    }

    /// Create a branch forking at `from_message`
    pub fn create_branch(&self, from_message: MessageId, now: i64) -> AngelResult<BranchRow> {
        let conn = self.conn.lock();
        let (session_id, parent_branch): (String, i64) = conn.query_row(
            "SELECT session_id, branch_id FROM messages WHERE id = ?1",
            params![from_message.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        conn.execute(
            "INSERT INTO branches (session_id, parent_branch_id, branch_from_message_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, parent_branch, from_message.0, now],
        )?;
        let id = BranchId(conn.last_insert_rowid());
        Ok(BranchRow {
            id,
            session_id,
            parent_branch_id: Some(BranchId(parent_branch)),
            branch_from_message_id: Some(from_message),
            created_at: now,
            pending_confirmation: None,
        })
    }

    pub fn branch_row(&self, branch: BranchId) -> AngelResult<Option<BranchRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, session_id, parent_branch_id, branch_from_message_id,
                        created_at, pending_confirmation
                 FROM branches WHERE id = ?1",
                params![branch.0],
                |row| {
                    let pending: Option<String> = row.get(5)?;
                    Ok(BranchRow {
                        id: BranchId(row.get(0)?),
                        session_id: row.get(1)?,
                        parent_branch_id: row.get::<_, Option<i64>>(2)?.map(BranchId),
                        branch_from_message_id: row.get::<_, Option<i64>>(3)?.map(MessageId),
                        created_at: row.get(4)?,
                        pending_confirmation: pending
                            .and_then(|s| serde_json::from_str(&s).ok()),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn require_branch(&self, branch: BranchId) -> AngelResult<BranchRow> {
        self.branch_row(branch)?
            .ok_or_else(|| AngelError::not_found(format!("branch {branch}")))
    }

    pub fn set_primary_branch(&self, local_id: &str, branch: BranchId) -> AngelResult<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE sessions SET primary_branch_id = ?2 WHERE local_id = ?1",
            params![local_id, branch.0],
        )?;
        if n == 0 {
            return Err(AngelError::not_found(format!("session {local_id:?}")));
        }
        Ok(())
    }

    /// Set a branch's pending confirmation. Setting a payload while one is
    /// already pending is a conflict (the branch is awaiting confirmation).
    pub fn set_pending_confirmation(
        &self,
        branch: BranchId,
        payload: Option<&serde_json::Value>,
    ) -> AngelResult<()> {
        let conn = self.conn.lock();
        if payload.is_some() {
            let existing: Option<String> = conn.query_row(
                "SELECT pending_confirmation FROM branches WHERE id = ?1",
                params![branch.0],
                |row| row.get(0),
            )?;
            if existing.is_some() {
                return Err(AngelError::conflict(format!(
                    "branch {branch} is already awaiting confirmation"
                )));
            }
        }
        let raw = payload.map(|v| v.to_string());
        conn.execute(
            "UPDATE branches SET pending_confirmation = ?2 WHERE id = ?1",
            params![branch.0, raw],
        )?;
        Ok(())
    }

    /// Branch lineage from the root branch down to `branch` inclusive
    pub fn branch_lineage(&self, branch: BranchId) -> AngelResult<Vec<BranchRow>> {
        let mut lineage = Vec::new();
        let mut cursor = Some(branch);
        while let Some(id) = cursor {
            let row = self.require_branch(id)?;
            cursor = row.parent_branch_id;
            lineage.push(row);
            if lineage.len() > 10_000 {
                return Err(AngelError::storage(format!(
                    "branch lineage of {branch} does not terminate"
                )));
            }
        }
        lineage.reverse();
        Ok(lineage)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub fn message(&self, id: MessageId) -> AngelResult<Option<MessageRecord>> {
        let conn = self.conn.lock();
        Self::message_in(&conn, id)
    }

    pub fn require_message(&self, id: MessageId) -> AngelResult<MessageRecord> {
        self.message(id)?
            .ok_or_else(|| AngelError::not_found(format!("message {id}")))
    }

    fn message_in(conn: &Connection, id: MessageId) -> AngelResult<Option<MessageRecord>> {
        let row = conn
            .query_row(
                &format!("{MESSAGE_COLUMNS} WHERE id = ?1"),
                params![id.0],
                row_to_message,
            )
            .optional()?;
        Ok(row)
    }

    /// Append one message. All linkage maintenance happens in one
    /// transaction: parent resolution is the caller's job (the chain), this
    /// method performs the insert, redirects the previous row's chosen-next,
    /// bumps the session timestamp, and seeds chosen-first for a root.
    pub fn append_message(
        &self,
        local_id: &str,
        branch: BranchId,
        parent: Option<MessageId>,
        msg: &NewMessage,
        now: i64,
    ) -> AngelResult<MessageRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let record = Self::append_message_tx(&tx, local_id, branch, parent, msg, now)?;
        tx.commit()?;
        Ok(record)
    }

    /// Transaction body of [`append_message`], reusable by compound
    /// operations (compression, extraction) that stack more work on top
    pub fn append_message_tx(
        tx: &Transaction<'_>,
        local_id: &str,
        branch: BranchId,
        parent: Option<MessageId>,
        msg: &NewMessage,
        now: i64,
    ) -> AngelResult<MessageRecord> {
        let parent_tokens = match parent {
            Some(pid) => tx.query_row(
                "SELECT cumul_tokens FROM messages WHERE id = ?1",
                params![pid.0],
                |row| row.get::<_, i64>(0),
            )?,
            None => 0,
        };
        let cumul = parent_tokens + msg.token_delta;
        let indexed = msg.kind.default_indexed();
        let aux = msg.aux.as_ref().map(|v| v.to_string());
        tx.execute(
            "INSERT INTO messages (session_id, branch_id, parent_id, kind, text, attachments,
                                   cumul_tokens, created_at, model, env_generation, aux, indexed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                     COALESCE((SELECT MAX(generation) FROM session_envs WHERE session_id = ?1), 0),
                     ?10, ?11)",
            params![
                local_id,
                branch.0,
                parent.map(|p| p.0),
                msg.kind.as_str(),
                msg.text,
                attachments_to_json(&msg.attachments),
                cumul,
                now,
                msg.model,
                aux,
                indexed,
            ],
        )?;
        let id = MessageId(tx.last_insert_rowid());
        if let Some(pid) = parent {
            tx.execute(
                "UPDATE messages SET chosen_next_id = ?2 WHERE id = ?1",
                params![pid.0, id.0],
            )?;
        }
        tx.execute(
            "UPDATE sessions SET last_updated_at = ?2 WHERE local_id = ?1",
            params![local_id, now],
        )?;
        if parent.is_none() {
            tx.execute(
                "UPDATE sessions SET chosen_first_id = ?2
                 WHERE local_id = ?1 AND chosen_first_id IS NULL",
                params![local_id, id.0],
            )?;
        }
        let record = Self::message_in_tx(tx, id)?;
        Ok(record)
    }

    fn message_in_tx(tx: &Transaction<'_>, id: MessageId) -> AngelResult<MessageRecord> {
        let record = tx.query_row(
            &format!("{MESSAGE_COLUMNS} WHERE id = ?1"),
            params![id.0],
            row_to_message,
        )?;
        Ok(record)
    }

    /// Last conversational message on a branch, if any. Compression rows
    /// are overlays spliced in at read time; they never act as the chain
    /// tail.
    pub fn last_message(&self, branch: BranchId) -> AngelResult<Option<MessageRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "{MESSAGE_COLUMNS} WHERE branch_id = ?1 AND kind != 'compression'
                     ORDER BY id DESC LIMIT 1"
                ),
                params![branch.0],
                row_to_message,
            )
            .optional()?;
        Ok(row)
    }

    /// Rebase cumulative token counts so the path starting at `first` sits
    /// on top of `base_tokens`. Each row keeps its own delta (old cumul
    /// minus old predecessor cumul); only the base changes.
    pub fn rebase_cumulative_tokens(&self, first: MessageId, base_tokens: i64) -> AngelResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut cursor = Some(first);
        let mut prev_old: Option<i64> = None;
        let mut prev_new = base_tokens;
        let mut visited = 0usize;
        while let Some(id) = cursor {
            let record = Self::message_in_tx(&tx, id)?;
            let old_parent_cumul = match prev_old {
                Some(v) => v,
                None => match record.parent_id {
                    Some(pid) => tx
                        .query_row(
                            "SELECT cumul_tokens FROM messages WHERE id = ?1",
                            params![pid.0],
                            |row| row.get(0),
                        )
                        .optional()?
                        .unwrap_or(0),
                    None => 0,
                },
            };
            let delta = record.cumul_tokens - old_parent_cumul;
            let new_cumul = prev_new + delta.max(0);
            tx.execute(
                "UPDATE messages SET cumul_tokens = ?2 WHERE id = ?1",
                params![id.0, new_cumul],
            )?;
            prev_old = Some(record.cumul_tokens);
            prev_new = new_cumul;
            cursor = record.chosen_next_id;
            visited += 1;
            if visited > 1_000_000 {
                return Err(AngelError::storage("token rebase does not terminate"));
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Messages owned by one branch in append order
    pub fn branch_messages(&self, branch: BranchId) -> AngelResult<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("{MESSAGE_COLUMNS} WHERE branch_id = ?1 ORDER BY id"))?;
        let rows = stmt
            .query_map(params![branch.0], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Full history of a branch: for each ancestor segment, the messages up
    /// to and including the fork message of the next branch down, then the
    /// branch's own messages.
    pub fn branch_history(&self, branch: BranchId) -> AngelResult<Vec<MessageRecord>> {
        let lineage = self.branch_lineage(branch)?;
        let conn = self.conn.lock();
        let mut history = Vec::new();
        for (idx, row) in lineage.iter().enumerate() {
            // For every segment except the leaf, stop at the fork message of
            // the next branch down (inclusive).
            let fork_bound = lineage.get(idx + 1).and_then(|b| b.branch_from_message_id);
            let bound = fork_bound.map(|m| m.0).unwrap_or(i64::MAX);
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_COLUMNS} WHERE branch_id = ?1 AND id <= ?2 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![row.id.0, bound], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            history.extend(rows);
        }
        Ok(history)
    }

    /// The unique parent-path from the branch root to `id`, inclusive
    pub fn path_to_message(&self, id: MessageId) -> AngelResult<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(mid) = cursor {
            let record = Self::message_in(&conn, mid)?
                .ok_or_else(|| AngelError::not_found(format!("message {mid}")))?;
            cursor = record.parent_id;
            path.push(record);
            if path.len() > 1_000_000 {
                return Err(AngelError::storage("message parent chain does not terminate"));
            }
        }
        path.reverse();
        Ok(path)
    }

    /// Follow chosen-next edges from the session's chosen-first message.
    /// Each message is visited at most once; a repeated edge fails.
    pub fn primary_path(&self, local_id: &str) -> AngelResult<Vec<MessageRecord>> {
        let session = self.require_session(local_id)?;
        let conn = self.conn.lock();
        let mut path = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut cursor = session.chosen_first_id;
        while let Some(id) = cursor {
            if !seen.insert(id) {
                return Err(AngelError::storage(format!(
                    "chosen-next cycle at message {id}"
                )));
            }
            let record = Self::message_in(&conn, id)?
                .ok_or_else(|| AngelError::not_found(format!("message {id}")))?;
            cursor = record.chosen_next_id;
            path.push(record);
        }
        Ok(path)
    }

    /// Branch picked when the client names none: the branch of the leaf
    /// reached by the chosen-next walk, falling back to the session's
    /// primary branch
    pub fn auto_detect_branch(&self, local_id: &str) -> AngelResult<BranchId> {
        let path = self.primary_path(local_id)?;
        match path.last() {
            Some(leaf) => Ok(leaf.branch_id),
            None => Ok(self.require_session(local_id)?.primary_branch_id),
        }
    }

    /// In-place edit of user/model text; the prior value is preserved in
    /// the aux JSON under `previous_text`
    pub fn edit_message_text(&self, id: MessageId, new_text: &str) -> AngelResult<MessageRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let record = Self::message_in_tx(&tx, id)?;
        if !record.kind.editable() {
            return Err(AngelError::conflict(format!(
                "message {id} of kind {} does not allow in-place edit",
                record.kind.as_str()
            )));
        }
        let mut aux = record.aux.clone().unwrap_or_else(|| serde_json::json!({}));
        if let Some(obj) = aux.as_object_mut() {
            obj.insert(
                "previous_text".to_string(),
                serde_json::Value::String(record.text.clone()),
            );
        }
        tx.execute(
            "UPDATE messages SET text = ?2, aux = ?3 WHERE id = ?1",
            params![id.0, new_text, aux.to_string()],
        )?;
        let updated = Self::message_in_tx(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }

    pub fn set_chosen_next(&self, id: MessageId, next: Option<MessageId>) -> AngelResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET chosen_next_id = ?2 WHERE id = ?1",
            params![id.0, next.map(|n| n.0)],
        )?;
        Ok(())
    }

    /// Delete trailing error messages on a branch, returning the new last
    /// message. Used by retry-error; no fork happens.
    pub fn delete_trailing_errors(&self, branch: BranchId) -> AngelResult<Option<MessageRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        loop {
            let last = tx
                .query_row(
                    &format!("{MESSAGE_COLUMNS} WHERE branch_id = ?1 ORDER BY id DESC LIMIT 1"),
                    params![branch.0],
                    row_to_message,
                )
                .optional()?;
            match last {
                Some(record) if record.kind.is_error() => {
                    tx.execute("DELETE FROM messages WHERE id = ?1", params![record.id.0])?;
                }
                Some(record) => {
                    tx.execute(
                        "UPDATE messages SET chosen_next_id = NULL WHERE id = ?1",
                        params![record.id.0],
                    )?;
                    tx.commit()?;
                    return Ok(Some(record));
                }
                None => {
                    tx.commit()?;
                    return Ok(None);
                }
            }
        }
    }

    /// Mark every attachment on messages up to `up_to` (exclusive) as
    /// omitted from the LLM view. Rows and refcounts are untouched: the
    /// update rewrites the same hashes, so the trigger delta is zero.
    pub fn mark_attachments_omitted(&self, local_id: &str, up_to: MessageId) -> AngelResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let targets: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, attachments FROM messages
                 WHERE session_id = ?1 AND id < ?2 AND attachments IS NOT NULL",
            )?;
            let rows = stmt
                .query_map(params![local_id, up_to.0], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let mut changed = 0;
        for (id, raw) in targets {
            let mut attachments = attachments_from_json(Some(&raw));
            if attachments.iter().all(|a| a.omitted) {
                continue;
            }
            for a in &mut attachments {
                a.omitted = true;
            }
            tx.execute(
                "UPDATE messages SET attachments = ?2 WHERE id = ?1",
                params![id, attachments_to_json(&attachments)],
            )?;
            changed += 1;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Compression rows of one session in insertion order
    pub fn compression_messages(&self, local_id: &str) -> AngelResult<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{MESSAGE_COLUMNS} WHERE session_id = ?1 AND kind = 'compression' ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![local_id], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn message_count(&self, local_id: &str) -> AngelResult<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![local_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // =========================================================================
    // Blobs
    // =========================================================================

    /// Store a byte payload content-addressed by SHA-512/256. Saving the
    /// same bytes twice is a no-op on the data row; the refcount moves only
    /// when messages referencing the hash are written.
    pub fn save_blob(&self, data: &[u8]) -> AngelResult<String> {
        let hash = blob_hash(data);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO blobs (hash, data, ref_count) VALUES (?1, ?2, 0)
             ON CONFLICT(hash) DO NOTHING",
            params![hash, data],
        )?;
        Ok(hash)
    }

    pub fn blob(&self, hash: &str) -> AngelResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let data = conn
            .query_row(
                "SELECT data FROM blobs WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    pub fn blob_ref_count(&self, hash: &str) -> AngelResult<Option<i64>> {
        let conn = self.conn.lock();
        let n = conn
            .query_row(
                "SELECT ref_count FROM blobs WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(n)
    }

    pub fn blob_count(&self) -> AngelResult<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
        Ok(n)
    }

    // =========================================================================
    // Session environments
    // =========================================================================

    /// Record a new root-list generation
    pub fn add_env_generation(
        &self,
        local_id: &str,
        roots: &[String],
        now: i64,
    ) -> AngelResult<i64> {
        let conn = self.conn.lock();
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(generation), 0) + 1 FROM session_envs WHERE session_id = ?1",
            params![local_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO session_envs (session_id, generation, roots, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![local_id, next, serde_json::to_string(roots)?, now],
        )?;
        Ok(next)
    }

    /// Latest environment generation and its roots
    pub fn latest_env(&self, local_id: &str) -> AngelResult<Option<(i64, Vec<String>)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT generation, roots FROM session_envs
                 WHERE session_id = ?1 ORDER BY generation DESC LIMIT 1",
                params![local_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            Some((generation, raw)) => Ok(Some((generation, serde_json::from_str(&raw)?))),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Shell commands
    // =========================================================================

    pub fn insert_shell_command(
        &self,
        local_id: &str,
        command: &str,
        now: i64,
    ) -> AngelResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO shell_commands (session_id, command, status, started_at)
             VALUES (?1, ?2, 'running', ?3)",
            params![local_id, command, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_shell_command(
        &self,
        id: i64,
        status: ShellCommandStatus,
        stdout: &str,
        stderr: &str,
        exit_code: Option<i32>,
        now: i64,
    ) -> AngelResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE shell_commands
             SET status = ?2, stdout = ?3, stderr = ?4, exit_code = ?5, ended_at = ?6
             WHERE id = ?1",
            params![id, status.as_str(), stdout, stderr, exit_code, now],
        )?;
        Ok(())
    }

    pub fn poll_shell_command(&self, id: i64, now: i64) -> AngelResult<Option<ShellCommandRow>> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE shell_commands SET last_polled_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        let row = conn
            .query_row(
                "SELECT id, session_id, command, status, started_at, ended_at,
                        stdout, stderr, exit_code, last_polled_at
                 FROM shell_commands WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ShellCommandRow {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        command: row.get(2)?,
                        status: ShellCommandStatus::parse(&row.get::<_, String>(3)?),
                        started_at: row.get(4)?,
                        ended_at: row.get(5)?,
                        stdout: row.get(6)?,
                        stderr: row.get(7)?,
                        exit_code: row.get(8)?,
                        last_polled_at: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

const MESSAGE_COLUMNS: &str = "SELECT id, session_id, branch_id, parent_id, chosen_next_id, kind,
        text, attachments, cumul_tokens, created_at, model, env_generation, aux, indexed
 FROM messages";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let kind_raw: String = row.get(5)?;
    let attachments_raw: Option<String> = row.get(7)?;
    let aux_raw: Option<String> = row.get(12)?;
    Ok(MessageRecord {
        id: MessageId(row.get(0)?),
        session_id: row.get(1)?,
        branch_id: BranchId(row.get(2)?),
        parent_id: row.get::<_, Option<i64>>(3)?.map(MessageId),
        chosen_next_id: row.get::<_, Option<i64>>(4)?.map(MessageId),
        kind: MessageKind::parse(&kind_raw).unwrap_or(MessageKind::Error),
        text: row.get(6)?,
        attachments: attachments_from_json(attachments_raw.as_deref()),
        cumul_tokens: row.get(8)?,
        created_at: row.get(9)?,
        model: row.get(10)?,
        env_generation: row.get(11)?,
        aux: aux_raw.and_then(|s| serde_json::from_str(&s).ok()),
        indexed: row.get(13)?,
    })
}

/// SHA-512/256 hex digest used for blob addressing
pub fn blob_hash(data: &[u8]) -> String {
    let digest = Sha512_256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// TEMP triggers mirroring indexed message text into the attached catalog.
/// The db key is interpolated as a literal because trigger bodies cannot be
/// parameterized; it is quote-escaped defensively even though identifiers
/// are validated upstream.
fn search_mirror_triggers(db_key: &str) -> String {
    let key = db_key.replace('\'', "''");
    let full_id = |alias: &str| {
        format!(
            "CASE WHEN {alias}.session_id = '' THEN '{key}'
                  ELSE '{key}' || '.' || {alias}.session_id END"
        )
    };
    let new_id = full_id("new");
    let old_id = full_id("old");
    format!(
        r#"
CREATE TEMP TRIGGER IF NOT EXISTS messages_search_insert
AFTER INSERT ON messages
WHEN new.indexed = 1
BEGIN
    INSERT INTO catalog.messages_searchable (session_id, message_id, workspace_id, text)
    VALUES (
        {new_id},
        new.id,
        (SELECT workspace_id FROM sessions WHERE local_id = new.session_id),
        new.text
    );
END;

CREATE TEMP TRIGGER IF NOT EXISTS messages_search_update
AFTER UPDATE OF text ON messages
WHEN new.indexed = 1
BEGIN
    UPDATE catalog.messages_searchable SET text = new.text
    WHERE session_id = {new_id} AND message_id = new.id;
END;

CREATE TEMP TRIGGER IF NOT EXISTS messages_search_delete
AFTER DELETE ON messages
WHEN old.indexed = 1
BEGIN
    DELETE FROM catalog.messages_searchable
    WHERE session_id = {old_id} AND message_id = old.id;
END;
"#
    )
}
