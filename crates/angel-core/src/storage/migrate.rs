//! One-shot migration from the legacy monolithic database to the split
//! layout
//!
//! The legacy shape kept every session's rows in one file, keyed by full
//! session identifiers. The migration groups sessions by their main-session
//! prefix, creates one session database per group, copies rows while
//! rewriting identifiers to their local form, and lets the session
//! connections' mirror triggers rebuild the catalog search index as the
//! messages land. Row counts and index coverage are compared at the end;
//! any mismatch fails the migration.

use std::path::Path;

use rusqlite::{params, Connection, OpenFlags};

use crate::error::{AngelError, AngelResult};
use crate::storage::main_db::MainDb;
use crate::storage::session_db::SessionDb;
use crate::types::SessionId;

/// Outcome counters, for logging and validation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub session_dbs: usize,
    pub sessions: usize,
    pub messages: usize,
    pub branches: usize,
    pub blobs: usize,
    pub indexed: usize,
}

/// Migrate `legacy_path` into `main` + per-group files under `sessions_dir`
pub fn migrate_monolithic(
    legacy_path: &Path,
    main: &MainDb,
    sessions_dir: &Path,
) -> AngelResult<MigrationReport> {
    let legacy = Connection::open_with_flags(legacy_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut report = MigrationReport::default();

    let full_ids: Vec<String> = {
        let mut stmt = legacy.prepare("SELECT id FROM sessions ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    let mut groups: std::collections::BTreeMap<String, Vec<SessionId>> = Default::default();
    for raw in full_ids {
        let id = SessionId(raw);
        groups.entry(id.db_key()).or_default().push(id);
    }

    for (db_key, members) in &groups {
        let sdb = SessionDb::open(sessions_dir, db_key, main.path())?;
        migrate_group(&legacy, &sdb, members, main, &mut report)?;
        report.session_dbs += 1;
    }

    validate(&legacy, main, sessions_dir, &groups, &report)?;
    tracing::info!(
        session_dbs = report.session_dbs,
        sessions = report.sessions,
        messages = report.messages,
        "monolithic database migrated"
    );
    Ok(report)
}

fn migrate_group(
    legacy: &Connection,
    sdb: &SessionDb,
    members: &[SessionId],
    main: &MainDb,
    report: &mut MigrationReport,
) -> AngelResult<()> {
    for id in members {
        let local = id.local_id();
        sdb.with_conn(|conn| {
            copy_session(legacy, conn, id, &local, report)?;
            Ok(())
        })?;
        let row = sdb.require_session(&local)?;
        main.upsert_session(
            id,
            row.workspace_id.as_deref(),
            row.name.as_deref(),
            row.last_updated_at,
        )?;
        report.sessions += 1;
    }
    Ok(())
}

fn copy_session(
    legacy: &Connection,
    conn: &Connection,
    id: &SessionId,
    local: &str,
    report: &mut MigrationReport,
) -> AngelResult<()> {
    let full = id.as_str();

    type SessionTuple = (
        i64,
        i64,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<i64>,
        Option<i64>,
    );
    let meta: SessionTuple = legacy
        .query_row(
            "SELECT created_at, last_updated_at, system_prompt, name, workspace_id,
                    primary_branch_id, chosen_first_id
             FROM sessions WHERE id = ?1",
            params![full],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )
        .map_err(|e| AngelError::storage(format!("legacy session {full}: {e}")))?;
    conn.execute(
        "INSERT INTO sessions (local_id, created_at, last_updated_at, system_prompt,
                               name, workspace_id, primary_branch_id, chosen_first_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![local, meta.0, meta.1, meta.2, meta.3, meta.4, meta.5, meta.6],
    )?;

    // Blobs land first with a zero refcount; the message-insert triggers
    // recompute the counts as attachments arrive.
    let mut stmt = legacy.prepare("SELECT hash, data FROM blobs WHERE session_id = ?1")?;
    let mut rows = stmt.query(params![full])?;
    while let Some(row) = rows.next()? {
        let hash: String = row.get(0)?;
        let data: Vec<u8> = row.get(1)?;
        conn.execute(
            "INSERT INTO blobs (hash, data, ref_count) VALUES (?1, ?2, 0)
             ON CONFLICT(hash) DO NOTHING",
            params![hash, data],
        )?;
        report.blobs += 1;
    }

    let mut stmt = legacy.prepare(
        "SELECT id, parent_branch_id, branch_from_message_id, created_at, pending_confirmation
         FROM branches WHERE session_id = ?1 ORDER BY id",
    )?;
    let mut rows = stmt.query(params![full])?;
    while let Some(row) = rows.next()? {
        conn.execute(
            "INSERT INTO branches (id, session_id, parent_branch_id, branch_from_message_id,
                                   created_at, pending_confirmation)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.get::<_, i64>(0)?,
                local,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
            ],
        )?;
        report.branches += 1;
    }

    let mut stmt = legacy.prepare(
        "SELECT id, branch_id, parent_id, chosen_next_id, kind, text, attachments,
                cumul_tokens, created_at, model, env_generation, aux, indexed
         FROM messages WHERE session_id = ?1 ORDER BY id",
    )?;
    let mut rows = stmt.query(params![full])?;
    while let Some(row) = rows.next()? {
        let indexed: bool = row.get(12)?;
        conn.execute(
            "INSERT INTO messages (id, session_id, branch_id, parent_id, chosen_next_id, kind,
                                   text, attachments, cumul_tokens, created_at, model,
                                   env_generation, aux, indexed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                row.get::<_, i64>(0)?,
                local,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, i64>(10)?,
                row.get::<_, Option<String>>(11)?,
                indexed,
            ],
        )?;
        report.messages += 1;
        if indexed {
            report.indexed += 1;
        }
    }

    let mut stmt = legacy.prepare(
        "SELECT generation, roots, created_at FROM session_envs WHERE session_id = ?1",
    )?;
    let mut rows = stmt.query(params![full])?;
    while let Some(row) = rows.next()? {
        conn.execute(
            "INSERT INTO session_envs (session_id, generation, roots, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                local,
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ],
        )?;
    }

    let mut stmt = legacy.prepare(
        "SELECT command, status, started_at, ended_at, stdout, stderr, exit_code, last_polled_at
         FROM shell_commands WHERE session_id = ?1",
    )?;
    let mut rows = stmt.query(params![full])?;
    while let Some(row) = rows.next()? {
        conn.execute(
            "INSERT INTO shell_commands (session_id, command, status, started_at, ended_at,
                                         stdout, stderr, exit_code, last_polled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                local,
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<i32>>(6)?,
                row.get::<_, Option<i64>>(7)?,
            ],
        )?;
    }

    Ok(())
}

fn validate(
    legacy: &Connection,
    main: &MainDb,
    sessions_dir: &Path,
    groups: &std::collections::BTreeMap<String, Vec<SessionId>>,
    report: &MigrationReport,
) -> AngelResult<()> {
    let legacy_sessions: i64 =
        legacy.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
    if legacy_sessions as usize != report.sessions {
        return Err(AngelError::storage(format!(
            "migration session count mismatch: legacy {legacy_sessions}, copied {}",
            report.sessions
        )));
    }

    let legacy_messages: i64 =
        legacy.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
    let mut copied_messages = 0i64;
    for db_key in groups.keys() {
        let sdb = SessionDb::open(sessions_dir, db_key, main.path())?;
        copied_messages += sdb.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(n)
        })?;
    }
    if legacy_messages != copied_messages {
        return Err(AngelError::storage(format!(
            "migration message count mismatch: legacy {legacy_messages}, copied {copied_messages}"
        )));
    }

    let index_rows: i64 = main.with_conn(|conn| {
        let n: i64 =
            conn.query_row("SELECT COUNT(*) FROM messages_searchable", [], |row| row.get(0))?;
        Ok(n)
    })?;
    if index_rows as usize != report.indexed {
        return Err(AngelError::storage(format!(
            "migration index coverage mismatch: {} indexed rows, {index_rows} in the index",
            report.indexed
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a small legacy monolith: two main sessions, one with a
    /// sub-agent, a blob attachment, and mixed indexed flags.
    fn build_legacy(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE sessions (
                id TEXT PRIMARY KEY, created_at INTEGER, last_updated_at INTEGER,
                system_prompt TEXT, name TEXT, workspace_id TEXT,
                primary_branch_id INTEGER, chosen_first_id INTEGER
            );
            CREATE TABLE branches (
                id INTEGER, session_id TEXT, parent_branch_id INTEGER,
                branch_from_message_id INTEGER, created_at INTEGER, pending_confirmation TEXT
            );
            CREATE TABLE messages (
                id INTEGER, session_id TEXT, branch_id INTEGER, parent_id INTEGER,
                chosen_next_id INTEGER, kind TEXT, text TEXT, attachments TEXT,
                cumul_tokens INTEGER, created_at INTEGER, model TEXT,
                env_generation INTEGER, aux TEXT, indexed INTEGER
            );
            CREATE TABLE session_envs (session_id TEXT, generation INTEGER, roots TEXT, created_at INTEGER);
            CREATE TABLE shell_commands (
                session_id TEXT, command TEXT, status TEXT, started_at INTEGER,
                ended_at INTEGER, stdout TEXT, stderr TEXT, exit_code INTEGER, last_polled_at INTEGER
            );
            CREATE TABLE blobs (session_id TEXT, hash TEXT, data BLOB, ref_count INTEGER);

            INSERT INTO sessions VALUES ('alpha', 1, 10, 'sp', 'Alpha', NULL, 1, 1);
            INSERT INTO sessions VALUES ('alpha.sub', 2, 9, NULL, NULL, NULL, 2, 3);
            INSERT INTO sessions VALUES ('beta', 3, 8, NULL, 'Beta', 'ws', 3, 4);

            INSERT INTO branches VALUES (1, 'alpha', NULL, NULL, 1, NULL);
            INSERT INTO branches VALUES (2, 'alpha.sub', NULL, NULL, 2, NULL);
            INSERT INTO branches VALUES (3, 'beta', NULL, NULL, 3, NULL);

            INSERT INTO messages VALUES (1, 'alpha', 1, NULL, 2, 'user_text', 'hello world', NULL, 3, 1, NULL, 0, NULL, 1);
            INSERT INTO messages VALUES (2, 'alpha', 1, 1, NULL, 'model_text', 'hi there',
                '[{"hash":"cafe","file_name":"x.png","mime_type":"image/png","omitted":false}]', 6, 2, 'm', 0, NULL, 1);
            INSERT INTO messages VALUES (3, 'alpha.sub', 2, NULL, NULL, 'thought', 'pondering', NULL, 0, 3, NULL, 0, NULL, 0);
            INSERT INTO messages VALUES (4, 'beta', 3, NULL, NULL, 'user_text', 'second db', NULL, 2, 4, NULL, 0, NULL, 1);

            INSERT INTO blobs VALUES ('alpha', 'cafe', x'deadbeef', 1);
            INSERT INTO session_envs VALUES ('alpha', 1, '["/r"]', 5);
            INSERT INTO shell_commands VALUES ('alpha', 'ls', 'complete', 1, 2, 'out', '', 0, NULL);
            "#,
        )
        .unwrap();
    }

    #[test]
    fn test_migration_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let legacy_path = dir.path().join("legacy.db");
        build_legacy(&legacy_path);

        let main = MainDb::open(&dir.path().join("angel.db")).unwrap();
        let sessions_dir = dir.path().join("sessions");
        let report = migrate_monolithic(&legacy_path, &main, &sessions_dir).unwrap();

        assert_eq!(report.session_dbs, 2);
        assert_eq!(report.sessions, 3);
        assert_eq!(report.messages, 4);
        assert_eq!(report.indexed, 3);

        // Identifiers were rewritten to local form.
        let alpha = SessionDb::open(&sessions_dir, "alpha", main.path()).unwrap();
        assert_eq!(alpha.all_local_ids().unwrap(), vec!["".to_string(), "sub".to_string()]);
        assert_eq!(alpha.require_session("").unwrap().name.as_deref(), Some("Alpha"));

        // Refcounts were recomputed from attachments by the triggers.
        assert_eq!(alpha.blob_ref_count("cafe").unwrap(), Some(1));

        // Search index was rebuilt through the mirror triggers.
        let hits = main.search_stems("hello", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_id, "alpha");
        assert_eq!(main.search_stems("second", 10).unwrap().len(), 1);
        assert!(main.search_stems("pondering", 10).unwrap().is_empty());
    }
}
