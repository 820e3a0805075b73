//! High-level session operations, one method per HTTP-facing call

use std::sync::Arc;

use serde_json::json;

use crate::error::{AngelError, AngelResult};
use crate::events::{EventKind, EventWriter};
use crate::orchestrator::{self, registry, state, CompressionOutcome, TurnOutcome};
use crate::session::{CreatedSession, Engine};
use crate::storage::main_db::SearchHit;
use crate::storage::message::{Attachment, MessageKind, MessageRecord, NewMessage};
use crate::storage::MessageChain;
use crate::types::{BranchId, MessageId, SessionId};

/// Options for creating a session
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub temporary: bool,
    pub system_prompt: Option<String>,
    pub name: Option<String>,
    pub workspace_id: Option<String>,
}

/// An uploaded attachment, before it becomes a blob
#[derive(Debug, Clone)]
pub struct IncomingAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Engine {
    /// Create a new main session
    pub fn create_session(&self, opts: CreateSessionOptions) -> AngelResult<CreatedSession> {
        let id = if opts.temporary {
            SessionId::generate_temporary()
        } else {
            SessionId::generate()
        };
        let now = Self::now();
        let handle = self.acquire(&id)?;
        let branch = handle.create_session(
            "",
            opts.system_prompt.as_deref(),
            opts.name.as_deref(),
            opts.workspace_id.as_deref(),
            now,
        )?;
        self.main().upsert_session(
            &id,
            opts.workspace_id.as_deref(),
            opts.name.as_deref(),
            now,
        )?;
        tracing::info!(session = %id, "session created");
        Ok(CreatedSession { id, branch })
    }

    /// Append a user message and run one orchestrator turn
    pub async fn user_turn(
        self: &Arc<Self>,
        session: &SessionId,
        branch: Option<BranchId>,
        text: &str,
        attachments: Vec<IncomingAttachment>,
        writer: &EventWriter,
    ) -> AngelResult<TurnOutcome> {
        let handle = self.acquire(session)?;
        let local = session.local_id();
        handle.require_session(&local)?;
        let branch = match branch {
            Some(branch) => branch,
            None => handle.auto_detect_branch(&local)?,
        };
        let branch_row = handle.require_branch(branch)?;
        state::ensure_accepts_user_turn(session, &branch_row)?;

        let now = Self::now();
        let mut chain = MessageChain::load(&handle, &local, branch)?;

        // Surface a root-list change to the model as an explicit turn.
        if let Some((generation, roots)) = handle.latest_env(&local)? {
            if generation > chain.env_generation() {
                chain.add(
                    NewMessage::new(
                        MessageKind::EnvChange,
                        json!({ "generation": generation, "roots": roots }).to_string(),
                    ),
                    now,
                )?;
                writer.send(EventKind::GenerationChanged, generation.to_string());
            }
        }

        let mut stored: Vec<Attachment> = Vec::with_capacity(attachments.len());
        for incoming in attachments {
            let hash = handle.save_blob(&incoming.data)?;
            stored.push(Attachment {
                hash,
                file_name: incoming.file_name,
                mime_type: incoming.mime_type,
                omitted: false,
            });
        }
        let record = chain.add(
            NewMessage::new(MessageKind::UserText, text)
                .with_attachments(stored)
                .with_token_delta((text.chars().count() as i64 + 3) / 4),
            now,
        )?;
        writer.send(EventKind::Acknowledge, json!({ "id": record.id }).to_string());
        self.main().touch_session(session, now)?;
        drop(chain);
        drop(handle);

        let outcome = orchestrator::run_turn(self, session, branch, writer).await?;
        if outcome == TurnOutcome::Completed {
            self.maybe_generate_title(session, branch, writer).await;
        }
        Ok(outcome)
    }

    /// Resolve a pending tool confirmation and resume the loop
    pub async fn confirm(
        self: &Arc<Self>,
        session: &SessionId,
        branch: BranchId,
        approved: bool,
        modified_args: Option<serde_json::Map<String, serde_json::Value>>,
        writer: &EventWriter,
    ) -> AngelResult<TurnOutcome> {
        let outcome =
            orchestrator::resume_after_confirmation(self, session, branch, approved, modified_args, writer)
                .await?;
        if outcome == TurnOutcome::Completed {
            self.maybe_generate_title(session, branch, writer).await;
        }
        Ok(outcome)
    }

    /// Drop trailing error messages and resume from the last good message
    pub async fn retry_error(
        self: &Arc<Self>,
        session: &SessionId,
        branch: BranchId,
        writer: &EventWriter,
    ) -> AngelResult<TurnOutcome> {
        let handle = self.acquire(session)?;
        let branch_row = handle.require_branch(branch)?;
        state::ensure_accepts_user_turn(session, &branch_row)?;
        handle.delete_trailing_errors(branch)?;
        drop(handle);
        orchestrator::run_turn(self, session, branch, writer).await
    }

    /// Compress on demand
    pub async fn compress(&self, session: &SessionId) -> AngelResult<CompressionOutcome> {
        let handle = self.acquire(session)?;
        let local = session.local_id();
        let branch = handle.auto_detect_branch(&local)?;
        let model = self.config().default_model.clone();
        orchestrator::compress_session(
            &handle,
            self.provider().as_ref(),
            &model,
            &local,
            branch,
            Self::now(),
        )
        .await
    }

    /// Switch the branch the UI renders by default
    pub fn switch_primary(&self, session: &SessionId, branch: BranchId) -> AngelResult<()> {
        let handle = self.acquire(session)?;
        let local = session.local_id();
        handle.require_branch(branch)?;
        handle.set_primary_branch(&local, branch)
    }

    /// Execute a slash command
    pub fn run_command(&self, session: &SessionId, command: &str, body: Option<&str>) -> AngelResult<()> {
        let handle = self.acquire(session)?;
        let local = session.local_id();
        let now = Self::now();
        let branch = handle.auto_detect_branch(&local)?;
        let mut chain = MessageChain::load(&handle, &local, branch)?;
        match command {
            "clear" => {
                chain.add(NewMessage::new(MessageKind::Command, "/clear"), now)?;
                // A fresh root timeline; the old one stays reachable by
                // branch switching.
                let fresh = handle.create_detached_branch(&local, now)?;
                handle.set_primary_branch(&local, fresh.id)?;
            }
            "clearblobs" => {
                let record = chain.add(NewMessage::new(MessageKind::Command, "/clearblobs"), now)?;
                handle.mark_attachments_omitted(&local, record.id)?;
            }
            "new-user-message" => {
                chain.add(
                    NewMessage::new(MessageKind::UserText, body.unwrap_or_default()),
                    now,
                )?;
            }
            "new-model-message" => {
                chain.add(
                    NewMessage::new(MessageKind::ModelText, body.unwrap_or_default()),
                    now,
                )?;
            }
            other => {
                return Err(AngelError::validation(format!("unknown command {other:?}")));
            }
        }
        self.main().touch_session(session, now)?;
        Ok(())
    }

    /// Replace the session's filesystem roots; the model learns about the
    /// change on its next turn
    pub fn set_roots(&self, session: &SessionId, roots: Vec<std::path::PathBuf>) -> AngelResult<i64> {
        let fs = self.fs_for(session)?;
        fs.set_roots(roots.clone())?;
        let handle = self.acquire(session)?;
        let local = session.local_id();
        let as_strings: Vec<String> = roots
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        handle.add_env_generation(&local, &as_strings, Self::now())
    }

    /// Durable state for an initial-state event
    pub fn snapshot(&self, session: &SessionId) -> AngelResult<serde_json::Value> {
        let handle = self.acquire(session)?;
        let local = session.local_id();
        let row = handle.require_session(&local)?;
        let branch = handle.auto_detect_branch(&local)?;
        let branch_row = handle.require_branch(branch)?;
        let messages = orchestrator::assemble::turn_history(&handle, branch)?;
        Ok(json!({
            "session": {
                "id": session.as_str(),
                "name": row.name,
                "workspace_id": row.workspace_id,
                "system_prompt": row.system_prompt,
                "primary_branch_id": row.primary_branch_id,
                "created_at": row.created_at,
                "last_updated_at": row.last_updated_at,
            },
            "branch": branch,
            "state": state::branch_state(session, &branch_row).as_str(),
            "pending_confirmation": branch_row.pending_confirmation,
            "messages": messages,
        }))
    }

    /// Delete a session (and for a main session, its whole database file),
    /// its search-index rows, its sandbox, and its sub-agents
    pub fn delete_session(&self, session: &SessionId) -> AngelResult<()> {
        registry::cancel(session);
        let local = session.local_id();
        if local.is_empty() {
            // Main session: the file owns every row.
            self.cache().evict(&session.db_key());
            let path = self.config().sessions_dir().join(format!("{}.db", session.db_key()));
            for suffix in ["", "-wal", "-shm"] {
                let target = std::path::PathBuf::from(format!("{}{}", path.display(), suffix));
                if target.exists() {
                    std::fs::remove_file(&target)?;
                }
            }
        } else {
            let handle = self.acquire(session)?;
            handle.delete_session_rows(&local)?;
        }
        self.main().forget_session_tree(session)?;
        self.destroy_fs(session)?;
        tracing::info!(session = %session, "session deleted");
        Ok(())
    }

    /// Fetch blob bytes by hash
    pub fn blob_bytes(&self, session: &SessionId, hash: &str) -> AngelResult<Vec<u8>> {
        let handle = self.acquire(session)?;
        handle
            .blob(hash)?
            .ok_or_else(|| AngelError::not_found(format!("blob {hash}")))
    }

    /// Cross-session full-text search
    pub fn search(&self, query: &str, substring: bool, limit: usize) -> AngelResult<Vec<SearchHit>> {
        if substring {
            self.main().search_trigrams(query, limit)
        } else {
            self.main().search_stems(query, limit)
        }
    }

    /// Copy the branch path up to `message` into a brand-new session,
    /// attachments and referenced sub-agent sessions included
    pub fn extract(&self, session: &SessionId, message: MessageId) -> AngelResult<SessionId> {
        let source = self.acquire(session)?;
        let local = session.local_id();
        let row = source.require_session(&local)?;
        let path = source.path_to_message(message)?;

        let new_id = SessionId::generate();
        let now = Self::now();
        let dest = self.acquire(&new_id)?;
        let dest_branch = dest.create_session(
            "",
            row.system_prompt.as_deref(),
            row.name.as_deref(),
            row.workspace_id.as_deref(),
            now,
        )?;
        self.main()
            .upsert_session(&new_id, row.workspace_id.as_deref(), row.name.as_deref(), now)?;

        copy_path(&source, &dest, "", dest_branch, &path, now)?;

        // Sub-agent sessions referenced by function responses on the path
        // come along, recursively.
        let mut queue: Vec<String> = referenced_sub_sessions(session, &path);
        let mut seen = std::collections::HashSet::new();
        while let Some(full) = queue.pop() {
            if !seen.insert(full.clone()) {
                continue;
            }
            let sub = SessionId(full);
            let sub_local = sub.local_id();
            let Some(sub_row) = source.session_row(&sub_local)? else {
                continue;
            };
            let sub_branch = source.auto_detect_branch(&sub_local)?;
            let sub_path = source.branch_history(sub_branch)?;
            let new_branch = dest.create_session(
                &sub_local,
                sub_row.system_prompt.as_deref(),
                sub_row.name.as_deref(),
                sub_row.workspace_id.as_deref(),
                now,
            )?;
            let new_full = SessionId::from_parts(&new_id.db_key(), &sub_local);
            self.main().upsert_session(&new_full, None, None, now)?;
            copy_path(&source, &dest, &sub_local, new_branch, &sub_path, now)?;
            queue.extend(referenced_sub_sessions(session, &sub_path));
        }

        tracing::info!(from = %session, to = %new_id, at = %message, "session extracted");
        Ok(new_id)
    }

    /// One-shot title generation after the first completed turn
    async fn maybe_generate_title(
        self: &Arc<Self>,
        session: &SessionId,
        branch: BranchId,
        writer: &EventWriter,
    ) {
        if session.is_sub_agent() {
            return;
        }
        let named = match self.acquire(session).and_then(|h| h.require_session(&session.local_id())) {
            Ok(row) => row.name.is_some(),
            Err(_) => return,
        };
        if named {
            return;
        }
        if let Err(err) = self.generate_title(session, branch, writer).await {
            tracing::debug!(%err, "title generation skipped");
        }
    }

    async fn generate_title(
        self: &Arc<Self>,
        session: &SessionId,
        branch: BranchId,
        writer: &EventWriter,
    ) -> AngelResult<()> {
        let handle = self.acquire(session)?;
        let local = session.local_id();
        let history = orchestrator::assemble::turn_history(&handle, branch)?;
        let opening: String = history
            .iter()
            .filter(|m| matches!(m.kind, MessageKind::UserText | MessageKind::ModelText))
            .take(4)
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if opening.is_empty() {
            return Ok(());
        }
        drop(handle);

        let params = crate::llm::provider::GenerateParams {
            contents: vec![crate::llm::provider::Content::user_text(format!(
                "Reply with a short display title (at most six words, no quotes) for this \
                 conversation:\n\n{opening}"
            ))],
            ..Default::default()
        };
        let model = self.config().default_model.clone();
        let title = self
            .provider()
            .generate_one_shot(&model, &params)
            .await?
            .trim()
            .trim_matches('"')
            .to_string();
        if title.is_empty() {
            return Ok(());
        }
        let handle = self.acquire(session)?;
        handle.set_session_name(&local, &title)?;
        self.main().rename_session(session, &title)?;
        writer.send(EventKind::SessionName, &title);
        Ok(())
    }
}

/// Copy a message path into `dest`, rewriting nothing but identifiers.
/// Blobs land first so the refcount triggers find them when the messages
/// arrive.
fn copy_path(
    source: &crate::storage::SessionDb,
    dest: &crate::storage::SessionDb,
    dest_local: &str,
    dest_branch: BranchId,
    path: &[MessageRecord],
    now: i64,
) -> AngelResult<()> {
    let mut chain = MessageChain::load(dest, dest_local, dest_branch)?;
    let mut prev_cumul = 0i64;
    for record in path {
        for attachment in &record.attachments {
            if let Some(data) = source.blob(&attachment.hash)? {
                dest.save_blob(&data)?;
            }
        }
        let mut msg = NewMessage::new(record.kind, &record.text)
            .with_attachments(record.attachments.clone())
            .with_token_delta((record.cumul_tokens - prev_cumul).max(0));
        if let Some(model) = &record.model {
            msg = msg.with_model(model.clone());
        }
        if let Some(aux) = &record.aux {
            msg = msg.with_aux(aux.clone());
        }
        chain.add(msg, now)?;
        prev_cumul = record.cumul_tokens;
    }
    Ok(())
}

/// Sub-agent session identifiers mentioned by function responses on a path
fn referenced_sub_sessions(session: &SessionId, path: &[MessageRecord]) -> Vec<String> {
    let mut found = Vec::new();
    for record in path {
        if record.kind != MessageKind::FunctionResponse {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&record.text) else {
            continue;
        };
        collect_session_ids(&value, session, &mut found);
    }
    found
}

fn collect_session_ids(value: &serde_json::Value, session: &SessionId, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, inner) in map {
                if key == "session_id" {
                    if let Some(id) = inner.as_str() {
                        if session.covers(&SessionId(id.to_string())) && id != session.as_str() {
                            out.push(id.to_string());
                        }
                    }
                }
                collect_session_ids(inner, session, out);
            }
        }
        serde_json::Value::Array(items) => {
            for inner in items {
                collect_session_ids(inner, session, out);
            }
        }
        _ => {}
    }
}
