//! Branch operations: edit, retry, continue-after
//!
//! Edit-with-retry forks a new branch at the original message's parent and
//! replays from there; retry without edit copies the message verbatim.
//! Retry-error lives on the service (no fork involved); continue-after
//! resumes generation on the current branch.

use std::sync::Arc;

use serde_json::json;

use crate::error::{AngelError, AngelResult};
use crate::events::{EventKind, EventWriter};
use crate::orchestrator::{run_turn, state, TurnOutcome};
use crate::session::Engine;
use crate::storage::message::{MessageKind, NewMessage};
use crate::storage::MessageChain;
use crate::types::{BranchId, MessageId, SessionId};

/// Fork at `message`'s parent and replay with `new_text` (edit) or the
/// original text (retry). The primary branch is untouched; the client
/// switches explicitly if it wants the fork rendered by default.
pub async fn fork_and_rerun(
    engine: &Arc<Engine>,
    session: &SessionId,
    message: MessageId,
    new_text: Option<&str>,
    writer: &EventWriter,
) -> AngelResult<(BranchId, TurnOutcome)> {
    let handle = engine.acquire(session)?;
    let local = session.local_id();
    let record = handle.require_message(message)?;
    if record.kind != MessageKind::UserText {
        return Err(AngelError::conflict(format!(
            "only user messages can be edited or retried, {} is {}",
            message,
            record.kind.as_str()
        )));
    }
    let branch_row = handle.require_branch(record.branch_id)?;
    state::ensure_accepts_user_turn(session, &branch_row)?;

    let now = Engine::now();
    let fork = match record.parent_id {
        Some(parent) => handle.create_branch(parent, now)?,
        None => handle.create_detached_branch(&local, now)?,
    };

    let mut chain = MessageChain::load(&handle, &local, fork.id)?;
    let text = new_text.unwrap_or(&record.text);
    let replay = chain.add(
        NewMessage::new(MessageKind::UserText, text)
            .with_attachments(record.attachments.clone())
            .with_token_delta((text.chars().count() as i64 + 3) / 4),
        now,
    )?;
    writer.send(EventKind::Acknowledge, json!({ "id": replay.id }).to_string());
    drop(chain);
    drop(handle);

    let outcome = run_turn(engine, session, fork.id, writer).await?;
    Ok((fork.id, outcome))
}

/// Resume generation after a model message that was edited in place. No
/// fork: the model continues on the current branch.
pub async fn continue_after(
    engine: &Arc<Engine>,
    session: &SessionId,
    message: MessageId,
    writer: &EventWriter,
) -> AngelResult<TurnOutcome> {
    let handle = engine.acquire(session)?;
    let record = handle.require_message(message)?;
    if record.kind != MessageKind::ModelText {
        return Err(AngelError::conflict(format!(
            "continue-after applies to model messages, {} is {}",
            message,
            record.kind.as_str()
        )));
    }
    let tail = handle
        .last_message(record.branch_id)?
        .map(|m| m.id)
        .ok_or_else(|| AngelError::not_found(format!("branch {} is empty", record.branch_id)))?;
    if tail != record.id {
        return Err(AngelError::conflict(format!(
            "message {message} is not the tail of its branch"
        )));
    }
    let branch_row = handle.require_branch(record.branch_id)?;
    state::ensure_accepts_user_turn(session, &branch_row)?;
    let branch = record.branch_id;
    drop(handle);

    run_turn(engine, session, branch, writer).await
}
