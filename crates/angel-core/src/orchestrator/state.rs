//! Branch state machine
//!
//! A branch is `Idle` (no call, no pending confirmation), `Streaming` (an
//! orchestrator is registered for its session), or `AwaitingConfirmation`
//! (the pending field is set and the stream has closed). At most one branch
//! of a session streams at a time, and a branch awaiting confirmation
//! cannot accept a new user turn until resolved.

use crate::error::{AngelError, AngelResult};
use crate::orchestrator::registry;
use crate::storage::session_db::BranchRow;
use crate::types::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Idle,
    Streaming,
    AwaitingConfirmation,
}

impl BranchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::AwaitingConfirmation => "awaiting_confirmation",
        }
    }
}

/// Derive a branch's state from the call registry and its pending field.
/// The pending field wins: a branch never streams while a confirmation is
/// outstanding.
pub fn branch_state(session: &SessionId, branch: &BranchRow) -> BranchState {
    if branch.pending_confirmation.is_some() {
        BranchState::AwaitingConfirmation
    } else if registry::is_active(session) {
        BranchState::Streaming
    } else {
        BranchState::Idle
    }
}

/// Guard for a new user turn: only an idle branch accepts one
pub fn ensure_accepts_user_turn(session: &SessionId, branch: &BranchRow) -> AngelResult<()> {
    match branch_state(session, branch) {
        BranchState::Idle => Ok(()),
        BranchState::Streaming => Err(AngelError::conflict(format!(
            "session {session} is streaming"
        ))),
        BranchState::AwaitingConfirmation => Err(AngelError::conflict(format!(
            "branch {} is awaiting confirmation",
            branch.id
        ))),
    }
}

/// Guard for confirm/deny: only a branch with a pending payload resolves
pub fn ensure_awaiting_confirmation(branch: &BranchRow) -> AngelResult<serde_json::Value> {
    branch.pending_confirmation.clone().ok_or_else(|| {
        AngelError::conflict(format!("branch {} has no pending confirmation", branch.id))
    })
}
