//! Process-wide registry of in-flight LLM calls
//!
//! At most one call per session across the whole process. Cancelling a
//! session also cancels every sub-agent session whose identifier extends it
//! with a dot. The lock is never held across a provider stream or a
//! subprocess wait.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{AngelError, AngelResult};
use crate::types::SessionId;

struct ActiveCall {
    cancel: CancellationToken,
    started: Instant,
}

static CALLS: LazyLock<Mutex<HashMap<String, ActiveCall>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Unregisters the call when dropped
#[derive(Debug)]
pub struct CallGuard {
    session: SessionId,
    cancel: CancellationToken,
}

impl CallGuard {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        CALLS.lock().remove(self.session.as_str());
    }
}

/// Record a new in-flight call. A second registration for the same session
/// is a conflict and does not perturb the existing call.
pub fn register(session: &SessionId) -> AngelResult<CallGuard> {
    let mut calls = CALLS.lock();
    if calls.contains_key(session.as_str()) {
        return Err(AngelError::conflict(format!(
            "session {session} already has an active call"
        )));
    }
    let cancel = CancellationToken::new();
    calls.insert(
        session.as_str().to_string(),
        ActiveCall {
            cancel: cancel.clone(),
            started: Instant::now(),
        },
    );
    Ok(CallGuard {
        session: session.clone(),
        cancel,
    })
}

/// Cancel the session's call and those of all its sub-agents; idempotent
pub fn cancel(session: &SessionId) {
    let calls = CALLS.lock();
    for (id, call) in calls.iter() {
        if session.covers(&SessionId(id.clone())) {
            call.cancel.cancel();
        }
    }
}

/// Elapsed time of the session's active call, if one is running
pub fn active_elapsed(session: &SessionId) -> Option<std::time::Duration> {
    CALLS
        .lock()
        .get(session.as_str())
        .map(|call| call.started.elapsed())
}

/// Whether the session has an in-flight call
pub fn is_active(session: &SessionId) -> bool {
    CALLS.lock().contains_key(session.as_str())
}
