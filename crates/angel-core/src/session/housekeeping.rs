//! Background housekeeping: temporary-session TTL and idle handle eviction

use std::sync::Arc;
use std::time::Duration;

use crate::error::AngelResult;
use crate::session::Engine;
use crate::types::SessionId;

/// How long a session-DB handle may sit unacquired before it is closed
const HANDLE_IDLE: Duration = Duration::from_secs(600);

/// One sweep: delete expired temporary sessions, close idle handles.
/// Returns the identifiers that were swept.
pub fn sweep_once(engine: &Engine) -> AngelResult<Vec<SessionId>> {
    let ttl_secs = engine.config().temp_session_ttl_hours as i64 * 3600;
    let cutoff = Engine::now() - ttl_secs;
    let stale = engine.main().stale_temporary_sessions(cutoff)?;
    for session in &stale {
        if let Err(err) = engine.delete_session(session) {
            tracing::warn!(session = %session, %err, "temporary session sweep failed");
        }
    }
    let closed = engine.cache().close_idle(HANDLE_IDLE);
    if !stale.is_empty() || closed > 0 {
        tracing::debug!(swept = stale.len(), closed, "housekeeping pass");
    }
    Ok(stale)
}

/// Run sweeps forever on `interval`; spawn as a background task
pub async fn run(engine: Arc<Engine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = sweep_once(&engine) {
            tracing::warn!(%err, "housekeeping sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::scripted::ScriptedProvider;
    use crate::session::service::CreateSessionOptions;
    use crate::tools::ToolRegistry;

    fn engine() -> (tempfile::TempDir, Arc<Engine>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            temp_session_ttl_hours: 0, // everything is instantly stale
            ..Default::default()
        };
        let engine = Engine::new(
            config,
            Arc::new(ScriptedProvider::new()),
            Arc::new(ToolRegistry::new()),
        )
        .unwrap();
        (dir, engine)
    }

    #[test]
    fn test_sweep_removes_only_temporary_sessions() {
        let (_dir, engine) = engine();
        let temp = engine
            .create_session(CreateSessionOptions {
                temporary: true,
                ..Default::default()
            })
            .unwrap();
        let durable = engine.create_session(CreateSessionOptions::default()).unwrap();

        // Backdate both far past any TTL; only the temporary one goes.
        engine.main().touch_session(&temp.id, 1).unwrap();
        engine.main().touch_session(&durable.id, 1).unwrap();

        let swept = sweep_once(&engine).unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0], temp.id);
        assert!(engine.main().get_session(&temp.id).unwrap().is_none());
        assert!(engine.main().get_session(&durable.id).unwrap().is_some());
    }
}
