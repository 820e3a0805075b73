//! Session engine facade
//!
//! [`Engine`] ties the storage engine, the provider, the tool registry,
//! and the per-session filesystems together and exposes the operations the
//! HTTP layer calls. The orchestrator borrows it for the turn loop.

pub mod housekeeping;
pub mod service;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{AngelError, AngelResult};
use crate::fs::{is_network_filesystem, SessionFs};
use crate::llm::provider::Provider;
use crate::storage::handle_cache::{SessionDbCache, SessionDbHandle};
use crate::storage::main_db::MainDb;
use crate::storage::message::MessageKind;
use crate::tools::types::SubagentSpawner;
use crate::tools::ToolRegistry;
use crate::types::{BranchId, SessionId};

/// The process-wide session engine
pub struct Engine {
    config: Config,
    main: Arc<MainDb>,
    cache: Arc<SessionDbCache>,
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    fs_handles: Mutex<HashMap<String, Arc<SessionFs>>>,
}

impl Engine {
    /// Open the engine. Refuses to place the catalog database on a network
    /// filesystem.
    pub fn new(
        config: Config,
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
    ) -> AngelResult<Arc<Self>> {
        if is_network_filesystem(&config.data_dir) {
            return Err(AngelError::config(format!(
                "data directory {} is on a network filesystem; refusing to open the database there",
                config.data_dir.display()
            )));
        }
        std::fs::create_dir_all(&config.data_dir)?;
        let main = Arc::new(MainDb::open(&config.main_db_path())?);
        let cache = SessionDbCache::new(config.sessions_dir(), config.main_db_path().clone());
        Ok(Arc::new(Self {
            config,
            main,
            cache,
            provider,
            registry,
            fs_handles: Mutex::new(HashMap::new()),
        }))
    }

    /// Seconds since the epoch; the engine's single clock
    pub fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn main(&self) -> &Arc<MainDb> {
        &self.main
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<SessionDbCache> {
        &self.cache
    }

    /// Acquire the session-group database owning `session`
    pub fn acquire(&self, session: &SessionId) -> AngelResult<SessionDbHandle> {
        self.cache.acquire(&session.db_key())
    }

    /// The session's sandbox filesystem, created on first use
    pub fn fs_for(&self, session: &SessionId) -> AngelResult<Arc<SessionFs>> {
        let mut handles = self.fs_handles.lock();
        if let Some(fs) = handles.get(session.as_str()) {
            return Ok(Arc::clone(fs));
        }
        let fs = Arc::new(SessionFs::new(&self.config.sandbox_dir(), session.as_str())?);
        if self.config.disable_os_sandbox {
            fs.disable_os_sandbox();
        }
        handles.insert(session.as_str().to_string(), Arc::clone(&fs));
        Ok(fs)
    }

    /// Drop and delete the session's sandbox
    pub fn destroy_fs(&self, session: &SessionId) -> AngelResult<()> {
        let removed = self.fs_handles.lock().remove(session.as_str());
        match removed {
            Some(fs) => match Arc::try_unwrap(fs) {
                Ok(fs) => fs.destroy(),
                Err(_) => Ok(()), // a live tool still holds it; TTL sweep retries
            },
            None => {
                let dir = self.config.sandbox_dir().join(session.as_str());
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                }
                Ok(())
            }
        }
    }

    /// Spawner injected into tool contexts for sub-agent tools
    pub fn subagent_spawner(self: &Arc<Self>) -> Arc<dyn SubagentSpawner> {
        Arc::new(EngineSubagent {
            engine: Arc::clone(self),
        })
    }
}

/// Runs a child orchestrator rooted at a sub-session of the caller
struct EngineSubagent {
    engine: Arc<Engine>,
}

#[async_trait::async_trait]
impl SubagentSpawner for EngineSubagent {
    async fn run_subagent(&self, parent: &SessionId, task: &str) -> AngelResult<String> {
        let suffix: String = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let child = SessionId(format!("{parent}.{suffix}"));
        let local = child.local_id();
        let now = Engine::now();

        let handle = self.engine.acquire(&child)?;
        let branch = handle.create_session(&local, None, None, None, now)?;
        self.engine.main().upsert_session(&child, None, None, now)?;
        handle.append_message(
            &local,
            branch,
            None,
            &crate::storage::message::NewMessage::new(MessageKind::UserText, task),
            now,
        )?;
        drop(handle);

        let writer = crate::events::broker().writer(&child);
        // Indirect recursion through the tool dispatch; box the future.
        let outcome = Box::pin(crate::orchestrator::run_turn(
            &self.engine,
            &child,
            branch,
            &writer,
        ))
        .await?;
        tracing::debug!(child = %child, ?outcome, "sub-agent finished");

        let handle = self.engine.acquire(&child)?;
        let result = handle
            .last_message(branch)?
            .filter(|m| m.kind == MessageKind::ModelText)
            .map(|m| m.text)
            .unwrap_or_default();
        Ok(serde_json::json!({ "result": result, "session_id": child.as_str() }).to_string())
    }
}

/// Identifier plus branch of a freshly created session
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub id: SessionId,
    pub branch: BranchId,
}
