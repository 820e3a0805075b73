//! Refcounted cache of open session-database handles
//!
//! Session databases are opened per main-session group on demand: callers
//! acquire, use, release. A housekeeping pass closes handles that have been
//! idle (zero acquirers) past a deadline. The cache never holds its lock
//! across database work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::AngelResult;
use crate::storage::session_db::SessionDb;

struct CacheEntry {
    db: Arc<SessionDb>,
    acquirers: usize,
    idle_since: Instant,
}

/// The process-wide session-DB handle cache
pub struct SessionDbCache {
    sessions_dir: PathBuf,
    catalog_path: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

/// RAII acquisition of one session database handle
pub struct SessionDbHandle {
    cache: Arc<SessionDbCache>,
    db_key: String,
    db: Arc<SessionDb>,
}

impl SessionDbCache {
    pub fn new(sessions_dir: PathBuf, catalog_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            sessions_dir,
            catalog_path,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Acquire the handle for `db_key`, opening the database if needed
    pub fn acquire(self: &Arc<Self>, db_key: &str) -> AngelResult<SessionDbHandle> {
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(db_key) {
                entry.acquirers += 1;
                return Ok(SessionDbHandle {
                    cache: Arc::clone(self),
                    db_key: db_key.to_string(),
                    db: Arc::clone(&entry.db),
                });
            }
        }
        // Open outside the lock; a racing open of the same key is resolved
        // by keeping whichever entry landed first.
        let opened = Arc::new(SessionDb::open(
            &self.sessions_dir,
            db_key,
            &self.catalog_path,
        )?);
        let mut entries = self.entries.lock();
        let entry = entries.entry(db_key.to_string()).or_insert_with(|| CacheEntry {
            db: Arc::clone(&opened),
            acquirers: 0,
            idle_since: Instant::now(),
        });
        entry.acquirers += 1;
        Ok(SessionDbHandle {
            cache: Arc::clone(self),
            db_key: db_key.to_string(),
            db: Arc::clone(&entry.db),
        })
    }

    /// Drop the cached handle for `db_key` (session deletion)
    pub fn evict(&self, db_key: &str) {
        self.entries.lock().remove(db_key);
    }

    /// Close handles idle longer than `max_idle`; returns how many closed
    pub fn close_idle(&self, max_idle: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.acquirers > 0 || entry.idle_since.elapsed() < max_idle
        });
        before - entries.len()
    }

    pub fn open_count(&self) -> usize {
        self.entries.lock().len()
    }

    fn release(&self, db_key: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(db_key) {
            entry.acquirers = entry.acquirers.saturating_sub(1);
            if entry.acquirers == 0 {
                entry.idle_since = Instant::now();
            }
        }
    }
}

impl std::ops::Deref for SessionDbHandle {
    type Target = SessionDb;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl SessionDbHandle {
    pub fn db(&self) -> &Arc<SessionDb> {
        &self.db
    }
}

impl Drop for SessionDbHandle {
    fn drop(&mut self) {
        self.cache.release(&self.db_key);
    }
}
