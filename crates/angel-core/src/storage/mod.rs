//! Split-database storage engine
//!
//! One catalog database per installation plus one database file per main
//! session group. The catalog owns the session index, workspaces,
//! configuration, and the cross-session full-text search tables; a session
//! database owns everything else and is the only place its messages,
//! branches, and blobs exist.

pub mod chain;
pub mod handle_cache;
pub mod main_db;
pub mod message;
pub mod migrate;
pub mod session_db;

pub use chain::MessageChain;
pub use handle_cache::{SessionDbCache, SessionDbHandle};
pub use main_db::{MainDb, SearchHit, SessionSummary, WorkspaceRecord};
pub use message::{Attachment, MessageKind, MessageRecord, NewMessage};
pub use migrate::{migrate_monolithic, MigrationReport};
pub use session_db::{
    blob_hash, BranchRow, SessionDb, SessionRow, ShellCommandRow, ShellCommandStatus,
};
