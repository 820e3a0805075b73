//! Angel Core Library
//!
//! The session engine behind the angel proxy: split-database conversation
//! storage with branching and deduplicated blobs, a streaming tool-use
//! orchestrator over pluggable LLM providers, per-session sandboxed
//! filesystems, and per-session event broadcast for SSE listeners.

#![allow(clippy::collapsible_if)]
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::redundant_closure)]
#![allow(clippy::match_like_matches_macro)]

pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod history;
pub mod llm;
pub mod orchestrator;
pub mod session;
pub mod storage;
pub mod tools;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ProviderConfig, ProviderKind};
pub use error::{AngelError, AngelResult};
pub use events::{broker, EventBroker, EventKind, EventWriter, SessionEvent};
pub use fs::{is_network_filesystem, CommandHandle, ExitState, RunOptions, SessionFs};
pub use history::{curate, CurationOptions};
pub use llm::{
    build_provider, Chunk, ChunkStream, Content, GenerateParams, GeminiProvider, OpenAiProvider,
    Part, Provider, Role, ScriptedProvider, ToolDeclaration,
};
pub use orchestrator::{
    branch_ops, compress_session, registry as call_registry, resume_after_confirmation, run_turn,
    BranchState, CompressionOutcome, TurnOutcome,
};
pub use session::{
    housekeeping,
    service::{CreateSessionOptions, IncomingAttachment},
    CreatedSession, Engine,
};
pub use storage::{
    blob_hash, migrate_monolithic, Attachment, BranchRow, MainDb, MessageChain, MessageKind,
    MessageRecord, MigrationReport, NewMessage, SearchHit, SessionDb, SessionDbCache,
    SessionDbHandle, SessionRow, SessionSummary, ShellCommandRow, ShellCommandStatus,
    WorkspaceRecord,
};
pub use tools::{
    SubagentSpawner, Tool, ToolCall, ToolContext, ToolFailure, ToolOutcome, ToolParameter,
    ToolRegistry, ToolSchema,
};
pub use types::{BranchId, MessageId, SessionId, WorkspaceId};
