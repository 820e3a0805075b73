//! Built-in tools for the angel proxy
//!
//! File and shell tools operate strictly through the session filesystem;
//! the recall tool reverses `/clearblobs` for a single attachment; the
//! sub-agent tool delegates to a child orchestrator through the spawner
//! injected by the engine.

pub mod files;
pub mod recall;
pub mod shell;
pub mod subagent;
pub mod web_fetch;

use std::sync::Arc;

use angel_core::ToolRegistry;

pub use files::{ListDirectoryTool, ReadFileTool, WriteFileTool};
pub use recall::RecallTool;
pub use shell::{PollShellTool, RunShellTool};
pub use subagent::SubagentTool;
pub use web_fetch::WebFetchTool;

/// Register every built-in tool
pub fn register_builtin(registry: &mut ToolRegistry) {
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(WriteFileTool));
    registry.register(Arc::new(ListDirectoryTool));
    registry.register(Arc::new(RunShellTool));
    registry.register(Arc::new(PollShellTool));
    registry.register(Arc::new(RecallTool));
    registry.register(Arc::new(WebFetchTool::new()));
    registry.register(Arc::new(SubagentTool));
}
