//! Tool runtime: schemas, registry, dispatch, confirmation plumbing

pub mod registry;
pub mod schema;
pub mod types;

pub use registry::{Tool, ToolRegistry};
pub use schema::{ToolParameter, ToolSchema};
pub use types::{SubagentSpawner, ToolCall, ToolContext, ToolFailure, ToolOutcome};
