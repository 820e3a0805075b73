//! Sub-agent tool: delegate a task to a child session

use async_trait::async_trait;
use serde_json::{json, Value};

use angel_core::{Tool, ToolContext, ToolFailure, ToolOutcome, ToolParameter, ToolSchema};

use crate::files::required_str;

pub struct SubagentTool;

#[async_trait]
impl Tool for SubagentTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "spawn_subagent",
            "Delegate a self-contained task to a sub-agent running in its own \
             session. Returns the sub-agent's final answer.",
            vec![ToolParameter::string("task", "Complete description of the task")],
        )
    }

    async fn run(
        &self,
        ctx: &ToolContext,
        args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutcome, ToolFailure> {
        let task = required_str(args, "task")?;
        let spawner = ctx
            .subagent
            .as_ref()
            .ok_or_else(|| ToolFailure::new("sub-agents are not available in this context"))?;
        let raw = spawner.run_subagent(&ctx.session_id, task).await?;
        // The spawner reports {"result", "session_id"}; pass it through so
        // the transcript records which child session did the work.
        let value: Value = serde_json::from_str(&raw)
            .unwrap_or_else(|_| json!({ "result": raw }));
        Ok(ToolOutcome::success(value))
    }
}
