//! Shell tools: run a command, poll a long-running one

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use angel_core::{
    Engine, ExitState, RunOptions, ShellCommandStatus, Tool, ToolContext, ToolFailure,
    ToolOutcome, ToolParameter, ToolSchema,
};

use crate::files::required_str;

/// Default deadline for foreground commands
const DEFAULT_TIMEOUT_SECS: u64 = 300;

pub struct RunShellTool;

#[async_trait]
impl Tool for RunShellTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "run_shell",
            "Run a shell command inside the session sandbox. Set background to \
             true for long-running commands and poll with poll_shell.",
            vec![
                ToolParameter::string("command", "Command line to execute"),
                ToolParameter::string("working_dir", "Working directory").optional(),
                ToolParameter::number("timeout_secs", "Kill after this many seconds").optional(),
                ToolParameter::boolean("background", "Return immediately with a command id")
                    .optional(),
            ],
        )
    }

    async fn run(
        &self,
        ctx: &ToolContext,
        args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutcome, ToolFailure> {
        let command = required_str(args, "command")?;
        let working_dir = args.get("working_dir").and_then(|v| v.as_str());
        let background = args
            .get("background")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let timeout = args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let local = ctx.local_id();
        let row_id = ctx
            .db
            .insert_shell_command(&local, command, Engine::now())?;
        let handle = ctx.fs.run_with(
            command,
            working_dir,
            RunOptions {
                timeout: Some(Duration::from_secs(timeout)),
                ..Default::default()
            },
        )?;

        if background {
            // The spawned task owns the handle; the row records progress.
            let db = std::sync::Arc::clone(&ctx.db);
            tokio::spawn(async move {
                let state = handle.wait().await;
                tracing::debug!(command_id = row_id, ?state, "background command finished");
                let status = match state {
                    ExitState::Exited(0) => ShellCommandStatus::Complete,
                    _ => ShellCommandStatus::Failed,
                };
                let _ = db.finish_shell_command(
                    row_id,
                    status,
                    &handle.stdout(),
                    &handle.stderr(),
                    state.exit_code(),
                    Engine::now(),
                );
            });
            return Ok(ToolOutcome::success(json!({
                "command_id": row_id,
                "status": "running",
            })));
        }

        let state = tokio::select! {
            state = handle.wait() => state,
            _ = ctx.cancel.cancelled() => {
                handle.cancel();
                handle.wait().await
            }
        };
        let stdout = handle.stdout();
        let stderr = handle.stderr();
        let status = match state {
            ExitState::Exited(0) => ShellCommandStatus::Complete,
            _ => ShellCommandStatus::Failed,
        };
        ctx.db.finish_shell_command(
            row_id,
            status,
            &stdout,
            &stderr,
            state.exit_code(),
            Engine::now(),
        )?;
        handle.close().await;

        Ok(ToolOutcome::success(json!({
            "command_id": row_id,
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": state.exit_code(),
            "timed_out": state == ExitState::TimedOut,
        })))
    }
}

pub struct PollShellTool;

#[async_trait]
impl Tool for PollShellTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "poll_shell",
            "Check on a background command started by run_shell.",
            vec![ToolParameter::number("command_id", "Identifier returned by run_shell")],
        )
    }

    async fn run(
        &self,
        ctx: &ToolContext,
        args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutcome, ToolFailure> {
        let id = args
            .get("command_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ToolFailure::new("argument \"command_id\" must be a number"))?;
        let row = ctx
            .db
            .poll_shell_command(id, Engine::now())?
            .ok_or_else(|| ToolFailure::new(format!("no command with id {id}")))?;
        Ok(ToolOutcome::success(json!({
            "command_id": row.id,
            "status": row.status.as_str(),
            "stdout": row.stdout,
            "stderr": row.stderr,
            "exit_code": row.exit_code,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tool_context;

    #[tokio::test]
    async fn test_foreground_command_persists_row() {
        let (_dir, ctx) = tool_context();
        let mut args = serde_json::Map::new();
        args.insert("command".into(), json!("echo out; echo err >&2"));
        let outcome = RunShellTool.run(&ctx, &args).await.unwrap();
        let value = match outcome {
            ToolOutcome::Success { value, .. } => value,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(value["stdout"], "out\n");
        assert_eq!(value["stderr"], "err\n");
        assert_eq!(value["exit_code"], 0);

        let row = ctx
            .db
            .poll_shell_command(value["command_id"].as_i64().unwrap(), 99)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ShellCommandStatus::Complete);
        assert_eq!(row.stdout, "out\n");
    }

    #[tokio::test]
    async fn test_background_command_polls_to_completion() {
        let (_dir, ctx) = tool_context();
        let mut args = serde_json::Map::new();
        args.insert("command".into(), json!("echo slow"));
        args.insert("background".into(), json!(true));
        let outcome = RunShellTool.run(&ctx, &args).await.unwrap();
        let id = match outcome {
            ToolOutcome::Success { value, .. } => value["command_id"].as_i64().unwrap(),
            other => panic!("unexpected {other:?}"),
        };

        // Wait for the background task to record the result.
        let mut row = None;
        for _ in 0..50 {
            let current = ctx.db.poll_shell_command(id, 1).unwrap().unwrap();
            if current.status != ShellCommandStatus::Running {
                row = Some(current);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let row = row.expect("command should finish");
        assert_eq!(row.status, ShellCommandStatus::Complete);
        assert_eq!(row.stdout, "slow\n");
    }

    #[tokio::test]
    async fn test_failed_command_marked_failed() {
        let (_dir, ctx) = tool_context();
        let mut args = serde_json::Map::new();
        args.insert("command".into(), json!("exit 2"));
        let outcome = RunShellTool.run(&ctx, &args).await.unwrap();
        let value = match outcome {
            ToolOutcome::Success { value, .. } => value,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(value["exit_code"], 2);
        let row = ctx
            .db
            .poll_shell_command(value["command_id"].as_i64().unwrap(), 1)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ShellCommandStatus::Failed);
    }
}
