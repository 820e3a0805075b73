//! File tools: read, write, list

use async_trait::async_trait;
use serde_json::{json, Value};

use angel_core::{Tool, ToolContext, ToolFailure, ToolOutcome, ToolParameter, ToolSchema};

/// Largest file the read tool will inline, to keep the context bounded
const MAX_READ_BYTES: usize = 512 * 1024;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "read_file",
            "Read a text file from the session filesystem. Relative paths resolve \
             inside the sandbox; absolute paths must lie under a configured root.",
            vec![ToolParameter::string("file_path", "Path of the file to read")],
        )
    }

    async fn run(
        &self,
        ctx: &ToolContext,
        args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutcome, ToolFailure> {
        let path = required_str(args, "file_path")?;
        let data = ctx.fs.read_file(path)?;
        if data.len() > MAX_READ_BYTES {
            return Err(ToolFailure::new(format!(
                "{path} is {} bytes, larger than the {MAX_READ_BYTES} byte limit",
                data.len()
            )));
        }
        match String::from_utf8(data) {
            Ok(content) => Ok(ToolOutcome::success(json!({ "content": content }))),
            Err(raw) => Ok(ToolOutcome::success(json!({
                "content": null,
                "binary": true,
                "size": raw.into_bytes().len(),
            }))),
        }
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "write_file",
            "Write a file. Writes inside the sandbox happen immediately; any \
             absolute path requires user confirmation first.",
            vec![
                ToolParameter::string("file_path", "Path of the file to write"),
                ToolParameter::string("content", "Full content to write"),
            ],
        )
    }

    async fn run(
        &self,
        ctx: &ToolContext,
        args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutcome, ToolFailure> {
        let path = required_str(args, "file_path")?;
        let content = required_str(args, "content")?;

        if std::path::Path::new(path).is_absolute() && !ctx.confirmation_received {
            // Pause for approval; the payload shows the user exactly what
            // would be written where.
            return Ok(ToolOutcome::pending(json!({
                "file_path": path,
                "content": content,
            })));
        }

        if ctx.confirmation_received && std::path::Path::new(path).is_absolute() {
            // The user approved this exact path (possibly after editing
            // it); honor it verbatim.
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| ToolFailure::new(e.to_string()))?;
            }
            std::fs::write(path, content).map_err(|e| ToolFailure::new(e.to_string()))?;
        } else {
            ctx.fs.write_file(path, content.as_bytes())?;
        }
        Ok(ToolOutcome::success(json!({
            "written": path,
            "bytes": content.len(),
        })))
    }
}

pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "list_directory",
            "List the entries of a directory in the session filesystem.",
            vec![ToolParameter::string("path", "Directory to list").optional()],
        )
    }

    async fn run(
        &self,
        ctx: &ToolContext,
        args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutcome, ToolFailure> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let entries = ctx.fs.read_dir(path)?;
        Ok(ToolOutcome::success(json!({ "entries": entries })))
    }
}

pub(crate) fn required_str<'a>(
    args: &'a serde_json::Map<String, Value>,
    key: &str,
) -> Result<&'a str, ToolFailure> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolFailure::new(format!("argument {key:?} must be a string")))
}
