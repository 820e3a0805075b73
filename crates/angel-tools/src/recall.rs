//! Recall tool: re-attach blob bytes hidden by `/clearblobs`

use async_trait::async_trait;
use serde_json::{json, Value};

use angel_core::{
    Attachment, Tool, ToolContext, ToolFailure, ToolOutcome, ToolParameter, ToolSchema,
};

use crate::files::required_str;

pub struct RecallTool;

#[async_trait]
impl Tool for RecallTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "recall",
            "Fetch a previously omitted attachment back into the conversation by \
             its content hash.",
            vec![ToolParameter::string("hash", "Content hash of the attachment")],
        )
    }

    async fn run(
        &self,
        ctx: &ToolContext,
        args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutcome, ToolFailure> {
        let hash = required_str(args, "hash")?;
        let data = ctx
            .db
            .blob(hash)?
            .ok_or_else(|| ToolFailure::new(format!("no blob with hash {hash}")))?;
        Ok(ToolOutcome::with_attachments(
            json!({ "recalled": hash, "size": data.len() }),
            vec![Attachment {
                hash: hash.to_string(),
                file_name: format!("recall-{}", &hash[..hash.len().min(12)]),
                mime_type: "application/octet-stream".to_string(),
                omitted: false,
            }],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tool_context;

    #[tokio::test]
    async fn test_recall_attaches_existing_blob() {
        let (_dir, ctx) = tool_context();
        let hash = ctx.db.save_blob(b"hidden bytes").unwrap();
        let mut args = serde_json::Map::new();
        args.insert("hash".into(), json!(hash));
        match RecallTool.run(&ctx, &args).await.unwrap() {
            ToolOutcome::Success { value, attachments } => {
                assert_eq!(value["size"], 12);
                assert_eq!(attachments.len(), 1);
                assert_eq!(attachments[0].hash, hash);
                assert!(!attachments[0].omitted);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recall_unknown_hash_fails() {
        let (_dir, ctx) = tool_context();
        let mut args = serde_json::Map::new();
        args.insert("hash".into(), json!("feedface"));
        let err = RecallTool.run(&ctx, &args).await.unwrap_err();
        assert!(err.message.contains("feedface"));
    }
}
