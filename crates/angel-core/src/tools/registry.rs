//! Tool registry and dispatch
//!
//! Tools are values in a map keyed by name; adding one is a single
//! registration call. Argument validation happens up front and unknown
//! keys are an error, so parameter drift between the model's training and
//! the current tool surface fails loudly instead of silently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AngelError, AngelResult};
use crate::llm::provider::ToolDeclaration;
use crate::tools::schema::ToolSchema;
use crate::tools::types::{ToolCall, ToolContext, ToolFailure, ToolOutcome};

/// A registered tool: schema plus handler
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    /// Execute with validated arguments. A `ToolFailure` is fed back to the
    /// model as an error-shaped function response.
    async fn run(
        &self,
        ctx: &ToolContext,
        args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutcome, ToolFailure>;
}

/// Name → tool map assembled at startup
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.schema().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Declarations advertised to the model
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut declarations: Vec<_> = self
            .tools
            .values()
            .map(|tool| {
                let schema = tool.schema();
                ToolDeclaration {
                    name: schema.name,
                    description: schema.description,
                    parameters: schema.parameters,
                }
            })
            .collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }

    /// Validate `call`'s arguments against the tool's schema: unknown keys
    /// are an error, missing required keys are an error
    pub fn validate(&self, call: &ToolCall) -> AngelResult<()> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| AngelError::validation(format!("unknown tool {:?}", call.name)))?;
        let schema = tool.schema();
        let known = schema.property_names();
        for key in call.args.keys() {
            if !known.iter().any(|k| k == key) {
                return Err(AngelError::validation(format!(
                    "tool {:?} does not accept argument {key:?}",
                    call.name
                )));
            }
        }
        for required in schema.required_names() {
            if !call.args.contains_key(&required) {
                return Err(AngelError::validation(format!(
                    "tool {:?} requires argument {required:?}",
                    call.name
                )));
            }
        }
        Ok(())
    }

    /// Validate then run. Handler failures come back as `Ok(Err(failure))`
    /// so the caller can persist an error-shaped response; only schema
    /// violations surface as engine errors.
    pub async fn dispatch(
        &self,
        ctx: &ToolContext,
        call: &ToolCall,
    ) -> AngelResult<Result<ToolOutcome, ToolFailure>> {
        self.validate(call)?;
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| AngelError::validation(format!("unknown tool {:?}", call.name)))?;
        tracing::debug!(tool = %call.name, "dispatching tool call");
        Ok(tool.run(ctx, &call.args).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::ToolParameter;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn schema(&self) -> ToolSchema {
            ToolSchema::new(
                "echo",
                "Echo the input back",
                vec![
                    ToolParameter::string("text", "What to echo"),
                    ToolParameter::boolean("loud", "Uppercase it").optional(),
                ],
            )
        }

        async fn run(
            &self,
            _ctx: &ToolContext,
            args: &serde_json::Map<String, Value>,
        ) -> Result<ToolOutcome, ToolFailure> {
            let text = args["text"].as_str().unwrap_or_default();
            Ok(ToolOutcome::success(serde_json::json!({ "echo": text })))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        registry
    }

    fn call(args: Value) -> ToolCall {
        ToolCall::new("echo", args.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_declarations_sorted_and_complete() {
        let declarations = registry().declarations();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].name, "echo");
        assert_eq!(declarations[0].parameters["type"], "object");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let registry = registry();
        let err = registry
            .validate(&call(serde_json::json!({"text": "hi", "volume": 11})))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("volume"));
    }

    #[test]
    fn test_missing_required_rejected() {
        let registry = registry();
        let err = registry
            .validate(&call(serde_json::json!({"loud": true})))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let registry = registry();
        let err = registry
            .validate(&ToolCall::new("nope", Default::default()))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_valid_args_pass() {
        let registry = registry();
        registry
            .validate(&call(serde_json::json!({"text": "hi", "loud": false})))
            .unwrap();
    }
}
