//! Tool parameter schemas

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One declared parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub description: String,
    /// JSON type name: string, number, boolean, object, array
    pub param_type: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            param_type: "string".to_string(),
            required: true,
        }
    }

    pub fn number(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            param_type: "number".to_string(),
            ..Self::string(name, description)
        }
    }

    pub fn boolean(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            param_type: "boolean".to_string(),
            ..Self::string(name, description)
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// JSON schema of a tool's argument object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSchema {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ToolParameter>,
    ) -> Self {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in parameters {
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
            properties.insert(
                param.name,
                serde_json::json!({
                    "type": param.param_type,
                    "description": param.description,
                }),
            );
        }
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    /// Property names the schema knows about
    pub fn property_names(&self) -> Vec<String> {
        self.parameters["properties"]
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Names listed as required
    pub fn required_names(&self) -> Vec<String> {
        self.parameters["required"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_shape() {
        let schema = ToolSchema::new(
            "write_file",
            "Write a file",
            vec![
                ToolParameter::string("file_path", "Target path"),
                ToolParameter::string("content", "Bytes to write"),
                ToolParameter::boolean("append", "Append instead").optional(),
            ],
        );
        assert_eq!(schema.parameters["type"], "object");
        assert_eq!(
            schema.required_names(),
            vec!["file_path".to_string(), "content".to_string()]
        );
        let mut names = schema.property_names();
        names.sort();
        assert_eq!(names, vec!["append", "content", "file_path"]);
    }
}
