use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Delimiter between server and tool name in the northbound-facing tool name.
/// Spec resolves the `::` vs `__` ambiguity in favor of `__` (see DESIGN.md).
pub const PREFIX_DELIMITER: &str = "__";

static PREFIXED_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Raw tool name as reported by a downstream, before the server prefix is applied.
/// Rejects names that already contain the delimiter, since that would make the
/// prefixed form ambiguous to split back apart.
pub fn validate_raw_name(name: &str) -> Result<(), GatewayError> {
    if name.contains(PREFIX_DELIMITER) {
        return Err(GatewayError::Validation(format!(
            "tool name '{name}' contains the reserved delimiter '{PREFIX_DELIMITER}'"
        )));
    }
    Ok(())
}

/// Builds the northbound tool name `<server>__<tool>` and decorates the
/// description with `[serverName] <description>` per spec.md §4.3.
pub fn prefix_tool(server: &str, tool: &Tool) -> Result<Tool, GatewayError> {
    validate_raw_name(server)?;
    validate_raw_name(&tool.name)?;
    let prefixed_name = format!("{server}{PREFIX_DELIMITER}{}", tool.name);
    if !PREFIXED_NAME_RE.is_match(&prefixed_name) {
        return Err(GatewayError::Validation(format!(
            "prefixed tool name '{prefixed_name}' does not match the LLM-client naming pattern"
        )));
    }
    Ok(Tool {
        name: prefixed_name,
        title: tool.title.clone(),
        description: format!("[{server}] {}", tool.description),
        input_schema: tool.input_schema.clone(),
    })
}

/// Splits a prefixed name on the first delimiter occurrence, returning
/// `(server, tool)`. Errors with `UnknownTool` (not `Validation`) because by
/// the time this runs, the caller already committed to a tool-call request.
pub fn split_prefixed(name: &str) -> Result<(&str, &str), GatewayError> {
    name.split_once(PREFIX_DELIMITER)
        .filter(|(server, tool)| !server.is_empty() && !tool.is_empty())
        .ok_or_else(|| GatewayError::UnknownTool(name.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { data: String, #[serde(rename = "mimeType")] mime_type: String },
    Audio { data: String, #[serde(rename = "mimeType")] mime_type: String },
    Resource { resource: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CallResult {
    pub content: Vec<ContentPart>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallResult {
    pub fn text(s: impl Into<String>) -> Self {
        CallResult {
            content: vec![ContentPart::Text { text: s.into() }],
            is_error: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            title: None,
            description: "adds two numbers".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn prefixes_and_decorates_description() {
        let prefixed = prefix_tool("math", &tool("add")).unwrap();
        assert_eq!(prefixed.name, "math__add");
        assert_eq!(prefixed.description, "[math] adds two numbers");
    }

    #[test]
    fn rejects_raw_name_with_delimiter() {
        let err = prefix_tool("math", &tool("weird__add")).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn splits_on_first_delimiter_only() {
        let (server, name) = split_prefixed("math__add__extra").unwrap();
        assert_eq!(server, "math");
        assert_eq!(name, "add__extra");
    }

    #[test]
    fn unknown_tool_when_no_delimiter() {
        let err = split_prefixed("add").unwrap_err();
        assert!(matches!(err, GatewayError::UnknownTool(_)));
    }
}
