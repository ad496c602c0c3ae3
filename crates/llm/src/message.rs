use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Anything a provider hands back that carries a piece of text.
pub trait TextFragment: fmt::Debug + Send + Sync {
    fn text(&self) -> Option<&str>;
}

#[derive(Debug, Clone)]
pub enum ContentPart {
    Text(String),
    Mapping(Map<String, Value>),
    Fragment(Arc<dyn TextFragment>),
}

impl ContentPart {
    pub fn text(&self) -> Option<&str> {
        match self {
            ContentPart::Text(text) => Some(text.as_str()),
            ContentPart::Mapping(map) => map.get("text").and_then(Value::as_str),
            ContentPart::Fragment(fragment) => fragment.text(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum MessageContent {
    #[default]
    Empty,
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text fragments in their original order; parts without text are skipped.
    pub fn fragments(&self) -> Vec<&str> {
        match self {
            MessageContent::Empty => Vec::new(),
            MessageContent::Text(text) => vec![text.as_str()],
            MessageContent::Parts(parts) => parts.iter().filter_map(ContentPart::text).collect(),
        }
    }

    pub fn normalized(&self) -> String {
        self.fragments().concat()
    }

    pub fn is_blank(&self) -> bool {
        self.fragments().iter().all(|f| f.trim().is_empty())
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        MessageContent::Text(value)
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        MessageContent::Text(value.to_string())
    }
}

impl From<Value> for MessageContent {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => MessageContent::Empty,
            Value::String(text) => MessageContent::Text(text),
            Value::Array(items) => MessageContent::Parts(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(text) => Some(ContentPart::Text(text)),
                        Value::Object(map) => Some(ContentPart::Mapping(map)),
                        _ => None,
                    })
                    .collect(),
            ),
            Value::Object(map) => MessageContent::Parts(vec![ContentPart::Mapping(map)]),
            other => MessageContent::Text(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: String,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    pub tool_calls: Vec<ToolCall>,
    /// Set on `Role::Tool` messages: the call being answered and the tool's name.
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text.into())
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(call: &ToolCall, output: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(output.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn text(&self) -> String {
        self.content.normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Block(String);

    impl TextFragment for Block {
        fn text(&self) -> Option<&str> {
            Some(&self.0)
        }
    }

    #[test]
    fn plain_string_is_used_as_is() {
        let content = MessageContent::from("Revenue was $100B");
        assert_eq!(content.normalized(), "Revenue was $100B");
    }

    #[test]
    fn mixed_parts_concatenate_in_order() {
        let mut mapping = Map::new();
        mapping.insert("text".into(), json!("A "));
        let content = MessageContent::Parts(vec![
            ContentPart::Mapping(mapping),
            ContentPart::Text("B".into()),
            ContentPart::Fragment(Arc::new(Block("C".into()))),
        ]);
        assert_eq!(content.normalized(), "A BC");
    }

    #[test]
    fn json_content_shapes_are_normalized() {
        let content = MessageContent::from(json!([
            {"type": "text", "text": "Apple "},
            {"type": "image"},
            "reported",
            42
        ]));
        assert_eq!(content.normalized(), "Apple reported");
        assert!(MessageContent::from(Value::Null).is_blank());
        assert!(MessageContent::from(json!([{"type": "tool_use"}])).is_blank());
    }
}
