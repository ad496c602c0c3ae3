#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Tools offered to the model. Each takes one free-text input and answers with text;
/// failures are reported in the returned text, never raised.
pub trait ToolBox {
    fn specs(&self) -> Vec<ToolSpec>;
    fn call(&self, name: &str, input: &str) -> String;
}
