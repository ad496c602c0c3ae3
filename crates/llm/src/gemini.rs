use reqwest::Client;
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::message::{ChatMessage, ContentPart, MessageContent, Role, ToolCall};
use crate::send_json;
use crate::tool::ToolSpec;

pub(crate) const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const PROVIDER: &str = "gemini";

#[derive(Clone)]
pub(crate) struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
}

pub(crate) async fn complete(
    http: &Client,
    cfg: &GeminiConfig,
    model: &str,
    system: &str,
    transcript: &[ChatMessage],
    specs: &[ToolSpec],
) -> Result<ChatMessage, LlmError> {
    let url = format!(
        "{}/models/{}:generateContent",
        cfg.base_url.trim_end_matches('/'),
        model
    );
    let payload = build_payload(system, transcript, specs);
    let request = http
        .post(url)
        .header("x-goog-api-key", &cfg.api_key)
        .json(&payload);
    let value = send_json(PROVIDER, request).await?;
    parse_response(&value)
}

pub(crate) fn build_payload(system: &str, transcript: &[ChatMessage], specs: &[ToolSpec]) -> Value {
    let mut instructions = vec![system.trim().to_string()];
    let mut contents: Vec<Value> = Vec::new();
    let mut pending_responses: Vec<Value> = Vec::new();

    for message in transcript {
        if message.role != Role::Tool && !pending_responses.is_empty() {
            contents.push(json!({ "role": "user", "parts": std::mem::take(&mut pending_responses) }));
        }
        match message.role {
            Role::System => instructions.push(message.text()),
            Role::User => {
                contents.push(json!({ "role": "user", "parts": [{ "text": message.text() }] }));
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                if !message.content.is_blank() {
                    parts.push(json!({ "text": message.text() }));
                }
                for call in &message.tool_calls {
                    parts.push(json!({
                        "functionCall": { "name": call.name, "args": { "input": call.input } }
                    }));
                }
                if !parts.is_empty() {
                    contents.push(json!({ "role": "model", "parts": parts }));
                }
            }
            Role::Tool => pending_responses.push(json!({
                "functionResponse": {
                    "name": message.name.clone().unwrap_or_default(),
                    "response": { "content": message.text() },
                }
            })),
        }
    }
    if !pending_responses.is_empty() {
        contents.push(json!({ "role": "user", "parts": pending_responses }));
    }

    let instruction = instructions
        .into_iter()
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    let mut payload = json!({
        "contents": contents,
        "generationConfig": { "temperature": 0 },
    });
    if !instruction.is_empty() {
        payload["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }
    if !specs.is_empty() {
        let declarations: Vec<Value> = specs
            .iter()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": {
                        "type": "OBJECT",
                        "properties": {
                            "input": { "type": "STRING", "description": "Free-text tool input" }
                        },
                        "required": ["input"],
                    },
                })
            })
            .collect();
        payload["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    payload
}

/// Turns the first candidate into an assistant message. Text parts are kept as raw
/// mappings; `functionCall` parts become tool calls.
pub(crate) fn parse_response(value: &Value) -> Result<ChatMessage, LlmError> {
    let candidate = value
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .ok_or_else(|| {
            let reason = value
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
                .unwrap_or("no candidates");
            LlmError::Decode {
                provider: PROVIDER,
                message: format!("response has no candidates ({reason})"),
            }
        })?;
    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut content = Vec::new();
    let mut calls = Vec::new();
    for part in parts {
        let Value::Object(map) = part else { continue };
        if let Some(call) = map.get("functionCall") {
            calls.push(ToolCall {
                id: format!("gemini-call-{}", calls.len()),
                name: call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: tool_input(call.get("args")),
            });
        } else {
            content.push(ContentPart::Mapping(map));
        }
    }
    let content = if content.is_empty() {
        MessageContent::Empty
    } else {
        MessageContent::Parts(content)
    };
    Ok(ChatMessage::assistant(content).with_tool_calls(calls))
}

fn tool_input(args: Option<&Value>) -> String {
    match args {
        Some(Value::Object(map)) => match map.get("input") {
            Some(Value::String(input)) => input.clone(),
            Some(other) => other.to_string(),
            None => Value::Object(map.clone()).to_string(),
        },
        Some(Value::String(input)) => input.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
