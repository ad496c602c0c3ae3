use reqwest::Client;
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::message::{ChatMessage, MessageContent, Role, ToolCall};
use crate::send_json;
use crate::tool::ToolSpec;

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const PROVIDER: &str = "openai";

#[derive(Clone)]
pub(crate) struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

pub(crate) async fn complete(
    http: &Client,
    cfg: &OpenAiConfig,
    model: &str,
    system: &str,
    transcript: &[ChatMessage],
    specs: &[ToolSpec],
) -> Result<ChatMessage, LlmError> {
    let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
    let payload = build_payload(model, system, transcript, specs);
    let request = http.post(url).bearer_auth(&cfg.api_key).json(&payload);
    let value = send_json(PROVIDER, request).await?;
    parse_response(&value)
}

pub(crate) fn build_payload(
    model: &str,
    system: &str,
    transcript: &[ChatMessage],
    specs: &[ToolSpec],
) -> Value {
    let mut messages = Vec::new();
    if !system.trim().is_empty() {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for message in transcript {
        let value = match message.role {
            Role::System => json!({ "role": "system", "content": message.text() }),
            Role::User => json!({ "role": "user", "content": message.text() }),
            Role::Assistant => {
                let mut value = json!({
                    "role": "assistant",
                    "content": if message.content.is_blank() { Value::Null } else { json!(message.text()) },
                });
                if !message.tool_calls.is_empty() {
                    let calls: Vec<Value> = message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": json!({ "input": call.input }).to_string(),
                                },
                            })
                        })
                        .collect();
                    value["tool_calls"] = json!(calls);
                }
                value
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
                "content": message.text(),
            }),
        };
        messages.push(value);
    }
    let mut payload = json!({
        "model": model,
        "messages": messages,
        "temperature": 0,
    });
    if !specs.is_empty() {
        let tools: Vec<Value> = specs
            .iter()
            .map(|spec| {
                json!({
                    "type": "function",
                    "function": {
                        "name": spec.name,
                        "description": spec.description,
                        "parameters": {
                            "type": "object",
                            "properties": { "input": { "type": "string" } },
                            "required": ["input"],
                        },
                    },
                })
            })
            .collect();
        payload["tools"] = json!(tools);
    }
    payload
}

pub(crate) fn parse_response(value: &Value) -> Result<ChatMessage, LlmError> {
    let message = value
        .pointer("/choices/0/message")
        .ok_or_else(|| LlmError::Decode {
            provider: PROVIDER,
            message: "missing choices[0].message".into(),
        })?;
    let content = MessageContent::from(message.get("content").cloned().unwrap_or(Value::Null));
    let calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().enumerate().map(|(idx, call)| parse_call(idx, call)).collect())
        .unwrap_or_default();
    Ok(ChatMessage::assistant(content).with_tool_calls(calls))
}

fn parse_call(idx: usize, call: &Value) -> ToolCall {
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("openai-call-{idx}"));
    let name = call
        .pointer("/function/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let raw = call
        .pointer("/function/arguments")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let input = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(args)) => match args.get("input") {
            Some(Value::String(input)) => input.clone(),
            Some(other) => other.to_string(),
            None => raw.to_string(),
        },
        _ => raw.to_string(),
    };
    ToolCall { id, name, input }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_are_serialized_as_functions() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "search_financial_filings".into(),
            input: "revenue".into(),
        };
        let transcript = vec![
            ChatMessage::user("revenue?"),
            ChatMessage::assistant(MessageContent::Empty).with_tool_calls(vec![call.clone()]),
            ChatMessage::tool_result(&call, "context"),
        ];
        let payload = build_payload("gpt-4o-mini", "sys", &transcript, &[]);
        let messages = payload["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 4);
        assert!(messages[2]["content"].is_null());
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], r#"{"input":"revenue"}"#);
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert!(payload.get("tools").is_none());
    }

    #[test]
    fn parses_array_content_and_tool_arguments() {
        let value = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": [{ "type": "text", "text": "Apple " }, { "type": "text", "text": "leads." }],
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "search_ticker_specific",
                                      "arguments": "{\"input\":\"ticker:AAPL query:revenue\"}" }
                    }]
                }
            }]
        });
        let message = parse_response(&value).expect("parse");
        assert_eq!(message.text(), "Apple leads.");
        assert_eq!(message.tool_calls[0].id, "call_9");
        assert_eq!(message.tool_calls[0].input, "ticker:AAPL query:revenue");
    }

    #[test]
    fn unstructured_arguments_are_passed_through() {
        let call = json!({ "function": { "name": "x", "arguments": "ticker:AAPL query:q" } });
        let parsed = parse_call(3, &call);
        assert_eq!(parsed.id, "openai-call-3");
        assert_eq!(parsed.input, "ticker:AAPL query:q");
    }
}
