//! Text model provider — streaming Anthropic Messages API adapter.
//!
//! System prompts go in the top-level `system` field; tool-call input
//! arrives as a stream of partial-JSON fragments that are concatenated per
//! content block and parsed once at block end.

use std::collections::HashMap;

use serde_json::Value;

use ms_domain::config::OrchestratorConfig;
use ms_domain::event::{SessionEvent, Usage};
use ms_domain::message::{Message, ToolDefinition};
use ms_domain::Result;

use crate::provider::{EventStream, ModelProvider};
use crate::sse;
use crate::util::{from_reqwest, resolve_api_key, ANTHROPIC_VERSION};

/// Streaming text provider over the Anthropic Messages API.
pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        let api_key = resolve_api_key()?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            base_url: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            client,
        })
    }

    fn build_body(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system: &str,
    ) -> Value {
        // Message and ContentBlock serialize directly into the Messages
        // API shape (role + string-or-block-list content).
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::json!(tools);
        }
        body
    }
}

#[async_trait::async_trait]
impl ModelProvider for AnthropicProvider {
    async fn create_message(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system: &str,
    ) -> EventStream {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(messages, tools, system);

        tracing::debug!(model = %self.model, messages = messages.len(), "messages stream request");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => return error_stream("api_error", e.to_string()),
        };

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return error_stream(
                "api_error",
                format!("HTTP {} - {}", status.as_u16(), detail),
            );
        }

        let mut state = StreamState::new();
        sse::sse_response_stream(resp, move |data| parse_messages_sse(data, &mut state))
    }
}

fn error_stream(kind: &'static str, detail: String) -> EventStream {
    Box::pin(async_stream::stream! {
        yield SessionEvent::error(kind, detail);
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum BlockState {
    Text { buf: String },
    Tool { id: String, name: String, args: String },
}

/// Per-response state for assembling content blocks.
struct StreamState {
    blocks: HashMap<u64, BlockState>,
    usage: Usage,
    turn_emitted: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            usage: Usage::default(),
            turn_emitted: false,
        }
    }
}

/// Parse one Messages-API SSE payload into zero or more session events.
fn parse_messages_sse(data: &str, state: &mut StreamState) -> Vec<SessionEvent> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable SSE payload");
            return events;
        }
    };

    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match event_type {
        "message_start" => {
            if let Some(usage) = v.get("message").and_then(|m| m.get("usage")) {
                state.usage.input_tokens = usage
                    .get("input_tokens")
                    .and_then(|t| t.as_u64())
                    .unwrap_or(0) as u32;
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        state.blocks.insert(idx, BlockState::Text { buf: String::new() });
                    }
                    "tool_use" => {
                        state.blocks.insert(
                            idx,
                            BlockState::Tool {
                                id: block
                                    .get("id")
                                    .and_then(|s| s.as_str())
                                    .unwrap_or("")
                                    .to_string(),
                                name: block
                                    .get("name")
                                    .and_then(|s| s.as_str())
                                    .unwrap_or("")
                                    .to_string(),
                                args: String::new(),
                            },
                        );
                    }
                    _ => {}
                }
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            if let Some(delta) = v.get("delta") {
                match delta.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                            if !text.is_empty() {
                                if let Some(BlockState::Text { buf }) = state.blocks.get_mut(&idx) {
                                    buf.push_str(text);
                                }
                                events.push(SessionEvent::TextDelta { text: text.to_string() });
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|p| p.as_str()) {
                            if let Some(BlockState::Tool { args, .. }) = state.blocks.get_mut(&idx)
                            {
                                args.push_str(partial);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            match state.blocks.remove(&idx) {
                Some(BlockState::Text { buf }) => {
                    if !buf.is_empty() {
                        events.push(SessionEvent::TextComplete { text: buf });
                    }
                }
                Some(BlockState::Tool { id, name, args }) => {
                    let input: Value = if args.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&args).unwrap_or_else(|e| {
                            tracing::warn!(tool = %name, error = %e, "tool input is not valid JSON");
                            Value::Object(Default::default())
                        })
                    };
                    events.push(SessionEvent::ToolUse {
                        tool_use_id: id,
                        tool_name: name,
                        tool_input: input,
                    });
                }
                None => {}
            }
        }

        "message_delta" => {
            if let Some(output) = v
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|t| t.as_u64())
            {
                state.usage.output_tokens = output as u32;
            }
        }

        "message_stop" => {
            if !state.turn_emitted {
                state.turn_emitted = true;
                events.push(SessionEvent::TurnComplete {
                    cost: None,
                    usage: state.usage,
                    num_turns: 0,
                    backend_id: None,
                    is_error: false,
                    result: None,
                });
            }
        }

        "error" => {
            let detail = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            state.turn_emitted = true;
            events.push(SessionEvent::error("api_error", detail));
        }

        _ => {
            // ping and unknown event types -- ignore.
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut StreamState, payloads: &[&str]) -> Vec<SessionEvent> {
        payloads
            .iter()
            .flat_map(|p| parse_messages_sse(p, state))
            .collect()
    }

    #[test]
    fn text_block_streams_then_completes() {
        let mut state = StreamState::new();
        let events = feed(
            &mut state,
            &[
                r#"{"type":"message_start","message":{"usage":{"input_tokens":12}}}"#,
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
                r#"{"type":"message_delta","usage":{"output_tokens":4}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );

        assert!(matches!(&events[0], SessionEvent::TextDelta { text } if text == "Hi"));
        assert!(matches!(&events[1], SessionEvent::TextDelta { text } if text == " there"));
        assert!(matches!(&events[2], SessionEvent::TextComplete { text } if text == "Hi there"));
        match &events[3] {
            SessionEvent::TurnComplete { usage, .. } => {
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 4);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn tool_input_assembles_from_partial_json() {
        let mut state = StreamState::new();
        let events = feed(
            &mut state,
            &[
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"search_memory"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"query\":"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
            ],
        );

        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::ToolUse {
                tool_use_id,
                tool_name,
                tool_input,
            } => {
                assert_eq!(tool_use_id, "tu_1");
                assert_eq!(tool_name, "search_memory");
                assert_eq!(tool_input["query"], "rust");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn invalid_tool_json_falls_back_to_empty_object() {
        let mut state = StreamState::new();
        let events = feed(
            &mut state,
            &[
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"x"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{broken"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
            ],
        );
        match &events[0] {
            SessionEvent::ToolUse { tool_input, .. } => {
                assert!(tool_input.as_object().unwrap().is_empty())
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn api_error_event() {
        let mut state = StreamState::new();
        let events = feed(
            &mut state,
            &[r#"{"type":"error","error":{"type":"overloaded_error","message":"overloaded"}}"#],
        );
        match &events[0] {
            SessionEvent::Error { error, detail } => {
                assert_eq!(error, "api_error");
                assert_eq!(detail, "overloaded");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn body_includes_tools_only_when_present() {
        let provider = AnthropicProvider {
            base_url: "https://api.anthropic.com".into(),
            api_key: "test".into(),
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 1024,
            client: reqwest::Client::new(),
        };

        let body = provider.build_body(&[Message::user("hi")], &[], "sys");
        assert!(body.get("tools").is_none());
        assert_eq!(body["system"], "sys");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");

        let tools = vec![ToolDefinition {
            name: "read_file".into(),
            description: "Read a file".into(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
        }];
        let body = provider.build_body(&[Message::user("hi")], &tools, "sys");
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert!(body["tools"][0].get("input_schema").is_some());
    }
}
