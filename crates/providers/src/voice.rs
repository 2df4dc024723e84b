//! Voice model provider — queue-driven from mirrored realtime events.
//!
//! The provider never calls the model itself. The browser holds the
//! WebRTC connection to the voice vendor and mirrors every data-channel
//! event to the gateway, which injects them here via [`VoiceProvider::
//! inject_event`]; `create_message` drains the queue and translates into
//! the shared event stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use ms_domain::event::{SessionEvent, Usage};
use ms_domain::message::{Message, ToolDefinition};

use crate::provider::{EventStream, ModelProvider};

/// Idle budget per queued event before the voice turn is abandoned.
pub const VOICE_IDLE_TIMEOUT_SECS: u64 = 30;

struct VoiceState {
    /// Partial assistant transcript, cleared on barge-in.
    transcript: String,
    /// call_id → tool name, populated when the function item is added.
    pending_calls: HashMap<String, String>,
    /// call_id → accumulated argument fragments.
    pending_args: HashMap<String, String>,
}

struct Inner {
    queue_tx: tokio::sync::mpsc::UnboundedSender<Value>,
    queue_rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<Value>>,
    state: Mutex<VoiceState>,
    voice_model: String,
    voice_name: String,
}

/// Queue-driven provider over mirrored voice-vendor events.
#[derive(Clone)]
pub struct VoiceProvider {
    inner: Arc<Inner>,
}

impl VoiceProvider {
    pub fn new(voice_model: impl Into<String>, voice_name: impl Into<String>) -> Self {
        let (queue_tx, queue_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                state: Mutex::new(VoiceState {
                    transcript: String::new(),
                    pending_calls: HashMap::new(),
                    pending_args: HashMap::new(),
                }),
                voice_model: voice_model.into(),
                voice_name: voice_name.into(),
            }),
        }
    }

    /// Inject one mirrored voice-vendor event.
    ///
    /// Bookkeeping (transcript accumulation, function-call name/argument
    /// caching, barge-in capture) happens here at injection time, so the
    /// caller can persist synchronously without waiting for a consumer of
    /// [`ModelProvider::create_message`].
    pub fn inject_event(&self, event: Value) {
        let mut event = event;
        let event_type = event
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();

        match event_type.as_str() {
            "response.audio_transcript.delta" => {
                if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                    self.inner.state.lock().transcript.push_str(delta);
                }
            }
            "response.output_item.added" => {
                if let Some(item) = event.get("item") {
                    if item.get("type").and_then(|t| t.as_str()) == Some("function_call") {
                        let call_id =
                            item.get("call_id").and_then(|c| c.as_str()).unwrap_or("");
                        let name = item.get("name").and_then(|n| n.as_str()).unwrap_or("");
                        if !call_id.is_empty() && !name.is_empty() {
                            let mut state = self.inner.state.lock();
                            state.pending_calls.insert(call_id.into(), name.into());
                            state.pending_args.insert(call_id.into(), String::new());
                        }
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                let call_id = event.get("call_id").and_then(|c| c.as_str()).unwrap_or("");
                let delta = event.get("delta").and_then(|d| d.as_str()).unwrap_or("");
                if let Some(buf) = self.inner.state.lock().pending_args.get_mut(call_id) {
                    buf.push_str(delta);
                }
            }
            // Capture the interrupted partial transcript into the queued
            // event before clearing it.
            "input_audio_buffer.speech_started" => {
                let partial = {
                    let mut state = self.inner.state.lock();
                    std::mem::take(&mut state.transcript)
                };
                if let Some(obj) = event.as_object_mut() {
                    obj.insert("partial_text".into(), Value::String(partial));
                }
            }
            _ => {}
        }

        if self.inner.queue_tx.send(event).is_err() {
            tracing::warn!("voice event queue closed");
        }
    }

    /// Tool name for a call id seen via function-item events.
    pub fn pending_call_name(&self, call_id: &str) -> Option<String> {
        self.inner.state.lock().pending_calls.get(call_id).cloned()
    }

    /// The assistant transcript accumulated so far in this response.
    /// Cleared by barge-in and at the start of each turn.
    pub fn partial_transcript(&self) -> String {
        self.inner.state.lock().transcript.clone()
    }

    /// Take the buffered argument fragments for a call id.
    pub fn take_pending_args(&self, call_id: &str) -> Option<String> {
        self.inner.state.lock().pending_args.remove(call_id)
    }

    /// The session.update payload the browser must forward to the voice
    /// vendor: server-VAD turn detection, transcription model, voice
    /// identity, instructions, and tool definitions in the vendor schema.
    pub fn build_session_config(&self, system: &str, tools: &[Value]) -> Value {
        serde_json::json!({
            "type": "session.update",
            "session": {
                "model": self.inner.voice_model,
                "voice": self.inner.voice_name,
                "instructions": system,
                "tools": tools,
                "tool_choice": "auto",
                "modalities": ["text", "audio"],
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": 0.5,
                    "prefix_padding_ms": 300,
                    "silence_duration_ms": 800,
                },
                "input_audio_transcription": {
                    "model": "whisper-1",
                },
            },
        })
    }

    /// Translate one raw event. Returns `None` for events with no
    /// stream-level meaning (argument deltas, item bookkeeping).
    fn translate(inner: &Inner, event: &Value) -> Option<SessionEvent> {
        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match event_type {
            "response.audio_transcript.delta" => {
                let text = event.get("delta").and_then(|d| d.as_str()).unwrap_or("");
                if text.is_empty() {
                    return None;
                }
                Some(SessionEvent::TextDelta { text: text.to_string() })
            }

            "response.audio_transcript.done" => {
                let text = event
                    .get("transcript")
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .to_string();
                Some(SessionEvent::TextComplete { text })
            }

            "response.function_call_arguments.done" => {
                let call_id = event
                    .get("call_id")
                    .and_then(|c| c.as_str())
                    .unwrap_or("")
                    .to_string();
                let mut state = inner.state.lock();
                let args_str = event
                    .get("arguments")
                    .and_then(|a| a.as_str())
                    .map(str::to_string)
                    .or_else(|| state.pending_args.remove(&call_id))
                    .unwrap_or_default();
                let name = state
                    .pending_calls
                    .get(&call_id)
                    .cloned()
                    .or_else(|| {
                        event
                            .get("name")
                            .and_then(|n| n.as_str())
                            .map(str::to_string)
                    })
                    .unwrap_or_default();
                drop(state);

                if call_id.is_empty() || name.is_empty() {
                    return None;
                }
                let tool_input: Value = serde_json::from_str(&args_str)
                    .unwrap_or(Value::Object(Default::default()));
                Some(SessionEvent::ToolUse {
                    tool_use_id: call_id,
                    tool_name: name,
                    tool_input,
                })
            }

            "response.done" => {
                let usage = event
                    .get("response")
                    .and_then(|r| r.get("usage"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Some(SessionEvent::TurnComplete {
                    cost: None,
                    usage: Usage {
                        input_tokens: usage
                            .get("input_tokens")
                            .and_then(|t| t.as_u64())
                            .unwrap_or(0) as u32,
                        output_tokens: usage
                            .get("output_tokens")
                            .and_then(|t| t.as_u64())
                            .unwrap_or(0) as u32,
                    },
                    num_turns: 0,
                    backend_id: None,
                    is_error: false,
                    result: None,
                })
            }

            // Server VAD detected user speech during assistant output;
            // the partial transcript was embedded at injection time.
            "input_audio_buffer.speech_started" => Some(SessionEvent::VoiceInterrupted {
                partial_text: event
                    .get("partial_text")
                    .and_then(|p| p.as_str())
                    .unwrap_or("")
                    .to_string(),
            }),

            "error" => {
                let err = event.get("error").cloned().unwrap_or(Value::Null);
                Some(SessionEvent::Error {
                    error: err
                        .get("code")
                        .and_then(|c| c.as_str())
                        .unwrap_or("voice_error")
                        .to_string(),
                    detail: err
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("")
                        .to_string(),
                })
            }

            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for VoiceProvider {
    /// Drain queued realtime events until `response.done` or an error,
    /// with a 30 s idle timeout per wait.
    async fn create_message(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _system: &str,
    ) -> EventStream {
        let inner = self.inner.clone();
        inner.state.lock().transcript.clear();

        Box::pin(async_stream::stream! {
            let mut rx = inner.queue_rx.lock().await;
            loop {
                let event = match tokio::time::timeout(
                    Duration::from_secs(VOICE_IDLE_TIMEOUT_SECS),
                    rx.recv(),
                )
                .await
                {
                    Ok(Some(e)) => e,
                    Ok(None) => return,
                    Err(_) => {
                        yield SessionEvent::error(
                            "voice_timeout",
                            format!("no event received within {VOICE_IDLE_TIMEOUT_SECS}s"),
                        );
                        return;
                    }
                };

                let event_type = event
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .to_string();

                if let Some(translated) = VoiceProvider::translate(&inner, &event) {
                    yield translated;
                }

                if event_type == "response.done" || event_type == "error" {
                    return;
                }
            }
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
