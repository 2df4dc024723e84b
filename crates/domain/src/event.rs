use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for provider and session event streams.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Token usage for one model response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Events produced by agent sessions and the orchestrator loop.
///
/// The serialized form is the wire format broadcast to WebSocket
/// subscribers, so variant and field names here are the client contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// A streaming text token.
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    /// A complete assistant text block (after streaming finishes).
    #[serde(rename = "text_complete")]
    TextComplete { text: String },

    /// A streaming thinking token.
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { text: String },

    /// A complete thinking block.
    #[serde(rename = "thinking_complete")]
    ThinkingComplete { text: String },

    /// The model invoked a tool.
    #[serde(rename = "tool_use")]
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
    },

    /// Result returned from a tool.
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },

    /// A tool handler has started executing.
    #[serde(rename = "tool_executing")]
    ToolExecuting {
        tool_use_id: String,
        tool_name: String,
    },

    /// Heartbeat for a tool that is still running.
    #[serde(rename = "tool_progress")]
    ToolProgress {
        tool_use_id: String,
        tool_name: String,
        elapsed_secs: u64,
        message: String,
    },

    /// End of a complete turn (one send→response cycle).
    #[serde(rename = "turn_complete")]
    TurnComplete {
        #[serde(skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(default)]
        usage: Usage,
        #[serde(default)]
        num_turns: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        backend_id: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },

    /// Conversation compaction completed.
    #[serde(rename = "compact_complete")]
    CompactComplete { trigger: String },

    /// The user interrupted the assistant's voice response (barge-in).
    #[serde(rename = "voice_interrupted")]
    VoiceInterrupted { partial_text: String },

    /// An error occurred; `error` is the stable kind string.
    #[serde(rename = "error")]
    Error {
        error: String,
        #[serde(default)]
        detail: String,
    },
}

impl SessionEvent {
    pub fn error(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        SessionEvent::Error {
            error: kind.into(),
            detail: detail.into(),
        }
    }

    /// Whether this event terminates a turn stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::TurnComplete { .. } | SessionEvent::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_snake_case() {
        let e = SessionEvent::TextDelta { text: "hi".into() };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "text_delta");

        let e = SessionEvent::ToolProgress {
            tool_use_id: "t1".into(),
            tool_name: "slow".into(),
            elapsed_secs: 5,
            message: "still running".into(),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "tool_progress");
        assert_eq!(v["elapsed_secs"], 5);
    }

    #[test]
    fn turn_complete_omits_absent_fields() {
        let e = SessionEvent::TurnComplete {
            cost: None,
            usage: Usage::default(),
            num_turns: 1,
            backend_id: None,
            is_error: false,
            result: None,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert!(v.get("cost").is_none());
        assert!(v.get("backend_id").is_none());
        assert_eq!(v["num_turns"], 1);
    }

    #[test]
    fn usage_is_additive() {
        let mut u = Usage {
            input_tokens: 10,
            output_tokens: 5,
        };
        u.add(&Usage {
            input_tokens: 2,
            output_tokens: 3,
        });
        assert_eq!(u.input_tokens, 12);
        assert_eq!(u.output_tokens, 8);
    }

    #[test]
    fn terminal_events() {
        assert!(SessionEvent::error("interrupted", "").is_terminal());
        assert!(!SessionEvent::TextDelta { text: "x".into() }.is_terminal());
    }
}
