//! Client protocol: WebSocket frame types for the session and
//! orchestrator endpoints.
//!
//! Clients (browser tabs) send [`ClientFrame`]s; the server replies with
//! [`ServerFrame`]s plus serialized `SessionEvent`s (which share the same
//! `type`-tagged JSON namespace).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Browser → gateway messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Subscribe to (or create) a session.
    #[serde(rename = "start")]
    Start {
        /// Stable tab UUID; generated server-side when absent.
        #[serde(default)]
        local_id: Option<String>,
        /// Backend id of a past session to resume.
        #[serde(default)]
        resume_sdk_id: Option<String>,
        #[serde(default)]
        fork: bool,
    },

    /// Send a user prompt to the session.
    #[serde(rename = "send")]
    Send { text: String },

    /// Send a slash command to the coding-agent CLI.
    #[serde(rename = "command")]
    Command { text: String },

    /// Interrupt the current response.
    #[serde(rename = "interrupt")]
    Interrupt,

    /// Unsubscribe; the session stays live in the pool.
    #[serde(rename = "stop")]
    Stop,

    /// Orchestrator endpoint only: start in voice mode.
    #[serde(rename = "voice_start")]
    VoiceStart {
        #[serde(default)]
        local_id: Option<String>,
        #[serde(default)]
        resume_sdk_id: Option<String>,
    },

    /// Orchestrator endpoint only: a mirrored voice-vendor event.
    #[serde(rename = "voice_event")]
    VoiceEvent { event: Value },
}

/// Gateway → browser control messages (events are broadcast separately
/// as serialized `SessionEvent`s).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "status")]
    Status { status: String },

    #[serde(rename = "session_started")]
    SessionStarted {
        session_id: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        voice: bool,
        /// Voice mode: the session.update payload the client must forward
        /// to the voice vendor.
        #[serde(skip_serializing_if = "Option::is_none")]
        voice_session_update: Option<Value>,
    },

    #[serde(rename = "session_stopped")]
    SessionStopped,

    /// Echo of another subscriber's prompt.
    #[serde(rename = "user_message")]
    UserMessage { text: String },

    #[serde(rename = "error")]
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        detail: String,
    },

    /// Voice mode: a payload the client must forward to the voice
    /// transport (e.g. a function-call output item).
    #[serde(rename = "voice_command")]
    VoiceCommand { command: Value },

    /// Watcher notification: a pooled session was opened.
    #[serde(rename = "agent_session_opened")]
    AgentSessionOpened {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdk_session_id: Option<String>,
    },

    /// Watcher notification: a pooled session was closed.
    #[serde(rename = "agent_session_closed")]
    AgentSessionClosed { session_id: String },

    /// An event produced by a pooled session while the orchestrator was
    /// driving it; relayed to orchestrator subscribers.
    #[serde(rename = "nested_session_event")]
    NestedSessionEvent {
        session_id: String,
        event_type: String,
        event_data: Value,
    },
}

impl ServerFrame {
    pub fn error(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: kind.into(),
            detail: detail.into(),
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        ServerFrame::Status {
            status: status.into(),
        }
    }
}

/// Wrap a serialized session event for relay on the orchestrator channel.
///
/// The `type` field of the original event becomes `event_type`; the rest
/// of the payload is carried in `event_data`.
pub fn nested_session_event(session_id: &str, event: &Value) -> ServerFrame {
    let event_type = event
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let mut data = event.clone();
    if let Some(obj) = data.as_object_mut() {
        obj.remove("type");
    }
    ServerFrame::NestedSessionEvent {
        session_id: session_id.to_string(),
        event_type,
        event_data: data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_start_parses_with_optional_fields() {
        let f: ClientFrame = serde_json::from_str(r#"{"type":"start"}"#).unwrap();
        assert!(matches!(
            f,
            ClientFrame::Start {
                local_id: None,
                resume_sdk_id: None,
                fork: false
            }
        ));

        let f: ClientFrame =
            serde_json::from_str(r#"{"type":"start","local_id":"A1","fork":true}"#).unwrap();
        match f {
            ClientFrame::Start { local_id, fork, .. } => {
                assert_eq!(local_id.as_deref(), Some("A1"));
                assert!(fork);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn server_error_omits_empty_detail() {
        let v = serde_json::to_value(ServerFrame::error("not_started", "")).unwrap();
        assert_eq!(v["type"], "error");
        assert!(v.get("detail").is_none());
    }

    #[test]
    fn nested_event_splits_type_from_data() {
        let event = serde_json::json!({"type": "text_delta", "text": "hi"});
        let frame = nested_session_event("A1", &event);
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "nested_session_event");
        assert_eq!(v["session_id"], "A1");
        assert_eq!(v["event_type"], "text_delta");
        assert_eq!(v["event_data"]["text"], "hi");
        assert!(v["event_data"].get("type").is_none());
    }

    #[test]
    fn session_started_voice_payload() {
        let v = serde_json::to_value(ServerFrame::SessionStarted {
            session_id: "o-1".into(),
            voice: true,
            voice_session_update: Some(serde_json::json!({"type": "session.update"})),
        })
        .unwrap();
        assert_eq!(v["voice"], true);
        assert_eq!(v["voice_session_update"]["type"], "session.update");

        let v = serde_json::to_value(ServerFrame::SessionStarted {
            session_id: "o-1".into(),
            voice: false,
            voice_session_update: None,
        })
        .unwrap();
        assert!(v.get("voice").is_none());
    }
}
