//! Line-framed JSON wire protocol spoken with the coding-agent CLI.

use serde_json::{json, Value};

use ms_domain::event::{SessionEvent, Usage};

/// One parsed stdout line from the CLI.
#[derive(Debug, Clone)]
pub enum CliMessage {
    /// A `status` line (`idle`, `streaming`, …).
    Status(String),
    /// A session event in the shared wire namespace.
    Event(SessionEvent),
}

/// Parse one stdout line. Returns `None` for blank or unrecognised lines
/// (the CLI may emit diagnostics we don't model).
pub fn parse_line(line: &str) -> Option<CliMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring non-JSON CLI output line");
            return None;
        }
    };

    let msg_type = v
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .to_string();
    match msg_type.as_str() {
        "status" => {
            let status = v.get("status").and_then(|s| s.as_str()).unwrap_or("idle");
            Some(CliMessage::Status(status.to_string()))
        }
        // The CLI calls its own log id `session_id`; we store it as the
        // session's backend id.
        "turn_complete" => Some(CliMessage::Event(SessionEvent::TurnComplete {
            cost: v.get("cost").and_then(|c| c.as_f64()),
            usage: v
                .get("usage")
                .cloned()
                .and_then(|u| serde_json::from_value::<Usage>(u).ok())
                .unwrap_or_default(),
            num_turns: v.get("num_turns").and_then(|n| n.as_u64()).unwrap_or(0) as u32,
            backend_id: v
                .get("session_id")
                .and_then(|s| s.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            is_error: v.get("is_error").and_then(|b| b.as_bool()).unwrap_or(false),
            result: v
                .get("result")
                .and_then(|r| r.as_str())
                .map(str::to_string),
        })),
        _ => match serde_json::from_value::<SessionEvent>(v) {
            Ok(event) => Some(CliMessage::Event(event)),
            Err(e) => {
                tracing::debug!(msg_type, error = %e, "ignoring unrecognised CLI event");
                None
            }
        },
    }
}

pub fn encode_user(text: &str) -> String {
    json!({"op": "user", "text": text}).to_string()
}

pub fn encode_command(text: &str) -> String {
    json!({"op": "command", "text": text}).to_string()
}

pub fn encode_interrupt() -> String {
    json!({"op": "interrupt"}).to_string()
}
