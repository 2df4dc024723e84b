//! Append-only JSONL session log.
//!
//! Each orchestrator session owns one `<session_id>.jsonl` file. Records
//! are written incrementally as events stream; the model-shaped history is
//! reconstructed on read, grouping standalone `tool_use` / `tool_result`
//! records into assistant and synthetic user messages.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ms_domain::message::{ContentBlock, Message, MessageContent, Role};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The `message` payload of `user` / `assistant` records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMessage {
    pub role: String,
    pub content: Value,
}

/// One line of a session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LogRecord {
    /// First line of every orchestrator log.
    #[serde(rename = "orchestrator_meta")]
    OrchestratorMeta {
        orchestrator: bool,
        session_id: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        voice: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice_model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice_name: Option<String>,
        timestamp: String,
    },

    #[serde(rename = "user")]
    User {
        message: RecordMessage,
        timestamp: String,
    },

    #[serde(rename = "assistant")]
    Assistant {
        message: RecordMessage,
        timestamp: String,
    },

    #[serde(rename = "tool_use")]
    ToolUse {
        tool_call_id: String,
        tool_name: String,
        tool_input: Value,
        timestamp: String,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_call_id: String,
        output: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        timestamp: String,
    },

    #[serde(rename = "voice_interrupted")]
    VoiceInterrupted {
        partial_text: String,
        timestamp: String,
    },
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

impl LogRecord {
    pub fn meta(session_id: &str, voice: bool, voice_model: Option<&str>, voice_name: Option<&str>) -> Self {
        LogRecord::OrchestratorMeta {
            orchestrator: true,
            session_id: session_id.to_string(),
            voice,
            voice_model: voice_model.map(str::to_string),
            voice_name: voice_name.map(str::to_string),
            timestamp: now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        LogRecord::User {
            message: RecordMessage {
                role: "user".into(),
                content: Value::String(text.into()),
            },
            timestamp: now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        LogRecord::Assistant {
            message: RecordMessage {
                role: "assistant".into(),
                content: Value::String(text.into()),
            },
            timestamp: now(),
        }
    }

    pub fn tool_use(id: &str, name: &str, input: &Value) -> Self {
        LogRecord::ToolUse {
            tool_call_id: id.to_string(),
            tool_name: name.to_string(),
            tool_input: input.clone(),
            timestamp: now(),
        }
    }

    pub fn tool_result(id: &str, output: &str, is_error: bool) -> Self {
        LogRecord::ToolResult {
            tool_call_id: id.to_string(),
            output: output.to_string(),
            is_error,
            timestamp: now(),
        }
    }

    pub fn voice_interrupted(partial_text: &str) -> Self {
        LogRecord::VoiceInterrupted {
            partial_text: partial_text.to_string(),
            timestamp: now(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionLog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append-only JSONL writer + history reader for one session.
///
/// There is exactly one writer per log (the owning session); the file is
/// opened and closed per append, so readers never see a partial line.
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Append one record as a single JSON line.
    ///
    /// I/O failures are logged and swallowed: a broken log must never take
    /// down the agent loop.
    pub fn append(&self, record: &LogRecord) {
        let line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to serialize log record");
                return;
            }
        };

        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));

        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to append to session log");
        }
    }

    /// Reconstruct model-shaped conversation history from the log.
    ///
    /// Grouping rules:
    /// - `orchestrator_meta` and `voice_interrupted` records are skipped
    /// - a `user` record with non-empty content becomes a user message
    /// - consecutive `assistant` / `tool_use` records accumulate into one
    ///   assistant message; it is flushed when the next record is a `user`
    ///   or `tool_result` (or on EOF); a text-only assistant record with
    ///   no pending tool calls flushes immediately
    /// - consecutive `tool_result` records accumulate into one synthetic
    ///   user message of `tool_result` blocks
    /// - invalid JSON lines are skipped with a warning
    pub fn load(&self) -> Vec<Message> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(r) => r,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to read session log");
                }
                return Vec::new();
            }
        };

        let mut history: Vec<Message> = Vec::new();
        let mut pending_assistant: Vec<ContentBlock> = Vec::new();
        let mut pending_results: Vec<ContentBlock> = Vec::new();

        for (line_num, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let record: LogRecord = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = line_num + 1,
                        error = %e,
                        "skipping invalid log line"
                    );
                    continue;
                }
            };

            match record {
                LogRecord::OrchestratorMeta { .. } | LogRecord::VoiceInterrupted { .. } => {}

                LogRecord::User { message, .. } => {
                    flush_assistant(&mut history, &mut pending_assistant);
                    flush_results(&mut history, &mut pending_results);
                    if let Some(content) = parse_content(message.content) {
                        history.push(Message {
                            role: Role::User,
                            content,
                        });
                    }
                }

                LogRecord::Assistant { message, .. } => {
                    flush_results(&mut history, &mut pending_results);
                    match parse_content(message.content) {
                        Some(MessageContent::Text(s)) => {
                            pending_assistant.push(ContentBlock::Text { text: s });
                        }
                        Some(MessageContent::Blocks(blocks)) => {
                            pending_assistant.extend(blocks);
                        }
                        None => {}
                    }
                    // A pure text response closes the assistant message; a
                    // pending tool call keeps it open for its results.
                    if !has_tool_use(&pending_assistant) {
                        flush_assistant(&mut history, &mut pending_assistant);
                    }
                }

                LogRecord::ToolUse {
                    tool_call_id,
                    tool_name,
                    tool_input,
                    ..
                } => {
                    pending_assistant.push(ContentBlock::ToolUse {
                        id: tool_call_id,
                        name: tool_name,
                        input: tool_input,
                    });
                }

                LogRecord::ToolResult {
                    tool_call_id,
                    output,
                    is_error,
                    ..
                } => {
                    flush_assistant(&mut history, &mut pending_assistant);
                    pending_results.push(ContentBlock::ToolResult {
                        tool_use_id: tool_call_id,
                        content: output,
                        is_error,
                    });
                }
            }
        }

        flush_assistant(&mut history, &mut pending_assistant);
        flush_results(&mut history, &mut pending_results);
        history
    }
}

/// Turn a record's raw content into message content. Returns `None` for
/// empty strings, empty block lists, and unrecognised shapes.
fn parse_content(content: Value) -> Option<MessageContent> {
    match content {
        Value::String(s) if !s.is_empty() => Some(MessageContent::Text(s)),
        Value::Array(items) => {
            let blocks: Vec<ContentBlock> =
                serde_json::from_value(Value::Array(items)).ok()?;
            if blocks.is_empty() {
                None
            } else {
                Some(MessageContent::Blocks(blocks))
            }
        }
        _ => None,
    }
}

fn has_tool_use(blocks: &[ContentBlock]) -> bool {
    blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }))
}

fn flush_assistant(history: &mut Vec<Message>, pending: &mut Vec<ContentBlock>) {
    if !pending.is_empty() {
        history.push(Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(std::mem::take(pending)),
        });
    }
}

fn flush_results(history: &mut Vec<Message>, pending: &mut Vec<ContentBlock>) {
    if !pending.is_empty() {
        history.push(Message {
            role: Role::User,
            content: MessageContent::Blocks(std::mem::take(pending)),
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
