//! Read-only store over past session logs.
//!
//! Lists and previews the `*.jsonl` files under `<project>/context/`,
//! resolves custom titles from the `.titles.json` sidecar, and handles
//! explicit deletion (the pool never deletes logs).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use ms_domain::paths;

/// Summary metadata for a past session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Custom title, else the first user prompt (truncated).
    pub title: String,
    pub message_count: usize,
    pub is_orchestrator: bool,
}

/// A single message in a session preview.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePreview {
    pub role: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Reads session logs from disk to list and preview past sessions.
pub struct SessionStore {
    project_dir: PathBuf,
    /// Argv for the best-effort index cleanup run after deletion.
    reindex_command: Vec<String>,
}

impl SessionStore {
    pub fn new(project_dir: impl Into<PathBuf>, reindex_command: Vec<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            reindex_command,
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        paths::sessions_dir(&self.project_dir)
    }

    /// List all sessions, most recently active first.
    ///
    /// Logs without any parseable timestamp are skipped but never deleted —
    /// they may be in-progress or in a format we don't understand yet.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let dir = self.sessions_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let titles = self.load_titles();
        let mut sessions: Vec<SessionInfo> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) != Some("jsonl") {
                    return None;
                }
                let session_id = path.file_stem()?.to_str()?.to_string();
                self.parse_session_info(&path, &session_id, &titles)
            })
            .collect();

        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }

    /// Lightweight summary for a single session.
    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let path = paths::session_path(&self.project_dir, session_id);
        if !path.is_file() {
            return None;
        }
        let titles = self.load_titles();
        self.parse_session_info(&path, session_id, &titles)
    }

    /// The most recent `max` user/assistant messages of a session.
    pub fn preview(&self, session_id: &str, max: usize) -> Vec<MessagePreview> {
        let path = paths::session_path(&self.project_dir, session_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(r) => r,
            Err(_) => return Vec::new(),
        };

        let mut previews: Vec<MessagePreview> = Vec::new();
        for line in raw.lines() {
            let obj: Value = match serde_json::from_str(line.trim()) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let msg_type = obj.get("type").and_then(|v| v.as_str()).unwrap_or("");
            match msg_type {
                "user" | "assistant" => {
                    let text = extract_text(&obj);
                    previews.push(MessagePreview {
                        role: msg_type.to_string(),
                        text: truncate(&text, 500),
                        timestamp: parse_timestamp(&obj),
                    });
                }
                // Standalone orchestrator tool records show up as activity
                // markers so previews reflect what the turn actually did.
                "tool_use" => {
                    let name = obj.get("tool_name").and_then(|v| v.as_str()).unwrap_or("?");
                    previews.push(MessagePreview {
                        role: "assistant".into(),
                        text: format!("[used tool: {name}]"),
                        timestamp: parse_timestamp(&obj),
                    });
                }
                _ => {}
            }
        }

        if previews.len() > max {
            previews.split_off(previews.len() - max)
        } else {
            previews
        }
    }

    /// Store a custom title. Returns false when the session does not exist.
    pub fn rename(&self, session_id: &str, title: &str) -> bool {
        if !paths::session_path(&self.project_dir, session_id).is_file() {
            return false;
        }
        let mut titles = self.load_titles();
        titles.insert(session_id.to_string(), title.trim().to_string());
        self.save_titles(&titles);
        true
    }

    /// Delete a session log, its title, and (best effort) its index
    /// entries. This is the explicit admin path — never wired to
    /// `pool.close`.
    pub fn delete(&self, session_id: &str) -> bool {
        let path = paths::session_path(&self.project_dir, session_id);
        if !path.is_file() {
            return false;
        }
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(session_id, error = %e, "failed to delete session log");
            return false;
        }

        let mut titles = self.load_titles();
        if titles.remove(session_id).is_some() {
            self.save_titles(&titles);
        }

        self.spawn_reindex(session_id);
        true
    }

    // ── Internals ──────────────────────────────────────────────────

    fn parse_session_info(
        &self,
        path: &Path,
        session_id: &str,
        titles: &HashMap<String, String>,
    ) -> Option<SessionInfo> {
        let raw = std::fs::read_to_string(path).ok()?;

        let mut first_user_text = String::new();
        let mut first_ts: Option<DateTime<Utc>> = None;
        let mut last_ts: Option<DateTime<Utc>> = None;
        let mut message_count = 0usize;
        let mut is_orchestrator = false;

        for line in raw.lines() {
            let obj: Value = match serde_json::from_str(line.trim()) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let msg_type = obj.get("type").and_then(|v| v.as_str()).unwrap_or("");

            if msg_type == "orchestrator_meta"
                && obj.get("orchestrator").and_then(|v| v.as_bool()) == Some(true)
            {
                is_orchestrator = true;
            }

            if let Some(ts) = parse_timestamp(&obj) {
                if first_ts.is_none() {
                    first_ts = Some(ts);
                }
                last_ts = Some(ts);
            }

            if msg_type == "user" || msg_type == "assistant" {
                message_count += 1;
                if msg_type == "user" && first_user_text.is_empty() {
                    first_user_text = extract_text(&obj);
                }
            }
        }

        let started_at = first_ts?;
        let title = titles
            .get(session_id)
            .cloned()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| {
                if first_user_text.is_empty() {
                    "(empty session)".into()
                } else {
                    truncate(&first_user_text, 100)
                }
            });

        Some(SessionInfo {
            session_id: session_id.to_string(),
            started_at,
            last_activity: last_ts.unwrap_or(started_at),
            title,
            message_count,
            is_orchestrator,
        })
    }

    fn load_titles(&self) -> HashMap<String, String> {
        std::fs::read_to_string(paths::titles_path(&self.project_dir))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_titles(&self, titles: &HashMap<String, String>) {
        let path = paths::titles_path(&self.project_dir);
        match serde_json::to_string(titles) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to save titles");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize titles"),
        }
    }

    fn spawn_reindex(&self, session_id: &str) {
        let Some((program, args)) = self.reindex_command.split_first() else {
            return;
        };
        let result = std::process::Command::new(program)
            .args(args)
            .arg(session_id)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
        if let Err(e) = result {
            tracing::debug!(session_id, error = %e, "index cleanup command not started");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Extract plain text from a `user` / `assistant` record's message, which
/// may be a string or a block list.
fn extract_text(obj: &Value) -> String {
    let content = obj
        .get("message")
        .and_then(|m| m.get("content"))
        .unwrap_or(&Value::Null);

    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| {
                if b.get("type").and_then(|t| t.as_str()) == Some("text") {
                    b.get("text").and_then(|t| t.as_str())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_timestamp(obj: &Value) -> Option<DateTime<Utc>> {
    let ts = obj.get("timestamp")?.as_str()?;
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
