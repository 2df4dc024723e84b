//! Agent-session tools — control pooled coding-agent sessions from the
//! orchestrator.
//!
//! These handlers re-enter the same pool that hosts the orchestrator.
//! That is safe because the orchestrator does not share a per-session
//! send lock with agent sessions, and the pool holds no global lock
//! across `send`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use ms_domain::event::SessionEvent;

use super::{error_result, ToolContext, ToolRegistry};

/// Wall-clock budget for one delegated agent turn.
pub const SEND_TIMEOUT_SECS: u64 = 300;

pub fn register(registry: &mut ToolRegistry) {
    registry.register(
        "list_agent_sessions",
        "List all currently active agent sessions with their status. Each session has a \
         session_id (use with send_to_agent_session/close_agent_session) and a sdk_session_id \
         (use with open_agent_session to resume after closing).",
        json!({"type": "object", "properties": {}}),
        &[],
        list_agent_sessions,
    );

    registry.register(
        "open_agent_session",
        "Start a new agent session or resume a past one from history. To resume, pass its \
         sdk_session_id (from list_agent_sessions or list_history). Omit all parameters to \
         start fresh. Returns the session_id to use with send_to_agent_session and \
         close_agent_session.",
        json!({
            "type": "object",
            "properties": {
                "resume_sdk_id": {
                    "type": "string",
                    "description": "sdk_session_id of a past session to resume. This is the \
                                    CLI's own log id, NOT the session_id returned by \
                                    open_agent_session.",
                },
            },
        }),
        &["resume_sdk_id"],
        open_agent_session,
    );

    registry.register(
        "close_agent_session",
        "Close an active agent session.",
        json!({
            "type": "object",
            "properties": {
                "session_id": {"type": "string", "description": "The session ID to close."},
            },
            "required": ["session_id"],
        }),
        &["session_id"],
        close_agent_session,
    );

    registry.register(
        "read_agent_session",
        "Read recent messages from an agent session's history.",
        json!({
            "type": "object",
            "properties": {
                "session_id": {"type": "string", "description": "The session ID to read."},
                "max_messages": {
                    "type": "integer",
                    "description": "Maximum number of messages to return (default: 20).",
                },
            },
            "required": ["session_id"],
        }),
        &["session_id", "max_messages"],
        read_agent_session,
    );

    registry.register(
        "send_to_agent_session",
        "Send a message to an active agent session and wait for the response. Returns the \
         agent's text response.",
        json!({
            "type": "object",
            "properties": {
                "session_id": {"type": "string", "description": "The session ID to send to."},
                "message": {"type": "string", "description": "The message to send."},
            },
            "required": ["session_id", "message"],
        }),
        &["session_id", "message"],
        send_to_agent_session,
    );

    registry.register(
        "interrupt_agent_session",
        "Interrupt the current response of an agent session.",
        json!({
            "type": "object",
            "properties": {
                "session_id": {"type": "string", "description": "The session ID to interrupt."},
            },
            "required": ["session_id"],
        }),
        &["session_id"],
        interrupt_agent_session,
    );

    registry.register(
        "list_history",
        "List all past conversation sessions (both agent and orchestrator).",
        json!({
            "type": "object",
            "properties": {
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of sessions to return (default: 20).",
                },
            },
        }),
        &["limit"],
        list_history,
    );
}

async fn list_agent_sessions(ctx: Arc<ToolContext>, _input: Value) -> ms_domain::Result<String> {
    let sessions = ctx.pool.list_sessions();

    // Enrich with log-derived title/message_count. The store is keyed by
    // backend ids (the JSONL filenames).
    let enriched: Vec<Value> = sessions
        .iter()
        .map(|s| {
            let mut v = serde_json::to_value(s).unwrap_or_else(|_| json!({}));
            if let Some(backend_id) = &s.sdk_session_id {
                if let Some(info) = ctx.store.session_info(backend_id) {
                    v["message_count"] = json!(info.message_count);
                    v["title"] = json!(info.title);
                }
            }
            v
        })
        .collect();

    Ok(json!({"sessions": enriched, "count": enriched.len()}).to_string())
}

async fn open_agent_session(ctx: Arc<ToolContext>, input: Value) -> ms_domain::Result<String> {
    let resume = input
        .get("resume_sdk_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    match ctx
        .pool
        .create(ctx.agent_config.clone(), None, resume, false)
        .await
    {
        Ok(local_id) => Ok(json!({"session_id": local_id, "status": "started"}).to_string()),
        Err(e) => Ok(error_result(format!("Failed to start session: {e}"))),
    }
}

async fn close_agent_session(ctx: Arc<ToolContext>, input: Value) -> ms_domain::Result<String> {
    let session_id = input.get("session_id").and_then(|v| v.as_str()).unwrap_or("");
    if !ctx.pool.has(session_id) {
        return Ok(error_result(format!("No active session with ID {session_id}")));
    }
    ctx.pool.close(session_id);
    Ok(json!({"session_id": session_id, "status": "closed"}).to_string())
}

async fn read_agent_session(ctx: Arc<ToolContext>, input: Value) -> ms_domain::Result<String> {
    let session_id = input.get("session_id").and_then(|v| v.as_str()).unwrap_or("");
    let max = input
        .get("max_messages")
        .and_then(|v| v.as_u64())
        .unwrap_or(20) as usize;

    // session_id is the local id; logs are keyed by the backend id.
    let backend_id = ctx
        .pool
        .get(session_id)
        .and_then(|s| s.backend_id())
        .unwrap_or_else(|| session_id.to_string());

    let previews = ctx.store.preview(&backend_id, max);
    if previews.is_empty() {
        return Ok(error_result(format!(
            "No messages found for session {session_id}"
        )));
    }

    let messages: Vec<Value> = previews
        .iter()
        .map(|p| {
            json!({
                "role": p.role,
                "text": p.text,
                "timestamp": p.timestamp.map(|t| t.to_rfc3339()),
            })
        })
        .collect();
    Ok(json!({"session_id": session_id, "messages": messages}).to_string())
}

async fn send_to_agent_session(ctx: Arc<ToolContext>, input: Value) -> ms_domain::Result<String> {
    let session_id = input
        .get("session_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let message = input.get("message").and_then(|v| v.as_str()).unwrap_or("");

    if !ctx.pool.has(&session_id) {
        return Ok(error_result(format!("No active session with ID {session_id}")));
    }

    // pool.send acquires the per-session lock and broadcasts to the
    // session's own subscribers; we additionally relay every event to the
    // orchestrator's subscribers as nested_session_event frames so tabs
    // watching the orchestrator see nested progress.
    let mut events = match ctx.pool.send(&session_id, message, None) {
        Ok(rx) => rx,
        Err(e) => return Ok(error_result(format!("Failed to send message: {e}"))),
    };

    let mut texts: Vec<String> = Vec::new();
    let mut cost = 0.0;
    let mut turns = 0u32;

    let collect = async {
        while let Some(event) = events.recv().await {
            if let Ok(value) = serde_json::to_value(&event) {
                let frame = ms_protocol::nested_session_event(&session_id, &value);
                ctx.pool.broadcast_orchestrator(&frame);
            }
            match event {
                SessionEvent::TextComplete { text } => texts.push(text),
                SessionEvent::TurnComplete {
                    cost: c,
                    num_turns,
                    ..
                } => {
                    cost = c.unwrap_or(0.0);
                    turns = num_turns;
                }
                SessionEvent::Error { error, detail } => {
                    return Err(format!("{error}: {detail}"));
                }
                _ => {}
            }
        }
        Ok(())
    };

    match tokio::time::timeout(Duration::from_secs(SEND_TIMEOUT_SECS), collect).await {
        Ok(Ok(())) => Ok(json!({
            "session_id": session_id,
            "response": texts.join("\n"),
            "cost": cost,
            "turns": turns,
        })
        .to_string()),
        Ok(Err(e)) => Ok(error_result(format!("Agent send failed: {e}"))),
        // Timeout is a tool-result error, not an exception; the agent
        // subprocess keeps running.
        Err(_) => Ok(error_result(format!(
            "Timed out after {SEND_TIMEOUT_SECS}s waiting for agent response"
        ))),
    }
}

async fn interrupt_agent_session(ctx: Arc<ToolContext>, input: Value) -> ms_domain::Result<String> {
    let session_id = input.get("session_id").and_then(|v| v.as_str()).unwrap_or("");
    if !ctx.pool.has(session_id) {
        return Ok(error_result(format!("No active session with ID {session_id}")));
    }
    ctx.pool.interrupt(session_id).await;
    Ok(json!({"session_id": session_id, "status": "interrupted"}).to_string())
}

async fn list_history(ctx: Arc<ToolContext>, input: Value) -> ms_domain::Result<String> {
    let limit = input.get("limit").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
    let sessions = ctx.store.list_sessions();

    let listed: Vec<Value> = sessions
        .iter()
        .take(limit)
        .map(|s| {
            json!({
                "session_id": s.session_id,
                "title": s.title,
                "message_count": s.message_count,
                "last_activity": s.last_activity.to_rfc3339(),
                "type": if s.is_orchestrator { "orchestrator" } else { "agent" },
            })
        })
        .collect();
    Ok(json!({"sessions": listed, "total": sessions.len()}).to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{infer_is_error, test_context, ToolRegistry};

    #[tokio::test]
    async fn list_sessions_empty_pool() {
        let registry = ToolRegistry::builtin();
        let ctx = test_context();
        let out = registry
            .execute("list_agent_sessions", &json!({}), &ctx)
            .await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["count"], 0);
    }

    #[tokio::test]
    async fn close_unknown_session_is_a_tool_error() {
        let registry = ToolRegistry::builtin();
        let ctx = test_context();
        let out = registry
            .execute("close_agent_session", &json!({"session_id": "ghost"}), &ctx)
            .await;
        assert!(infer_is_error(&out));
        assert!(out.contains("ghost"));
    }

    #[tokio::test]
    async fn send_to_unknown_session_is_a_tool_error() {
        let registry = ToolRegistry::builtin();
        let ctx = test_context();
        let out = registry
            .execute(
                "send_to_agent_session",
                &json!({"session_id": "ghost", "message": "hi"}),
                &ctx,
            )
            .await;
        assert!(infer_is_error(&out));
    }

    #[tokio::test]
    async fn read_unknown_session_is_a_tool_error() {
        let registry = ToolRegistry::builtin();
        let ctx = test_context();
        let out = registry
            .execute(
                "read_agent_session",
                &json!({"session_id": "ghost"}),
                &ctx,
            )
            .await;
        assert!(infer_is_error(&out));
    }

    /// A context whose agent sessions are backed by a scripted fake CLI.
    fn ctx_with_fake_cli() -> Arc<ToolContext> {
        let script = r#"
echo '{"type":"status","status":"idle"}'
while IFS= read -r line; do
  echo '{"type":"text_delta","text":"Hi"}'
  echo '{"type":"text_complete","text":"Hi there"}'
  echo '{"type":"turn_complete","cost":0.01,"num_turns":1,"session_id":"b-1"}'
done
"#;
        let base = test_context();
        Arc::new(ToolContext {
            pool: base.pool.clone(),
            store: base.store.clone(),
            agent_config: ms_domain::config::AgentConfig {
                project_dir: base.project_dir.clone(),
                cli_command: vec!["/bin/sh".into(), "-c".into(), script.into()],
                model: None,
                permission_mode: "default".into(),
                max_turns: None,
            },
            search: base.search.clone(),
            project_dir: base.project_dir.clone(),
            index_dir: base.index_dir.clone(),
        })
    }

    #[tokio::test]
    async fn open_list_close_roundtrip() {
        let registry = ToolRegistry::builtin();
        let ctx = ctx_with_fake_cli();

        let out = registry
            .execute("open_agent_session", &json!({}), &ctx)
            .await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["status"], "started");
        let session_id = v["session_id"].as_str().unwrap().to_string();

        let out = registry
            .execute("list_agent_sessions", &json!({}), &ctx)
            .await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["count"], 1);
        assert_eq!(v["sessions"][0]["session_id"], session_id.as_str());
        assert_eq!(v["sessions"][0]["status"], "idle");

        let out = registry
            .execute(
                "close_agent_session",
                &json!({"session_id": session_id}),
                &ctx,
            )
            .await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["status"], "closed");
        assert!(!ctx.pool.has(&session_id));
    }

    #[tokio::test]
    async fn send_to_agent_session_streams_nested_events() {
        let registry = ToolRegistry::builtin();
        let ctx = ctx_with_fake_cli();

        ctx.pool
            .create(ctx.agent_config.clone(), Some("A1".into()), None, false)
            .await
            .unwrap();

        // One tab watches the orchestrator, one watches the session.
        let (orch_sink, mut orch_rx) = crate::pool::EventSink::channel();
        ctx.pool.subscribe_orchestrator(orch_sink);
        let (session_sink, mut session_rx) = crate::pool::EventSink::channel();
        ctx.pool.subscribe("A1", session_sink);

        let out = registry
            .execute(
                "send_to_agent_session",
                &json!({"session_id": "A1", "message": "list files"}),
                &ctx,
            )
            .await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["session_id"], "A1");
        assert_eq!(v["response"], "Hi there");
        assert_eq!(v["cost"], 0.01);
        assert_eq!(v["turns"], 1);

        // Orchestrator subscribers see nested_session_event wrappers.
        let mut nested_types = Vec::new();
        for _ in 0..3 {
            let frame: Value =
                serde_json::from_str(&orch_rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["type"], "nested_session_event");
            assert_eq!(frame["session_id"], "A1");
            nested_types.push(frame["event_type"].as_str().unwrap().to_string());
        }
        assert_eq!(nested_types, vec!["text_delta", "text_complete", "turn_complete"]);

        // The session's own subscribers see the raw events.
        let frame: Value = serde_json::from_str(&session_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "user_message");
        assert_eq!(frame["text"], "list files");
        let frame: Value = serde_json::from_str(&session_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "text_delta");
    }

    #[tokio::test]
    async fn list_history_reads_the_store() {
        let registry = ToolRegistry::builtin();
        let ctx = test_context();

        let log = ms_store::SessionLog::new(ms_domain::paths::session_path(
            &ctx.project_dir,
            "past-1",
        ));
        log.append(&ms_store::LogRecord::meta("past-1", false, None, None));
        log.append(&ms_store::LogRecord::user("do a thing"));

        let out = registry.execute("list_history", &json!({}), &ctx).await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["total"], 1);
        assert_eq!(v["sessions"][0]["session_id"], "past-1");
        assert_eq!(v["sessions"][0]["type"], "orchestrator");
    }
}
