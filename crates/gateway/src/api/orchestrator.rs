//! Orchestrator WebSocket endpoint.
//!
//! Same framing as the session endpoint plus `voice_start` and
//! `voice_event`. The socket is also registered as a watcher so it
//! receives `agent_session_opened` / `agent_session_closed` frames. The
//! orchestrator session itself keeps running headlessly after a
//! disconnect, until an explicit `stop`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;

use ms_protocol::{ClientFrame, ServerFrame};

use crate::orchestrator::OrchestratorSession;
use crate::pool::{EventSink, SessionPool};
use crate::state::AppState;

pub async fn orchestrator_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (sink, mut sink_rx) = EventSink::channel();
    let writer = tokio::spawn(async move {
        while let Some(frame) = sink_rx.recv().await {
            if ws_sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    state.pool.watch(sink.clone());
    let mut session: Option<Arc<OrchestratorSession>> = None;

    while let Some(Ok(msg)) = ws_stream.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(_) => {
                sink.push_frame(&ServerFrame::error("invalid_json", ""));
                continue;
            }
        };

        match frame {
            ClientFrame::Start {
                local_id,
                resume_sdk_id,
                ..
            } => {
                session = handle_start(&state, &sink, local_id, resume_sdk_id, false).await;
            }

            ClientFrame::VoiceStart {
                local_id,
                resume_sdk_id,
            } => {
                session = handle_start(&state, &sink, local_id, resume_sdk_id, true).await;
            }

            ClientFrame::Send { text } => {
                let Some(session) = session.clone() else {
                    sink.push_frame(&ServerFrame::error(
                        "not_started",
                        "Send a 'start' message first",
                    ));
                    continue;
                };
                // Streaming happens on a task so interrupts stay live on
                // this socket during long tool waves.
                tokio::spawn(handle_send(state.pool.clone(), session, text));
            }

            ClientFrame::VoiceEvent { event } => {
                let voice_session = session.as_ref().filter(|s| s.is_voice()).cloned();
                let Some(voice_session) = voice_session else {
                    sink.push_frame(&ServerFrame::error(
                        "not_voice_session",
                        "No active voice session",
                    ));
                    continue;
                };
                handle_voice_event(&state.pool, &voice_session, event).await;
            }

            ClientFrame::Interrupt => {
                if let Some(session) = &session {
                    session.interrupt();
                    state
                        .pool
                        .broadcast_orchestrator(&ServerFrame::status("interrupted"));
                }
            }

            ClientFrame::Stop => {
                state.pool.stop_orchestrator();
                session = None;
                sink.push_frame(&ServerFrame::SessionStopped);
            }

            ClientFrame::Command { .. } => {
                sink.push_frame(&ServerFrame::error(
                    "unknown_type",
                    "the orchestrator has no slash commands",
                ));
            }
        }
    }

    state.pool.unwatch(sink.id());
    state.pool.unsubscribe_orchestrator(sink.id());
    writer.abort();
    // The orchestrator session keeps running headlessly until an
    // explicit stop.
}

/// Start, resume, or reconnect to the orchestrator session.
async fn handle_start(
    state: &AppState,
    sink: &EventSink,
    local_id: Option<String>,
    resume_id: Option<String>,
    voice: bool,
) -> Option<Arc<OrchestratorSession>> {
    if state.pool.has_orchestrator() {
        // Reconnect: an orchestrator with this local id is already live.
        if let (Some(lid), Some(current)) = (&local_id, state.pool.orchestrator_id()) {
            if *lid == current {
                let session = state.pool.get_orchestrator()?;
                state.pool.subscribe_orchestrator(sink.clone());
                sink.push_frame(&ServerFrame::SessionStarted {
                    session_id: current,
                    voice: session.is_voice(),
                    voice_session_update: None,
                });
                return Some(session);
            }
        }
        sink.push_frame(&ServerFrame::error(
            "orchestrator_active",
            "An orchestrator session is already active. Stop it first.",
        ));
        return None;
    }

    sink.push_frame(&ServerFrame::status("connecting"));
    let started = OrchestratorSession::start(
        &state.config.orchestrator,
        state.tool_ctx.clone(),
        state.registry.clone(),
        resume_id,
        local_id,
        voice,
    )
    .await;

    match started {
        Ok(session) => {
            let session_id = session.local_id().to_string();
            if let Err(e) = state.pool.set_orchestrator(&session_id, session.clone()) {
                sink.push_frame(&ServerFrame::error(e.kind(), e.to_string()));
                return None;
            }
            state.pool.subscribe_orchestrator(sink.clone());

            let voice_session_update = if voice { session.session_config() } else { None };
            sink.push_frame(&ServerFrame::SessionStarted {
                session_id,
                voice,
                voice_session_update,
            });
            Some(session)
        }
        Err(e) => {
            tracing::warn!(error = %e, "orchestrator session start failed");
            sink.push_frame(&ServerFrame::error("start_failed", e.to_string()));
            None
        }
    }
}

/// Stream one orchestrator turn to every subscribed socket.
async fn handle_send(pool: Arc<SessionPool>, session: Arc<OrchestratorSession>, text: String) {
    pool.broadcast_orchestrator(&ServerFrame::status("streaming"));
    match session.send(&text) {
        Ok(mut events) => {
            while let Some(event) = events.recv().await {
                if let Ok(payload) = serde_json::to_string(&event) {
                    pool.broadcast_orchestrator_raw(&payload);
                }
            }
            pool.broadcast_orchestrator(&ServerFrame::status("idle"));
        }
        Err(e) => {
            tracing::warn!(error = %e, "orchestrator send failed");
            pool.broadcast_orchestrator(&ServerFrame::error("send_failed", e.to_string()));
        }
    }
}

/// Process one mirrored voice event and forward any transport commands.
async fn handle_voice_event(
    pool: &Arc<SessionPool>,
    session: &Arc<OrchestratorSession>,
    event: Value,
) {
    match session.process_voice_event(event).await {
        Ok(commands) => {
            for command in commands {
                pool.broadcast_orchestrator(&ServerFrame::VoiceCommand { command });
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "voice event processing failed");
            pool.broadcast_orchestrator(&ServerFrame::error("voice_event_failed", e.to_string()));
        }
    }
}
