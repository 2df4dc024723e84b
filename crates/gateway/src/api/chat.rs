//! Agent-session WebSocket endpoint.
//!
//! Frames in: start / send / command / interrupt / stop. Frames out: the
//! session's broadcast events plus status and lifecycle frames. The
//! socket is registered as a pool subscriber; a writer task drains the
//! subscriber channel so a slow client never blocks the pool.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use ms_protocol::{ClientFrame, ServerFrame};

use crate::pool::EventSink;
use crate::state::AppState;

pub async fn chat_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
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

    let mut session_id: Option<String> = None;

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
                fork,
            } => {
                session_id = handle_start(&state, &sink, local_id, resume_sdk_id, fork).await;
            }

            ClientFrame::Send { text } => {
                let Some(sid) = &session_id else {
                    sink.push_frame(&ServerFrame::error(
                        "not_started",
                        "Send a 'start' message first",
                    ));
                    continue;
                };
                match state.pool.send(sid, &text, Some(sink.id())) {
                    Ok(mut events) => {
                        // Events reach this socket via the pool broadcast;
                        // drain the raw copy so the turn keeps flowing.
                        tokio::spawn(async move { while events.recv().await.is_some() {} });
                    }
                    Err(e) => {
                        sink.push_frame(&ServerFrame::error(e.kind(), e.to_string()));
                    }
                }
            }

            ClientFrame::Command { text } => {
                let session = session_id.as_ref().and_then(|sid| state.pool.get(sid));
                let Some(session) = session else {
                    sink.push_frame(&ServerFrame::error(
                        "not_started",
                        "Send a 'start' message first",
                    ));
                    continue;
                };
                // Commands stream to this socket only.
                match session.command(&text).await {
                    Ok(mut events) => {
                        let sink = sink.clone();
                        tokio::spawn(async move {
                            while let Some(event) = events.recv().await {
                                if let Ok(payload) = serde_json::to_string(&event) {
                                    if !sink.push(&payload) {
                                        break;
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        sink.push_frame(&ServerFrame::error("command_failed", e.to_string()));
                    }
                }
            }

            ClientFrame::Interrupt => {
                if let Some(sid) = &session_id {
                    state.pool.interrupt(sid).await;
                    sink.push_frame(&ServerFrame::status("interrupted"));
                }
            }

            ClientFrame::Stop => {
                // Unsubscribe only; the session stays live in the pool.
                if let Some(sid) = session_id.take() {
                    state.pool.unsubscribe(&sid, sink.id());
                }
                sink.push_frame(&ServerFrame::SessionStopped);
            }

            ClientFrame::VoiceStart { .. } | ClientFrame::VoiceEvent { .. } => {
                sink.push_frame(&ServerFrame::error(
                    "unknown_type",
                    "voice frames belong to the orchestrator endpoint",
                ));
            }
        }
    }

    if let Some(sid) = session_id {
        state.pool.unsubscribe(&sid, sink.id());
    }
    writer.abort();
}

/// Start or resume a session via the pool; returns the subscribed id.
async fn handle_start(
    state: &AppState,
    sink: &EventSink,
    local_id: Option<String>,
    resume_sdk_id: Option<String>,
    fork: bool,
) -> Option<String> {
    // Reconnect to a live session by its stable local id.
    if let Some(lid) = &local_id {
        if state.pool.has(lid) {
            state.pool.subscribe(lid, sink.clone());
            sink.push_frame(&ServerFrame::SessionStarted {
                session_id: lid.clone(),
                voice: false,
                voice_session_update: None,
            });
            return Some(lid.clone());
        }
    }

    sink.push_frame(&ServerFrame::status("connecting"));
    match state
        .pool
        .create(state.config.agent.clone(), local_id, resume_sdk_id, fork)
        .await
    {
        Ok(session_id) => {
            state.pool.subscribe(&session_id, sink.clone());
            sink.push_frame(&ServerFrame::SessionStarted {
                session_id: session_id.clone(),
                voice: false,
                voice_session_update: None,
            });
            Some(session_id)
        }
        Err(e) => {
            tracing::warn!(error = %e, "session start failed");
            sink.push_frame(&ServerFrame::error(e.kind(), e.to_string()));
            None
        }
    }
}
