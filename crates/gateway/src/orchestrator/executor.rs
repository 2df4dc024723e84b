//! Non-blocking streaming tool executor.
//!
//! Contract: while tools run, the agent loop keeps yielding events so the
//! pool can keep broadcasting them. Each tool call runs in its own task;
//! a shared heartbeat emits `tool_progress` for everything still pending;
//! the collector polls in short slices so an interrupt cancels the whole
//! wave promptly. Results come back in the original call order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use ms_domain::event::SessionEvent;
use ms_domain::message::ToolCall;
use ms_domain::{Error, Result};

use crate::tools::{error_result, infer_is_error, ToolContext, ToolRegistry};

use super::cancel::CancelToken;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Collector poll slice; bounds how long an interrupt can go unnoticed.
const POLL_SLICE: Duration = Duration::from_millis(500);

/// One tool call's final output, keyed for the history append.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub output: String,
    pub is_error: bool,
}

/// Run one tool wave, relaying `tool_executing` / `tool_progress` /
/// `tool_result` events on `events` as they happen.
///
/// Returns `Err(Interrupted)` when the cancel token fires; pending tool
/// tasks and the heartbeat are aborted and nothing further is emitted.
pub async fn run_tool_wave(
    registry: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
    calls: Vec<ToolCall>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancelToken,
) -> Result<Vec<ToolOutcome>> {
    let (out_tx, mut out_rx) = mpsc::channel::<SessionEvent>(64);

    let pending: Arc<Mutex<HashMap<String, (String, Instant)>>> =
        Arc::new(Mutex::new(HashMap::new()));
    {
        let mut map = pending.lock();
        for call in &calls {
            map.insert(call.id.clone(), (call.name.clone(), Instant::now()));
        }
    }

    // One task per call.
    let mut handles = Vec::with_capacity(calls.len());
    for call in calls.iter().cloned() {
        let registry = registry.clone();
        let ctx = ctx.clone();
        let out_tx = out_tx.clone();
        handles.push(tokio::spawn(async move {
            let _ = out_tx
                .send(SessionEvent::ToolExecuting {
                    tool_use_id: call.id.clone(),
                    tool_name: call.name.clone(),
                })
                .await;
            let output = registry.execute(&call.name, &call.input, &ctx).await;
            let is_error = infer_is_error(&output);
            let _ = out_tx
                .send(SessionEvent::ToolResult {
                    tool_use_id: call.id,
                    output,
                    is_error,
                })
                .await;
        }));
    }

    // Shared heartbeat for everything still pending.
    let heartbeat = {
        let pending = pending.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await; // the immediate first tick
            loop {
                interval.tick().await;
                let snapshot: Vec<(String, String, u64)> = pending
                    .lock()
                    .iter()
                    .map(|(id, (name, started))| {
                        (id.clone(), name.clone(), started.elapsed().as_secs())
                    })
                    .collect();
                for (tool_use_id, tool_name, elapsed_secs) in snapshot {
                    let message = format!("{tool_name} still running ({elapsed_secs}s)");
                    let _ = out_tx
                        .send(SessionEvent::ToolProgress {
                            tool_use_id,
                            tool_name,
                            elapsed_secs,
                            message,
                        })
                        .await;
                }
            }
        })
    };
    drop(out_tx);

    // Collector: forward events, track completion, watch the cancel flag.
    let mut results: HashMap<String, ToolOutcome> = HashMap::new();
    let total = calls.len();
    let mut interrupted = false;

    while results.len() < total {
        if cancel.is_cancelled() {
            interrupted = true;
            break;
        }
        match tokio::time::timeout(POLL_SLICE, out_rx.recv()).await {
            Ok(Some(event)) => {
                if let SessionEvent::ToolResult {
                    tool_use_id,
                    output,
                    is_error,
                } = &event
                {
                    pending.lock().remove(tool_use_id);
                    results.insert(
                        tool_use_id.clone(),
                        ToolOutcome {
                            call_id: tool_use_id.clone(),
                            output: output.clone(),
                            is_error: *is_error,
                        },
                    );
                }
                // A vanished consumer is fine: the wave still finishes so
                // the results can be appended to history.
                let _ = events.send(event).await;
            }
            Ok(None) => break,
            Err(_) => continue,
        }
    }

    heartbeat.abort();
    if interrupted {
        for handle in &handles {
            handle.abort();
        }
        tracing::debug!(pending = total - results.len(), "tool wave interrupted");
        return Err(Error::Interrupted);
    }

    // Original call order, independent of completion order.
    let ordered = calls
        .iter()
        .map(|call| {
            results.remove(&call.id).unwrap_or_else(|| ToolOutcome {
                call_id: call.id.clone(),
                output: error_result("tool task failed"),
                is_error: true,
            })
        })
        .collect();
    Ok(ordered)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
