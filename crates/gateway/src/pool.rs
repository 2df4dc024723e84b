//! SessionPool — shared pool of coding-agent sessions with per-session
//! locking and event broadcast.
//!
//! Both the WebSocket handlers and the orchestrator tools use this pool.
//! Sessions are independent: they survive client disconnects and can have
//! any number of subscribers receiving identical event streams.
//!
//! Sessions are keyed by a stable **local id** (UUID) that never changes.
//! The CLI's own log id is stored as the session's backend id and used
//! only for resume and log lookups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};

use ms_agent::AgentSession;
use ms_domain::config::AgentConfig;
use ms_domain::event::SessionEvent;
use ms_domain::{Error, Result};
use ms_protocol::ServerFrame;

use crate::orchestrator::session::OrchestratorSession;

/// Buffered frames per subscriber before it is considered dead.
const SINK_CAPACITY: usize = 256;

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// One endpoint of a subscriber/watcher connection.
///
/// Frames are pushed with `try_send`: a sink whose buffer is full or whose
/// receiver is gone counts as dead and is dropped after the sweep, so a
/// slow consumer never blocks the broadcast loop.
#[derive(Clone)]
pub struct EventSink {
    id: u64,
    tx: mpsc::Sender<String>,
}

impl EventSink {
    pub fn channel() -> (EventSink, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        (
            EventSink {
                id: NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send a pre-serialized frame. Returns false when the sink is dead.
    pub fn push(&self, frame: &str) -> bool {
        self.tx.try_send(frame.to_string()).is_ok()
    }

    /// Serialize and send a control frame directly to this sink.
    pub fn push_frame(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(json) => self.push(&json),
            Err(_) => false,
        }
    }
}

/// Live-session snapshot used by tools and the system prompt.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    pub status: String,
    pub cost: f64,
    pub turns: u32,
}

/// The concurrent registry owning all sessions, locks, subscribers, and
/// watchers, plus the single orchestrator slot.
pub struct SessionPool {
    sessions: Mutex<HashMap<String, AgentSession>>,
    subscribers: Mutex<HashMap<String, Vec<EventSink>>>,
    /// Per-session send locks: `Semaphore(1)`, acquired for a whole turn.
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
    watchers: Mutex<Vec<EventSink>>,
    orchestrator: Mutex<Option<(String, Arc<OrchestratorSession>)>>,
    orchestrator_subs: Mutex<Vec<EventSink>>,
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            orchestrator: Mutex::new(None),
            orchestrator_subs: Mutex::new(Vec::new()),
        }
    }

    // ── Session lifecycle ──────────────────────────────────────────

    /// Create, start, and register a session. Returns the stable local id.
    ///
    /// Resuming a backend id that is already live and healthy returns the
    /// existing session instead of creating a duplicate (no watcher event
    /// in that case).
    pub async fn create(
        &self,
        config: AgentConfig,
        local_id: Option<String>,
        resume_backend_id: Option<String>,
        fork: bool,
    ) -> Result<String> {
        if let (Some(backend_id), false) = (&resume_backend_id, fork) {
            let sessions = self.sessions.lock();
            let live = sessions.values().find(|s| {
                s.backend_id().as_deref() == Some(backend_id.as_str()) && s.is_healthy()
            });
            if let Some(existing) = live {
                tracing::debug!(
                    backend_id,
                    local_id = existing.local_id(),
                    "resume matched a live session"
                );
                return Ok(existing.local_id().to_string());
            }
        }

        let session = AgentSession::new(config, local_id, resume_backend_id, fork);
        let local_id = session.start().await?;

        {
            self.sessions.lock().insert(local_id.clone(), session.clone());
            self.subscribers.lock().entry(local_id.clone()).or_default();
            self.locks
                .lock()
                .entry(local_id.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1)));
        }

        // Announce immediately — the local id is stable from creation.
        self.notify_watchers(&ServerFrame::AgentSessionOpened {
            session_id: local_id.clone(),
            sdk_session_id: session.backend_id(),
        });

        tracing::info!(session_id = %local_id, "session registered in pool");
        Ok(local_id)
    }

    /// Remove a session, notifying subscribers and watchers.
    ///
    /// The subprocess is never stopped from here: removing the session
    /// stops routing work to it, and the CLI exits once the last strong
    /// handle is dropped (its stdin closes). Session logs are never
    /// deleted from the pool either.
    pub fn close(&self, session_id: &str) {
        let removed = self.sessions.lock().remove(session_id);
        if removed.is_none() {
            return;
        }

        // Notify while subscribers/watchers are still registered.
        self.broadcast_frame(session_id, &ServerFrame::SessionStopped, None);
        self.notify_watchers(&ServerFrame::AgentSessionClosed {
            session_id: session_id.to_string(),
        });

        self.subscribers.lock().remove(session_id);
        self.locks.lock().remove(session_id);
        tracing::info!(session_id, "session closed");
    }

    /// Interrupt the current response for a session.
    pub async fn interrupt(&self, session_id: &str) {
        let session = self.get(session_id);
        if let Some(session) = session {
            session.interrupt().await;
        }
    }

    // ── Session access ─────────────────────────────────────────────

    pub fn get(&self, session_id: &str) -> Option<AgentSession> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn has(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, s)| SessionSnapshot {
                session_id: id.clone(),
                sdk_session_id: s.backend_id(),
                status: s.status().as_str().to_string(),
                cost: s.cost(),
                turns: s.turns(),
            })
            .collect()
    }

    // ── Subscribers ────────────────────────────────────────────────

    /// Add a subscriber for a session's events. Safe if the session is
    /// unknown.
    pub fn subscribe(&self, session_id: &str, sink: EventSink) {
        if let Some(subs) = self.subscribers.lock().get_mut(session_id) {
            subs.retain(|s| s.id != sink.id);
            subs.push(sink);
        }
    }

    pub fn unsubscribe(&self, session_id: &str, sink_id: u64) {
        if let Some(subs) = self.subscribers.lock().get_mut(session_id) {
            subs.retain(|s| s.id != sink_id);
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.subscribers
            .lock()
            .get(session_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    // ── Watchers ───────────────────────────────────────────────────

    pub fn watch(&self, sink: EventSink) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|s| s.id != sink.id);
        watchers.push(sink);
    }

    pub fn unwatch(&self, sink_id: u64) {
        self.watchers.lock().retain(|s| s.id != sink_id);
    }

    // ── Sending (lock + broadcast) ─────────────────────────────────

    /// Drive one turn of a session under its per-session lock.
    ///
    /// Broadcasts a `user_message` frame to every subscriber except
    /// `source` (the sender already knows what it sent), then every event
    /// to every subscriber, in provider order. Raw events are also
    /// forwarded on the returned receiver for the caller to collect.
    pub fn send(
        self: &Arc<Self>,
        session_id: &str,
        text: &str,
        source: Option<u64>,
    ) -> Result<mpsc::Receiver<SessionEvent>> {
        let session = self
            .get(session_id)
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;

        let semaphore = self
            .locks
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let (caller_tx, caller_rx) = mpsc::channel::<SessionEvent>(256);
        let pool = Arc::clone(self);
        let session_id = session_id.to_string();
        let text = text.to_string();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };

            pool.broadcast_frame(
                &session_id,
                &ServerFrame::UserMessage { text: text.clone() },
                source,
            );

            let mut events = match session.send(&text).await {
                Ok(rx) => rx,
                Err(e) => {
                    let event = SessionEvent::error(e.kind(), e.to_string());
                    pool.broadcast_event(&session_id, &event);
                    let _ = caller_tx.send(event).await;
                    return;
                }
            };

            let mut caller_alive = true;
            while let Some(event) = events.recv().await {
                pool.broadcast_event(&session_id, &event);
                if caller_alive && caller_tx.send(event).await.is_err() {
                    // Caller went away; keep broadcasting to subscribers.
                    caller_alive = false;
                }
            }
        });

        Ok(caller_rx)
    }

    // ── Orchestrator slot ──────────────────────────────────────────

    /// Register the orchestrator session. At most one may exist.
    pub fn set_orchestrator(&self, id: &str, session: Arc<OrchestratorSession>) -> Result<()> {
        let mut slot = self.orchestrator.lock();
        if slot.is_some() {
            return Err(Error::OrchestratorActive);
        }
        *slot = Some((id.to_string(), session));
        Ok(())
    }

    pub fn orchestrator_id(&self) -> Option<String> {
        self.orchestrator.lock().as_ref().map(|(id, _)| id.clone())
    }

    pub fn get_orchestrator(&self) -> Option<Arc<OrchestratorSession>> {
        self.orchestrator.lock().as_ref().map(|(_, s)| s.clone())
    }

    pub fn has_orchestrator(&self) -> bool {
        self.orchestrator.lock().is_some()
    }

    pub fn subscribe_orchestrator(&self, sink: EventSink) {
        let mut subs = self.orchestrator_subs.lock();
        subs.retain(|s| s.id != sink.id);
        subs.push(sink);
    }

    pub fn unsubscribe_orchestrator(&self, sink_id: u64) {
        self.orchestrator_subs.lock().retain(|s| s.id != sink_id);
    }

    /// Broadcast a frame to every orchestrator subscriber.
    pub fn broadcast_orchestrator(&self, frame: &ServerFrame) {
        if let Ok(payload) = serde_json::to_string(frame) {
            self.broadcast_orchestrator_raw(&payload);
        }
    }

    pub fn broadcast_orchestrator_raw(&self, payload: &str) {
        let sinks: Vec<EventSink> = self.orchestrator_subs.lock().clone();
        let dead = push_all(&sinks, payload, None);
        if !dead.is_empty() {
            self.orchestrator_subs
                .lock()
                .retain(|s| !dead.contains(&s.id));
        }
    }

    /// Tear down the orchestrator slot.
    pub fn stop_orchestrator(&self) {
        if let Some((id, session)) = self.orchestrator.lock().take() {
            session.stop();
            tracing::info!(session_id = %id, "orchestrator stopped");
        }
    }

    // ── Graceful process shutdown ──────────────────────────────────

    /// Stop every subprocess handle. Only the process-exit path calls
    /// this; normal `close` relies on handle drop.
    pub fn shutdown(&self) {
        self.stop_orchestrator();
        for (id, session) in self.sessions.lock().drain() {
            tracing::debug!(session_id = %id, "stopping session at shutdown");
            session.stop();
        }
    }

    // ── Broadcast internals ────────────────────────────────────────

    fn broadcast_event(&self, session_id: &str, event: &SessionEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            self.broadcast_raw(session_id, &payload, None);
        }
    }

    fn broadcast_frame(&self, session_id: &str, frame: &ServerFrame, exclude: Option<u64>) {
        if let Ok(payload) = serde_json::to_string(frame) {
            self.broadcast_raw(session_id, &payload, exclude);
        }
    }

    /// Serialize-once fanout with a dead-sink sweep after iteration.
    fn broadcast_raw(&self, session_id: &str, payload: &str, exclude: Option<u64>) {
        let sinks: Vec<EventSink> = match self.subscribers.lock().get(session_id) {
            Some(subs) => subs.clone(),
            None => return,
        };
        let dead = push_all(&sinks, payload, exclude);
        if !dead.is_empty() {
            if let Some(subs) = self.subscribers.lock().get_mut(session_id) {
                subs.retain(|s| !dead.contains(&s.id));
            }
        }
    }

    fn notify_watchers(&self, frame: &ServerFrame) {
        let payload = match serde_json::to_string(frame) {
            Ok(p) => p,
            Err(_) => return,
        };
        let sinks: Vec<EventSink> = self.watchers.lock().clone();
        let dead = push_all(&sinks, &payload, None);
        if !dead.is_empty() {
            self.watchers.lock().retain(|s| !dead.contains(&s.id));
        }
    }
}

/// Push to every sink, returning the ids that failed.
fn push_all(sinks: &[EventSink], payload: &str, exclude: Option<u64>) -> Vec<u64> {
    let mut dead = Vec::new();
    for sink in sinks {
        if Some(sink.id) == exclude {
            continue;
        }
        if !sink.push(payload) {
            dead.push(sink.id);
        }
    }
    dead
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_cli_config() -> AgentConfig {
        // Reports idle, answers each prompt with a scripted turn.
        let script = r#"
echo '{"type":"status","status":"idle"}'
while IFS= read -r line; do
  echo '{"type":"text_delta","text":"Hi"}'
  echo '{"type":"text_delta","text":" there"}'
  echo '{"type":"text_complete","text":"Hi there"}'
  echo '{"type":"turn_complete","cost":0.01,"num_turns":1,"session_id":"b-1"}'
done
"#;
        AgentConfig {
            project_dir: std::env::temp_dir(),
            cli_command: vec!["/bin/sh".into(), "-c".into(), script.into()],
            model: None,
            permission_mode: "default".into(),
            max_turns: None,
        }
    }

    async fn drain_sink(rx: &mut mpsc::Receiver<String>, n: usize) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        for _ in 0..n {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("sink closed");
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn send_broadcasts_in_order_with_user_message_first() {
        let pool = Arc::new(SessionPool::new());
        let id = pool
            .create(fake_cli_config(), Some("A1".into()), None, false)
            .await
            .unwrap();
        assert_eq!(id, "A1");

        let (sink, mut rx) = EventSink::channel();
        pool.subscribe("A1", sink);

        let mut events = pool.send("A1", "hi", None).unwrap();
        let mut raw = Vec::new();
        while let Some(e) = events.recv().await {
            raw.push(e);
        }
        assert_eq!(raw.len(), 4);

        let frames = drain_sink(&mut rx, 5).await;
        assert_eq!(frames[0]["type"], "user_message");
        assert_eq!(frames[0]["text"], "hi");
        assert_eq!(frames[1]["type"], "text_delta");
        assert_eq!(frames[1]["text"], "Hi");
        assert_eq!(frames[2]["type"], "text_delta");
        assert_eq!(frames[2]["text"], " there");
        assert_eq!(frames[3]["type"], "text_complete");
        assert_eq!(frames[4]["type"], "turn_complete");
        assert_eq!(frames[4]["cost"], 0.01);
        assert_eq!(frames[4]["num_turns"], 1);
    }

    #[tokio::test]
    async fn source_subscriber_skips_its_own_user_message() {
        let pool = Arc::new(SessionPool::new());
        pool.create(fake_cli_config(), Some("A1".into()), None, false)
            .await
            .unwrap();

        let (w1, mut rx1) = EventSink::channel();
        let (w2, mut rx2) = EventSink::channel();
        let w1_id = w1.id();
        pool.subscribe("A1", w1);
        pool.subscribe("A1", w2);

        let mut events = pool.send("A1", "ping", Some(w1_id)).unwrap();
        while events.recv().await.is_some() {}

        // w2 sees the user_message; w1 does not.
        let w2_frames = drain_sink(&mut rx2, 5).await;
        assert_eq!(w2_frames[0]["type"], "user_message");

        let w1_frames = drain_sink(&mut rx1, 4).await;
        assert_eq!(w1_frames[0]["type"], "text_delta");

        // Both see identical event frames after that.
        let w1_events: Vec<_> = w1_frames.iter().collect();
        let w2_events: Vec<_> = w2_frames[1..].iter().collect();
        assert_eq!(w1_events, w2_events);
    }

    #[tokio::test]
    async fn concurrent_sends_are_serialized_per_session() {
        let pool = Arc::new(SessionPool::new());
        pool.create(fake_cli_config(), Some("A1".into()), None, false)
            .await
            .unwrap();

        let (sink, mut rx) = EventSink::channel();
        pool.subscribe("A1", sink);

        let mut rx_a = pool.send("A1", "first", None).unwrap();
        let mut rx_b = pool.send("A1", "second", None).unwrap();
        while rx_a.recv().await.is_some() {}
        while rx_b.recv().await.is_some() {}

        // Second turn's frames start strictly after the first turn's
        // turn_complete.
        let frames = drain_sink(&mut rx, 10).await;
        let types: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
        assert_eq!(
            types,
            vec![
                "user_message",
                "text_delta",
                "text_delta",
                "text_complete",
                "turn_complete",
                "user_message",
                "text_delta",
                "text_delta",
                "text_complete",
                "turn_complete",
            ]
        );
    }

    #[tokio::test]
    async fn resume_dedupes_onto_live_session() {
        let pool = Arc::new(SessionPool::new());
        let id = pool
            .create(fake_cli_config(), Some("A1".into()), None, false)
            .await
            .unwrap();

        // Record the backend id from the first turn.
        let mut events = pool.send(&id, "hi", None).unwrap();
        while events.recv().await.is_some() {}
        assert_eq!(pool.get(&id).unwrap().backend_id().as_deref(), Some("b-1"));

        let (watcher, mut watch_rx) = EventSink::channel();
        pool.watch(watcher);

        let id2 = pool
            .create(fake_cli_config(), None, Some("b-1".into()), false)
            .await
            .unwrap();
        assert_eq!(id2, id);
        assert_eq!(pool.list_sessions().len(), 1);

        // No agent_session_opened was announced for the dedupe.
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(200),
            watch_rx.recv()
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn close_notifies_subscribers_and_watchers() {
        let pool = Arc::new(SessionPool::new());
        pool.create(fake_cli_config(), Some("A1".into()), None, false)
            .await
            .unwrap();

        let (sub, mut sub_rx) = EventSink::channel();
        let (watcher, mut watch_rx) = EventSink::channel();
        pool.subscribe("A1", sub);
        pool.watch(watcher);

        pool.close("A1");
        assert!(!pool.has("A1"));

        let frame: serde_json::Value =
            serde_json::from_str(&sub_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "session_stopped");

        let frame: serde_json::Value =
            serde_json::from_str(&watch_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "agent_session_closed");
        assert_eq!(frame["session_id"], "A1");

        // Closing again is a no-op.
        pool.close("A1");
    }

    #[tokio::test]
    async fn dead_subscribers_are_swept_without_blocking_others() {
        let pool = Arc::new(SessionPool::new());
        pool.create(fake_cli_config(), Some("A1".into()), None, false)
            .await
            .unwrap();

        let (dead, dead_rx) = EventSink::channel();
        drop(dead_rx);
        let (live, mut live_rx) = EventSink::channel();
        pool.subscribe("A1", dead);
        pool.subscribe("A1", live);
        assert_eq!(pool.subscriber_count("A1"), 2);

        let mut events = pool.send("A1", "hi", None).unwrap();
        while events.recv().await.is_some() {}

        let frames = drain_sink(&mut live_rx, 5).await;
        assert_eq!(frames.len(), 5);
        assert_eq!(pool.subscriber_count("A1"), 1);
    }

    #[tokio::test]
    async fn send_to_unknown_session_errors() {
        let pool = Arc::new(SessionPool::new());
        let err = pool.send("ghost", "hi", None).unwrap_err();
        assert_eq!(err.kind(), "unknown_session");
    }

    #[tokio::test]
    async fn subscribe_unknown_session_is_safe() {
        let pool = SessionPool::new();
        let (sink, _rx) = EventSink::channel();
        pool.subscribe("ghost", sink);
        pool.unsubscribe("ghost", 42);
        assert_eq!(pool.subscriber_count("ghost"), 0);
    }
}
