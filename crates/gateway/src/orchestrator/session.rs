//! OrchestratorSession — couples an [`OrchestratorAgent`] with a
//! [`SessionLog`]; in voice mode, translates mirrored voice events into
//! tool calls and back into transport commands.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use ms_domain::config::OrchestratorConfig;
use ms_domain::event::SessionEvent;
use ms_domain::message::Message;
use ms_domain::{paths, Error, Result};
use ms_providers::{AnthropicProvider, ModelProvider, Summarizer, VoiceProvider};
use ms_store::{LogRecord, SessionLog};

use crate::tools::{infer_is_error, ToolContext, ToolRegistry};

use super::agent::OrchestratorAgent;

/// Resumed voice histories longer than this get the older portion
/// digested by the summarizer instead of carried in the message list.
pub const MAX_VOICE_HISTORY_MESSAGES: usize = 20;

pub struct OrchestratorSession {
    local_id: String,
    backend_id: String,
    voice: bool,
    agent: Arc<OrchestratorAgent>,
    log: Arc<SessionLog>,
    voice_provider: Option<VoiceProvider>,
    registry: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
}

impl OrchestratorSession {
    /// Start a new or resumed orchestrator session.
    ///
    /// The log filename uses the prior session's id when resuming, else
    /// the fresh local id. Resuming loads history from the log; a fresh
    /// session writes the `orchestrator_meta` first line.
    pub async fn start(
        config: &OrchestratorConfig,
        ctx: Arc<ToolContext>,
        registry: Arc<ToolRegistry>,
        resume_id: Option<String>,
        local_id: Option<String>,
        voice: bool,
    ) -> Result<Arc<Self>> {
        let (provider, voice_provider): (Arc<dyn ModelProvider>, Option<VoiceProvider>) = if voice
        {
            let vp = VoiceProvider::new(&config.voice_model, &config.voice_name);
            (Arc::new(vp.clone()), Some(vp))
        } else {
            (Arc::new(AnthropicProvider::new(config)?), None)
        };
        Self::start_with_provider(config, ctx, registry, resume_id, local_id, provider, voice_provider)
            .await
    }

    pub(crate) async fn start_with_provider(
        config: &OrchestratorConfig,
        ctx: Arc<ToolContext>,
        registry: Arc<ToolRegistry>,
        resume_id: Option<String>,
        local_id: Option<String>,
        provider: Arc<dyn ModelProvider>,
        voice_provider: Option<VoiceProvider>,
    ) -> Result<Arc<Self>> {
        let voice = voice_provider.is_some();
        let local_id = local_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let backend_id = resume_id.clone().unwrap_or_else(|| local_id.clone());

        let log = Arc::new(SessionLog::new(paths::session_path(
            &ctx.project_dir,
            &backend_id,
        )));
        let agent = OrchestratorAgent::new(provider, registry.clone(), ctx.clone(), voice);

        if resume_id.is_some() && log.exists() {
            let history = log.load();
            tracing::info!(
                session_id = %backend_id,
                messages = history.len(),
                voice,
                "resumed orchestrator history"
            );

            if voice && history.len() > MAX_VOICE_HISTORY_MESSAGES {
                let (older, recent) = split_for_voice_resume(history);
                let summary = match Summarizer::new(config) {
                    Ok(summarizer) => match summarizer.summarize(&older).await {
                        Ok(s) if !s.is_empty() => Some(s),
                        Ok(_) => None,
                        Err(e) => {
                            tracing::warn!(error = %e, "voice history summarization failed");
                            None
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "summarizer unavailable");
                        None
                    }
                };
                agent.set_history(recent);
                agent.set_history_summary(summary);
            } else {
                agent.set_history(history);
            }
        } else {
            let (voice_model, voice_name) = if voice {
                (Some(config.voice_model.as_str()), Some(config.voice_name.as_str()))
            } else {
                (None, None)
            };
            log.append(&LogRecord::meta(&backend_id, voice, voice_model, voice_name));
        }

        Ok(Arc::new(Self {
            local_id,
            backend_id,
            voice,
            agent,
            log,
            voice_provider,
            registry,
            ctx,
        }))
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn is_voice(&self) -> bool {
        self.voice
    }

    /// Voice mode: the session.update payload the browser must forward
    /// to the voice vendor.
    pub fn session_config(&self) -> Option<Value> {
        let provider = self.voice_provider.as_ref()?;
        let system = self.agent.system_prompt();
        Some(provider.build_session_config(&system, &self.registry.voice_definitions()))
    }

    // ── Text mode ──────────────────────────────────────────────────

    /// Send a user prompt through the agent loop, persisting the turn to
    /// the session log as it streams.
    pub fn send(self: &Arc<Self>, prompt: &str) -> Result<mpsc::Receiver<SessionEvent>> {
        if self.voice {
            return Err(Error::Other(
                "voice sessions are driven by voice_event frames".into(),
            ));
        }

        self.log.append(&LogRecord::user(prompt));

        let mut agent_rx = self.agent.run(prompt);
        let (tx, rx) = mpsc::channel::<SessionEvent>(256);
        let session = self.clone();

        tokio::spawn(async move {
            let mut text_parts: Vec<String> = Vec::new();
            let mut caller_alive = true;

            while let Some(event) = agent_rx.recv().await {
                match &event {
                    SessionEvent::TextComplete { text } => {
                        text_parts.push(text.clone());
                    }
                    SessionEvent::ToolUse {
                        tool_use_id,
                        tool_name,
                        tool_input,
                    } => {
                        session
                            .log
                            .append(&LogRecord::tool_use(tool_use_id, tool_name, tool_input));
                    }
                    SessionEvent::ToolResult {
                        tool_use_id,
                        output,
                        is_error,
                    } => {
                        session
                            .log
                            .append(&LogRecord::tool_result(tool_use_id, output, *is_error));
                    }
                    _ => {}
                }

                if caller_alive && tx.send(event).await.is_err() {
                    // Keep draining so the turn is fully persisted.
                    caller_alive = false;
                }
            }

            if !text_parts.is_empty() {
                session.log.append(&LogRecord::assistant(text_parts.join("\n")));
            }
        });

        Ok(rx)
    }

    // ── Voice mode ─────────────────────────────────────────────────

    /// Process one mirrored voice event: persist what matters, execute
    /// any completed tool call, and return the transport commands the
    /// caller must forward back to the voice vendor.
    pub async fn process_voice_event(&self, event: Value) -> Result<Vec<Value>> {
        let provider = self
            .voice_provider
            .as_ref()
            .ok_or_else(|| Error::Other("not a voice session".into()))?;

        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let mut commands = Vec::new();

        match event_type {
            // The user's own speech, transcribed.
            "conversation.item.input_audio_transcription.completed" => {
                let transcript = event
                    .get("transcript")
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .trim();
                if !transcript.is_empty() {
                    self.log.append(&LogRecord::user(format!("[voice] {transcript}")));
                }
            }

            "response.audio_transcript.done" => {
                let transcript = event
                    .get("transcript")
                    .and_then(|t| t.as_str())
                    .unwrap_or("");
                if !transcript.is_empty() {
                    self.log.append(&LogRecord::assistant(transcript));
                }
            }

            "input_audio_buffer.speech_started" => {
                let partial = provider.partial_transcript();
                self.log.append(&LogRecord::voice_interrupted(&partial));
            }

            // A completed tool call: execute synchronously and hand the
            // output back for the vendor to consume.
            "response.function_call_arguments.done" => {
                let call_id = event
                    .get("call_id")
                    .and_then(|c| c.as_str())
                    .unwrap_or("")
                    .to_string();
                let name = provider
                    .pending_call_name(&call_id)
                    .or_else(|| {
                        event
                            .get("name")
                            .and_then(|n| n.as_str())
                            .map(str::to_string)
                    })
                    .unwrap_or_default();
                let args_str = event
                    .get("arguments")
                    .and_then(|a| a.as_str())
                    .map(str::to_string)
                    .or_else(|| provider.take_pending_args(&call_id))
                    .unwrap_or_default();

                if !call_id.is_empty() && !name.is_empty() {
                    let tool_input: Value = serde_json::from_str(&args_str)
                        .unwrap_or(Value::Object(Default::default()));

                    self.log
                        .append(&LogRecord::tool_use(&call_id, &name, &tool_input));

                    let output = self.registry.execute(&name, &tool_input, &self.ctx).await;
                    let is_error = infer_is_error(&output);
                    self.log
                        .append(&LogRecord::tool_result(&call_id, &output, is_error));

                    commands.push(json!({
                        "type": "conversation.item.create",
                        "item": {
                            "type": "function_call_output",
                            "call_id": call_id,
                            "output": output,
                        },
                    }));
                    commands.push(json!({"type": "response.create"}));
                }
            }

            _ => {}
        }

        provider.inject_event(event);
        Ok(commands)
    }

    // ── Control ────────────────────────────────────────────────────

    pub fn interrupt(&self) {
        self.agent.interrupt();
    }

    pub fn stop(&self) {
        self.agent.interrupt();
    }
}

/// Split a resumed history into (older, most recent
/// `MAX_VOICE_HISTORY_MESSAGES`).
fn split_for_voice_resume(mut history: Vec<Message>) -> (Vec<Message>, Vec<Message>) {
    let cut = history.len().saturating_sub(MAX_VOICE_HISTORY_MESSAGES);
    let recent = history.split_off(cut);
    (history, recent)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::agent::tests::{turn_complete, ScriptedProvider};
    use crate::tools::test_context;
    use ms_domain::message::Role;

    fn test_registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(
            "echo",
            "Echo the input.",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            &["text"],
            |_ctx, input| async move {
                Ok(json!({"echo": input.get("text").cloned().unwrap_or_default()}).to_string())
            },
        );
        Arc::new(registry)
    }

    fn read_log_types(ctx: &ToolContext, backend_id: &str) -> Vec<String> {
        let raw =
            std::fs::read_to_string(paths::session_path(&ctx.project_dir, backend_id)).unwrap();
        raw.lines()
            .map(|l| {
                serde_json::from_str::<Value>(l).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn text_turn_is_persisted_and_reloadable() {
        let ctx = test_context();
        let provider = ScriptedProvider::new(vec![
            vec![
                SessionEvent::TextComplete { text: "Checking.".into() },
                SessionEvent::ToolUse {
                    tool_use_id: "T".into(),
                    tool_name: "echo".into(),
                    tool_input: json!({"text": "x"}),
                },
                turn_complete(5, 2),
            ],
            vec![
                SessionEvent::TextComplete { text: "Done.".into() },
                turn_complete(8, 3),
            ],
        ]);

        let config = OrchestratorConfig::default();
        let session = OrchestratorSession::start_with_provider(
            &config,
            ctx.clone(),
            test_registry(),
            None,
            Some("orch-1".into()),
            provider,
            None,
        )
        .await
        .unwrap();

        let mut rx = session.send("go").unwrap();
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert!(count >= 5);

        assert_eq!(
            read_log_types(&ctx, "orch-1"),
            vec![
                "orchestrator_meta",
                "user",
                "tool_use",
                "tool_result",
                "assistant",
            ]
        );

        // The log round-trips into model-shaped history.
        let history = SessionLog::new(paths::session_path(&ctx.project_dir, "orch-1")).load();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Role::User);
        assert!(history[1].content.has_tool_use());
        assert_eq!(history[3].content.extract_all_text(), "Checking.\nDone.");
    }

    #[tokio::test]
    async fn resume_loads_history_into_the_agent() {
        let ctx = test_context();
        let log = SessionLog::new(paths::session_path(&ctx.project_dir, "orch-old"));
        log.append(&LogRecord::meta("orch-old", false, None, None));
        log.append(&LogRecord::user("first"));
        log.append(&LogRecord::assistant("answer"));

        let provider = ScriptedProvider::new(vec![]);
        let session = OrchestratorSession::start_with_provider(
            &OrchestratorConfig::default(),
            ctx,
            test_registry(),
            Some("orch-old".into()),
            Some("tab-1".into()),
            provider,
            None,
        )
        .await
        .unwrap();

        assert_eq!(session.backend_id(), "orch-old");
        assert_eq!(session.local_id(), "tab-1");
        assert_eq!(session.agent.history().len(), 2);
    }

    #[tokio::test]
    async fn voice_session_writes_meta_with_voice_fields() {
        let ctx = test_context();
        let session = OrchestratorSession::start(
            &OrchestratorConfig::default(),
            ctx.clone(),
            test_registry(),
            None,
            Some("v-1".into()),
            true,
        )
        .await
        .unwrap();
        assert!(session.is_voice());

        let raw =
            std::fs::read_to_string(paths::session_path(&ctx.project_dir, "v-1")).unwrap();
        let meta: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(meta["type"], "orchestrator_meta");
        assert_eq!(meta["orchestrator"], true);
        assert_eq!(meta["voice"], true);
        assert_eq!(meta["voice_model"], "gpt-realtime");
        assert_eq!(meta["voice_name"], "cedar");

        let config = session.session_config().unwrap();
        assert_eq!(config["type"], "session.update");
        assert_eq!(config["session"]["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn voice_tool_call_executes_and_returns_commands() {
        let ctx = test_context();
        let session = OrchestratorSession::start(
            &OrchestratorConfig::default(),
            ctx.clone(),
            test_registry(),
            None,
            Some("v-2".into()),
            true,
        )
        .await
        .unwrap();

        // User speech transcribed.
        let commands = session
            .process_voice_event(json!({
                "type": "conversation.item.input_audio_transcription.completed",
                "transcript": "echo hello please",
            }))
            .await
            .unwrap();
        assert!(commands.is_empty());

        // Function call: name arrives on the item, args on done.
        session
            .process_voice_event(json!({
                "type": "response.output_item.added",
                "item": {"type": "function_call", "call_id": "c1", "name": "echo"},
            }))
            .await
            .unwrap();
        let commands = session
            .process_voice_event(json!({
                "type": "response.function_call_arguments.done",
                "call_id": "c1",
                "arguments": "{\"text\":\"hello\"}",
            }))
            .await
            .unwrap();

        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0]["type"], "conversation.item.create");
        assert_eq!(commands[0]["item"]["call_id"], "c1");
        assert!(commands[0]["item"]["output"]
            .as_str()
            .unwrap()
            .contains("hello"));
        assert_eq!(commands[1]["type"], "response.create");

        // Assistant transcript, then barge-in.
        session
            .process_voice_event(json!({
                "type": "response.audio_transcript.done",
                "transcript": "I echoed it.",
            }))
            .await
            .unwrap();
        session
            .process_voice_event(json!({"type": "input_audio_buffer.speech_started"}))
            .await
            .unwrap();

        assert_eq!(
            read_log_types(&ctx, "v-2"),
            vec![
                "orchestrator_meta",
                "user",
                "tool_use",
                "tool_result",
                "assistant",
                "voice_interrupted",
            ]
        );

        // Reconstruction skips meta + voice_interrupted and groups tools.
        let history = SessionLog::new(paths::session_path(&ctx.project_dir, "v-2")).load();
        assert_eq!(history.len(), 4);
        assert!(history[0].content.extract_all_text().starts_with("[voice]"));
    }

    #[tokio::test]
    async fn send_on_a_voice_session_is_rejected() {
        let ctx = test_context();
        let session = OrchestratorSession::start(
            &OrchestratorConfig::default(),
            ctx,
            test_registry(),
            None,
            None,
            true,
        )
        .await
        .unwrap();
        assert!(session.send("hi").is_err());
    }

    #[test]
    fn voice_resume_split_keeps_the_tail() {
        let history: Vec<Message> = (0..30).map(|i| Message::user(format!("m{i}"))).collect();
        let (older, recent) = split_for_voice_resume(history);
        assert_eq!(older.len(), 10);
        assert_eq!(recent.len(), MAX_VOICE_HISTORY_MESSAGES);
        assert_eq!(recent[0].content.extract_all_text(), "m10");
    }
}
