//! OrchestratorAgent — the tool-calling loop over a model provider.
//!
//! `run` streams one user turn: it relays provider events, executes any
//! requested tools with the non-blocking executor, feeds the results back
//! into the conversation, and loops until the model answers without tool
//! calls (or the loop limit is hit).

use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ms_domain::event::{SessionEvent, Usage};
use ms_domain::message::{ContentBlock, Message, ToolCall};
use ms_providers::ModelProvider;

use crate::tools::{ToolContext, ToolRegistry};

use super::cancel::CancelToken;
use super::executor;
use super::prompt::{self, HistoryDigest};

/// Safety limit to prevent infinite tool loops.
pub const MAX_TOOL_LOOPS: usize = 20;

pub struct OrchestratorAgent {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
    /// Voice providers cannot carry the message list, so the system
    /// prompt gets a rendered history digest instead.
    voice: bool,
    history: Mutex<Vec<Message>>,
    history_summary: Mutex<Option<String>>,
    cancel: CancelToken,
}

impl OrchestratorAgent {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        ctx: Arc<ToolContext>,
        voice: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            registry,
            ctx,
            voice,
            history: Mutex::new(Vec::new()),
            history_summary: Mutex::new(None),
            cancel: CancelToken::new(),
        })
    }

    pub fn history(&self) -> Vec<Message> {
        self.history.lock().clone()
    }

    pub fn set_history(&self, history: Vec<Message>) {
        *self.history.lock() = history;
    }

    pub fn history_summary(&self) -> Option<String> {
        self.history_summary.lock().clone()
    }

    pub fn set_history_summary(&self, summary: Option<String>) {
        *self.history_summary.lock() = summary;
    }

    /// Interrupt the current run; checked between provider events and
    /// executor polls.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// The system prompt for the current state (also used to configure
    /// the voice vendor session).
    pub fn system_prompt(&self) -> String {
        if self.voice {
            let history = self.history();
            let summary = self.history_summary();
            prompt::build_system_prompt(
                &self.ctx,
                Some(HistoryDigest {
                    recent: &history,
                    summary: summary.as_deref(),
                }),
            )
        } else {
            prompt::build_system_prompt(&self.ctx, None)
        }
    }

    /// Run one user turn through the agent loop, streaming events on the
    /// returned receiver.
    pub fn run(self: &Arc<Self>, prompt_text: &str) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel::<SessionEvent>(256);
        let agent = self.clone();
        let prompt_text = prompt_text.to_string();
        tokio::spawn(async move {
            agent.run_inner(&prompt_text, tx).await;
        });
        rx
    }

    async fn run_inner(self: Arc<Self>, prompt_text: &str, tx: mpsc::Sender<SessionEvent>) {
        self.cancel.reset();
        self.history.lock().push(Message::user(prompt_text));

        let mut total_usage = Usage::default();
        let mut loops_used: u32 = 0;

        for loop_idx in 0..MAX_TOOL_LOOPS {
            if self.cancel.is_cancelled() {
                let _ = tx
                    .send(SessionEvent::error("interrupted", "agent was interrupted"))
                    .await;
                return;
            }

            let system = self.system_prompt();
            let tools = self.registry.definitions();
            let messages = self.history();

            tracing::debug!(loop_idx, messages = messages.len(), "tool loop iteration");
            let mut stream = self
                .provider
                .create_message(&messages, &tools, &system)
                .await;

            let mut assistant_blocks: Vec<ContentBlock> = Vec::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();

            while let Some(event) = stream.next().await {
                if self.cancel.is_cancelled() {
                    let _ = tx
                        .send(SessionEvent::error("interrupted", "agent was interrupted"))
                        .await;
                    return;
                }

                match event {
                    SessionEvent::TextDelta { .. } => {
                        let _ = tx.send(event).await;
                    }
                    SessionEvent::TextComplete { ref text } => {
                        assistant_blocks.push(ContentBlock::Text { text: text.clone() });
                        let _ = tx.send(event).await;
                    }
                    SessionEvent::ToolUse {
                        ref tool_use_id,
                        ref tool_name,
                        ref tool_input,
                    } => {
                        tool_calls.push(ToolCall {
                            id: tool_use_id.clone(),
                            name: tool_name.clone(),
                            input: tool_input.clone(),
                        });
                        assistant_blocks.push(ContentBlock::ToolUse {
                            id: tool_use_id.clone(),
                            name: tool_name.clone(),
                            input: tool_input.clone(),
                        });
                        let _ = tx.send(event).await;
                    }
                    SessionEvent::TurnComplete { ref usage, .. } => {
                        total_usage.add(usage);
                    }
                    SessionEvent::Error { .. } => {
                        let _ = tx.send(event).await;
                        return;
                    }
                    _ => {}
                }
            }

            if !assistant_blocks.is_empty() {
                self.history
                    .lock()
                    .push(Message::assistant_blocks(assistant_blocks));
            }

            loops_used = loop_idx as u32 + 1;
            if tool_calls.is_empty() {
                break;
            }

            let outcomes = executor::run_tool_wave(
                self.registry.clone(),
                self.ctx.clone(),
                tool_calls,
                tx.clone(),
                self.cancel.clone(),
            )
            .await;

            match outcomes {
                Ok(outcomes) => {
                    let result_blocks: Vec<ContentBlock> = outcomes
                        .into_iter()
                        .map(|o| ContentBlock::ToolResult {
                            tool_use_id: o.call_id,
                            content: o.output,
                            is_error: o.is_error,
                        })
                        .collect();
                    self.history.lock().push(Message::tool_results(result_blocks));
                }
                Err(_) => {
                    let _ = tx
                        .send(SessionEvent::error("interrupted", "agent was interrupted"))
                        .await;
                    return;
                }
            }

            if loop_idx == MAX_TOOL_LOOPS - 1 {
                tracing::warn!("tool loop limit reached ({MAX_TOOL_LOOPS} iterations)");
            }
        }

        let _ = tx
            .send(SessionEvent::TurnComplete {
                cost: None,
                usage: total_usage,
                num_turns: loops_used,
                backend_id: None,
                is_error: false,
                result: None,
            })
            .await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tools::test_context;
    use ms_domain::message::{MessageContent, Role};
    use ms_providers::EventStream;
    use serde_json::json;
    use std::collections::VecDeque;

    /// A provider that replays scripted event lists, one per iteration.
    pub(crate) struct ScriptedProvider {
        turns: Mutex<VecDeque<Vec<SessionEvent>>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(turns: Vec<Vec<SessionEvent>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn create_message(
            &self,
            _messages: &[Message],
            _tools: &[ms_domain::message::ToolDefinition],
            _system: &str,
        ) -> EventStream {
            let events = self.turns.lock().pop_front().unwrap_or_default();
            Box::pin(futures_util::stream::iter(events))
        }
    }

    pub(crate) fn turn_complete(input: u32, output: u32) -> SessionEvent {
        SessionEvent::TurnComplete {
            cost: None,
            usage: Usage {
                input_tokens: input,
                output_tokens: output,
            },
            num_turns: 0,
            backend_id: None,
            is_error: false,
            result: None,
        }
    }

    fn echo_registry() -> Arc<ToolRegistry> {
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
        registry.register(
            "sleep_forever",
            "Sleep for a long time.",
            json!({"type": "object", "properties": {}}),
            &[],
            |_ctx, _input| async move {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok("{}".to_string())
            },
        );
        Arc::new(registry)
    }

    async fn collect(mut rx: mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn plain_text_turn() {
        let provider = ScriptedProvider::new(vec![vec![
            SessionEvent::TextDelta { text: "Hi".into() },
            SessionEvent::TextComplete { text: "Hi there".into() },
            turn_complete(10, 4),
        ]]);
        let agent = OrchestratorAgent::new(provider, echo_registry(), test_context(), false);

        let events = collect(agent.run("hi")).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], SessionEvent::TextDelta { .. }));
        assert!(matches!(&events[1], SessionEvent::TextComplete { .. }));
        match &events[2] {
            SessionEvent::TurnComplete { usage, num_turns, .. } => {
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 4);
                assert_eq!(*num_turns, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let history = agent.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content.extract_all_text(), "Hi there");
    }

    #[tokio::test]
    async fn tool_turn_feeds_results_back_into_history() {
        let provider = ScriptedProvider::new(vec![
            vec![
                SessionEvent::TextComplete { text: "Let me check.".into() },
                SessionEvent::ToolUse {
                    tool_use_id: "T".into(),
                    tool_name: "echo".into(),
                    tool_input: json!({"text": "x"}),
                },
                turn_complete(10, 5),
            ],
            vec![
                SessionEvent::TextComplete { text: "All done.".into() },
                turn_complete(20, 6),
            ],
        ]);
        let agent = OrchestratorAgent::new(provider, echo_registry(), test_context(), false);

        let events = collect(agent.run("go")).await;
        let types: Vec<&str> = events
            .iter()
            .map(|e| match e {
                SessionEvent::TextComplete { .. } => "text_complete",
                SessionEvent::ToolUse { .. } => "tool_use",
                SessionEvent::ToolExecuting { .. } => "tool_executing",
                SessionEvent::ToolResult { .. } => "tool_result",
                SessionEvent::TurnComplete { .. } => "turn_complete",
                _ => "other",
            })
            .collect();
        assert_eq!(
            types,
            vec![
                "text_complete",
                "tool_use",
                "tool_executing",
                "tool_result",
                "text_complete",
                "turn_complete",
            ]
        );

        match &events[3] {
            SessionEvent::ToolResult {
                tool_use_id,
                output,
                is_error,
            } => {
                assert_eq!(tool_use_id, "T");
                assert!(output.contains("\"echo\""));
                assert!(!is_error);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Usage accumulated across both iterations.
        match events.last().unwrap() {
            SessionEvent::TurnComplete { usage, num_turns, .. } => {
                assert_eq!(usage.input_tokens, 30);
                assert_eq!(usage.output_tokens, 11);
                assert_eq!(*num_turns, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // History: user, assistant[text+tool_use], user[tool_result],
        // assistant[text].
        let history = agent.history();
        assert_eq!(history.len(), 4);
        assert!(history[1].content.has_tool_use());
        match &history[2].content {
            MessageContent::Blocks(blocks) => {
                assert!(matches!(&blocks[0], ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "T"));
            }
            other => panic!("unexpected content: {other:?}"),
        }
        assert_eq!(history[3].content.extract_all_text(), "All done.");
    }

    #[tokio::test]
    async fn interrupt_during_tool_wave_emits_exactly_one_error() {
        let provider = ScriptedProvider::new(vec![vec![
            SessionEvent::ToolUse {
                tool_use_id: "T".into(),
                tool_name: "sleep_forever".into(),
                tool_input: json!({}),
            },
            turn_complete(1, 1),
        ]]);
        let agent = OrchestratorAgent::new(provider, echo_registry(), test_context(), false);

        let mut rx = agent.run("go");

        // Wait until the tool has started, then interrupt.
        loop {
            match rx.recv().await {
                Some(SessionEvent::ToolExecuting { .. }) => break,
                Some(_) => continue,
                None => panic!("stream ended before tool started"),
            }
        }
        let started = std::time::Instant::now();
        agent.interrupt();

        let mut tail = Vec::new();
        while let Some(e) = rx.recv().await {
            tail.push(e);
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(tail.len(), 1, "expected only the interrupted error, got {tail:?}");
        assert!(matches!(
            &tail[0],
            SessionEvent::Error { error, .. } if error == "interrupted"
        ));
    }

    #[tokio::test]
    async fn provider_error_terminates_the_turn() {
        let provider = ScriptedProvider::new(vec![vec![SessionEvent::error(
            "api_error",
            "overloaded",
        )]]);
        let agent = OrchestratorAgent::new(provider, echo_registry(), test_context(), false);

        let events = collect(agent.run("hi")).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SessionEvent::Error { error, .. } if error == "api_error"
        ));
        // No synthetic turn_complete after a provider error.
    }

    #[tokio::test]
    async fn loop_limit_stops_a_tool_happy_model() {
        // Every iteration asks for another tool call.
        let turns: Vec<Vec<SessionEvent>> = (0..MAX_TOOL_LOOPS + 5)
            .map(|i| {
                vec![
                    SessionEvent::ToolUse {
                        tool_use_id: format!("T{i}"),
                        tool_name: "echo".into(),
                        tool_input: json!({"text": "again"}),
                    },
                    turn_complete(1, 1),
                ]
            })
            .collect();
        let agent = OrchestratorAgent::new(
            ScriptedProvider::new(turns),
            echo_registry(),
            test_context(),
            false,
        );

        let events = collect(agent.run("go")).await;
        let executing = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::ToolExecuting { .. }))
            .count();
        assert_eq!(executing, MAX_TOOL_LOOPS);
        assert!(matches!(
            events.last().unwrap(),
            SessionEvent::TurnComplete { .. }
        ));
    }
}
