use ms_domain::event::{BoxStream, SessionEvent};
use ms_domain::message::{Message, ToolDefinition};

/// The stream produced by one `create_message` call.
///
/// Failures travel inside the stream as `SessionEvent::Error` so the agent
/// loop has a single relay path; the stream terminates after a
/// `turn_complete` or `error` event.
pub type EventStream = BoxStream<'static, SessionEvent>;

/// Trait every model provider implements.
///
/// The text variant opens a streaming request against the LLM API; the
/// voice variant replays mirrored realtime events. Voice-only operations
/// (`inject_event`, `build_session_config`) are inherent methods on
/// [`crate::VoiceProvider`] — tool-result submission is deliberately not
/// unified across the two variants.
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stream one model response for the given conversation.
    async fn create_message(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system: &str,
    ) -> EventStream;
}
