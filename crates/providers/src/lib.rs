//! Model providers for the orchestrator agent.
//!
//! Two variants implement [`ModelProvider`]: the text provider opens a
//! streaming LLM request directly; the voice provider is queue-driven from
//! voice-vendor events mirrored by the browser.

mod anthropic;
mod provider;
mod sse;
mod summarizer;
mod util;
mod voice;

pub use anthropic::AnthropicProvider;
pub use provider::{EventStream, ModelProvider};
pub use summarizer::Summarizer;
pub use voice::{VoiceProvider, VOICE_IDLE_TIMEOUT_SECS};
