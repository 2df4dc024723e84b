//! One-shot summarization with a fast auxiliary model.
//!
//! Used when resuming a long history into voice mode: the older portion
//! of the conversation is digested into a few sentences injected into the
//! system prompt instead of the message list.

use serde_json::Value;

use ms_domain::config::OrchestratorConfig;
use ms_domain::message::{Message, Role};
use ms_domain::{Error, Result};

use crate::util::{from_reqwest, resolve_api_key, ANTHROPIC_VERSION};

const SUMMARY_MAX_TOKENS: u32 = 512;

pub struct Summarizer {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl Summarizer {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.api_base.trim_end_matches('/').to_string(),
            api_key: resolve_api_key()?,
            model: config.summarizer_model.clone(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .map_err(from_reqwest)?,
        })
    }

    /// Summarize a conversation slice into a short plain-text digest.
    pub async fn summarize(&self, messages: &[Message]) -> Result<String> {
        let transcript = render_transcript(messages);
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": SUMMARY_MAX_TOKENS,
            "system": "Summarize the following conversation in a few sentences. \
                       Keep concrete names, decisions, and open tasks.",
            "messages": [{"role": "user", "content": transcript}],
        });

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        let text = resp.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(Error::Provider {
                provider: "summarizer".into(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        let v: Value = serde_json::from_str(&text)?;
        let summary = v
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Ok(summary)
    }
}

/// Flatten a history slice into a readable transcript; tool blocks are
/// reduced to short markers so the digest stays about the conversation.
pub fn render_transcript(messages: &[Message]) -> String {
    let mut lines = Vec::new();
    for msg in messages {
        let label = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        let text = msg.content.extract_all_text();
        if !text.is_empty() {
            lines.push(format!("{label}: {text}"));
        } else if msg.content.has_tool_use() {
            lines.push(format!("{label}: [tool activity]"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms_domain::message::ContentBlock;

    #[test]
    fn transcript_skips_tool_noise() {
        let messages = vec![
            Message::user("open a session"),
            Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: "c1".into(),
                name: "open_agent_session".into(),
                input: serde_json::json!({}),
            }]),
            Message::assistant("done, session open"),
        ];
        let t = render_transcript(&messages);
        assert_eq!(
            t,
            "User: open a session\nAssistant: [tool activity]\nAssistant: done, session open"
        );
    }
}
