//! Configuration for the gateway, pooled agent sessions, and the
//! orchestrator. Loaded from a TOML file with environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    ///
    /// Lookup order for each field: env var, file value, default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.is_file() => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?
            }
            Some(p) => {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    p.display()
                )))
            }
            None => {
                let default = PathBuf::from("maestro.toml");
                if default.is_file() {
                    let raw = std::fs::read_to_string(&default)?;
                    toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?
                } else {
                    Config::default()
                }
            }
        };

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MAESTRO_PROJECT_DIR") {
            self.agent.project_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MAESTRO_AGENT_MODEL") {
            self.agent.model = Some(v);
        }
        if let Ok(v) = std::env::var("MAESTRO_ORCHESTRATOR_MODEL") {
            self.orchestrator.model = v;
        }
        if let Ok(v) = std::env::var("MAESTRO_ORCHESTRATOR_MAX_TOKENS") {
            if let Ok(n) = v.parse() {
                self.orchestrator.max_tokens = n;
            }
        }
        if let Ok(v) = std::env::var("MAESTRO_BIND") {
            self.server.bind = v;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: d_bind() }
    }
}

fn d_bind() -> String {
    "127.0.0.1:8765".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pooled agent sessions (coding-agent CLI)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for a pooled coding-agent CLI session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Project the CLI runs against (also the session-log root).
    #[serde(default = "d_project_dir")]
    pub project_dir: PathBuf,
    /// Argv used to spawn the coding-agent CLI; flags are appended.
    #[serde(default = "d_cli_command")]
    pub cli_command: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "d_permission_mode")]
    pub permission_mode: String,
    #[serde(default)]
    pub max_turns: Option<u32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            project_dir: d_project_dir(),
            cli_command: d_cli_command(),
            model: None,
            permission_mode: d_permission_mode(),
            max_turns: None,
        }
    }
}

fn d_project_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn d_cli_command() -> Vec<String> {
    vec!["claude".into(), "--output-format".into(), "stream-json".into()]
}

fn d_permission_mode() -> String {
    "default".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Model for the text provider.
    #[serde(default = "d_orch_model")]
    pub model: String,
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u32,
    /// Anthropic-compatible API base URL.
    #[serde(default = "d_api_base")]
    pub api_base: String,
    /// Fast model used to digest long resumed histories in voice mode.
    #[serde(default = "d_summarizer_model")]
    pub summarizer_model: String,
    /// Voice-vendor realtime model mirrored by the browser transport.
    #[serde(default = "d_voice_model")]
    pub voice_model: String,
    #[serde(default = "d_voice_name")]
    pub voice_name: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: d_orch_model(),
            max_tokens: d_max_tokens(),
            api_base: d_api_base(),
            summarizer_model: d_summarizer_model(),
            voice_model: d_voice_model(),
            voice_name: d_voice_name(),
        }
    }
}

fn d_orch_model() -> String {
    "claude-sonnet-4-20250514".into()
}

fn d_max_tokens() -> u32 {
    8192
}

fn d_api_base() -> String {
    "https://api.anthropic.com".into()
}

fn d_summarizer_model() -> String {
    "claude-3-5-haiku-20241022".into()
}

fn d_voice_model() -> String {
    "gpt-realtime".into()
}

fn d_voice_name() -> String {
    "cedar".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// External search subprocess
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Argv prefix for the vector-search command; query and flags are
    /// appended (`<query> --collection <c> --n <k> --json`).
    #[serde(default = "d_search_command")]
    pub command: Vec<String>,
    #[serde(default = "d_search_timeout")]
    pub timeout_secs: u64,
    /// Argv for the index cleanup command run after log deletion.
    #[serde(default = "d_reindex_command")]
    pub reindex_command: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            command: d_search_command(),
            timeout_secs: d_search_timeout(),
            reindex_command: d_reindex_command(),
        }
    }
}

fn d_search_command() -> Vec<String> {
    vec!["context/scripts/search".into()]
}

fn d_search_timeout() -> u64 {
    60
}

fn d_reindex_command() -> Vec<String> {
    vec!["context/scripts/cleanup-history-index".into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let c = Config::default();
        assert_eq!(c.server.bind, "127.0.0.1:8765");
        assert_eq!(c.orchestrator.max_tokens, 8192);
        assert_eq!(c.search.timeout_secs, 60);
        assert_eq!(c.agent.permission_mode, "default");
    }

    #[test]
    fn toml_partial_overlay() {
        let raw = r#"
            [orchestrator]
            model = "claude-opus-4-20250514"

            [search]
            timeout_secs = 10
        "#;
        let c: Config = toml::from_str(raw).unwrap();
        assert_eq!(c.orchestrator.model, "claude-opus-4-20250514");
        assert_eq!(c.orchestrator.max_tokens, 8192);
        assert_eq!(c.search.timeout_secs, 10);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/maestro.toml"))).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }
}
