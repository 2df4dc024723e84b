//! Tool registry for the orchestrator agent.
//!
//! Tools are name-indexed specs with a JSON-schema declaration and an
//! async handler. Handler failures never escape: they are wrapped into a
//! `{"error": …}` result string, and callers infer `is_error` by parsing
//! the result for an `error` key.

pub mod agent_sessions;
pub mod files;
pub mod search;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use ms_domain::config::{AgentConfig, SearchConfig};
use ms_domain::message::ToolDefinition;
use ms_domain::Result;
use ms_store::SessionStore;

use crate::pool::SessionPool;

/// Dependency bag threaded into every tool handler.
pub struct ToolContext {
    pub pool: Arc<SessionPool>,
    pub store: Arc<SessionStore>,
    pub agent_config: AgentConfig,
    pub search: SearchConfig,
    pub project_dir: PathBuf,
    pub index_dir: PathBuf,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;
type Handler = Arc<dyn Fn(Arc<ToolContext>, Value) -> HandlerFuture + Send + Sync>;

struct ToolSpec {
    name: String,
    description: String,
    input_schema: Value,
    /// Parameter names the handler accepts; other input keys are dropped
    /// before dispatch.
    params: Vec<&'static str>,
    handler: Handler,
}

/// Name-indexed registry of async tool handlers.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default registry with every builtin tool.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        agent_sessions::register(&mut registry);
        files::register(&mut registry);
        search::register(&mut registry);
        registry
    }

    pub fn register<F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        input_schema: Value,
        params: &[&'static str],
        handler: F,
    ) where
        F: Fn(Arc<ToolContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        self.tools.push(ToolSpec {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            params: params.to_vec(),
            handler: Arc::new(move |ctx, input| Box::pin(handler(ctx, input))),
        });
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Definitions in the text-provider (Messages API) dialect.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    /// Definitions in the voice-vendor function dialect.
    pub fn voice_definitions(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                })
            })
            .collect()
    }

    /// Execute a tool by name. Always returns a result string; failures
    /// come back as `{"error": …}`.
    pub async fn execute(&self, name: &str, input: &Value, ctx: &Arc<ToolContext>) -> String {
        let Some(tool) = self.tools.iter().find(|t| t.name == name) else {
            return error_result(format!("Unknown tool: {name}"));
        };

        let filtered = filter_input(input, &tool.params);
        match (tool.handler)(ctx.clone(), filtered).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "tool handler failed");
                error_result(e.to_string())
            }
        }
    }
}

/// Keep only the input keys the handler declares.
fn filter_input(input: &Value, params: &[&'static str]) -> Value {
    match input.as_object() {
        Some(obj) => Value::Object(
            obj.iter()
                .filter(|(k, _)| params.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => Value::Object(Default::default()),
    }
}

pub fn error_result(message: impl Into<String>) -> String {
    serde_json::json!({"error": message.into()}).to_string()
}

/// A tool result is an error iff it parses as JSON with an `error` key.
pub fn infer_is_error(output: &str) -> bool {
    serde_json::from_str::<Value>(output)
        .map(|v| v.get("error").is_some())
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) fn test_context() -> Arc<ToolContext> {
    let tmp = std::env::temp_dir().join(format!("maestro-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&tmp).unwrap();
    ms_domain::paths::ensure_context_dirs(&tmp).unwrap();
    Arc::new(ToolContext {
        pool: Arc::new(SessionPool::new()),
        store: Arc::new(SessionStore::new(&tmp, vec![])),
        agent_config: AgentConfig {
            project_dir: tmp.clone(),
            ..AgentConfig::default()
        },
        search: SearchConfig::default(),
        index_dir: ms_domain::paths::index_dir(&tmp),
        project_dir: tmp,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
