//! Shared application state passed to all WebSocket handlers.

use std::sync::Arc;

use ms_domain::config::Config;
use ms_domain::{paths, Result};
use ms_store::SessionStore;

use crate::pool::SessionPool;
use crate::tools::{ToolContext, ToolRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Arc<SessionPool>,
    pub store: Arc<SessionStore>,
    pub registry: Arc<ToolRegistry>,
    pub tool_ctx: Arc<ToolContext>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let project_dir = config.agent.project_dir.clone();
        paths::ensure_context_dirs(&project_dir)?;

        let pool = Arc::new(SessionPool::new());
        let store = Arc::new(SessionStore::new(
            &project_dir,
            config.search.reindex_command.clone(),
        ));
        let registry = Arc::new(ToolRegistry::builtin());
        let tool_ctx = Arc::new(ToolContext {
            pool: pool.clone(),
            store: store.clone(),
            agent_config: config.agent.clone(),
            search: config.search.clone(),
            index_dir: paths::index_dir(&project_dir),
            project_dir,
        });

        Ok(Self {
            config: Arc::new(config),
            pool,
            store,
            registry,
            tool_ctx,
        })
    }
}
