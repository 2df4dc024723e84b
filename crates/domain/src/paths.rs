//! Context-directory layout.
//!
//! All session logs, the titles sidecar, memory files, and the vector
//! index live under `<project>/context/`:
//!
//! ```text
//! context/
//! ├── <session_id>.jsonl   # session logs (one writer each)
//! ├── .titles.json         # custom session titles
//! ├── memory/              # memory files (Markdown)
//! └── ../index/            # vector index (sibling of context/)
//! ```

use std::path::{Path, PathBuf};

pub const MEMORY_INDEX_FILENAME: &str = "MEMORY.md";
pub const ORCHESTRATOR_MEMORY_FILENAME: &str = "ORCHESTRATOR_MEMORY.md";

/// The context directory (sessions, titles, memory).
pub fn context_dir(project_dir: &Path) -> PathBuf {
    project_dir.join("context")
}

/// Directory holding session JSONL files (the context dir itself).
pub fn sessions_dir(project_dir: &Path) -> PathBuf {
    context_dir(project_dir)
}

pub fn memory_dir(project_dir: &Path) -> PathBuf {
    context_dir(project_dir).join("memory")
}

pub fn index_dir(project_dir: &Path) -> PathBuf {
    project_dir.join("index")
}

/// Path of one session's JSONL log.
pub fn session_path(project_dir: &Path, session_id: &str) -> PathBuf {
    sessions_dir(project_dir).join(format!("{session_id}.jsonl"))
}

pub fn titles_path(project_dir: &Path) -> PathBuf {
    context_dir(project_dir).join(".titles.json")
}

pub fn memory_index_path(project_dir: &Path) -> PathBuf {
    memory_dir(project_dir).join(MEMORY_INDEX_FILENAME)
}

pub fn orchestrator_memory_path(project_dir: &Path) -> PathBuf {
    memory_dir(project_dir).join(ORCHESTRATOR_MEMORY_FILENAME)
}

/// The coding-agent CLI's own configuration directory:
/// `$CLAUDE_CONFIG_DIR` when set, else `~/.claude`.
pub fn cli_config_dir() -> PathBuf {
    match std::env::var_os("CLAUDE_CONFIG_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude"),
    }
}

/// Create the context directories if missing.
pub fn ensure_context_dirs(project_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(context_dir(project_dir))?;
    std::fs::create_dir_all(memory_dir(project_dir))?;
    std::fs::create_dir_all(index_dir(project_dir))?;
    Ok(())
}
