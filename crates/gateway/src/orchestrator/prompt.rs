//! System prompt builder for the orchestrator agent.
//!
//! The prompt is a plain template assembled from sections: role, a live
//! snapshot of pooled sessions, memory file contents (size-capped),
//! guidelines, and — when resuming into voice mode — a digest of the
//! earlier conversation.

use ms_domain::message::{Message, Role};
use ms_domain::paths;

use crate::tools::ToolContext;

pub const MAX_MEMORY_CHARS: usize = 12_000;
pub const MAX_MEMORY_INDEX_CHARS: usize = 20_000;
pub const MAX_HISTORY_MESSAGES: usize = 20;
pub const MAX_HISTORY_CHARS: usize = 6_000;

/// Recent history (+ optional summary of what came before it), injected
/// for providers that cannot carry the message list themselves.
pub struct HistoryDigest<'a> {
    pub recent: &'a [Message],
    pub summary: Option<&'a str>,
}

pub fn build_system_prompt(ctx: &ToolContext, history: Option<HistoryDigest<'_>>) -> String {
    let sections = [
        Some(role_section()),
        Some(active_sessions_section(ctx)),
        Some(memory_section(ctx)),
        Some(guidelines_section()),
        history.and_then(history_section),
    ];
    sections.into_iter().flatten().collect::<Vec<_>>().join("\n\n")
}

fn role_section() -> String {
    "You are an orchestrator agent that coordinates multiple coding-agent sessions.

You can open, monitor, and communicate with agent sessions to accomplish complex tasks.
You have access to the project's conversation history and memory via search tools, and can read/write files in the project directory.

## UI Context

The user interacts with you through a multi-tab web interface. Each agent session you open appears as a **tab** in their browser — the user may say \"tab\" to refer to an open agent session. Opening a session creates a new tab; closing one removes that tab.

## Your Responsibilities

- Understand user requests and break them into tasks for agent sessions
- Open agent sessions and delegate work to them
- Monitor their progress and collect results
- Coordinate multi-step workflows across sessions
- Maintain persistent memory for cross-session context"
        .to_string()
}

fn active_sessions_section(ctx: &ToolContext) -> String {
    let sessions = ctx.pool.list_sessions();
    if sessions.is_empty() {
        return "## Active Agent Sessions\nNo agent sessions are currently active.".to_string();
    }

    let mut lines = vec!["## Active Agent Sessions".to_string()];
    for s in sessions {
        lines.push(format!(
            "- `{}`: status={}, turns={}, cost=${:.4}",
            s.session_id, s.status, s.turns, s.cost
        ));
    }
    lines.join("\n")
}

fn memory_section(ctx: &ToolContext) -> String {
    let memory_index = read_capped(
        &paths::memory_index_path(&ctx.project_dir),
        MAX_MEMORY_INDEX_CHARS,
    );
    let private_memory = read_capped(
        &paths::orchestrator_memory_path(&ctx.project_dir),
        MAX_MEMORY_CHARS,
    );

    let mut section = String::from(
        "## Memory System

Two tiers: a **shared index** (`context/memory/MEMORY.md`) used by you and agent sessions alike, and your **private memory** (`context/memory/ORCHESTRATOR_MEMORY.md`) for orchestrator-specific state (active workflows, pending tasks, session notes).

### File Editing Rule

**`write_file` performs a full overwrite.** Always read the file first, make your changes, and write the complete updated content. Never omit existing entries unless they are clearly obsolete.",
    );

    if !memory_index.is_empty() {
        section.push_str("\n\n---\n\n### Current Shared Memory Index\n\n```markdown\n");
        section.push_str(&memory_index);
        section.push_str("\n```");
    }

    section.push_str("\n\n---\n\n### Current Private Memory\n\n");
    if private_memory.is_empty() {
        section.push_str("Your private memory is currently empty.");
    } else {
        section.push_str("```\n");
        section.push_str(&private_memory);
        section.push_str("\n```");
    }

    section
}

fn guidelines_section() -> String {
    "## Guidelines

### Before Starting Work
- **Search first**: use `search_memory` and `search_history` before non-trivial tasks — relevant context often exists
- **Check active sessions**: review what's already running to avoid duplicate work

### Delegating to Agents
- **Be specific**: give clear, actionable instructions with enough context for independent work
- **One thing at a time**: wait for an agent's response before sending the next message

### Session Management
- **Open sessions only when needed** and close them when their task completes
- **Report progress**: keep the user informed of status and results

### Memory Maintenance
- **Update the shared index** when you or agents modify skills or create memory files
- **Verify writes** — after updating any memory file, confirm nothing was accidentally omitted"
        .to_string()
}

fn history_section(digest: HistoryDigest<'_>) -> Option<String> {
    if digest.recent.is_empty() && digest.summary.is_none() {
        return None;
    }

    let mut lines = vec![
        "## Recent Conversation History".to_string(),
        "(from your previous conversation in this session)\n".to_string(),
    ];

    if let Some(summary) = digest.summary {
        lines.push("### Earlier Conversation Summary".to_string());
        lines.push(summary.trim().to_string());
        lines.push("\n### Recent Messages".to_string());
    }

    let start = digest.recent.len().saturating_sub(MAX_HISTORY_MESSAGES);
    for msg in &digest.recent[start..] {
        let label = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        let text = msg.content.extract_all_text();
        if !text.is_empty() {
            lines.push(format!("**{label}:** {}", text.trim()));
        } else if msg.content.has_tool_use() {
            lines.push(format!("**{label}:** [tool activity]"));
        }
    }

    let mut section = lines.join("\n");
    if section.len() > MAX_HISTORY_CHARS {
        section.truncate(floor_char_boundary(&section, MAX_HISTORY_CHARS));
        section.push_str("\n... (history truncated)");
    }
    Some(section)
}

fn read_capped(path: &std::path::Path, cap: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(mut content) => {
            if content.len() > cap {
                content.truncate(floor_char_boundary(&content, cap));
                content.push_str("\n... (truncated)");
            }
            content
        }
        Err(_) => String::new(),
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
