//! Search tools — semantic search over history and memory.
//!
//! Both tools shell out to the external search command; its only contract
//! is the JSON array it prints on stdout:
//! `search <query> --collection <memory|history> --n <k> --json`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::{error_result, ToolContext, ToolRegistry};

pub fn register(registry: &mut ToolRegistry) {
    registry.register(
        "search_history",
        "Search conversation history using semantic search.",
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query."},
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results (default: 5).",
                },
            },
            "required": ["query"],
        }),
        &["query", "max_results"],
        |ctx, input| run_search(ctx, input, "history"),
    );

    registry.register(
        "search_memory",
        "Search memory files (MEMORY.md and related docs) using semantic search.",
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query."},
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results (default: 5).",
                },
            },
            "required": ["query"],
        }),
        &["query", "max_results"],
        |ctx, input| run_search(ctx, input, "memory"),
    );
}

async fn run_search(
    ctx: Arc<ToolContext>,
    input: Value,
    collection: &'static str,
) -> ms_domain::Result<String> {
    let query = input
        .get("query")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let max_results = input
        .get("max_results")
        .and_then(|v| v.as_u64())
        .unwrap_or(5);

    let Some((program, base_args)) = ctx.search.command.split_first() else {
        return Ok(error_result("Search command not configured"));
    };

    let mut command = tokio::process::Command::new(program);
    command
        .args(base_args)
        .arg(&query)
        .args(["--collection", collection])
        .args(["--n", &max_results.to_string()])
        .arg("--json")
        .current_dir(&ctx.project_dir)
        .stdin(std::process::Stdio::null());

    let output = match tokio::time::timeout(
        Duration::from_secs(ctx.search.timeout_secs),
        command.output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Ok(error_result(format!("Search command failed to run: {e}"))),
        Err(_) => {
            return Ok(error_result(format!(
                "Search timed out after {}s",
                ctx.search.timeout_secs
            )))
        }
    };

    // Segfaults and other crashes show up as non-zero/signal exits.
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Ok(error_result(format!(
            "Search command exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let results: Value = match serde_json::from_str(stdout.trim()) {
        Ok(Value::Array(items)) => Value::Array(items),
        Ok(other) => {
            tracing::warn!(collection, "search output was not a JSON array");
            json!([other])
        }
        Err(e) => return Ok(error_result(format!("Unparseable search output: {e}"))),
    };

    let count = results.as_array().map(|a| a.len()).unwrap_or(0);
    Ok(json!({"query": query, "results": results, "count": count}).to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
