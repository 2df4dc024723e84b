//! File tools — read and write files confined to the project directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use super::{error_result, ToolContext, ToolRegistry};

/// Read cap; larger files are truncated with a marker.
const MAX_FILE_SIZE: usize = 100_000;

pub fn register(registry: &mut ToolRegistry) {
    registry.register(
        "read_file",
        "Read a file from the project directory. Path is relative to the project root.",
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Relative path to the file (e.g. 'context/memory/MEMORY.md').",
                },
            },
            "required": ["path"],
        }),
        &["path"],
        read_file,
    );

    registry.register(
        "write_file",
        "Write content to a file in the project directory. Creates parent directories if \
         needed. This is a full overwrite.",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Relative path to the file."},
                "content": {"type": "string", "description": "The content to write."},
            },
            "required": ["path", "content"],
        }),
        &["path", "content"],
        write_file,
    );
}

/// Resolve a path inside `base`, or `None` when it escapes.
///
/// The deepest existing ancestor is canonicalized (so symlinks cannot
/// smuggle the target out of the project), then the remaining components
/// are folded lexically with `..` rejected once it would climb past base.
pub fn resolve_safe_path(base: &Path, relative: &str) -> Option<PathBuf> {
    let base = base.canonicalize().ok()?;

    let joined = {
        let rel = Path::new(relative);
        if rel.is_absolute() {
            rel.to_path_buf()
        } else {
            base.join(rel)
        }
    };

    // Canonicalize the deepest existing ancestor, keep the rest lexical.
    let mut existing = joined.clone();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                remainder.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return None,
        }
    }

    let mut resolved = existing.canonicalize().ok()?;
    for name in remainder.iter().rev() {
        match Path::new(name).components().next() {
            Some(Component::Normal(_)) => resolved.push(name),
            Some(Component::CurDir) => {}
            _ => return None,
        }
    }

    if resolved.starts_with(&base) {
        Some(resolved)
    } else {
        None
    }
}

async fn read_file(ctx: Arc<ToolContext>, input: Value) -> ms_domain::Result<String> {
    let path = input.get("path").and_then(|v| v.as_str()).unwrap_or("");

    let Some(target) = resolve_safe_path(&ctx.project_dir, path) else {
        return Ok(error_result("Path escapes project directory"));
    };
    if !target.is_file() {
        return Ok(error_result(format!("File not found: {path}")));
    }

    match std::fs::read_to_string(&target) {
        Ok(mut content) => {
            if content.len() > MAX_FILE_SIZE {
                content.truncate(floor_char_boundary(&content, MAX_FILE_SIZE));
                content.push_str(&format!("\n... (truncated at {MAX_FILE_SIZE} bytes)"));
            }
            Ok(json!({"path": path, "content": content}).to_string())
        }
        Err(e) => Ok(error_result(format!("Failed to read file: {e}"))),
    }
}

async fn write_file(ctx: Arc<ToolContext>, input: Value) -> ms_domain::Result<String> {
    let path = input.get("path").and_then(|v| v.as_str()).unwrap_or("");
    let content = input.get("content").and_then(|v| v.as_str()).unwrap_or("");

    let Some(target) = resolve_safe_path(&ctx.project_dir, path) else {
        return Ok(error_result("Path escapes project directory"));
    };

    if let Some(parent) = target.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return Ok(error_result(format!("Failed to create directories: {e}")));
        }
    }
    match std::fs::write(&target, content) {
        Ok(()) => {
            Ok(json!({"path": path, "status": "written", "bytes": content.len()}).to_string())
        }
        Err(e) => Ok(error_result(format!("Failed to write file: {e}"))),
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
