//! Pulling structured content out of raw model output.

use serde::Deserialize;
use serde_json::Value;

use crate::files::ProjectFile;

/// Upper bound on files a plan may ask for.
pub const MAX_PLANNED_FILES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlannedFile {
    pub path: String,
    #[serde(default)]
    pub purpose: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub files: Vec<PlannedFile>,
}

#[derive(Deserialize)]
struct FileEntry {
    path: String,
    content: String,
}

/// Find the first JSON object in `raw`: a fenced block that parses, else the
/// span from the first `{` to the last `}`.
pub fn extract_json(raw: &str) -> Option<Value> {
    for block in fenced_blocks(raw) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(block.body.trim()) {
            return Some(value);
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Files from a `{"files": ...}` document, falling back to path-annotated
/// code blocks. Returns an empty list when nothing usable is found.
pub fn parse_files(raw: &str) -> Vec<ProjectFile> {
    if let Some(files) = extract_json(raw).and_then(|doc| files_from_json(&doc)) {
        if !files.is_empty() {
            return files;
        }
    }
    files_from_blocks(raw)
}

/// The planning document: title plus at most [`MAX_PLANNED_FILES`] entries.
pub fn parse_plan(raw: &str) -> Option<Plan> {
    let doc = extract_json(raw)?;
    let mut plan: Plan = serde_json::from_value(doc).ok()?;
    plan.files.retain(|f| !f.path.trim().is_empty());
    plan.files.truncate(MAX_PLANNED_FILES);
    Some(plan)
}

/// Body of a single-file completion: the first fenced block if any,
/// otherwise the whole text.
pub fn strip_code_fence(raw: &str) -> String {
    match fenced_blocks(raw).into_iter().next() {
        Some(block) => block.body,
        None => raw.trim().to_string(),
    }
}

fn files_from_json(doc: &Value) -> Option<Vec<ProjectFile>> {
    match doc.get("files")? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<FileEntry>(item.clone()).ok())
                .map(|f| ProjectFile::new(f.path, f.content))
                .collect(),
        ),
        // `{"files": {"src/App.jsx": "..."}}` or `{"files": {"src/App.jsx": {"content": "..."}}}`
        Value::Object(map) => Some(
            map.iter()
                .filter_map(|(path, entry)| {
                    let content = match entry {
                        Value::String(s) => s.clone(),
                        other => other.get("content")?.as_str()?.to_string(),
                    };
                    Some(ProjectFile::new(path.clone(), content))
                })
                .collect(),
        ),
        _ => None,
    }
}

fn files_from_blocks(raw: &str) -> Vec<ProjectFile> {
    fenced_blocks(raw)
        .into_iter()
        .filter_map(|block| {
            let path = block.path?;
            Some(ProjectFile::new(path, block.body))
        })
        .collect()
}

// ── Fenced blocks ───────────────────────────────────────────────────

struct Block {
    path: Option<String>,
    body: String,
}

fn fenced_blocks(raw: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut previous = "";
    let mut lines = raw.lines();

    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        let Some(info) = trimmed.strip_prefix("```") else {
            if !line.trim().is_empty() {
                previous = line;
            }
            continue;
        };

        let path = info
            .split_whitespace()
            .find_map(path_token)
            .or_else(|| path_from_label(previous));

        let mut body = Vec::new();
        for inner in lines.by_ref() {
            if inner.trim_start().starts_with("```") {
                break;
            }
            body.push(inner);
        }
        let mut body = body.join("\n");
        body.push('\n');
        blocks.push(Block { path, body });
        previous = "";
    }
    blocks
}

/// A line like `### src/App.jsx`, `**File: src/App.jsx**` or `// src/App.jsx`.
fn path_from_label(line: &str) -> Option<String> {
    let cleaned = line
        .trim()
        .trim_start_matches(['#', '/', '*', '-', ' '])
        .trim_end_matches(['*', ':', ' ']);
    let cleaned = ["File:", "file:", "Path:", "path:", "Filename:", "filename:"]
        .iter()
        .find_map(|label| cleaned.strip_prefix(label))
        .unwrap_or(cleaned)
        .trim();
    path_token(cleaned.trim_matches(['`', '*']))
}

fn path_token(token: &str) -> Option<String> {
    let token = token.trim_matches(['`', '"', '\'', ':']);
    let token = token.strip_prefix("path=").unwrap_or(token);
    let (stem, ext) = token.rsplit_once('.')?;
    let valid = !stem.is_empty()
        && !ext.is_empty()
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
        && !token.contains("://")
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-".contains(c));
    valid.then(|| token.to_string())
}
