pub mod projection;

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

/// One generated file. Paths are relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub path: String,
    pub content: String,
}

impl ProjectFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Files that count as a runnable entry point for a generated project.
pub const ENTRY_POINTS: &[&str] = &[
    "index.html",
    "public/index.html",
    "src/main.jsx",
    "src/main.tsx",
    "src/main.js",
    "src/main.ts",
    "src/index.jsx",
    "src/index.tsx",
    "src/index.js",
    "src/index.ts",
    "index.js",
    "main.js",
];

pub fn is_entry_point(path: &str) -> bool {
    let path = path.trim_start_matches("./").trim_start_matches('/');
    ENTRY_POINTS.contains(&path)
}

pub fn has_entry_point(files: &[ProjectFile]) -> bool {
    files.iter().any(|f| is_entry_point(&f.path))
}

/// Collapse duplicate paths, keeping the last write but the first position.
pub fn dedupe(files: Vec<ProjectFile>) -> Vec<ProjectFile> {
    let mut order: Vec<String> = Vec::with_capacity(files.len());
    let mut latest: BTreeMap<String, String> = BTreeMap::new();
    for file in files {
        if latest.insert(file.path.clone(), file.content).is_none() {
            order.push(file.path);
        }
    }
    order
        .into_iter()
        .filter_map(|path| {
            let content = latest.remove(&path)?;
            Some(ProjectFile { path, content })
        })
        .collect()
}

/// Stable fingerprint of a file set, independent of ordering.
pub fn fingerprint(files: &[ProjectFile]) -> u64 {
    let mut sorted: Vec<&ProjectFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    let mut hasher = DefaultHasher::new();
    for file in sorted {
        file.path.hash(&mut hasher);
        file.content.hash(&mut hasher);
    }
    hasher.finish()
}

/// Output of one generation run: the files plus which strategy produced them.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub strategy: String,
    pub files: Vec<ProjectFile>,
    /// Strategies tried before the successful one, with the reason each failed.
    pub failures: Vec<StrategyFailure>,
}

impl GenerationResult {
    pub fn file(&self, path: &str) -> Option<&ProjectFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyFailure {
    pub strategy: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_detection() {
        assert!(is_entry_point("index.html"));
        assert!(is_entry_point("./src/main.tsx"));
        assert!(is_entry_point("/src/index.js"));
        assert!(!is_entry_point("src/App.jsx"));
        assert!(!is_entry_point("package.json"));
    }

    #[test]
    fn has_entry_point_requires_one_match() {
        let files = vec![
            ProjectFile::new("package.json", "{}"),
            ProjectFile::new("src/App.jsx", "export default 1"),
        ];
        assert!(!has_entry_point(&files));

        let mut with_entry = files.clone();
        with_entry.push(ProjectFile::new("src/main.jsx", ""));
        assert!(has_entry_point(&with_entry));
    }

    #[test]
    fn dedupe_keeps_last_write_in_first_position() {
        let files = vec![
            ProjectFile::new("a.txt", "one"),
            ProjectFile::new("b.txt", "two"),
            ProjectFile::new("a.txt", "three"),
        ];
        let deduped = dedupe(files);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0], ProjectFile::new("a.txt", "three"));
        assert_eq!(deduped[1], ProjectFile::new("b.txt", "two"));
    }

    #[test]
    fn fingerprint_ignores_order_but_not_content() {
        let a = vec![ProjectFile::new("x", "1"), ProjectFile::new("y", "2")];
        let b = vec![ProjectFile::new("y", "2"), ProjectFile::new("x", "1")];
        let c = vec![ProjectFile::new("x", "1"), ProjectFile::new("y", "3")];
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn project_file_serializes_as_path_and_content() {
        let json = serde_json::to_value(ProjectFile::new("index.html", "<html>")).unwrap();
        assert_eq!(json["path"], "index.html");
        assert_eq!(json["content"], "<html>");
    }
}
