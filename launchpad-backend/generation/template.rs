//! Deterministic fallback: pick an embedded template by keyword and fill it in.

use std::sync::LazyLock;

use async_trait::async_trait;
use serde::Deserialize;

use super::{derive_title, GenerationError, GenerationStrategy, Progress};
use crate::files::projection::{html_escape, scaffold};
use crate::files::ProjectFile;

/// Used when no template's keywords match the prompt.
pub const DEFAULT_TEMPLATE: &str = "landing";

const TAGLINE_MAX_CHARS: usize = 140;

const SOURCES: &[(&str, &str)] = &[
    ("landing", include_str!("templates/landing.yaml")),
    ("todo", include_str!("templates/todo.yaml")),
    ("dashboard", include_str!("templates/dashboard.yaml")),
    ("portfolio", include_str!("templates/portfolio.yaml")),
];

// ============================================================================
// YAML shape
// ============================================================================

#[derive(Debug, Deserialize)]
struct TemplateYaml {
    #[serde(default)]
    meta: TemplateMeta,
    #[serde(default)]
    files: Vec<TemplateFile>,
}

#[derive(Debug, Default, Deserialize)]
struct TemplateMeta {
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    path: String,
    content: String,
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug)]
pub struct Template {
    pub slug: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    files: Vec<TemplateFile>,
}

impl Template {
    /// Number of prompt words that hit this template's keywords.
    fn score(&self, words: &[String]) -> usize {
        words
            .iter()
            .filter(|w| {
                self.keywords
                    .iter()
                    .any(|k| *w == k || w.strip_suffix('s') == Some(k.as_str()))
            })
            .count()
    }

    fn render(&self, title: &str, tagline: &str) -> Vec<ProjectFile> {
        let title = html_escape(title);
        let tagline = html_escape(tagline);
        self.files
            .iter()
            .map(|f| {
                ProjectFile::new(
                    f.path.clone(),
                    f.content
                        .replace("{{title}}", &title)
                        .replace("{{tagline}}", &tagline),
                )
            })
            .collect()
    }
}

fn load_catalog() -> Result<Vec<Template>, String> {
    SOURCES
        .iter()
        .map(|(slug, raw)| {
            let doc: TemplateYaml =
                serde_yaml::from_str(raw).map_err(|e| format!("{slug}.yaml: {e}"))?;
            if doc.files.is_empty() {
                return Err(format!("{slug}.yaml: no files"));
            }
            Ok(Template {
                slug: slug.to_string(),
                title: doc.meta.title.unwrap_or_else(|| slug.to_string()),
                description: doc.meta.description.unwrap_or_default(),
                keywords: doc
                    .meta
                    .keywords
                    .into_iter()
                    .map(|k| k.to_lowercase())
                    .collect(),
                files: doc.files,
            })
        })
        .collect()
}

static CATALOG: LazyLock<Result<Vec<Template>, String>> = LazyLock::new(load_catalog);

fn catalog() -> Result<&'static [Template], GenerationError> {
    CATALOG
        .as_ref()
        .map(Vec::as_slice)
        .map_err(|e| GenerationError::Template(e.clone()))
}

/// Filler words that never count towards a template match.
const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "app", "for", "my", "of", "page", "simple", "site", "some",
    "something", "the", "to", "website", "with",
];

fn words(prompt: &str) -> Vec<String> {
    prompt
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// The best-scoring template, earliest on ties, default when nothing matches.
pub fn select(prompt: &str) -> Result<&'static Template, GenerationError> {
    let templates = catalog()?;
    let words = words(prompt);
    let mut best: Option<(&Template, usize)> = None;
    for template in templates {
        let score = template.score(&words);
        if score > 0 && best.is_none_or(|(_, s)| score > s) {
            best = Some((template, score));
        }
    }
    match best {
        Some((template, _)) => Ok(template),
        None => templates
            .iter()
            .find(|t| t.slug == DEFAULT_TEMPLATE)
            .ok_or_else(|| GenerationError::Template(format!("missing {DEFAULT_TEMPLATE} template"))),
    }
}

fn tagline(prompt: &str) -> String {
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= TAGLINE_MAX_CHARS {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(TAGLINE_MAX_CHARS - 1).collect();
    cut.push('…');
    cut
}

// ============================================================================
// Strategy
// ============================================================================

/// Keyword-selected template layered over the scaffold. No I/O.
#[derive(Default)]
pub struct TemplateStrategy;

impl TemplateStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GenerationStrategy for TemplateStrategy {
    fn name(&self) -> &'static str {
        "template"
    }

    async fn generate(
        &self,
        prompt: &str,
        progress: &Progress,
    ) -> Result<Vec<ProjectFile>, GenerationError> {
        let template = select(prompt)?;
        progress.report("render", format!("using the {} template", template.slug));

        let title = derive_title(prompt);
        let mut files = scaffold(&title);
        files.extend(template.render(&title, &tagline(prompt)));
        Ok(files)
    }
}
