//! Generation strategy chain: richest strategy first, deterministic last.

pub mod enhanced;
pub mod parse;
pub mod standard;
pub mod template;

use std::sync::Arc;

use async_trait::async_trait;

use crate::files::{self, GenerationResult, ProjectFile, StrategyFailure};
use crate::providers::{ProviderCaller, ProviderError};
use crate::status::{Phase, StatusChannel, StatusEvent};

pub use enhanced::EnhancedStrategy;
pub use standard::StandardStrategy;
pub use template::TemplateStrategy;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum GenerationError {
    #[error("prompt is empty")]
    EmptyPrompt,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("could not parse model output: {0}")]
    Parse(String),

    #[error("generated project is unusable: {0}")]
    Invalid(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("all {} generation strategies failed", .failures.len())]
    AllStrategiesFailed { failures: Vec<StrategyFailure> },
}

// ── Progress ────────────────────────────────────────────────────────

/// Progress sink handed to strategies. Steps are published as
/// `generating:<strategy>:<step>` for the project.
#[derive(Clone)]
pub struct Progress {
    status: Option<StatusChannel>,
    project_id: String,
    strategy: String,
}

impl Progress {
    pub fn new(status: StatusChannel, project_id: &str) -> Self {
        Self {
            status: Some(status),
            project_id: project_id.to_string(),
            strategy: String::new(),
        }
    }

    /// A sink that only logs.
    pub fn silent() -> Self {
        Self {
            status: None,
            project_id: String::new(),
            strategy: String::new(),
        }
    }

    fn for_strategy(&self, strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            ..self.clone()
        }
    }

    pub fn report(&self, step: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(strategy = %self.strategy, step, message = %message, "generation progress");
        if let Some(status) = &self.status {
            status.publish(StatusEvent::new(
                &self.project_id,
                Phase::generating(&self.strategy, step),
                message,
            ));
        }
    }

    fn report_failure(&self, error: &GenerationError) {
        if let Some(status) = &self.status {
            status.publish(
                StatusEvent::new(
                    &self.project_id,
                    Phase::generating(&self.strategy, "failed"),
                    "strategy failed, falling back",
                )
                .with_error(error.to_string()),
            );
        }
    }
}

// ── Strategy seam ───────────────────────────────────────────────────

/// One way of turning a prompt into project files.
///
/// A failing strategy must leave nothing behind: strategies only return
/// files, they never write them.
#[async_trait]
pub trait GenerationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(
        &self,
        prompt: &str,
        progress: &Progress,
    ) -> Result<Vec<ProjectFile>, GenerationError>;
}

// ── Chain ───────────────────────────────────────────────────────────

pub struct GenerationChain {
    strategies: Vec<Arc<dyn GenerationStrategy>>,
}

impl GenerationChain {
    pub fn new(strategies: Vec<Arc<dyn GenerationStrategy>>) -> Self {
        Self { strategies }
    }

    /// Enhanced, then standard, then template. The AI strategies are left out
    /// when no provider is configured.
    pub fn standard(caller: ProviderCaller) -> Self {
        let mut strategies: Vec<Arc<dyn GenerationStrategy>> = Vec::new();
        if caller.is_empty() {
            tracing::warn!("no AI providers configured, generation uses templates only");
        } else {
            let caller = Arc::new(caller);
            strategies.push(Arc::new(EnhancedStrategy::new(Arc::clone(&caller))));
            strategies.push(Arc::new(StandardStrategy::new(caller)));
        }
        strategies.push(Arc::new(TemplateStrategy::new()));
        Self::new(strategies)
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Try each strategy in order and return the first valid file set.
    pub async fn generate(
        &self,
        prompt: &str,
        progress: &Progress,
    ) -> Result<GenerationResult, GenerationError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(GenerationError::EmptyPrompt);
        }

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            let name = strategy.name();
            let progress = progress.for_strategy(name);
            progress.report("start", format!("trying {name} generation"));

            let outcome = match strategy.generate(prompt, &progress).await {
                Ok(files) => validate(files),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(files) => {
                    tracing::info!(strategy = name, files = files.len(), "generation succeeded");
                    progress.report("done", format!("generated {} files", files.len()));
                    return Ok(GenerationResult {
                        strategy: name.to_string(),
                        files,
                        failures,
                    });
                }
                Err(e) => {
                    tracing::warn!(strategy = name, error = %e, "generation strategy failed");
                    progress.report_failure(&e);
                    failures.push(StrategyFailure {
                        strategy: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(GenerationError::AllStrategiesFailed { failures })
    }
}

/// Dedupe by path and require a non-empty set with an entry point.
fn validate(files: Vec<ProjectFile>) -> Result<Vec<ProjectFile>, GenerationError> {
    let files: Vec<ProjectFile> = files::dedupe(files)
        .into_iter()
        .filter(|f| !f.path.trim().is_empty())
        .collect();
    if files.is_empty() {
        return Err(GenerationError::Invalid("no files produced".into()));
    }
    if !files::has_entry_point(&files) {
        return Err(GenerationError::Invalid("no entry point file".into()));
    }
    Ok(files)
}

/// Turn a prompt into a short display title.
pub fn derive_title(prompt: &str) -> String {
    let words: Vec<String> = prompt
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .take(6)
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    if words.is_empty() {
        "Generated App".to_string()
    } else {
        words.join(" ")
    }
}
