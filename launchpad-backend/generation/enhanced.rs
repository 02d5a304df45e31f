use std::sync::Arc;

use async_trait::async_trait;

use super::{parse, GenerationError, GenerationStrategy, Progress};
use crate::files::ProjectFile;
use crate::providers::{CompletionRequest, ProviderCaller};

const SYSTEM_PROMPT: &str = "\
You are a senior frontend engineer. Build a complete, polished Vite + React \
project for the user's request. Customize copy, layout and styling to the \
request; do not leave placeholders.

Respond with a single JSON object and nothing else:
{\"files\": [{\"path\": \"<relative path>\", \"content\": \"<file contents>\"}]}

Include package.json, index.html, vite.config.js, src/main.jsx and src/App.jsx. \
Only depend on react, react-dom, vite and @vitejs/plugin-react.";

/// One completion for the whole project.
pub struct EnhancedStrategy {
    caller: Arc<ProviderCaller>,
}

impl EnhancedStrategy {
    pub fn new(caller: Arc<ProviderCaller>) -> Self {
        Self { caller }
    }
}

#[async_trait]
impl GenerationStrategy for EnhancedStrategy {
    fn name(&self) -> &'static str {
        "enhanced"
    }

    async fn generate(
        &self,
        prompt: &str,
        progress: &Progress,
    ) -> Result<Vec<ProjectFile>, GenerationError> {
        progress.report("requesting", "asking for a complete project");
        let request = CompletionRequest::new(SYSTEM_PROMPT, prompt).with_max_tokens(8192);
        let completion = self.caller.call_with_fallback(&request).await?;

        progress.report("parsing", format!("parsing response from {}", completion.provider));
        let files = parse::parse_files(&completion.text);
        if files.is_empty() {
            return Err(GenerationError::Parse("no files in response".into()));
        }
        Ok(files)
    }
}
