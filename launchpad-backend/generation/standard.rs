use std::sync::Arc;

use async_trait::async_trait;

use super::{derive_title, parse, GenerationError, GenerationStrategy, Progress};
use crate::files::projection::{normalize_path, scaffold};
use crate::files::ProjectFile;
use crate::providers::{CompletionRequest, ProviderCaller};

const PLAN_PROMPT: &str = "\
You are planning a small Vite + React project. Plan the files needed for the \
user's request. A scaffold already provides package.json, index.html, \
vite.config.js and src/main.jsx, which renders the default export of src/App.jsx.

Respond with JSON only:
{\"title\": \"<short app title>\", \"files\": [{\"path\": \"src/...\", \"purpose\": \"<one sentence>\"}]}

List at most 8 files and always include src/App.jsx.";

const FILE_PROMPT: &str = "\
You write one file of a Vite + React project at a time. Reply with the file \
contents only, in a single fenced code block, no explanation. Only import \
react, react-dom and files listed in the plan.";

/// Plan the file list, then write each file with its own completion.
pub struct StandardStrategy {
    caller: Arc<ProviderCaller>,
}

impl StandardStrategy {
    pub fn new(caller: Arc<ProviderCaller>) -> Self {
        Self { caller }
    }
}

#[async_trait]
impl GenerationStrategy for StandardStrategy {
    fn name(&self) -> &'static str {
        "standard"
    }

    async fn generate(
        &self,
        prompt: &str,
        progress: &Progress,
    ) -> Result<Vec<ProjectFile>, GenerationError> {
        progress.report("planning", "planning project files");
        let completion = self
            .caller
            .call_with_fallback(&CompletionRequest::new(PLAN_PROMPT, prompt).with_max_tokens(1024))
            .await?;
        let plan = parse::parse_plan(&completion.text)
            .ok_or_else(|| GenerationError::Parse("plan is not valid JSON".into()))?;

        let planned: Vec<(String, String)> = plan
            .files
            .iter()
            .filter_map(|f| normalize_path(&f.path).map(|p| (p, f.purpose.clone())))
            .collect();
        if planned.is_empty() {
            return Err(GenerationError::Parse("plan lists no files".into()));
        }

        let title = if plan.title.trim().is_empty() {
            derive_title(prompt)
        } else {
            plan.title.trim().to_string()
        };
        let listing = planned
            .iter()
            .map(|(path, purpose)| format!("- {path}: {purpose}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut files = scaffold(&title);
        for (i, (path, purpose)) in planned.iter().enumerate() {
            progress.report(
                "writing",
                format!("writing {path} ({}/{})", i + 1, planned.len()),
            );
            let request = CompletionRequest::new(
                FILE_PROMPT,
                format!(
                    "App: {title}\nRequest: {prompt}\n\nPlan:\n{listing}\n\nWrite {path}. Purpose: {purpose}"
                ),
            );
            let completion = self.caller.call_with_fallback(&request).await?;
            let content = parse::strip_code_fence(&completion.text);
            if content.trim().is_empty() {
                return Err(GenerationError::Parse(format!("empty content for {path}")));
            }
            files.push(ProjectFile::new(path.clone(), content));
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::dedupe;
    use crate::providers::{OllamaAdapter, ProviderAdapter};
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn answer(text: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "response": text }))
    }

    fn caller(server: &MockServer) -> Arc<ProviderCaller> {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(OllamaAdapter::new(server.uri(), "llama3.1".into()));
        Arc::new(ProviderCaller::new(vec![adapter]).with_retry_delay(Duration::ZERO))
    }

    #[tokio::test]
    async fn plans_then_writes_each_file_over_scaffold() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_string_contains("Plan the files"))
            .respond_with(answer(
                r#"{"title":"Recipe Box","files":[{"path":"src/App.jsx","purpose":"root"},{"path":"./src/Card.jsx","purpose":"card"}]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_string_contains("Write src/App.jsx"))
            .respond_with(answer("```jsx\nexport default function App() { return <Card /> }\n```"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_string_contains("Write src/Card.jsx"))
            .respond_with(answer("export default function Card() { return null }"))
            .expect(1)
            .mount(&server)
            .await;

        let files = StandardStrategy::new(caller(&server))
            .generate("a recipe box", &Progress::silent())
            .await
            .unwrap();
        let files = dedupe(files);

        let app = files.iter().find(|f| f.path == "src/App.jsx").unwrap();
        assert!(app.content.contains("<Card />"));
        assert!(files.iter().any(|f| f.path == "src/Card.jsx"));
        let manifest = files.iter().find(|f| f.path == "package.json").unwrap();
        assert!(manifest.content.contains("recipe-box"));
        assert!(files.iter().any(|f| f.path == "index.html"));
    }

    #[tokio::test]
    async fn bad_plan_fails_without_writing_files() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(answer("I would suggest a few components."))
            .expect(1)
            .mount(&server)
            .await;

        let err = StandardStrategy::new(caller(&server))
            .generate("a recipe box", &Progress::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Parse(_)));
    }
}
