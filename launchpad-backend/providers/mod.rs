//! Upstream AI providers and the fallback caller that walks them in order.

pub mod anthropic;
pub mod ollama;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

// ── Request / response ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 4096,
            temperature: 0.7,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Text returned by the first provider that answered.
#[derive(Debug, Clone)]
pub struct Completion {
    pub provider: String,
    pub text: String,
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("{provider}: request failed: {message}")]
    Transport { provider: String, message: String },

    #[error("{provider}: HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider}: unexpected response: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("{0}: empty completion")]
    EmptyResponse(String),

    #[error(
        "all providers failed after {attempts} attempt(s){}",
        .last.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
    )]
    AllProvidersFailed {
        attempts: usize,
        last: Option<Box<ProviderError>>,
    },
}

impl ProviderError {
    pub fn invalid(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

// ── Adapter seam ────────────────────────────────────────────────────

/// Provider-specific request shaping and response parsing. The caller owns
/// transport, status handling and retries.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn request(&self, client: &reqwest::Client, req: &CompletionRequest) -> reqwest::RequestBuilder;

    fn parse_response(&self, body: Value) -> Result<String, ProviderError>;
}

// ── Fallback caller ─────────────────────────────────────────────────

/// Tries providers in order until one returns non-empty text.
///
/// At most `max_attempts` providers are tried, with `retry_delay` between
/// attempts. Exhaustion yields `AllProvidersFailed` carrying the last error.
#[derive(Clone)]
pub struct ProviderCaller {
    client: reqwest::Client,
    providers: Vec<Arc<dyn ProviderAdapter>>,
    max_attempts: usize,
    retry_delay: Duration,
    request_timeout: Duration,
}

impl ProviderCaller {
    pub fn new(providers: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            providers,
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub async fn call_with_fallback(
        &self,
        req: &CompletionRequest,
    ) -> Result<Completion, ProviderError> {
        let attempts = self.providers.len().min(self.max_attempts);
        let mut last = None;

        for (i, provider) in self.providers.iter().take(attempts).enumerate() {
            if i > 0 && !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.call_one(provider.as_ref(), req).await {
                Ok(text) => {
                    tracing::info!(provider = %provider.name(), attempt = i + 1, "completion received");
                    return Ok(Completion {
                        provider: provider.name().to_string(),
                        text,
                    });
                }
                Err(e) => {
                    tracing::warn!(provider = %provider.name(), attempt = i + 1, error = %e, "provider failed");
                    last = Some(Box::new(e));
                }
            }
        }

        Err(ProviderError::AllProvidersFailed { attempts, last })
    }

    async fn call_one(
        &self,
        provider: &dyn ProviderAdapter,
        req: &CompletionRequest,
    ) -> Result<String, ProviderError> {
        let name = provider.name();
        let resp = provider
            .request(&self.client, req)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ProviderError::Transport {
                provider: name.to_string(),
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                provider: name.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::invalid(name, e.to_string()))?;
        let text = provider.parse_response(body)?;
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyResponse(name.to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ollama(server: &MockServer) -> Arc<dyn ProviderAdapter> {
        Arc::new(OllamaAdapter::new(server.uri(), "llama3.1".into()))
    }

    async fn failing_server(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(status).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    async fn answering_server(text: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"response": text})),
            )
            .mount(&server)
            .await;
        server
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("system", "build a todo app")
    }

    #[tokio::test]
    async fn first_success_wins() {
        let bad = failing_server(500).await;
        let good = answering_server("hello").await;
        let caller = ProviderCaller::new(vec![ollama(&bad), ollama(&good)])
            .with_retry_delay(Duration::from_millis(1));

        let completion = caller.call_with_fallback(&request()).await.unwrap();
        assert_eq!(completion.text, "hello");
        assert_eq!(completion.provider, "ollama");
    }

    #[tokio::test]
    async fn exhaustion_after_exactly_n_attempts() {
        let a = failing_server(500).await;
        let b = failing_server(429).await;
        let c = failing_server(503).await;
        let caller = ProviderCaller::new(vec![ollama(&a), ollama(&b), ollama(&c)])
            .with_retry_delay(Duration::ZERO);

        let err = caller.call_with_fallback(&request()).await.unwrap_err();
        match err {
            ProviderError::AllProvidersFailed { attempts, last } => {
                assert_eq!(attempts, 3);
                let last = last.expect("last error attached");
                assert!(matches!(*last, ProviderError::Status { status: 503, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Each mock verifies on drop that it was hit exactly once.
    }

    #[tokio::test]
    async fn attempts_are_capped() {
        let a = failing_server(500).await;
        let b = failing_server(500).await;
        let skipped = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&skipped)
            .await;

        let caller = ProviderCaller::new(vec![ollama(&a), ollama(&b), ollama(&skipped)])
            .with_max_attempts(2)
            .with_retry_delay(Duration::ZERO);
        let err = caller.call_with_fallback(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::AllProvidersFailed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn empty_text_counts_as_failure() {
        let empty = answering_server("   ").await;
        let caller = ProviderCaller::new(vec![ollama(&empty)]);
        let err = caller.call_with_fallback(&request()).await.unwrap_err();
        let ProviderError::AllProvidersFailed { last: Some(last), .. } = err else {
            panic!("expected exhaustion");
        };
        assert!(matches!(*last, ProviderError::EmptyResponse(_)));
    }

    #[tokio::test]
    async fn no_providers_fails_immediately() {
        let caller = ProviderCaller::new(vec![]);
        let err = caller.call_with_fallback(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::AllProvidersFailed { attempts: 0, last: None }));
        assert_eq!(err.to_string(), "all providers failed after 0 attempt(s)");
    }

    #[test]
    fn exhaustion_message_includes_last_error() {
        let err = ProviderError::AllProvidersFailed {
            attempts: 2,
            last: Some(Box::new(ProviderError::EmptyResponse("openai".into()))),
        };
        assert_eq!(
            err.to_string(),
            "all providers failed after 2 attempt(s): openai: empty completion"
        );
    }
}
