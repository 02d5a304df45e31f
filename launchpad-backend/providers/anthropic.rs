use serde_json::{Value, json};

use super::{CompletionRequest, ProviderAdapter, ProviderError};

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API.
pub struct AnthropicAdapter {
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicAdapter {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn request(&self, client: &reqwest::Client, req: &CompletionRequest) -> reqwest::RequestBuilder {
        let body = json!({
            "model": self.model,
            "system": req.system,
            "messages": [{"role": "user", "content": req.prompt}],
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
    }

    /// Concatenates every text block of the reply.
    fn parse_response(&self, body: Value) -> Result<String, ProviderError> {
        let blocks = body["content"]
            .as_array()
            .ok_or_else(|| ProviderError::invalid(self.name(), "missing content array"))?;
        let text: String = blocks
            .iter()
            .filter(|b| b["type"].as_str().is_none_or(|t| t == "text"))
            .filter_map(|b| b["text"].as_str())
            .collect();
        Ok(text)
    }
}
