use serde_json::{Value, json};

use super::{CompletionRequest, ProviderAdapter, ProviderError};

/// Local Ollama server, non-streaming `/api/generate`.
pub struct OllamaAdapter {
    base_url: String,
    model: String,
}

impl OllamaAdapter {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }
}

impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        "ollama"
    }

    fn request(&self, client: &reqwest::Client, req: &CompletionRequest) -> reqwest::RequestBuilder {
        let body = json!({
            "model": self.model,
            "system": req.system,
            "prompt": req.prompt,
            "stream": false,
            "options": {
                "temperature": req.temperature,
                "num_predict": req.max_tokens,
            }
        });
        client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
    }

    fn parse_response(&self, body: Value) -> Result<String, ProviderError> {
        body["response"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::invalid(self.name(), "missing response field"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_response_field() {
        let adapter = OllamaAdapter::new("http://localhost:11434/".into(), "llama3.1".into());
        assert_eq!(adapter.parse_response(json!({"response": "ok", "done": true})).unwrap(), "ok");
        assert!(adapter.parse_response(json!({"done": true})).is_err());
    }

    #[test]
    fn request_targets_generate_endpoint() {
        let adapter = OllamaAdapter::new("http://localhost:11434/".into(), "llama3.1".into());
        let client = reqwest::Client::new();
        let request = adapter
            .request(&client, &CompletionRequest::new("s", "p"))
            .build()
            .unwrap();
        assert_eq!(request.url().as_str(), "http://localhost:11434/api/generate");
        assert_eq!(request.method(), reqwest::Method::POST);
    }
}
