use serde_json::{Value, json};

use super::{CompletionRequest, ProviderAdapter, ProviderError};

/// OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiAdapter {
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiAdapter {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn request(&self, client: &reqwest::Client, req: &CompletionRequest) -> reqwest::RequestBuilder {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": req.system},
                {"role": "user", "content": req.prompt},
            ],
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
    }

    fn parse_response(&self, body: Value) -> Result<String, ProviderError> {
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::invalid(self.name(), "missing choices[0].message.content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderCaller;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_first_choice() {
        let adapter = OpenAiAdapter::new("http://x".into(), "k".into(), "m".into());
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        assert_eq!(adapter.parse_response(body).unwrap(), "hi");
        assert!(adapter.parse_response(json!({"choices": []})).is_err());
    }

    #[tokio::test]
    async fn sends_bearer_and_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "system", "content": "sys"}, {"role": "user", "content": "make a blog"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "{\"files\": []}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::new(
            format!("{}/v1/", server.uri()),
            "sk-test".into(),
            "gpt-4o-mini".into(),
        );
        let caller = ProviderCaller::new(vec![Arc::new(adapter)]);
        let completion = caller
            .call_with_fallback(&CompletionRequest::new("sys", "make a blog"))
            .await
            .unwrap();
        assert_eq!(completion.provider, "openai");
        assert_eq!(completion.text, "{\"files\": []}");
    }
}
