//! HTTP client for the remote sandbox service.
//!
//! The service boots isolated Linux sandboxes on demand and exposes every
//! listening port on a public hostname.
//!
//! API: POST /sandboxes, POST /sandboxes/{id}/files, POST /sandboxes/{id}/commands,
//! DELETE /sandboxes/{id}, GET /health

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::sandbox::error::{SandboxError, mentions_capacity};

// ── Request / Response types ────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateSandboxRequest {
    pub template: String,
    /// Server-side lifetime after which the service reaps the sandbox.
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    /// Domain ports are exposed under (`{port}-{sandbox_id}.{domain}`).
    pub domain: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry<'a> {
    pub path: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct WriteFilesRequest<'a> {
    files: &'a [FileEntry<'a>],
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRequest {
    pub cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub envs: BTreeMap<String, String>,
    pub timeout_ms: u64,
    /// Start and return immediately (dev servers).
    pub background: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

// ── Client ──────────────────────────────────────────────────────────

/// HTTP client for the remote sandbox REST API.
#[derive(Debug, Clone)]
pub struct RemoteSandboxClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RemoteSandboxClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Check service health.
    pub async fn health(&self, timeout: Duration) -> Result<HealthResponse, SandboxError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .authed(self.client.get(&url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, "health"))?;
        let resp = check_status(resp, "health").await?;
        resp.json::<HealthResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse health response: {e}")))
    }

    /// Create a new sandbox.
    pub async fn create_sandbox(
        &self,
        req: &CreateSandboxRequest,
        timeout: Duration,
    ) -> Result<SandboxInfo, SandboxError> {
        let url = format!("{}/sandboxes", self.base_url);

        tracing::info!(template = %req.template, "creating remote sandbox");

        let resp = self
            .authed(self.client.post(&url))
            .timeout(timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| transport_error(e, "create"))?;
        let resp = check_status(resp, "create").await?;

        let info = resp
            .json::<SandboxInfo>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse sandbox response: {e}")))?;

        tracing::info!(
            sandbox_id = %info.sandbox_id,
            domain = %info.domain,
            "remote sandbox created"
        );
        Ok(info)
    }

    /// Write a batch of files into the sandbox.
    pub async fn write_files(
        &self,
        sandbox_id: &str,
        files: &[FileEntry<'_>],
        timeout: Duration,
    ) -> Result<(), SandboxError> {
        let url = format!("{}/sandboxes/{}/files", self.base_url, sandbox_id);
        let resp = self
            .authed(self.client.post(&url))
            .timeout(timeout)
            .json(&WriteFilesRequest { files })
            .send()
            .await
            .map_err(|e| transport_error(e, "mount"))?;
        check_status(resp, "mount").await?;
        Ok(())
    }

    /// Run a command. Foreground commands block until exit or `timeout_ms`.
    pub async fn run_command(
        &self,
        sandbox_id: &str,
        req: &CommandRequest,
    ) -> Result<CommandResponse, SandboxError> {
        let url = format!("{}/sandboxes/{}/commands", self.base_url, sandbox_id);
        // Leave headroom over the server-side timeout so its answer wins.
        let http_timeout = Duration::from_millis(req.timeout_ms) + Duration::from_secs(10);

        tracing::debug!(sandbox_id = %sandbox_id, cmd = %req.cmd, background = req.background, "running remote command");

        let resp = self
            .authed(self.client.post(&url))
            .timeout(http_timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| transport_error(e, "command"))?;
        let resp = check_status(resp, "command").await?;

        if req.background {
            return Ok(CommandResponse::default());
        }
        resp.json::<CommandResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse command response: {e}")))
    }

    /// Delete a sandbox. Already-deleted sandboxes are not an error.
    pub async fn delete_sandbox(&self, sandbox_id: &str, timeout: Duration) -> Result<(), SandboxError> {
        let url = format!("{}/sandboxes/{}", self.base_url, sandbox_id);

        tracing::info!(sandbox_id = %sandbox_id, "deleting remote sandbox");

        let resp = self
            .authed(self.client.delete(&url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, "delete"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            tracing::warn!(sandbox_id = %sandbox_id, "sandbox already deleted");
            return Ok(());
        }
        check_status(resp, "delete").await?;

        tracing::info!(sandbox_id = %sandbox_id, "sandbox deleted");
        Ok(())
    }
}

fn transport_error(e: reqwest::Error, op: &'static str) -> SandboxError {
    if e.is_timeout() {
        SandboxError::BackendTimeout(op)
    } else {
        SandboxError::Backend(format!("remote sandbox {op} request failed: {e}"))
    }
}

/// Map a non-success response into the provisioning error taxonomy.
async fn check_status(resp: Response, op: &'static str) -> Result<Response, SandboxError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();

    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => SandboxError::BackendUnavailable {
            message: format!("remote sandbox {op} rate limited: {body}"),
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SandboxError::BackendAuth(format!("remote sandbox {op} returned {status}: {body}"))
        }
        StatusCode::NOT_FOUND => SandboxError::NotFound(format!("remote sandbox {op}: {body}")),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            SandboxError::BackendTimeout(op)
        }
        _ if mentions_capacity(&body) => SandboxError::BackendUnavailable {
            message: format!("remote sandbox {op} returned {status}: {body}"),
            retry_after,
        },
        _ => SandboxError::Backend(format!("remote sandbox {op} returned {status}: {body}")),
    })
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_req() -> CreateSandboxRequest {
        CreateSandboxRequest {
            template: "node".into(),
            timeout_ms: 60_000,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn client_trims_trailing_slash() {
        let c = RemoteSandboxClient::new("http://example.com:8080/".into(), None);
        assert_eq!(c.base_url, "http://example.com:8080");
    }

    #[test]
    fn command_request_skips_empty_fields() {
        let req = CommandRequest {
            cmd: "npm install".into(),
            cwd: None,
            envs: BTreeMap::new(),
            timeout_ms: 1000,
            background: false,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["cmd"], "npm install");
        assert!(json.get("cwd").is_none());
        assert!(json.get("envs").is_none());
    }

    #[tokio::test]
    async fn create_sends_bearer_and_parses_info() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"template": "node"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "sandbox_id": "sbx-1",
                "domain": "sandbox.dev"
            })))
            .mount(&server)
            .await;

        let client = RemoteSandboxClient::new(server.uri(), Some("sk-test".into()));
        let info = client
            .create_sandbox(&create_req(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(info.sandbox_id, "sbx-1");
        assert_eq!(info.domain, "sandbox.dev");
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_unavailable_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "12")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let client = RemoteSandboxClient::new(server.uri(), None);
        let err = client
            .create_sandbox(&create_req(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[tokio::test]
    async fn concurrency_body_maps_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string("You have reached the limit of 2 concurrent sandboxes"),
            )
            .mount(&server)
            .await;

        let client = RemoteSandboxClient::new(server.uri(), None);
        let err = client
            .create_sandbox(&create_req(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_capacity());
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let client = RemoteSandboxClient::new(server.uri(), Some("bad".into()));
        let err = client
            .create_sandbox(&create_req(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BackendAuth(_)));
    }

    #[tokio::test]
    async fn run_command_parses_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes/sbx-1/commands"))
            .and(body_partial_json(serde_json::json!({"cmd": "ls", "background": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "exit_code": 0,
                "stdout": "package.json\n",
                "stderr": ""
            })))
            .mount(&server)
            .await;

        let client = RemoteSandboxClient::new(server.uri(), None);
        let out = client
            .run_command(
                "sbx-1",
                &CommandRequest {
                    cmd: "ls".into(),
                    cwd: Some("/home/user/app".into()),
                    envs: BTreeMap::new(),
                    timeout_ms: 1000,
                    background: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, "package.json\n");
    }

    #[tokio::test]
    async fn delete_treats_not_found_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/sandboxes/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = RemoteSandboxClient::new(server.uri(), None);
        client.delete_sandbox("gone", Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn unresponsive_delete_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/sandboxes/stuck"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(60)))
            .mount(&server)
            .await;

        let client = RemoteSandboxClient::new(server.uri(), None);
        let err = client
            .delete_sandbox("stuck", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BackendTimeout("delete")));
    }

    #[tokio::test]
    async fn health_deserializes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "active_sandboxes": 1
            })))
            .mount(&server)
            .await;

        let client = RemoteSandboxClient::new(server.uri(), None);
        let h = client.health(Duration::from_secs(5)).await.unwrap();
        assert_eq!(h.status, "ok");
    }
}
