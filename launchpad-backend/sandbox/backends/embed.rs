//! Online-IDE embed backend.
//!
//! The IDE installs dependencies and runs the dev server itself once a
//! project is defined, so the local side only uploads files and waits for
//! the public preview to answer. Ad-hoc commands are not available.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::files::ProjectFile;
use crate::sandbox::backend::ExecutionBackend;
use crate::sandbox::cancellable;
use crate::sandbox::environment::Environment;
use crate::sandbox::error::{SandboxError, mentions_capacity};
use crate::sandbox::liveness::{LivenessPolicy, wait_for_http};
use crate::sandbox::types::*;

#[derive(Debug, Serialize)]
struct DefineRequest<'a> {
    files: BTreeMap<&'a str, DefineFile<'a>>,
}

#[derive(Debug, Serialize)]
struct DefineFile<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct DefineResponse {
    sandbox_id: String,
}

pub struct IdeEmbedBackend {
    config: IdeEmbedConfig,
    timeouts: Timeouts,
    client: reqwest::Client,
}

impl IdeEmbedBackend {
    pub fn new(config: IdeEmbedConfig, timeouts: Timeouts) -> Self {
        Self {
            config,
            timeouts,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ExecutionBackend for IdeEmbedBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::IdeEmbed,
            supports_exec: false,
        }
    }

    async fn create(
        &self,
        project_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Environment>, SandboxError> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        let draft_id = format!("draft-{}", uuid::Uuid::new_v4());
        tracing::info!(project_id = %project_id, draft_id = %draft_id, "IDE embed draft allocated");

        Ok(Box::new(EmbedEnvironment {
            draft_id,
            config: self.config.clone(),
            timeouts: self.timeouts.clone(),
            client: self.client.clone(),
            metadata: EnvironmentMetadata::for_project(project_id),
            sandbox_id: Mutex::new(None),
        }))
    }
}

struct EmbedEnvironment {
    draft_id: String,
    config: IdeEmbedConfig,
    timeouts: Timeouts,
    client: reqwest::Client,
    metadata: EnvironmentMetadata,
    /// Set once the IDE has accepted the file set.
    sandbox_id: Mutex<Option<String>>,
}

impl EmbedEnvironment {
    fn defined_id(&self) -> Option<String> {
        self.sandbox_id.lock().ok().and_then(|id| id.clone())
    }

    fn api_base(&self) -> &str {
        self.config.api_base_url.trim_end_matches('/')
    }

    async fn define(&self, files: &[ProjectFile]) -> Result<String, SandboxError> {
        let url = format!("{}/api/v1/sandboxes/define?json=1", self.api_base());
        let body = DefineRequest {
            files: files
                .iter()
                .map(|f| (f.path.as_str(), DefineFile { content: &f.content }))
                .collect(),
        };

        let mut builder = self.client.post(&url).timeout(self.timeouts.create).json(&body);
        if let Some(token) = &self.config.api_token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SandboxError::BackendTimeout("define")
            } else {
                SandboxError::Backend(format!("IDE define request failed: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => SandboxError::BackendUnavailable {
                    message: format!("IDE rate limited: {body}"),
                    retry_after,
                },
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    SandboxError::BackendAuth(format!("IDE returned {status}: {body}"))
                }
                _ if mentions_capacity(&body) => SandboxError::BackendUnavailable {
                    message: format!("IDE returned {status}: {body}"),
                    retry_after,
                },
                _ => SandboxError::MountFailure {
                    path: files.first().map(|f| f.path.clone()).unwrap_or_default(),
                    reason: format!("IDE rejected project ({status}): {body}"),
                },
            });
        }

        let parsed = resp
            .json::<DefineResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse define response: {e}")))?;
        Ok(parsed.sandbox_id)
    }
}

#[async_trait]
impl Environment for EmbedEnvironment {
    fn id(&self) -> &str {
        &self.draft_id
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::IdeEmbed
    }

    fn metadata(&self) -> &EnvironmentMetadata {
        &self.metadata
    }

    fn preview_url(&self) -> Option<String> {
        self.defined_id().map(|id| {
            self.config
                .preview_url_template
                .replace("{id}", &id)
                .replace("{domain}", &self.config.preview_domain)
        })
    }

    fn embed_url(&self) -> Option<String> {
        self.defined_id()
            .map(|id| format!("{}/embed/{id}", self.api_base()))
    }

    async fn mount(
        &self,
        files: &[ProjectFile],
        cancel: &CancellationToken,
    ) -> Result<(), SandboxError> {
        let sandbox_id = cancellable(cancel, self.define(files)).await?;
        tracing::info!(draft_id = %self.draft_id, sandbox_id = %sandbox_id, files = files.len(), "IDE project defined");
        if let Ok(mut slot) = self.sandbox_id.lock() {
            *slot = Some(sandbox_id);
        }
        Ok(())
    }

    async fn install_dependencies(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<ExecResult, SandboxError> {
        // Installed by the IDE on first boot.
        Ok(ExecResult {
            exit_code: Some(0),
            ..ExecResult::default()
        })
    }

    async fn start_server(&self, cancel: &CancellationToken) -> Result<String, SandboxError> {
        let url = self.preview_url().ok_or_else(|| {
            SandboxError::Backend("IDE project must be mounted before starting".into())
        })?;
        let policy = LivenessPolicy::from(&self.timeouts);
        wait_for_http(&self.client, &url, &policy, cancel).await?;
        Ok(url)
    }

    async fn execute(
        &self,
        _req: ExecRequest,
        _cancel: &CancellationToken,
    ) -> Result<ExecResult, SandboxError> {
        Err(SandboxError::Unsupported("execute"))
    }

    async fn cleanup(&self) -> Result<(), SandboxError> {
        // Defined projects are owned by the IDE; only forget the draft.
        if let Ok(mut slot) = self.sandbox_id.lock() {
            slot.take();
        }
        Ok(())
    }
}
