//! Remote cloud sandbox backend.
//!
//! Each environment is one sandbox on the remote service. Files are pushed
//! over HTTP, commands run through the service's command endpoint and the
//! dev server is reached through the service's public port forwarding.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::files::ProjectFile;
use crate::sandbox::backend::ExecutionBackend;
use crate::sandbox::cancellable;
use crate::sandbox::environment::Environment;
use crate::sandbox::error::SandboxError;
use crate::sandbox::liveness::{LivenessPolicy, wait_for_http};
use crate::sandbox::remote_api::{
    CommandRequest, CreateSandboxRequest, FileEntry, RemoteSandboxClient, SandboxInfo,
};
use crate::sandbox::types::*;

/// Files per upload request.
const MOUNT_BATCH: usize = 25;

// ── Backend ─────────────────────────────────────────────────────────

pub struct RemoteSandboxBackend {
    client: RemoteSandboxClient,
    config: RemoteSandboxConfig,
    timeouts: Timeouts,
}

impl RemoteSandboxBackend {
    pub fn new(config: RemoteSandboxConfig, timeouts: Timeouts) -> Result<Self, SandboxError> {
        if config.api_base_url.trim().is_empty() {
            return Err(SandboxError::Backend(
                "remote sandbox backend requires an API base URL".into(),
            ));
        }
        let client = RemoteSandboxClient::new(config.api_base_url.clone(), config.api_key.clone());
        Ok(Self {
            client,
            config,
            timeouts,
        })
    }
}

#[async_trait]
impl ExecutionBackend for RemoteSandboxBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::RemoteSandbox,
            supports_exec: true,
        }
    }

    async fn health(&self) -> Result<(), SandboxError> {
        let health = self.client.health(self.timeouts.exec).await?;
        if health.status != "ok" {
            return Err(SandboxError::Backend(format!(
                "remote sandbox service reports status {}",
                health.status
            )));
        }
        Ok(())
    }

    async fn create(
        &self,
        project_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Environment>, SandboxError> {
        let req = CreateSandboxRequest {
            template: self.config.template.clone(),
            timeout_ms: self.config.lifetime.as_millis() as u64,
            metadata: BTreeMap::from([("project_id".to_string(), project_id.to_string())]),
        };
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        // Not raced against `cancel`: once the POST is out the service may
        // have allocated a sandbox, and only the response tells us its id.
        let info = self.client.create_sandbox(&req, self.timeouts.create).await?;
        if cancel.is_cancelled() {
            tracing::info!(
                project_id = %project_id,
                sandbox_id = %info.sandbox_id,
                "attempt cancelled during create, releasing sandbox"
            );
            if let Err(e) = self.client.delete_sandbox(&info.sandbox_id, self.timeouts.exec).await {
                tracing::warn!(sandbox_id = %info.sandbox_id, error = %e, "failed to release sandbox");
            }
            return Err(SandboxError::Cancelled);
        }

        tracing::info!(
            project_id = %project_id,
            sandbox_id = %info.sandbox_id,
            "remote sandbox allocated"
        );

        Ok(Box::new(RemoteEnvironment {
            info,
            client: self.client.clone(),
            config: self.config.clone(),
            timeouts: self.timeouts.clone(),
            metadata: EnvironmentMetadata::for_project(project_id),
            cleaned: AtomicBool::new(false),
        }))
    }
}

// ── Environment ─────────────────────────────────────────────────────

struct RemoteEnvironment {
    info: SandboxInfo,
    client: RemoteSandboxClient,
    config: RemoteSandboxConfig,
    timeouts: Timeouts,
    metadata: EnvironmentMetadata,
    cleaned: AtomicBool,
}

impl RemoteEnvironment {
    fn url(&self) -> String {
        self.config
            .preview_url_template
            .replace("{port}", &self.config.port.to_string())
            .replace("{id}", &self.info.sandbox_id)
            .replace("{domain}", &self.info.domain)
    }

    fn command(&self, cmd: String, timeout: std::time::Duration, background: bool) -> CommandRequest {
        CommandRequest {
            cmd,
            cwd: Some(self.config.workdir.clone()),
            envs: BTreeMap::new(),
            timeout_ms: timeout.as_millis() as u64,
            background,
        }
    }

    fn guest_path(&self, path: &str) -> String {
        format!("{}/{}", self.config.workdir.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Environment for RemoteEnvironment {
    fn id(&self) -> &str {
        &self.info.sandbox_id
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::RemoteSandbox
    }

    fn metadata(&self) -> &EnvironmentMetadata {
        &self.metadata
    }

    fn preview_url(&self) -> Option<String> {
        Some(self.url())
    }

    async fn mount(
        &self,
        files: &[ProjectFile],
        cancel: &CancellationToken,
    ) -> Result<(), SandboxError> {
        let guest_paths: Vec<String> = files.iter().map(|f| self.guest_path(&f.path)).collect();
        let entries: Vec<FileEntry<'_>> = files
            .iter()
            .zip(&guest_paths)
            .map(|(f, p)| FileEntry {
                path: p,
                content: &f.content,
            })
            .collect();

        for (batch_no, batch) in entries.chunks(MOUNT_BATCH).enumerate() {
            let result =
                cancellable(cancel, self.client.write_files(&self.info.sandbox_id, batch, self.timeouts.exec)).await;
            match result {
                Ok(()) => {}
                Err(SandboxError::Cancelled) => return Err(SandboxError::Cancelled),
                Err(e) => {
                    return Err(SandboxError::MountFailure {
                        path: batch[0].path.to_string(),
                        reason: format!("batch {batch_no} rejected: {e}"),
                    });
                }
            }
        }

        tracing::debug!(sandbox_id = %self.info.sandbox_id, files = files.len(), "files mounted");
        Ok(())
    }

    async fn install_dependencies(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, SandboxError> {
        let req = self.command(self.config.install_command.clone(), self.timeouts.install, false);
        let out = cancellable(cancel, self.client.run_command(&self.info.sandbox_id, &req)).await?;
        if out.exit_code != Some(0) {
            return Err(SandboxError::InstallFailure {
                code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        Ok(ExecResult {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            timed_out: false,
        })
    }

    async fn start_server(&self, cancel: &CancellationToken) -> Result<String, SandboxError> {
        let cmd = self
            .config
            .dev_command
            .replace("{port}", &self.config.port.to_string());
        let req = self.command(cmd, self.timeouts.exec, true);
        cancellable(cancel, self.client.run_command(&self.info.sandbox_id, &req)).await?;

        let url = self.url();
        let policy = LivenessPolicy::from(&self.timeouts);
        wait_for_http(self.client.http(), &url, &policy, cancel).await?;
        Ok(url)
    }

    async fn execute(
        &self,
        req: ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, SandboxError> {
        let timeout = req.timeout.unwrap_or(self.timeouts.exec);
        let mut cmd = self.command(req.command_line(), timeout, false);
        if let Some(cwd) = req.cwd {
            cmd.cwd = Some(cwd);
        }
        cmd.envs = req.env;
        let out = cancellable(cancel, self.client.run_command(&self.info.sandbox_id, &cmd)).await?;
        Ok(ExecResult {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            timed_out: false,
        })
    }

    async fn cleanup(&self) -> Result<(), SandboxError> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.client.delete_sandbox(&self.info.sandbox_id, self.timeouts.exec).await {
            // Allow a later retry.
            self.cleaned.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
