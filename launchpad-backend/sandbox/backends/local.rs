use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU16, Ordering};

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::files::ProjectFile;
use crate::sandbox::backend::ExecutionBackend;
use crate::sandbox::environment::Environment;
use crate::sandbox::error::SandboxError;
use crate::sandbox::liveness::{LivenessPolicy, wait_for_http};
use crate::sandbox::local_host::fs_jail::FsJail;
use crate::sandbox::local_host::process_supervisor::ProcessSupervisor;
use crate::sandbox::types::*;

/// Local workspace backend.
///
/// Each environment gets its own directory under `config.root_dir` and a
/// supervised dev server on a port from the configured range. Processes run
/// as the current user with a filtered env, so this is for trusted
/// workloads and local development only.
pub struct LocalContainerBackend {
    config: LocalContainerConfig,
    timeouts: Timeouts,
    counter: AtomicU64,
    ports: Arc<PortAllocator>,
    http: reqwest::Client,
}

impl LocalContainerBackend {
    pub fn new(config: LocalContainerConfig, timeouts: Timeouts) -> Result<Self, SandboxError> {
        if config.root_dir.as_os_str().is_empty() {
            return Err(SandboxError::Backend(
                "local backend requires a root directory".into(),
            ));
        }
        if config.port_range_start > config.port_range_end {
            return Err(SandboxError::Backend(format!(
                "invalid port range {}-{}",
                config.port_range_start, config.port_range_end
            )));
        }
        std::fs::create_dir_all(&config.root_dir).map_err(|e| {
            SandboxError::Backend(format!(
                "failed to create environments root {}: {e}",
                config.root_dir.display()
            ))
        })?;
        let ports = Arc::new(PortAllocator::new(
            config.host.clone(),
            config.port_range_start,
            config.port_range_end,
        ));
        Ok(Self {
            config,
            timeouts,
            counter: AtomicU64::new(0),
            ports,
            http: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl ExecutionBackend for LocalContainerBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::LocalContainer,
            supports_exec: true,
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
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("local-{}-{seq}", dir_safe(project_id));
        let workspace_dir = self.config.root_dir.join(&id);

        tracing::info!(
            environment_id = %id,
            project_id = %project_id,
            workspace_dir = %workspace_dir.display(),
            "creating local environment"
        );

        let jail = FsJail::create(workspace_dir)?;
        let supervisor = ProcessSupervisor::new(
            self.config.inherit_env_allowlist.clone(),
            self.config.max_output_bytes,
        );

        Ok(Box::new(LocalEnvironment {
            id,
            jail,
            supervisor,
            config: self.config.clone(),
            timeouts: self.timeouts.clone(),
            metadata: EnvironmentMetadata::for_project(project_id),
            ports: self.ports.clone(),
            http: self.http.clone(),
            server: Mutex::new(None),
            workspace: RwLock::new(()),
            cleaned: AtomicBool::new(false),
        }))
    }
}

// ── Ports ───────────────────────────────────────────────────────────

/// Round-robin over the configured range, skipping ports already bound.
struct PortAllocator {
    host: String,
    start: u16,
    end: u16,
    cursor: AtomicU16,
}

impl PortAllocator {
    fn new(host: String, start: u16, end: u16) -> Self {
        Self {
            host,
            start,
            end,
            cursor: AtomicU16::new(0),
        }
    }

    fn allocate(&self) -> Result<u16, SandboxError> {
        let span = u32::from(self.end - self.start) + 1;
        for _ in 0..span {
            let offset = u32::from(self.cursor.fetch_add(1, Ordering::SeqCst)) % span;
            let port = self.start + offset as u16;
            if TcpListener::bind((self.host.as_str(), port)).is_ok() {
                return Ok(port);
            }
        }
        Err(SandboxError::unavailable(format!(
            "no free port in {}-{}",
            self.start, self.end
        )))
    }
}

fn dir_safe(project_id: &str) -> String {
    project_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ── Environment ─────────────────────────────────────────────────────

struct DevServer {
    child: Child,
    url: String,
}

struct LocalEnvironment {
    id: String,
    jail: FsJail,
    supervisor: ProcessSupervisor,
    config: LocalContainerConfig,
    timeouts: Timeouts,
    metadata: EnvironmentMetadata,
    ports: Arc<PortAllocator>,
    http: reqwest::Client,
    server: Mutex<Option<DevServer>>,
    /// Writes hold it shared; removing the workspace holds it exclusively.
    workspace: RwLock<()>,
    cleaned: AtomicBool,
}

impl LocalEnvironment {
    async fn stop_server(&self) {
        if let Some(mut server) = self.server.lock().await.take() {
            if let Err(e) = server.child.kill().await {
                tracing::warn!(environment_id = %self.id, error = %e, "failed to kill dev server");
            }
        }
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::LocalContainer
    }

    fn metadata(&self) -> &EnvironmentMetadata {
        &self.metadata
    }

    fn preview_url(&self) -> Option<String> {
        self.server
            .try_lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.url.clone()))
    }

    async fn mount(
        &self,
        files: &[ProjectFile],
        cancel: &CancellationToken,
    ) -> Result<(), SandboxError> {
        for file in files {
            let _writing = self.workspace.read().await;
            if cancel.is_cancelled() || self.cleaned.load(Ordering::SeqCst) {
                return Err(SandboxError::Cancelled);
            }
            self.jail.write_file(&file.path, &file.content).await?;
        }
        tracing::debug!(environment_id = %self.id, files = files.len(), "files mounted");
        Ok(())
    }

    async fn install_dependencies(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, SandboxError> {
        let req = ExecRequest::new(self.config.install_command.clone());
        let out = self
            .supervisor
            .exec(&req, self.jail.root(), self.timeouts.install, cancel)
            .await?;
        if out.timed_out {
            return Err(SandboxError::BackendTimeout("install"));
        }
        if out.exit_code != Some(0) {
            return Err(SandboxError::InstallFailure {
                code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    async fn start_server(&self, cancel: &CancellationToken) -> Result<String, SandboxError> {
        self.stop_server().await;

        let port = self.ports.allocate()?;
        let port_str = port.to_string();
        let argv: Vec<String> = self
            .config
            .dev_command
            .iter()
            .map(|arg| arg.replace("{port}", &port_str))
            .collect();
        let env = BTreeMap::from([("PORT".to_string(), port_str.clone())]);
        let child = self.supervisor.spawn(&argv, self.jail.root(), &env)?;
        let url = format!("http://{}:{port}", self.config.host);

        tracing::info!(environment_id = %self.id, port, command = ?argv, "dev server spawned");
        *self.server.lock().await = Some(DevServer {
            child,
            url: url.clone(),
        });

        let policy = LivenessPolicy::from(&self.timeouts);
        if let Err(e) = wait_for_http(&self.http, &url, &policy, cancel).await {
            self.stop_server().await;
            return Err(e);
        }
        Ok(url)
    }

    async fn execute(
        &self,
        req: ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, SandboxError> {
        tracing::debug!(environment_id = %self.id, command = ?req.command, "executing command");
        self.supervisor
            .exec(&req, self.jail.root(), self.timeouts.exec, cancel)
            .await
    }

    async fn cleanup(&self) -> Result<(), SandboxError> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(environment_id = %self.id, "destroying local environment");
        self.stop_server().await;
        let _removing = self.workspace.write().await;
        if let Err(e) = self.jail.destroy().await {
            self.cleaned.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
