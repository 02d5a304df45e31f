//! In-memory backend for exercising the environment manager.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::files::ProjectFile;
use crate::sandbox::backend::ExecutionBackend;
use crate::sandbox::environment::Environment;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::*;

#[derive(Default)]
pub(crate) struct FakeState {
    pub created: AtomicUsize,
    pub cleaned: AtomicUsize,
    /// Upcoming `create()` calls that fail with a capacity rejection.
    pub capacity_failures: AtomicUsize,
    pub fail_install: AtomicBool,
    /// Report the backend as unable to run ad-hoc commands.
    pub no_exec: AtomicBool,
    /// Make `cleanup()` never return.
    pub hang_cleanup: AtomicBool,
    /// Milliseconds each install blocks for (0 = immediate).
    pub install_delay_ms: AtomicU64,
    pub live: Mutex<HashSet<String>>,
    pub mounted: Mutex<Vec<Vec<ProjectFile>>>,
    seq: AtomicU64,
}

impl FakeState {
    pub fn live_ids(&self) -> HashSet<String> {
        self.live.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or_default()
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    pub state: Arc<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::LocalContainer,
            supports_exec: !self.state.no_exec.load(Ordering::SeqCst),
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
        let remaining = self.state.capacity_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.capacity_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SandboxError::BackendUnavailable {
                message: "too many concurrent sandboxes".into(),
                retry_after: Some(Duration::from_millis(20)),
            });
        }

        let n = self.state.seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-{project_id}-{n}");
        self.state.created.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut live) = self.state.live.lock() {
            live.insert(id.clone());
        }

        Ok(Box::new(FakeEnvironment {
            id,
            metadata: EnvironmentMetadata::for_project(project_id),
            state: self.state.clone(),
            started: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
        }))
    }
}

pub(crate) struct FakeEnvironment {
    id: String,
    metadata: EnvironmentMetadata,
    state: Arc<FakeState>,
    started: AtomicBool,
    cleaned: AtomicBool,
}

#[async_trait]
impl Environment for FakeEnvironment {
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
        self.started
            .load(Ordering::SeqCst)
            .then(|| format!("http://preview.test/{}", self.id))
    }

    async fn mount(
        &self,
        files: &[ProjectFile],
        _cancel: &CancellationToken,
    ) -> Result<(), SandboxError> {
        if let Ok(mut mounted) = self.state.mounted.lock() {
            mounted.push(files.to_vec());
        }
        Ok(())
    }

    async fn install_dependencies(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, SandboxError> {
        let delay = self.state.install_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
        if self.state.fail_install.load(Ordering::SeqCst) {
            return Err(SandboxError::InstallFailure {
                code: Some(1),
                stdout: String::new(),
                stderr: "npm ERR! missing script".into(),
            });
        }
        Ok(ExecResult {
            exit_code: Some(0),
            ..ExecResult::default()
        })
    }

    async fn start_server(&self, _cancel: &CancellationToken) -> Result<String, SandboxError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(format!("http://preview.test/{}", self.id))
    }

    async fn execute(
        &self,
        req: ExecRequest,
        _cancel: &CancellationToken,
    ) -> Result<ExecResult, SandboxError> {
        Ok(ExecResult {
            exit_code: Some(0),
            stdout: req.command_line(),
            ..ExecResult::default()
        })
    }

    async fn cleanup(&self) -> Result<(), SandboxError> {
        if self.state.hang_cleanup.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.cleaned.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut live) = self.state.live.lock() {
            live.remove(&self.id);
        }
        Ok(())
    }
}
