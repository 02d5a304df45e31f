//! Environment manager: owns the map from project to live environment.
//!
//! One manager is built at startup around a single execution backend and
//! shared by reference. All mutation of the registry goes through its
//! methods; backends never see it.

pub mod error;
pub mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::files::{self, ProjectFile, projection};
use crate::sandbox::{
    BackendInfo, BackendKind, Environment, EnvironmentId, ExecRequest, ExecResult,
    ExecutionBackend, SandboxError,
};
use crate::status::{StatusChannel, StatusEvent};

pub use error::ProvisionError;
pub use state::{EnvironmentState, ManagerConfig};

/// Snapshot of one tracked environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentHandle {
    pub project_id: String,
    pub environment_id: EnvironmentId,
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_url: Option<String>,
    pub backend_kind: BackendKind,
    pub created_at: DateTime<Utc>,
    pub last_status: EnvironmentState,
}

struct Tracked {
    handle: EnvironmentHandle,
    env: Arc<dyn Environment>,
    /// Token of the attempt that created this environment.
    cancel: CancellationToken,
    attempt: u64,
    fingerprint: u64,
}

struct Attempt {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    handles: HashMap<String, Tracked>,
    /// Newest provisioning attempt per project.
    attempts: HashMap<String, Attempt>,
}

impl Registry {
    fn is_current(&self, project_id: &str, attempt: u64) -> bool {
        self.attempts.get(project_id).map(|a| a.id) == Some(attempt)
    }

    fn tracks(&self, project_id: &str, environment_id: &str) -> bool {
        self.handles
            .get(project_id)
            .is_some_and(|t| t.handle.environment_id == environment_id)
    }

    /// Remove a project's tracked environment and forget its attempt.
    fn take(&mut self, project_id: &str) -> Option<Tracked> {
        let tracked = self.handles.remove(project_id)?;
        if self.is_current(project_id, tracked.attempt) {
            self.attempts.remove(project_id);
        }
        Some(tracked)
    }

    /// Pop oldest environments until fewer than `limit` remain.
    fn evict_oldest(&mut self, limit: usize) -> Vec<Tracked> {
        let mut victims = Vec::new();
        while self.handles.len() >= limit {
            let oldest = self
                .handles
                .values()
                .min_by_key(|t| t.handle.created_at)
                .map(|t| t.handle.project_id.clone());
            match oldest.and_then(|pid| self.take(&pid)) {
                Some(t) => victims.push(t),
                None => break,
            }
        }
        victims
    }
}

pub struct EnvironmentManager {
    backend: Arc<dyn ExecutionBackend>,
    status: StatusChannel,
    config: ManagerConfig,
    registry: Mutex<Registry>,
    shutdown: CancellationToken,
    next_attempt: AtomicU64,
}

impl EnvironmentManager {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        status: StatusChannel,
        mut config: ManagerConfig,
    ) -> Self {
        config.max_environments = config.max_environments.max(1);
        Self {
            backend,
            status,
            config,
            registry: Mutex::new(Registry::default()),
            shutdown: CancellationToken::new(),
            next_attempt: AtomicU64::new(1),
        }
    }

    pub fn backend_info(&self) -> BackendInfo {
        self.backend.info()
    }

    pub fn status(&self) -> &StatusChannel {
        &self.status
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ── Provisioning ───────────────────────────────────────────────

    /// Build a fresh environment for `files` and return its preview URL.
    pub async fn provision_preview(
        &self,
        project_id: &str,
        files: &[ProjectFile],
    ) -> Result<String, ProvisionError> {
        let handle = self.create_managed(project_id, files).await?;
        handle.preview_url.ok_or_else(|| {
            ProvisionError::Backend(SandboxError::Backend(
                "environment became ready without a preview URL".into(),
            ))
        })
    }

    /// Reuse the project's ready environment when no newer attempt is in
    /// flight and it was built from the same files; otherwise rebuild.
    pub async fn get_or_create(
        &self,
        project_id: &str,
        files: &[ProjectFile],
    ) -> Result<EnvironmentHandle, ProvisionError> {
        let wanted = files::fingerprint(&files::dedupe(files.to_vec()));
        {
            let reg = self.registry.lock().await;
            if let Some(tracked) = reg.handles.get(project_id) {
                if !reg.attempts.contains_key(project_id)
                    && tracked.handle.last_status == EnvironmentState::Ready
                    && tracked.fingerprint == wanted
                {
                    tracing::debug!(
                        project_id = %project_id,
                        environment_id = %tracked.handle.environment_id,
                        "reusing environment"
                    );
                    return Ok(tracked.handle.clone());
                }
            }
        }
        self.create_managed(project_id, files).await
    }

    /// Replace whatever the project runs on with a new environment.
    ///
    /// Every state transition is published on the status channel. Any
    /// failure removes the environment from the registry and cleans it up.
    pub async fn create_managed(
        &self,
        project_id: &str,
        files: &[ProjectFile],
    ) -> Result<EnvironmentHandle, ProvisionError> {
        if files.is_empty() {
            return Err(ProvisionError::EmptyFileSet);
        }
        if self.shutdown.is_cancelled() {
            return Err(ProvisionError::ShuttingDown);
        }
        let files = files::dedupe(files.to_vec());
        let fingerprint = files::fingerprint(&files);

        let (attempt, cancel, previous) = self.begin_attempt(project_id).await;
        if let Some(previous) = previous {
            let message = format!("replacing environment {}", previous.handle.environment_id);
            self.emit(attempt, StatusEvent::new(project_id, EnvironmentState::Replacing, message))
                .await;
            self.teardown(previous, None).await;
        }

        let victims = self
            .registry
            .lock()
            .await
            .evict_oldest(self.config.max_environments);
        self.teardown_all(victims, "evicted: environment limit reached").await;

        let kind = self.backend.info().kind;
        self.emit(
            attempt,
            StatusEvent::new(
                project_id,
                EnvironmentState::Creating,
                format!("allocating {kind} environment"),
            ),
        )
        .await;

        let env: Arc<dyn Environment> = match self.backend.create(project_id, &cancel).await {
            Ok(env) => Arc::from(env),
            Err(e) => return Err(self.fail_create(project_id, attempt, e).await),
        };
        self.admit(project_id, attempt, &env, &cancel, fingerprint).await?;

        match self.run_pipeline(project_id, attempt, &env, &files, &cancel).await {
            Ok(handle) => {
                tracing::info!(
                    project_id = %project_id,
                    environment_id = %handle.environment_id,
                    preview_url = ?handle.preview_url,
                    "environment ready"
                );
                Ok(handle)
            }
            Err(e) => Err(self.fail_pipeline(project_id, attempt, &env, e).await),
        }
    }

    async fn begin_attempt(&self, project_id: &str) -> (u64, CancellationToken, Option<Tracked>) {
        let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
        let cancel = self.shutdown.child_token();
        let mut reg = self.registry.lock().await;
        let superseded = reg.attempts.insert(
            project_id.to_string(),
            Attempt {
                id: attempt,
                cancel: cancel.clone(),
            },
        );
        if let Some(old) = superseded {
            old.cancel.cancel();
        }
        let previous = reg.handles.remove(project_id);
        (attempt, cancel, previous)
    }

    /// Register a freshly created environment, enforcing the ceiling again
    /// in case concurrent attempts filled it meanwhile.
    async fn admit(
        &self,
        project_id: &str,
        attempt: u64,
        env: &Arc<dyn Environment>,
        cancel: &CancellationToken,
        fingerprint: u64,
    ) -> Result<(), ProvisionError> {
        let mut reg = self.registry.lock().await;
        if !reg.is_current(project_id, attempt) {
            drop(reg);
            self.cleanup_quietly(env).await;
            return Err(self.interrupted());
        }
        let victims = reg.evict_oldest(self.config.max_environments);
        let created_at = DateTime::from_timestamp_millis(env.metadata().created_at_unix_ms)
            .unwrap_or_else(Utc::now);
        let handle = EnvironmentHandle {
            project_id: project_id.to_string(),
            environment_id: env.id().to_string(),
            preview_url: None,
            embed_url: None,
            backend_kind: env.backend_kind(),
            created_at,
            last_status: EnvironmentState::Creating,
        };
        reg.handles.insert(
            project_id.to_string(),
            Tracked {
                handle,
                env: env.clone(),
                cancel: cancel.clone(),
                attempt,
                fingerprint,
            },
        );
        drop(reg);
        self.teardown_all(victims, "evicted: environment limit reached").await;
        Ok(())
    }

    async fn run_pipeline(
        &self,
        project_id: &str,
        attempt: u64,
        env: &Arc<dyn Environment>,
        files: &[ProjectFile],
        cancel: &CancellationToken,
    ) -> Result<EnvironmentHandle, ProvisionError> {
        let env_id = env.id();
        let projected = projection::project(files, env.backend_kind());

        let message = format!("mounting {} files", projected.len());
        self.advance(project_id, attempt, env_id, EnvironmentState::Mounting, message)
            .await?;
        env.mount(&projected, cancel).await?;

        self.advance(project_id, attempt, env_id, EnvironmentState::Installing, "installing dependencies".into())
            .await?;
        let install = env.install_dependencies(cancel).await?;
        tracing::debug!(
            project_id = %project_id,
            environment_id = %env_id,
            stdout_bytes = install.stdout.len(),
            "dependencies installed"
        );

        self.advance(project_id, attempt, env_id, EnvironmentState::Starting, "starting dev server".into())
            .await?;
        let url = env.start_server(cancel).await?;

        let mut reg = self.registry.lock().await;
        if !reg.is_current(project_id, attempt) {
            return Err(self.interrupted());
        }
        let Some(tracked) = reg
            .handles
            .get_mut(project_id)
            .filter(|t| t.handle.environment_id == env_id)
        else {
            return Err(self.interrupted());
        };
        tracked.handle.last_status = EnvironmentState::Ready;
        tracked.handle.preview_url = Some(url.clone());
        tracked.handle.embed_url = env.embed_url();
        let handle = tracked.handle.clone();
        self.status.publish(
            StatusEvent::new(project_id, EnvironmentState::Ready, "preview is live").with_preview_url(url),
        );
        reg.attempts.remove(project_id);
        Ok(handle)
    }

    /// Move the tracked handle to `state` and announce it, unless a newer
    /// attempt or a teardown took the project over.
    async fn advance(
        &self,
        project_id: &str,
        attempt: u64,
        environment_id: &str,
        state: EnvironmentState,
        message: String,
    ) -> Result<(), ProvisionError> {
        let mut reg = self.registry.lock().await;
        if !reg.is_current(project_id, attempt) || !reg.tracks(project_id, environment_id) {
            return Err(self.interrupted());
        }
        if let Some(tracked) = reg.handles.get_mut(project_id) {
            debug_assert!(tracked.handle.last_status.can_transition(state));
            tracked.handle.last_status = state;
        }
        self.status
            .publish(StatusEvent::new(project_id, state, message));
        Ok(())
    }

    /// Publish `event` only while `attempt` is still the project's newest.
    async fn emit(&self, attempt: u64, event: StatusEvent) -> bool {
        let reg = self.registry.lock().await;
        if !reg.is_current(&event.project_id, attempt) {
            return false;
        }
        self.status.publish(event);
        true
    }

    async fn fail_create(&self, project_id: &str, attempt: u64, err: SandboxError) -> ProvisionError {
        if matches!(err, SandboxError::Cancelled) {
            self.finish_attempt(project_id, attempt).await;
            return self.interrupted();
        }

        if !err.is_capacity() {
            tracing::warn!(project_id = %project_id, error = %err, "environment creation failed");
            let failure = ProvisionError::Backend(err);
            self.announce_error(project_id, attempt, &failure).await;
            return failure;
        }

        // Capacity rejection: clear everything we hold and back off once.
        tracing::warn!(project_id = %project_id, error = %err, "backend at capacity, destroying all environments");
        let message = err.to_string();
        let retry_after = err.retry_after().unwrap_or(self.config.capacity_cooldown);
        let victims: Vec<Tracked> = {
            let mut reg = self.registry.lock().await;
            let pids: Vec<String> = reg.handles.keys().cloned().collect();
            let taken: Vec<Tracked> = pids.iter().filter_map(|pid| reg.take(pid)).collect();
            taken
        };
        let cleaned = victims.len();
        let failure = ProvisionError::BackendUnavailable {
            cleaned,
            retry_after,
            message,
        };
        self.announce_error(project_id, attempt, &failure).await;
        self.teardown_all(victims, "destroyed: backend capacity reached").await;

        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.capacity_cooldown) => {}
        }
        failure
    }

    async fn fail_pipeline(
        &self,
        project_id: &str,
        attempt: u64,
        env: &Arc<dyn Environment>,
        err: ProvisionError,
    ) -> ProvisionError {
        let err = match err {
            ProvisionError::Backend(SandboxError::Cancelled) => self.interrupted(),
            other => other,
        };
        {
            let mut reg = self.registry.lock().await;
            if reg.tracks(project_id, env.id()) {
                reg.handles.remove(project_id);
            }
            if reg.is_current(project_id, attempt) {
                tracing::warn!(
                    project_id = %project_id,
                    environment_id = %env.id(),
                    error = %err,
                    "provisioning failed"
                );
                self.status.publish(
                    StatusEvent::new(project_id, EnvironmentState::Error, err.user_message())
                        .with_error(err.to_string()),
                );
                reg.attempts.remove(project_id);
            }
        }
        self.cleanup_quietly(env).await;
        err
    }

    async fn announce_error(&self, project_id: &str, attempt: u64, err: &ProvisionError) {
        let mut reg = self.registry.lock().await;
        if reg.is_current(project_id, attempt) {
            self.status.publish(
                StatusEvent::new(project_id, EnvironmentState::Error, err.user_message())
                    .with_error(err.to_string()),
            );
            reg.attempts.remove(project_id);
        }
    }

    async fn finish_attempt(&self, project_id: &str, attempt: u64) {
        let mut reg = self.registry.lock().await;
        if reg.is_current(project_id, attempt) {
            reg.attempts.remove(project_id);
        }
    }

    fn interrupted(&self) -> ProvisionError {
        if self.shutdown.is_cancelled() {
            ProvisionError::ShuttingDown
        } else {
            ProvisionError::Superseded
        }
    }

    // ── Teardown ───────────────────────────────────────────────────

    /// Cancel in-flight work on `tracked` and release it. With a reason, a
    /// `destroyed` event is published for its project.
    async fn teardown(&self, tracked: Tracked, reason: Option<&str>) {
        tracked.cancel.cancel();
        let Tracked { handle, env, .. } = tracked;
        tracing::info!(
            project_id = %handle.project_id,
            environment_id = %handle.environment_id,
            reason = reason.unwrap_or("replaced"),
            "destroying environment"
        );
        self.cleanup_quietly(&env).await;
        if let Some(reason) = reason {
            self.status.publish(StatusEvent::new(
                &handle.project_id,
                EnvironmentState::Destroyed,
                reason,
            ));
        }
    }

    async fn teardown_all(&self, victims: Vec<Tracked>, reason: &str) {
        join_all(victims.into_iter().map(|t| self.teardown(t, Some(reason)))).await;
    }

    /// `env.cleanup()`, given up on after the teardown timeout.
    async fn bounded_cleanup(&self, env: &Arc<dyn Environment>) -> Result<(), SandboxError> {
        match tokio::time::timeout(self.config.teardown_timeout, env.cleanup()).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::BackendTimeout("cleanup")),
        }
    }

    async fn cleanup_quietly(&self, env: &Arc<dyn Environment>) {
        if let Err(e) = self.bounded_cleanup(env).await {
            tracing::warn!(environment_id = %env.id(), error = %e, "environment cleanup failed");
        }
    }

    /// Destroy the project's environment and cancel any attempt in flight.
    pub async fn destroy(&self, project_id: &str) -> Result<(), ProvisionError> {
        let (tracked, attempt) = {
            let mut reg = self.registry.lock().await;
            let attempt = reg.attempts.remove(project_id);
            let tracked = reg.handles.remove(project_id);
            (tracked, attempt)
        };
        if let Some(attempt) = &attempt {
            attempt.cancel.cancel();
        }
        match tracked {
            Some(tracked) => {
                tracked.cancel.cancel();
                let result = self.bounded_cleanup(&tracked.env).await;
                self.status.publish(StatusEvent::new(
                    project_id,
                    EnvironmentState::Destroyed,
                    "destroyed on request",
                ));
                result.map_err(ProvisionError::from)
            }
            None if attempt.is_some() => Ok(()),
            None => Err(ProvisionError::UnknownProject(project_id.to_string())),
        }
    }

    /// Destroy every environment older than the configured max age.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .unwrap_or(chrono::Duration::MAX);
        let victims: Vec<Tracked> = {
            let mut reg = self.registry.lock().await;
            let expired: Vec<String> = reg
                .handles
                .values()
                .filter(|t| now.signed_duration_since(t.handle.created_at) > max_age)
                .map(|t| t.handle.project_id.clone())
                .collect();
            let taken: Vec<Tracked> = expired.iter().filter_map(|pid| reg.take(pid)).collect();
            taken
        };
        let count = victims.len();
        if count > 0 {
            tracing::info!(count, "sweeping expired environments");
        }
        self.teardown_all(victims, "expired: maximum age reached").await;
        count
    }

    /// Run `sweep_expired` every sweep interval until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep_expired(Utc::now()).await;
                    }
                }
            }
            tracing::debug!("environment sweeper stopped");
        })
    }

    /// Stop accepting work and destroy every environment, best-effort.
    /// Teardowns run concurrently and each is bounded by the teardown timeout.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let victims: Vec<Tracked> = {
            let mut reg = self.registry.lock().await;
            reg.attempts.clear();
            reg.handles.drain().map(|(_, t)| t).collect()
        };
        let count = victims.len();
        tracing::info!(count, "tearing down environments");
        self.teardown_all(victims, "destroyed: shutting down").await;
        count
    }

    // ── Queries & commands ─────────────────────────────────────────

    pub async fn execute(
        &self,
        project_id: &str,
        req: ExecRequest,
    ) -> Result<ExecResult, ProvisionError> {
        if !self.backend.info().supports_exec {
            return Err(SandboxError::Unsupported("execute").into());
        }
        let (env, cancel) = {
            let reg = self.registry.lock().await;
            let tracked = reg
                .handles
                .get(project_id)
                .ok_or_else(|| ProvisionError::UnknownProject(project_id.to_string()))?;
            (tracked.env.clone(), tracked.cancel.child_token())
        };
        Ok(env.execute(req, &cancel).await?)
    }

    pub async fn get(&self, project_id: &str) -> Option<EnvironmentHandle> {
        self.registry
            .lock()
            .await
            .handles
            .get(project_id)
            .map(|t| t.handle.clone())
    }

    /// All tracked environments, oldest first.
    pub async fn list(&self) -> Vec<EnvironmentHandle> {
        let reg = self.registry.lock().await;
        let mut handles: Vec<EnvironmentHandle> =
            reg.handles.values().map(|t| t.handle.clone()).collect();
        handles.sort_by_key(|h| h.created_at);
        handles
    }

    pub async fn live_count(&self) -> usize {
        self.registry.lock().await.handles.len()
    }
}

// ── Tests ───────────────────────────────────────────────────────────
