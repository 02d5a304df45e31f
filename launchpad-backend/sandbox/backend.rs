use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::environment::Environment;
use super::error::SandboxError;
use super::types::BackendInfo;

/// Factory for physical environments on one kind of backend.
///
/// One backend instance is constructed at startup and handed to the
/// environment manager. Each call to `create()` allocates a fresh,
/// isolated environment; backends keep no handle to it afterwards.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Metadata about this backend (kind, capability flags).
    fn info(&self) -> BackendInfo;

    /// Cheap reachability check of the backend service itself.
    async fn health(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Allocate a new environment for `project_id`.
    ///
    /// Fails with `BackendUnavailable` on quota/capacity rejection,
    /// `BackendTimeout` or `BackendAuth`.
    async fn create(
        &self,
        project_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Environment>, SandboxError>;
}
