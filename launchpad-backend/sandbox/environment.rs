use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::SandboxError;
use super::types::*;
use crate::files::ProjectFile;

/// One allocated physical environment. Everything the manager drives.
///
/// Long-running calls take a cancellation token and return
/// `SandboxError::Cancelled` once it fires. Operations a backend does
/// not support return `SandboxError::Unsupported`.
#[async_trait]
pub trait Environment: Send + Sync {
    fn id(&self) -> &str;
    fn backend_kind(&self) -> BackendKind;
    fn metadata(&self) -> &EnvironmentMetadata;

    /// Where the running project is reachable, once the backend knows.
    fn preview_url(&self) -> Option<String>;

    /// Embeddable editor address, for backends that have one.
    fn embed_url(&self) -> Option<String> {
        None
    }

    // ── Provisioning pipeline ──────────────────────────────────────

    /// Write every file. Any single failure fails the whole mount.
    async fn mount(
        &self,
        files: &[ProjectFile],
        cancel: &CancellationToken,
    ) -> Result<(), SandboxError>;

    async fn install_dependencies(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, SandboxError>;

    /// Start the dev server and wait until it answers. Returns the preview URL.
    async fn start_server(&self, cancel: &CancellationToken) -> Result<String, SandboxError>;

    // ── Ad-hoc commands ────────────────────────────────────────────

    async fn execute(
        &self,
        req: ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, SandboxError>;

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Release backend resources. Safe to call more than once.
    async fn cleanup(&self) -> Result<(), SandboxError>;
}
