pub mod backend;
pub mod backends;
pub mod environment;
pub mod error;
pub mod liveness;
pub mod local_host;
pub mod remote_api;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use backend::ExecutionBackend;
pub use environment::Environment;
pub use error::SandboxError;
pub use types::*;

use backends::embed::IdeEmbedBackend;
use backends::local::LocalContainerBackend;
use backends::remote::RemoteSandboxBackend;

/// Build the execution backend selected in configuration.
pub fn build_backend(
    config: BackendConfig,
    timeouts: Timeouts,
) -> Result<Arc<dyn ExecutionBackend>, SandboxError> {
    match config {
        BackendConfig::RemoteSandbox(c) => {
            tracing::info!(
                api_url = %c.api_base_url,
                template = %c.template,
                "initializing remote sandbox backend"
            );
            Ok(Arc::new(RemoteSandboxBackend::new(c, timeouts)?))
        }
        BackendConfig::LocalContainer(c) => {
            tracing::info!(
                root_dir = %c.root_dir.display(),
                "initializing local container backend"
            );
            Ok(Arc::new(LocalContainerBackend::new(c, timeouts)?))
        }
        BackendConfig::IdeEmbed(c) => {
            tracing::info!(api_url = %c.api_base_url, "initializing IDE embed backend");
            Ok(Arc::new(IdeEmbedBackend::new(c, timeouts)))
        }
    }
}

/// Race `fut` against `cancel`.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, SandboxError>
where
    F: Future<Output = Result<T, SandboxError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        result = fut => result,
    }
}
