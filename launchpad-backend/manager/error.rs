use std::time::Duration;

use crate::sandbox::SandboxError;

/// Errors surfaced to callers of the environment manager.
///
/// Every variant renders a message fit for direct display.
#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("no files to preview")]
    EmptyFileSet,

    #[error("capacity limit reached: cleaned up {cleaned} environment(s), please retry shortly")]
    BackendUnavailable {
        cleaned: usize,
        retry_after: Duration,
        message: String,
    },

    #[error("no environment for project {0}")]
    UnknownProject(String),

    #[error("environment was replaced or torn down before it became ready")]
    Superseded,

    #[error("environment manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Backend(#[from] SandboxError),
}

impl ProvisionError {
    /// Message shown to end users.
    pub fn user_message(&self) -> String {
        match self {
            ProvisionError::Backend(e) => match e {
                SandboxError::BackendAuth(_) => {
                    "preview backend rejected our credentials".to_string()
                }
                SandboxError::BackendTimeout(step) => {
                    format!("preview backend timed out during {step}, please retry")
                }
                SandboxError::InstallFailure { stderr, .. } => {
                    let tail = tail_lines(stderr, 5);
                    if tail.is_empty() {
                        "installing dependencies failed".to_string()
                    } else {
                        format!("installing dependencies failed:\n{tail}")
                    }
                }
                SandboxError::ServerStartTimeout { .. } => {
                    "dev server did not come up in time".to_string()
                }
                other => other.to_string(),
            },
            other => other.to_string(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProvisionError::BackendUnavailable { retry_after, .. } => Some(*retry_after),
            ProvisionError::Backend(e) => e.retry_after(),
            _ => None,
        }
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
