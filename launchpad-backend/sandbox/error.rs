use std::io;
use std::time::Duration;

/// Errors from execution backend operations.
///
/// Backends map their internal failures into these variants. The first six
/// are the provisioning taxonomy the environment manager reacts to; the rest
/// describe plumbing failures. `Unsupported` is the expected return for
/// operations a backend does not offer (e.g. `execute` on an IDE embed).
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("backend rejected credentials: {0}")]
    BackendAuth(String),

    #[error("backend timed out during {0}")]
    BackendTimeout(&'static str),

    #[error("mount failed at {path}: {reason}")]
    MountFailure { path: String, reason: String },

    #[error("dependency install failed: code={code:?}, stderr={stderr}")]
    InstallFailure {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("dev server not reachable after {attempts} attempts")]
    ServerStartTimeout { attempts: u32 },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("environment not found: {0}")]
    NotFound(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// Quota / "too many concurrent environments" signals.
    pub fn is_capacity(&self) -> bool {
        matches!(self, SandboxError::BackendUnavailable { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SandboxError::BackendUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        SandboxError::BackendUnavailable {
            message: message.into(),
            retry_after: None,
        }
    }
}

/// Does a backend error body look like a capacity/rate-limit rejection?
pub fn mentions_capacity(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    [
        "rate limit",
        "rate-limit",
        "too many",
        "concurrent",
        "quota",
        "capacity",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_displays_message() {
        let err = SandboxError::unavailable("too many concurrent sandboxes");
        assert_eq!(
            err.to_string(),
            "backend unavailable: too many concurrent sandboxes"
        );
        assert!(err.is_capacity());
        assert!(err.retry_after().is_none());
    }

    #[test]
    fn retry_after_only_for_capacity() {
        let err = SandboxError::BackendUnavailable {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(SandboxError::BackendTimeout("create").retry_after().is_none());
        assert!(!SandboxError::BackendAuth("bad key".into()).is_capacity());
    }

    #[test]
    fn install_failure_displays_code_and_stderr() {
        let err = SandboxError::InstallFailure {
            code: Some(1),
            stdout: "added 0 packages".into(),
            stderr: "ERESOLVE".into(),
        };
        assert_eq!(
            err.to_string(),
            "dependency install failed: code=Some(1), stderr=ERESOLVE"
        );
    }

    #[test]
    fn mount_and_start_display() {
        assert_eq!(
            SandboxError::MountFailure {
                path: "src/App.jsx".into(),
                reason: "disk full".into()
            }
            .to_string(),
            "mount failed at src/App.jsx: disk full"
        );
        assert_eq!(
            SandboxError::ServerStartTimeout { attempts: 30 }.to_string(),
            "dev server not reachable after 30 attempts"
        );
        assert_eq!(
            SandboxError::BackendTimeout("install").to_string(),
            "backend timed out during install"
        );
    }

    #[test]
    fn capacity_detection_in_bodies() {
        assert!(mentions_capacity("Rate limit exceeded"));
        assert!(mentions_capacity("You have reached the maximum number of concurrent sandboxes"));
        assert!(mentions_capacity("quota exhausted"));
        assert!(!mentions_capacity("template not found"));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: SandboxError = io_err.into();
        assert!(err.to_string().contains("file missing"));
        assert!(matches!(err, SandboxError::Io(_)));
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SandboxError>();
    }
}
