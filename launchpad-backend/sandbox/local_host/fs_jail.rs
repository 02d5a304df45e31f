use std::path::{Component, Path, PathBuf};

use crate::sandbox::error::SandboxError;

/// Workspace directory for one local environment.
///
/// Every write is validated to stay under the workspace root. This is path
/// validation only, not a chroot.
pub struct FsJail {
    root: PathBuf,
}

impl FsJail {
    /// Create a jail rooted at `root`, creating the directory if needed.
    pub fn create(root: PathBuf) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&root).map_err(|e| {
            SandboxError::Backend(format!(
                "failed to create workspace dir {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a project-relative path to a host path inside the root.
    pub fn resolve(&self, rel_path: &str) -> Result<PathBuf, SandboxError> {
        let rel = Path::new(rel_path);
        let mut normalized = PathBuf::new();
        for component in rel.components() {
            match component {
                Component::Normal(seg) => normalized.push(seg),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxError::MountFailure {
                            path: rel_path.to_string(),
                            reason: "path escapes workspace".into(),
                        });
                    }
                }
                Component::Prefix(_) => {
                    return Err(SandboxError::MountFailure {
                        path: rel_path.to_string(),
                        reason: "path prefixes are not allowed".into(),
                    });
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(SandboxError::MountFailure {
                path: rel_path.to_string(),
                reason: "empty path".into(),
            });
        }
        Ok(self.root.join(normalized))
    }

    /// Write `content` at `rel_path`, creating parent directories.
    pub async fn write_file(&self, rel_path: &str, content: &str) -> Result<(), SandboxError> {
        let path = self.resolve(rel_path)?;
        let mount_err = |e: std::io::Error| SandboxError::MountFailure {
            path: rel_path.to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(mount_err)?;
        }
        tokio::fs::write(&path, content).await.map_err(mount_err)
    }

    /// Remove the entire workspace directory.
    pub async fn destroy(&self) -> Result<(), SandboxError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
