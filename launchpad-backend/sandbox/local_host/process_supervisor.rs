use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{ExecRequest, ExecResult};

/// Wraps `tokio::process::Command` with env filtering, output limits,
/// timeout and kill. Used by the local container backend.
pub struct ProcessSupervisor {
    /// Environment variables to inherit from host (allowlist).
    pub env_allowlist: Vec<String>,
    /// Maximum bytes kept per output stream.
    pub max_output_bytes: usize,
}

impl ProcessSupervisor {
    pub fn new(env_allowlist: Vec<String>, max_output_bytes: usize) -> Self {
        Self {
            env_allowlist,
            max_output_bytes,
        }
    }

    /// Build a filtered env map: only allowlisted host vars + request vars.
    fn build_env(&self, extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();
        for key in &self.env_allowlist {
            if let Ok(val) = std::env::var(key) {
                env.push((key.clone(), val));
            }
        }
        for (k, v) in extra {
            env.push((k.clone(), v.clone()));
        }
        env
    }

    fn command(
        &self,
        argv: &[String],
        working_dir: &Path,
        cwd: Option<&str>,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<Command, SandboxError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Exec("empty command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        match cwd {
            Some(dir) => cmd.current_dir(working_dir.join(dir.trim_start_matches('/'))),
            None => cmd.current_dir(working_dir),
        };
        cmd.env_clear();
        for (k, v) in self.build_env(extra_env) {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    /// Run a command to completion, capturing output.
    ///
    /// On timeout the child is killed and `timed_out` is set. On cancellation
    /// the child is killed and `Cancelled` is returned.
    pub async fn exec(
        &self,
        req: &ExecRequest,
        working_dir: &Path,
        default_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, SandboxError> {
        let mut cmd = self.command(&req.command, working_dir, req.cwd.as_deref(), &req.env)?;
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Exec(format!("spawn failed: {e}")))?;

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(collect_capped(out, self.max_output_bytes)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(collect_capped(err, self.max_output_bytes)));

        let timeout_dur = req.timeout.unwrap_or(default_timeout);
        let (timed_out, exit_code) = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(SandboxError::Cancelled);
            }
            waited = tokio::time::timeout(timeout_dur, child.wait()) => match waited {
                Ok(Ok(status)) => (false, status.code()),
                Ok(Err(e)) => return Err(SandboxError::Exec(format!("wait failed: {e}"))),
                Err(_) => {
                    let _ = child.kill().await;
                    (true, None)
                }
            },
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }

    /// Start a long-running background process. Output is discarded; the
    /// child is killed when the returned handle is dropped.
    pub fn spawn(
        &self,
        argv: &[String],
        working_dir: &Path,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<Child, SandboxError> {
        let mut cmd = self.command(argv, working_dir, None, extra_env)?;
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.spawn()
            .map_err(|e| SandboxError::Exec(format!("spawn failed: {e}")))
    }
}

async fn collect_capped<R: AsyncRead + Unpin>(reader: R, max_bytes: usize) -> String {
    let mut buf = String::new();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.len() + line.len() <= max_bytes {
                    buf.push_str(&line);
                }
            }
            Err(_) => break,
        }
    }
    buf
}
