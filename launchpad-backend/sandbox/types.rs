use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Identity ────────────────────────────────────────────────────────

pub type EnvironmentId = String;

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Remote cloud sandbox service reached over HTTP.
    RemoteSandbox,
    /// Local workspace directory with supervised child processes.
    LocalContainer,
    /// Online-IDE project that installs and serves the code itself.
    IdeEmbed,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::RemoteSandbox => "remote_sandbox",
            BackendKind::LocalContainer => "local_container",
            BackendKind::IdeEmbed => "ide_embed",
        }
    }

    /// Parse the short names accepted in configuration.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "remote" | "remote_sandbox" | "sandbox" => Some(BackendKind::RemoteSandbox),
            "local" | "local_container" | "container" => Some(BackendKind::LocalContainer),
            "embed" | "ide_embed" | "ide" => Some(BackendKind::IdeEmbed),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Backend info ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub kind: BackendKind,
    /// Whether environments accept ad-hoc commands.
    pub supports_exec: bool,
}

// ── Metadata ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EnvironmentMetadata {
    pub project_id: String,
    pub created_at_unix_ms: i64,
}

impl EnvironmentMetadata {
    pub fn for_project(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

// ── Exec model ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    /// Run a single shell line through `sh -c`.
    pub fn shell(line: &str) -> Self {
        Self::new(vec!["sh".into(), "-c".into(), line.into()])
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Render the command as one shell line (used by backends that take a string).
    pub fn command_line(&self) -> String {
        match self.command.as_slice() {
            [sh, flag, line] if sh == "sh" && flag == "-c" => line.clone(),
            parts => parts
                .iter()
                .map(|p| shell_quote(p))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@{}".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

// ── Timeouts ────────────────────────────────────────────────────────

/// Bounds applied to long-running adapter calls.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub create: Duration,
    pub install: Duration,
    pub exec: Duration,
    pub liveness_attempts: u32,
    pub liveness_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(60),
            install: Duration::from_secs(120),
            exec: Duration::from_secs(60),
            liveness_attempts: 30,
            liveness_interval: Duration::from_secs(1),
        }
    }
}

// ── Backend configs ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RemoteSandboxConfig {
    /// Base URL of the sandbox service API.
    pub api_base_url: String,
    /// Opaque credential sent as a bearer token.
    pub api_key: Option<String>,
    /// Image/template the service boots.
    pub template: String,
    /// Directory inside the sandbox the project is mounted into.
    pub workdir: String,
    /// Port the dev server listens on inside the sandbox.
    pub port: u16,
    pub install_command: String,
    /// Dev server command; `{port}` is replaced with `port`.
    pub dev_command: String,
    /// Public address of an exposed port: `{port}`, `{id}` and `{domain}` are substituted.
    pub preview_url_template: String,
    /// Server-side lifetime requested at creation, as a backstop for leaks.
    pub lifetime: Duration,
}

impl Default for RemoteSandboxConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(), // must be set by caller
            api_key: None,
            template: "node".into(),
            workdir: "/home/user/app".into(),
            port: 3000,
            install_command: "npm install".into(),
            dev_command: "npm run dev -- --host 0.0.0.0 --port {port}".into(),
            preview_url_template: "https://{port}-{id}.{domain}".into(),
            lifetime: Duration::from_secs(45 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalContainerConfig {
    pub root_dir: PathBuf,
    pub inherit_env_allowlist: Vec<String>,
    pub install_command: Vec<String>,
    /// Dev server command; `{port}` is replaced with the allocated port.
    pub dev_command: Vec<String>,
    pub host: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub max_output_bytes: usize,
}

impl Default for LocalContainerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(""), // must be set by caller
            inherit_env_allowlist: vec![
                "PATH".into(),
                "HOME".into(),
                "LANG".into(),
                "TERM".into(),
                "NODE_OPTIONS".into(),
                "npm_config_cache".into(),
            ],
            install_command: vec!["npm".into(), "install".into()],
            dev_command: vec![
                "npm".into(),
                "run".into(),
                "dev".into(),
                "--".into(),
                "--host".into(),
                "127.0.0.1".into(),
                "--port".into(),
                "{port}".into(),
            ],
            host: "127.0.0.1".into(),
            port_range_start: 4100,
            port_range_end: 4199,
            max_output_bytes: 1024 * 1024, // 1 MB
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdeEmbedConfig {
    pub api_base_url: String,
    /// Domain the IDE serves running projects from.
    pub preview_domain: String,
    /// Public address of a defined project: `{id}` and `{domain}` are substituted.
    pub preview_url_template: String,
    pub api_token: Option<String>,
}

impl Default for IdeEmbedConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://codesandbox.io".into(),
            preview_domain: "csb.app".into(),
            preview_url_template: "https://{id}.{domain}".into(),
            api_token: None,
        }
    }
}

// ── Runtime config selector ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum BackendConfig {
    RemoteSandbox(RemoteSandboxConfig),
    LocalContainer(LocalContainerConfig),
    IdeEmbed(IdeEmbedConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::RemoteSandbox(_) => BackendKind::RemoteSandbox,
            BackendConfig::LocalContainer(_) => BackendKind::LocalContainer,
            BackendConfig::IdeEmbed(_) => BackendKind::IdeEmbed,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
