use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::manager::ManagerConfig;
use crate::providers::{
    AnthropicAdapter, OllamaAdapter, OpenAiAdapter, ProviderAdapter, ProviderCaller,
};
use crate::sandbox::{
    BackendConfig, BackendKind, IdeEmbedConfig, LocalContainerConfig, RemoteSandboxConfig,
    Timeouts,
};

/// Server configuration loaded from environment variables.
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub backend: BackendConfig,
    pub timeouts: Timeouts,
    pub manager: ManagerConfig,
    pub providers: Vec<ProviderSettings>,
    pub provider_max_attempts: usize,
    pub provider_retry_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl ProviderSettings {
    pub fn adapter(&self) -> Arc<dyn ProviderAdapter> {
        let (base, key, model) = (self.base_url.clone(), self.api_key.clone(), self.model.clone());
        match self.kind {
            ProviderKind::OpenAi => Arc::new(OpenAiAdapter::new(base, key, model)),
            ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(base, key, model)),
            ProviderKind::Ollama => Arc::new(OllamaAdapter::new(base, model)),
        }
    }
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from a key lookup (as env vars would provide).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let port = get("PORT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(8081);
        let sentry_dsn = get("SENTRY_DSN");
        let environment = get("ENVIRONMENT").unwrap_or_else(|| "local".to_string());

        let kind = match get("LAUNCHPAD_BACKEND") {
            None => BackendKind::LocalContainer,
            Some(raw) => match BackendKind::parse(&raw) {
                Some(kind) => kind,
                None => bail!("LAUNCHPAD_BACKEND must be remote, local or embed, got {raw:?}"),
            },
        };

        let backend = match kind {
            BackendKind::RemoteSandbox => {
                let mut c = RemoteSandboxConfig {
                    api_base_url: get("REMOTE_SANDBOX_API_URL").unwrap_or_default(),
                    api_key: get("REMOTE_SANDBOX_API_KEY"),
                    ..RemoteSandboxConfig::default()
                };
                if let Some(template) = get("REMOTE_SANDBOX_TEMPLATE") {
                    c.template = template;
                }
                BackendConfig::RemoteSandbox(c)
            }
            BackendKind::LocalContainer => {
                let mut c = LocalContainerConfig {
                    root_dir: get("LOCAL_SANDBOX_ROOT")
                        .map(PathBuf::from)
                        .unwrap_or_else(default_local_root),
                    ..LocalContainerConfig::default()
                };
                if let Some(cmd) = get("LOCAL_INSTALL_COMMAND") {
                    c.install_command = split_command(&cmd);
                }
                if let Some(cmd) = get("LOCAL_DEV_COMMAND") {
                    c.dev_command = split_command(&cmd);
                }
                BackendConfig::LocalContainer(c)
            }
            BackendKind::IdeEmbed => {
                let mut c = IdeEmbedConfig {
                    api_token: get("IDE_EMBED_API_TOKEN"),
                    ..IdeEmbedConfig::default()
                };
                if let Some(url) = get("IDE_EMBED_API_URL") {
                    c.api_base_url = url;
                }
                if let Some(domain) = get("IDE_EMBED_PREVIEW_DOMAIN") {
                    c.preview_domain = domain;
                }
                BackendConfig::IdeEmbed(c)
            }
        };

        let timeouts = Timeouts {
            install: Duration::from_secs(number("INSTALL_TIMEOUT_SECS", 120)),
            exec: Duration::from_secs(number("EXEC_TIMEOUT_SECS", 60)),
            liveness_attempts: number("LIVENESS_ATTEMPTS", 30).clamp(1, u32::MAX as u64) as u32,
            liveness_interval: Duration::from_millis(number("LIVENESS_INTERVAL_MS", 1000)),
            ..Timeouts::default()
        };

        let manager = ManagerConfig {
            max_environments: number("MAX_ENVIRONMENTS", 2).max(1) as usize,
            max_age: Duration::from_secs(number("ENVIRONMENT_MAX_AGE_SECS", 1800)),
            sweep_interval: Duration::from_secs(number("SWEEP_INTERVAL_SECS", 300).max(1)),
            capacity_cooldown: Duration::from_secs(number("CAPACITY_COOLDOWN_SECS", 10)),
            teardown_timeout: Duration::from_secs(number("TEARDOWN_TIMEOUT_SECS", 15).max(1)),
        };

        let mut providers = Vec::new();
        if let Some(api_key) = get("OPENAI_API_KEY") {
            providers.push(ProviderSettings {
                kind: ProviderKind::OpenAi,
                base_url: get("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                api_key,
                model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            });
        }
        if let Some(api_key) = get("ANTHROPIC_API_KEY") {
            providers.push(ProviderSettings {
                kind: ProviderKind::Anthropic,
                base_url: get("ANTHROPIC_BASE_URL")
                    .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
                api_key,
                model: get("ANTHROPIC_MODEL")
                    .unwrap_or_else(|| "claude-3-5-haiku-latest".to_string()),
            });
        }
        if let Some(base_url) = get("OLLAMA_BASE_URL") {
            providers.push(ProviderSettings {
                kind: ProviderKind::Ollama,
                base_url,
                api_key: String::new(),
                model: get("OLLAMA_MODEL").unwrap_or_else(|| "llama3.1".to_string()),
            });
        }

        Ok(Config {
            port,
            sentry_dsn,
            environment,
            backend,
            timeouts,
            manager,
            providers,
            provider_max_attempts: number("PROVIDER_MAX_ATTEMPTS", 5) as usize,
            provider_retry_delay: Duration::from_millis(number("PROVIDER_RETRY_DELAY_MS", 1000)),
        })
    }

    pub fn provider_caller(&self) -> ProviderCaller {
        ProviderCaller::new(self.providers.iter().map(ProviderSettings::adapter).collect())
            .with_max_attempts(self.provider_max_attempts)
            .with_retry_delay(self.provider_retry_delay)
    }
}

fn default_local_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".launchpad")
        .join("environments")
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(String::from).collect()
}
