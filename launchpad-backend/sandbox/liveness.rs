//! Bounded polling used by `start_server` implementations.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::error::SandboxError;
use super::types::Timeouts;

#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    pub attempts: u32,
    pub interval: Duration,
    /// Per-probe request timeout.
    pub probe_timeout: Duration,
}

impl From<&Timeouts> for LivenessPolicy {
    fn from(t: &Timeouts) -> Self {
        Self {
            attempts: t.liveness_attempts,
            interval: t.liveness_interval,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Run `probe` until it reports live, at most `policy.attempts` times with
/// `policy.interval` between attempts. Returns the attempt that succeeded.
pub async fn poll_until_live<F, Fut>(
    policy: &LivenessPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<u32, SandboxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=policy.attempts {
        let live = tokio::select! {
            _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
            live = probe() => live,
        };
        if live {
            return Ok(attempt);
        }
        if attempt < policy.attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    }
    Err(SandboxError::ServerStartTimeout {
        attempts: policy.attempts,
    })
}

/// Any answer below 500 counts as live; proxies report 502/503 while the
/// dev server is still booting.
pub async fn http_probe(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match client.get(url).timeout(timeout).send().await {
        Ok(resp) => !resp.status().is_server_error(),
        Err(_) => false,
    }
}

pub async fn wait_for_http(
    client: &reqwest::Client,
    url: &str,
    policy: &LivenessPolicy,
    cancel: &CancellationToken,
) -> Result<(), SandboxError> {
    let started = tokio::time::Instant::now();
    let attempt =
        poll_until_live(policy, cancel, || http_probe(client, url, policy.probe_timeout)).await?;
    tracing::info!(
        url = %url,
        attempt,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "dev server is reachable"
    );
    Ok(())
}
