//! Health checker (C3): a stateless HTTP prober. Holds no per-target state
//! — the tracker (C4) owns that — so one checker instance is shared freely
//! across the monitor's concurrent batch.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::Target;
use crate::util::Backoff;

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub healthy: bool,
    pub error: Option<String>,
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

pub struct HealthChecker {
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // Redirects are not followed (spec §4.3); probes must not pin
            // old backends so keep-alive is disabled per request.
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .build()
            .expect("failed to build health-check http client");
        Self { client }
    }

    /// `GET target.url()`. 2xx or 3xx is healthy; anything else — including
    /// a transport error — is unhealthy.
    pub async fn check(&self, target: &Target) -> CheckResult {
        let start = Instant::now();
        match self.client.get(target.url()).send().await {
            Ok(resp) => {
                let status = resp.status();
                CheckResult {
                    healthy: status.is_success() || status.is_redirection(),
                    error: if status.is_success() || status.is_redirection() {
                        None
                    } else {
                        Some(format!("unexpected status {status}"))
                    },
                    latency: start.elapsed(),
                }
            }
            Err(e) => CheckResult {
                healthy: false,
                error: Some(e.to_string()),
                latency: start.elapsed(),
            },
        }
    }

    /// `check` with doubling-backoff retries. `cancel` is raced against both
    /// the probe itself and the backoff sleep (spec §5: cancellation must be
    /// honored between attempts and during waits, uniformly, not left to
    /// the caller aborting the whole task). `on_retry`, if given, is called
    /// with the attempt number (starting at 1) before each retry sleep.
    pub async fn check_with_retry(
        &self,
        target: &Target,
        retry: RetryConfig,
        cancel: &CancellationToken,
        on_retry: Option<&(dyn Fn(u32) + Send + Sync)>,
    ) -> CheckResult {
        let mut backoff = Backoff::new(retry.initial_backoff, retry.max_backoff);
        let mut attempts = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return CheckResult { healthy: false, error: Some("cancelled".to_string()), latency: Duration::ZERO };
                }
                result = self.check(target) => result,
            };
            if result.healthy || attempts >= retry.max_retries {
                if !result.healthy && attempts > 0 {
                    return CheckResult {
                        error: Some(format!(
                            "health check failed after {} attempts: {}",
                            attempts + 1,
                            result.error.clone().unwrap_or_default()
                        )),
                        ..result
                    };
                }
                return result;
            }
            attempts += 1;
            if let Some(cb) = on_retry {
                cb(attempts);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return CheckResult { healthy: false, error: Some("cancelled".to_string()), latency: Duration::ZERO };
                }
                _ = tokio::time::sleep(backoff.next()) => {}
            }
        }
    }

    /// Probe every target with at most `max_concurrent` requests in flight,
    /// preserving input order in the results. Stops issuing new probes once
    /// `cancel` fires; targets not yet started are reported unhealthy.
    pub async fn check_all(&self, targets: &[Target], max_concurrent: usize, cancel: &CancellationToken) -> Vec<CheckResult> {
        use futures::stream::{self, StreamExt};

        stream::iter(targets.iter())
            .map(|target| async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        CheckResult { healthy: false, error: Some("cancelled".to_string()), latency: Duration::ZERO }
                    }
                    result = self.check(target) => result,
                }
            })
            .buffered(max_concurrent.max(1))
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(port: u16) -> Target {
        Target {
            id: "c1".to_string(),
            app: "web".to_string(),
            ip: "127.0.0.1".to_string(),
            port,
            health_path: "/healthz".to_string(),
        }
    }

    #[tokio::test]
    async fn check_reports_unhealthy_on_connection_refused() {
        let checker = HealthChecker::new(Duration::from_millis(200));
        // Port 1 is privileged/unassigned and should refuse immediately.
        let result = checker.check(&target(1)).await;
        assert!(!result.healthy);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn check_all_preserves_order() {
        let checker = HealthChecker::new(Duration::from_millis(100));
        let targets = vec![target(1), target(2), target(3)];
        let results = checker.check_all(&targets, 2, &CancellationToken::new()).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.healthy));
    }

    #[tokio::test]
    async fn check_with_retry_stops_immediately_when_cancelled() {
        let checker = HealthChecker::new(Duration::from_millis(200));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = checker
            .check_with_retry(
                &target(1),
                RetryConfig { max_retries: 5, initial_backoff: Duration::from_secs(5), max_backoff: Duration::from_secs(5) },
                &cancel,
                None,
            )
            .await;
        assert!(!result.healthy);
        assert_eq!(result.error.as_deref(), Some("cancelled"));
    }
}
