//! Container healthchecks.
//!
//! Runs a service's probe command inside a running replica until it passes or
//! the retries are exhausted, and records the last observed status so that
//! `service_healthy` waiters can poll it.

use crate::adapters::ContainerHandle;
use crate::error::{CompoteError, Result};
use crate::manifest::Healthcheck;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRIES: u32 = 3;

/// Parse a `<int><s|m|h>` duration. Unknown units and malformed values fall
/// back to 30s.
pub fn parse_duration(s: &str) -> Duration {
    let s = s.trim();
    let split = s.len().saturating_sub(1);
    let (digits, unit) = s.split_at(split);

    let Ok(value) = digits.parse::<u64>() else {
        return DEFAULT_INTERVAL;
    };

    match unit {
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => DEFAULT_INTERVAL,
    }
}

/// A healthcheck resolved to concrete values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthcheckSpec {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

impl HealthcheckSpec {
    /// Resolve a manifest healthcheck. Returns `None` when the check is
    /// disabled or has no test command.
    pub fn resolve(healthcheck: &Healthcheck) -> Option<Self> {
        if healthcheck.disable {
            return None;
        }

        let mut test = healthcheck.test.as_ref()?.to_args();
        // Compose-style probes lead with CMD / CMD-SHELL; the runtime execs
        // the remainder directly.
        if matches!(test.first().map(String::as_str), Some("CMD") | Some("CMD-SHELL")) {
            test.remove(0);
        }
        if test.is_empty() {
            return None;
        }

        Some(Self {
            test,
            interval: healthcheck.interval.as_deref().map(parse_duration).unwrap_or(DEFAULT_INTERVAL),
            timeout: healthcheck.timeout.as_deref().map(parse_duration).unwrap_or(DEFAULT_TIMEOUT),
            retries: healthcheck.retries.unwrap_or(DEFAULT_RETRIES).max(1),
            start_period: healthcheck
                .start_period
                .as_deref()
                .map(parse_duration)
                .unwrap_or(Duration::ZERO),
        })
    }

    /// Upper bound on how long one run of the probe loop can take.
    pub fn deadline(&self) -> Duration {
        self.start_period + self.interval * self.retries
    }
}

/// Last observed health of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Tracks per-service health and runs probe loops.
#[derive(Clone, Default)]
pub struct HealthMonitor {
    statuses: Arc<RwLock<HashMap<String, HealthState>>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last recorded status for a service.
    pub async fn status(&self, service: &str) -> HealthState {
        self.statuses.read().await.get(service).copied().unwrap_or(HealthState::Unknown)
    }

    async fn record(&self, service: &str, state: HealthState) {
        self.statuses.write().await.insert(service.to_string(), state);
    }

    /// Run the probe loop against one replica handle.
    ///
    /// Sleeps `start_period`, then execs the test up to `retries` times with
    /// `interval` between attempts. Exit code 0 is healthy; a non-zero code
    /// or exec error counts as a failure.
    #[instrument(skip(self, handle, spec), fields(service = %service))]
    pub async fn run(
        &self,
        service: &str,
        handle: Arc<dyn ContainerHandle>,
        spec: &HealthcheckSpec,
    ) -> Result<()> {
        if !spec.start_period.is_zero() {
            tokio::time::sleep(spec.start_period).await;
        }

        for attempt in 1..=spec.retries {
            match handle.exec(&spec.test, &[]).await {
                Ok(0) => {
                    info!(service = %service, attempt, "Healthcheck passed");
                    self.record(service, HealthState::Healthy).await;
                    return Ok(());
                }
                Ok(code) => {
                    debug!(service = %service, attempt, code, "Healthcheck probe failed");
                }
                Err(e) => {
                    debug!(service = %service, attempt, error = %e, "Healthcheck exec failed");
                }
            }

            if attempt < spec.retries {
                tokio::time::sleep(spec.interval).await;
            }
        }

        warn!(service = %service, retries = spec.retries, "Service is unhealthy");
        self.record(service, HealthState::Unhealthy).await;
        Err(CompoteError::Unhealthy { service: service.to_string() })
    }

    /// Block until the service's recorded status becomes healthy, up to
    /// `timeout`. An unhealthy record fails immediately.
    #[instrument(skip(self))]
    pub async fn wait_healthy(&self, service: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.status(service).await {
                HealthState::Healthy => return Ok(()),
                HealthState::Unhealthy => {
                    return Err(CompoteError::Unhealthy { service: service.to_string() })
                }
                HealthState::Unknown => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(CompoteError::HealthTimeout { service: service.to_string() });
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LogLine;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    /// Handle whose exec fails a fixed number of times before succeeding.
    struct FlakyHandle {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyHandle {
        fn new(failures: u32) -> Self {
            Self { failures_left: AtomicU32::new(failures), calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl ContainerHandle for FlakyHandle {
        fn id(&self) -> &str {
            "test"
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        async fn delete(&self) -> Result<()> {
            Ok(())
        }
        async fn wait(&self) -> Result<i64> {
            Ok(0)
        }
        async fn exec(&self, _argv: &[String], _env: &[String]) -> Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                Ok(1)
            } else {
                Ok(0)
            }
        }
        async fn logs(
            &self,
            _tail: Option<usize>,
            _follow: bool,
        ) -> Result<mpsc::Receiver<LogLine>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
        async fn is_running(&self) -> bool {
            true
        }
    }

    fn spec(retries: u32) -> HealthcheckSpec {
        HealthcheckSpec {
            test: vec!["true".to_string()],
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(1),
            retries,
            start_period: Duration::ZERO,
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s"), Duration::from_secs(5));
        assert_eq!(parse_duration("2m"), Duration::from_secs(120));
        assert_eq!(parse_duration("1h"), Duration::from_secs(3600));
        // Unknown unit and junk fall back to the 30s default.
        assert_eq!(parse_duration("10x"), Duration::from_secs(30));
        assert_eq!(parse_duration("soon"), Duration::from_secs(30));
    }

    #[test]
    fn test_resolve_defaults() {
        let hc = Healthcheck {
            test: Some(crate::manifest::Command::Args(vec![
                "CMD".to_string(),
                "true".to_string(),
            ])),
            ..Default::default()
        };
        let spec = HealthcheckSpec::resolve(&hc).unwrap();
        assert_eq!(spec.test, vec!["true"]);
        assert_eq!(spec.interval, Duration::from_secs(30));
        assert_eq!(spec.timeout, Duration::from_secs(30));
        assert_eq!(spec.retries, 3);
        assert_eq!(spec.start_period, Duration::ZERO);
    }

    #[test]
    fn test_resolve_disabled_or_empty() {
        let disabled = Healthcheck { disable: true, ..Default::default() };
        assert_eq!(HealthcheckSpec::resolve(&disabled), None);

        let empty = Healthcheck::default();
        assert_eq!(HealthcheckSpec::resolve(&empty), None);
    }

    #[tokio::test]
    async fn test_probe_passes_after_retries() {
        let monitor = HealthMonitor::new();
        let handle = Arc::new(FlakyHandle::new(2));

        monitor.run("app", handle.clone(), &spec(3)).await.unwrap();
        assert_eq!(handle.calls.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.status("app").await, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_probe_exhausts_retries() {
        let monitor = HealthMonitor::new();
        let handle = Arc::new(FlakyHandle::new(10));

        let err = monitor.run("app", handle, &spec(2)).await.unwrap_err();
        assert!(matches!(err, CompoteError::Unhealthy { .. }));
        assert_eq!(monitor.status("app").await, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_wait_healthy_sees_recorded_status() {
        let monitor = HealthMonitor::new();
        monitor.record("app", HealthState::Healthy).await;
        monitor.wait_healthy("app", Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_healthy_times_out() {
        let monitor = HealthMonitor::new();
        let err = monitor.wait_healthy("app", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, CompoteError::HealthTimeout { .. }));
    }
}
