use std::sync::Arc;

use tokio::time::timeout;
use tracing::debug;

use super::checker::{CheckError, Checker, HttpChecker, IcmpChecker, TcpChecker};
use super::types::{FailureReason, ProbeOutcome};
use crate::config::ProbeConfig;
use crate::target::{MonitoredTarget, ProbeKind};

/// Anything that can turn a target into a probe outcome.
///
/// Implementations must not fail: every fault is reported as a failed
/// outcome so one misbehaving device cannot take the scheduler down.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &MonitoredTarget) -> ProbeOutcome;
}

/// Probe executor - runs one timeout-bounded check against one device
pub struct ProbeExecutor {
    icmp_checker: Arc<dyn Checker>,
    tcp_checker: Arc<dyn Checker>,
    http_checker: Arc<dyn Checker>,
    config: ProbeConfig,
}

impl ProbeExecutor {
    /// Create an executor backed by the network checkers
    pub fn new(config: ProbeConfig) -> Result<Self, CheckError> {
        let timeout = config.timeout();
        Ok(Self::with_checkers(
            config,
            Arc::new(IcmpChecker::new(timeout)),
            Arc::new(TcpChecker),
            Arc::new(HttpChecker::new(timeout)?),
        ))
    }

    pub fn with_checkers(
        config: ProbeConfig,
        icmp_checker: Arc<dyn Checker>,
        tcp_checker: Arc<dyn Checker>,
        http_checker: Arc<dyn Checker>,
    ) -> Self {
        Self { icmp_checker, tcp_checker, http_checker, config }
    }

    fn checker_for(&self, kind: &ProbeKind) -> Arc<dyn Checker> {
        match kind {
            ProbeKind::Icmp => self.icmp_checker.clone(),
            ProbeKind::Tcp { .. } => self.tcp_checker.clone(),
            ProbeKind::Http { .. } => self.http_checker.clone(),
        }
    }
}

/// Run attempts until one succeeds, a non-retryable error shows up or attempts run out
async fn check_with_retry(
    checker: Arc<dyn Checker>,
    target: MonitoredTarget,
    config: ProbeConfig,
) -> Result<u64, CheckError> {
    let mut attempt = 1;
    loop {
        match checker.check(&target).await {
            Ok(latency) => return Ok(latency),
            Err(e) if e.is_retryable() && attempt < config.retry_attempts => {
                debug!(device_id = %target.device_id, attempt, error = %e, "Probe attempt failed, retrying");
                tokio::time::sleep(config.retry_delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait::async_trait]
impl Prober for ProbeExecutor {
    async fn probe(&self, target: &MonitoredTarget) -> ProbeOutcome {
        let device_id = target.device_id.clone();
        let budget = self.config.timeout();
        let attempts = check_with_retry(
            self.checker_for(&target.probe),
            target.clone(),
            self.config.clone(),
        );

        // Run on its own task so a panicking checker surfaces as a JoinError
        let handle = tokio::spawn(timeout(budget, attempts));

        match handle.await {
            Ok(Ok(Ok(latency))) => ProbeOutcome::success(device_id, latency),
            Ok(Ok(Err(e))) => {
                debug!(device_id = %device_id, reason = %e.reason(), error = %e, "Probe failed");
                ProbeOutcome::failure(device_id, e.reason(), e.to_string())
            }
            Ok(Err(_elapsed)) => {
                debug!(device_id = %device_id, timeout_ms = budget.as_millis() as u64, "Probe timed out");
                ProbeOutcome::failure(
                    device_id,
                    FailureReason::Timeout,
                    format!("no answer within {} ms", budget.as_millis()),
                )
            }
            Err(join_error) => {
                tracing::error!(device_id = %device_id, error = %join_error, "Probe task aborted");
                ProbeOutcome::failure(device_id, FailureReason::Internal, join_error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Sleepy;

    #[async_trait::async_trait]
    impl Checker for Sleepy {
        async fn check(&self, _target: &MonitoredTarget) -> Result<u64, CheckError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(1)
        }
    }

    struct Panicky;

    #[async_trait::async_trait]
    impl Checker for Panicky {
        async fn check(&self, _target: &MonitoredTarget) -> Result<u64, CheckError> {
            panic!("checker blew up");
        }
    }

    /// Refuses until the `succeed_on`-th call
    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait::async_trait]
    impl Checker for Flaky {
        async fn check(&self, _target: &MonitoredTarget) -> Result<u64, CheckError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(7)
            } else {
                Err(CheckError::Refused("127.0.0.1:1".into()))
            }
        }
    }

    fn executor_with(checker: Arc<dyn Checker>) -> ProbeExecutor {
        ProbeExecutor::with_checkers(ProbeConfig::default(), checker.clone(), checker.clone(), checker)
    }

    fn target() -> MonitoredTarget {
        MonitoredTarget::new("dev-1", "127.0.0.1", 5000)
    }

    #[tokio::test(start_paused = true)]
    async fn slow_checker_times_out() {
        let outcome = executor_with(Arc::new(Sleepy)).probe(&target()).await;
        assert_eq!(outcome.failure_reason().map(|f| f.reason), Some(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn panicking_checker_becomes_internal_failure() {
        let outcome = executor_with(Arc::new(Panicky)).probe(&target()).await;
        assert_eq!(outcome.failure_reason().map(|f| f.reason), Some(FailureReason::Internal));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_attempts_are_retried() {
        let flaky = Arc::new(Flaky { calls: AtomicU32::new(0), succeed_on: 3 });
        let outcome = executor_with(flaky.clone()).probe(&target()).await;
        assert!(outcome.is_success());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_configured_attempts() {
        let flaky = Arc::new(Flaky { calls: AtomicU32::new(0), succeed_on: 10 });
        let outcome = executor_with(flaky.clone()).probe(&target()).await;
        assert_eq!(
            outcome.failure_reason().map(|f| f.reason),
            Some(FailureReason::ConnectionRefused)
        );
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn tcp_probe_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let executor = ProbeExecutor::new(ProbeConfig::default()).unwrap();

        let outcome = executor
            .probe(&target().with_probe(ProbeKind::Tcp { port }))
            .await;
        assert!(outcome.is_success());
        assert!(outcome.latency_ms().is_some());
    }
}
