//! Liveness
//!
//! [`HealthMonitor`] probes the ledger store and the broker on an interval.
//! Each failed round doubles the delay before the next one (capped at
//! `max_backoff`); a success resets it. Reaching `failure_threshold`
//! consecutive failures marks the process unhealthy and ends the monitor with
//! [`HealthError::ThresholdExceeded`], which the runner treats as fatal.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::HealthSettings;
use crate::queue::Broker;
use crate::shutdown::ShutdownSignal;
use crate::store::LedgerStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("{failures} consecutive health checks failed, last error: {last_error}")]
    ThresholdExceeded { failures: u32, last_error: String },
}

/// Liveness flag read by `GET /isalive`
#[derive(Debug, Clone)]
pub struct HealthState {
    healthy: Arc<AtomicBool>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

/// A dependency the monitor can ping
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), String>;
}

pub struct LedgerProbe(pub Arc<dyn LedgerStore>);

#[async_trait]
impl HealthProbe for LedgerProbe {
    fn name(&self) -> &str {
        "ledger"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.ping().await.map_err(|e| e.to_string())
    }
}

pub struct BrokerProbe(pub Arc<dyn Broker>);

#[async_trait]
impl HealthProbe for BrokerProbe {
    fn name(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.ping().await.map_err(|e| e.to_string())
    }
}

pub struct HealthMonitor {
    probes: Vec<Arc<dyn HealthProbe>>,
    interval: Duration,
    max_backoff: Duration,
    failure_threshold: u32,
    state: HealthState,
}

impl HealthMonitor {
    pub fn new(settings: &HealthSettings, state: HealthState) -> Self {
        Self {
            probes: Vec::new(),
            interval: Duration::from_millis(settings.interval_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            failure_threshold: settings.failure_threshold.max(1),
            state,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn state(&self) -> &HealthState {
        &self.state
    }

    /// Ping every probe once; the first failure wins
    pub async fn check_once(&self) -> Result<(), String> {
        for probe in &self.probes {
            probe
                .check()
                .await
                .map_err(|e| format!("{}: {}", probe.name(), e))?;
        }
        Ok(())
    }

    /// Delay before the next round after `failures` consecutive failures
    pub fn next_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.interval;
        }
        let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
        self.interval
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Probe until shutdown or until the failure threshold is reached
    pub async fn run(&self, shutdown: &ShutdownSignal) -> Result<(), HealthError> {
        info!(
            probes = self.probes.len(),
            interval_ms = self.interval.as_millis() as u64,
            failure_threshold = self.failure_threshold,
            "Health monitor started"
        );

        let mut failures = 0u32;
        while !shutdown.is_shutdown_requested() {
            match self.check_once().await {
                Ok(()) => {
                    if failures > 0 {
                        info!(failures, "Dependencies recovered");
                    }
                    failures = 0;
                    self.state.set_healthy(true);
                    debug!("Health check passed");
                }
                Err(e) => {
                    failures += 1;
                    warn!(failures, error = %e, "Health check failed");
                    if failures >= self.failure_threshold {
                        self.state.set_healthy(false);
                        error!(failures, error = %e, "Health check failure threshold reached");
                        return Err(HealthError::ThresholdExceeded {
                            failures,
                            last_error: e,
                        });
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.next_delay(failures)) => {}
                _ = shutdown.wait() => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryBroker;
    use crate::store::InMemoryLedger;

    fn settings(interval_ms: u64, max_backoff_ms: u64, failure_threshold: u32) -> HealthSettings {
        HealthSettings {
            interval_ms,
            max_backoff_ms,
            failure_threshold,
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let monitor = HealthMonitor::new(&settings(100, 1000, 5), HealthState::new());
        assert_eq!(monitor.next_delay(0), Duration::from_millis(100));
        assert_eq!(monitor.next_delay(1), Duration::from_millis(200));
        assert_eq!(monitor.next_delay(2), Duration::from_millis(400));
        assert_eq!(monitor.next_delay(4), Duration::from_millis(1000));
        assert_eq!(monitor.next_delay(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_check_once_names_failing_probe() {
        let ledger = InMemoryLedger::new();
        let broker = Arc::new(InMemoryBroker::new());
        let monitor = HealthMonitor::new(&settings(10, 10, 1), HealthState::new())
            .with_probe(Arc::new(LedgerProbe(Arc::new(ledger.clone()))))
            .with_probe(Arc::new(BrokerProbe(broker.clone())));

        assert!(monitor.check_once().await.is_ok());

        broker.set_available(false);
        let err = monitor.check_once().await.unwrap_err();
        assert!(err.starts_with("broker:"), "{}", err);
    }

    #[tokio::test]
    async fn test_threshold_marks_unhealthy() {
        let ledger = InMemoryLedger::new();
        ledger.set_available(false);
        let state = HealthState::new();
        let monitor = HealthMonitor::new(&settings(1, 4, 3), state.clone())
            .with_probe(Arc::new(LedgerProbe(Arc::new(ledger))));

        let shutdown = ShutdownSignal::new();
        let result = tokio::time::timeout(Duration::from_secs(2), monitor.run(&shutdown))
            .await
            .unwrap();

        assert!(matches!(
            result,
            Err(HealthError::ThresholdExceeded { failures: 3, .. })
        ));
        assert!(!state.is_healthy());
    }

    #[tokio::test]
    async fn test_shutdown_stops_healthy_monitor() {
        let state = HealthState::new();
        let monitor = HealthMonitor::new(&settings(5, 5, 3), state.clone())
            .with_probe(Arc::new(LedgerProbe(Arc::new(InMemoryLedger::new()))));
        let shutdown = Arc::new(ShutdownSignal::new());

        let stopper = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                shutdown.request_shutdown();
            })
        };

        let result = tokio::time::timeout(Duration::from_secs(2), monitor.run(&shutdown))
            .await
            .unwrap();
        stopper.await.unwrap();

        assert!(result.is_ok());
        assert!(state.is_healthy());
    }
}
