use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::middleware::AppError;

/// Sampling interval of the event-loop lag probe.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Load shedding at the front door: queries are rejected with 503 while the
/// runtime is lagging or too many queries are queued against the pool.
pub struct AdmissionControl {
    /// Lag threshold in milliseconds; 0 disables the check.
    cpu_threshold_ms: u64,
    /// Queued query cap; 0 disables the check.
    queue_limit: usize,
    /// Last sampled scheduling lag in milliseconds.
    lag_ms: Arc<AtomicU64>,
}

impl AdmissionControl {
    /// Create the control and start the background lag probe.
    pub fn start(cpu_threshold_ms: u64, queue_limit: usize) -> Arc<Self> {
        let control = Arc::new(Self {
            cpu_threshold_ms,
            queue_limit,
            lag_ms: Arc::new(AtomicU64::new(0)),
        });
        if cpu_threshold_ms > 0 {
            let lag = Arc::clone(&control.lag_ms);
            tokio::spawn(async move {
                loop {
                    let before = Instant::now();
                    tokio::time::sleep(PROBE_INTERVAL).await;
                    let overshoot = before.elapsed().saturating_sub(PROBE_INTERVAL);
                    lag.store(overshoot.as_millis() as u64, Ordering::Relaxed);
                }
            });
        }
        control
    }

    /// A control with both checks off, for tests.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            cpu_threshold_ms: 0,
            queue_limit: 0,
            lag_ms: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn current_lag(&self) -> Duration {
        Duration::from_millis(self.lag_ms.load(Ordering::Relaxed))
    }

    /// Admit or reject a request given the current queued-query depth.
    pub fn check(&self, queued_queries: usize) -> Result<(), AppError> {
        if self.cpu_threshold_ms > 0 {
            let lag = self.lag_ms.load(Ordering::Relaxed);
            if lag > self.cpu_threshold_ms {
                tracing::warn!("admission rejected: scheduling lag {}ms", lag);
                return Err(AppError::Busy(format!(
                    "server is overloaded (lag {lag}ms)"
                )));
            }
        }
        if self.queue_limit > 0 && queued_queries >= self.queue_limit {
            tracing::warn!("admission rejected: {} queued queries", queued_queries);
            return Err(AppError::Busy(format!(
                "too many queued queries ({queued_queries})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_admits_everything() {
        let control = AdmissionControl::disabled();
        assert!(control.check(0).is_ok());
        assert!(control.check(10_000).is_ok());
    }

    #[tokio::test]
    async fn test_queue_limit() {
        let control = AdmissionControl::start(0, 5);
        assert!(control.check(4).is_ok());
        assert!(control.check(5).is_err());
        assert!(matches!(control.check(6).unwrap_err(), AppError::Busy(_)));
    }

    #[tokio::test]
    async fn test_lag_threshold() {
        let control = AdmissionControl::start(200, 0);
        // Fresh probe has no lag recorded yet
        assert!(control.check(0).is_ok());
        control.lag_ms.store(500, Ordering::Relaxed);
        assert!(control.check(0).is_err());
        control.lag_ms.store(100, Ordering::Relaxed);
        assert!(control.check(0).is_ok());
    }
}
