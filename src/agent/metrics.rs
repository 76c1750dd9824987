//! Reconciliation counters, reported as a periodic structured log event.

use crate::iptables::{IpTables, FILTER};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct Metrics {
    c2c_ticks: AtomicU64,
    c2c_failures: AtomicU64,
    last_c2c_micros: AtomicU64,
    asg_ticks: AtomicU64,
    asg_failures: AtomicU64,
    last_asg_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub c2c_ticks: u64,
    pub c2c_failures: u64,
    pub last_c2c_micros: u64,
    pub asg_ticks: u64,
    pub asg_failures: u64,
    pub last_asg_micros: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_c2c(&self, elapsed: Duration, ok: bool) {
        Self::record(&self.c2c_ticks, &self.c2c_failures, &self.last_c2c_micros, elapsed, ok);
    }

    pub fn record_asg(&self, elapsed: Duration, ok: bool) {
        Self::record(&self.asg_ticks, &self.asg_failures, &self.last_asg_micros, elapsed, ok);
    }

    fn record(ticks: &AtomicU64, failures: &AtomicU64, last: &AtomicU64, elapsed: Duration, ok: bool) {
        ticks.fetch_add(1, Ordering::Relaxed);
        if !ok {
            failures.fetch_add(1, Ordering::Relaxed);
        }
        last.store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            c2c_ticks: self.c2c_ticks.load(Ordering::Relaxed),
            c2c_failures: self.c2c_failures.load(Ordering::Relaxed),
            last_c2c_micros: self.last_c2c_micros.load(Ordering::Relaxed),
            asg_ticks: self.asg_ticks.load(Ordering::Relaxed),
            asg_failures: self.asg_failures.load(Ordering::Relaxed),
            last_asg_micros: self.last_asg_micros.load(Ordering::Relaxed),
        }
    }

    /// Log one snapshot plus the filter table's current rule count
    pub fn emit(&self, ipt: &dyn IpTables) {
        let s = self.snapshot();
        let rule_count = match ipt.rule_count(FILTER) {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "counting filter rules");
                0
            }
        };
        info!(
            c2c_ticks = s.c2c_ticks,
            c2c_failures = s.c2c_failures,
            last_c2c_micros = s.last_c2c_micros,
            asg_ticks = s.asg_ticks,
            asg_failures = s.asg_failures,
            last_asg_micros = s.last_asg_micros,
            rule_count,
            "reconciliation metrics"
        );
    }
}

/// Emit metrics every `interval` until the task is dropped
pub async fn emit_forever(metrics: Arc<Metrics>, ipt: Arc<dyn IpTables>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        metrics.emit(ipt.as_ref());
    }
}
