//! Safe-mode circuit breaker.
//!
//! A scheduled probe measures backend round-trip latency into a bounded ring
//! of samples; the breaker trips on the *median* so a single slow probe does
//! not flip it. Critical errors are tracked in a trailing 60-second window.
//! Activation and deactivation are edge-triggered: repeated breaches while
//! already active produce no additional notification.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::ledger::Ledger;
use crate::logging::{json_log, obj, v_bool, v_num, v_str, warn_log};
use crate::notify::{Notification, NotificationSink};
use crate::stats::median;

pub const LATENCY_SAMPLES: usize = 20;
pub const ERROR_WINDOW_SECS: u64 = 60;

pub struct SafeMode {
    latency_threshold_ms: f64,
    error_threshold: usize,
    latencies: VecDeque<f64>,
    errors: VecDeque<u64>,
    active: bool,
    sink: Arc<dyn NotificationSink>,
}

impl SafeMode {
    pub fn new(cfg: &Config, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            latency_threshold_ms: cfg.latency_threshold_ms,
            error_threshold: cfg.error_threshold.max(1),
            latencies: VecDeque::with_capacity(LATENCY_SAMPLES),
            errors: VecDeque::new(),
            active: false,
            sink,
        }
    }

    /// One scheduled probe: a trivial backend round-trip. A failed probe is
    /// itself a critical error.
    pub fn probe_tick(&mut self, ledger: &dyn Ledger, now: u64) {
        let start = Instant::now();
        match ledger.ping() {
            Ok(()) => {
                let ms = start.elapsed().as_secs_f64() * 1000.0;
                self.record_latency(ms, now);
            }
            Err(err) => {
                warn_log(
                    "safemode",
                    obj(&[
                        ("event", v_str("probe_failed")),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                self.record_critical_error(now);
            }
        }
    }

    pub fn record_latency(&mut self, latency_ms: f64, now: u64) {
        if self.latencies.len() >= LATENCY_SAMPLES {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency_ms);
        self.reevaluate(now);
    }

    pub fn record_critical_error(&mut self, now: u64) {
        self.errors.push_back(now);
        self.reevaluate(now);
    }

    fn prune_errors(&mut self, now: u64) {
        while let Some(&oldest) = self.errors.front() {
            if now.saturating_sub(oldest) > ERROR_WINDOW_SECS {
                self.errors.pop_front();
            } else {
                break;
            }
        }
    }

    fn reevaluate(&mut self, now: u64) {
        self.prune_errors(now);
        let med = self.median_latency();
        let latency_breach = !self.latencies.is_empty() && med > self.latency_threshold_ms;
        let error_spike = self.errors.len() >= self.error_threshold;

        // Deactivation needs both clear; activation needs either breached.
        let next = if self.active {
            latency_breach || !self.errors.is_empty()
        } else {
            latency_breach || error_spike
        };

        if next != self.active {
            self.active = next;
            let reason = if latency_breach {
                "median_latency"
            } else if error_spike {
                "error_spike"
            } else {
                "recovered"
            };
            json_log(
                "safemode",
                obj(&[
                    ("event", v_str("state_change")),
                    ("active", v_bool(self.active)),
                    ("reason", v_str(reason)),
                    ("median_ms", v_num(med)),
                    ("errors_60s", v_num(self.errors.len() as f64)),
                ]),
            );
            self.sink.publish(Notification::SafeModeChange {
                active: self.active,
                reason: reason.to_string(),
            });
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn median_latency(&self) -> f64 {
        let samples: Vec<f64> = self.latencies.iter().copied().collect();
        median(&samples)
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemorySink;

    fn make(threshold_ms: f64, error_threshold: usize) -> (SafeMode, Arc<MemorySink>) {
        let mut cfg = Config::from_env();
        cfg.latency_threshold_ms = threshold_ms;
        cfg.error_threshold = error_threshold;
        let sink = Arc::new(MemorySink::new());
        (SafeMode::new(&cfg, sink.clone()), sink)
    }

    #[test]
    fn test_single_spike_does_not_trip_median() {
        let (mut sm, _) = make(500.0, 5);
        for _ in 0..19 {
            sm.record_latency(50.0, 100);
        }
        sm.record_latency(800.0, 100);
        assert!(!sm.is_active(), "median ~50ms must not trip a 500ms threshold");
        assert!(sm.median_latency() < 100.0);
    }

    #[test]
    fn test_sustained_latency_trips_and_recovers() {
        let (mut sm, sink) = make(100.0, 5);
        for _ in 0..LATENCY_SAMPLES {
            sm.record_latency(250.0, 100);
        }
        assert!(sm.is_active());
        // Edge-triggered: exactly one activation notification so far.
        let flips = sink.drain();
        assert_eq!(flips.len(), 1);

        // Fresh fast samples push the median back under threshold.
        for _ in 0..LATENCY_SAMPLES {
            sm.record_latency(20.0, 200);
        }
        assert!(!sm.is_active());
        assert_eq!(sink.drain().len(), 1, "one deactivation notification");
    }

    #[test]
    fn test_latency_ring_bounded() {
        let (mut sm, _) = make(500.0, 5);
        for i in 0..50 {
            sm.record_latency(i as f64, 100);
        }
        assert!(sm.latencies.len() <= LATENCY_SAMPLES);
    }

    #[test]
    fn test_error_spike_activates() {
        let (mut sm, _) = make(500.0, 3);
        sm.record_latency(10.0, 100);
        sm.record_critical_error(100);
        sm.record_critical_error(101);
        assert!(!sm.is_active());
        sm.record_critical_error(102);
        assert!(sm.is_active());
    }

    #[test]
    fn test_deactivation_requires_empty_error_window() {
        let (mut sm, _) = make(500.0, 2);
        sm.record_critical_error(100);
        sm.record_critical_error(101);
        assert!(sm.is_active());
        // Errors age out of the 60s window only after it fully drains.
        sm.record_latency(10.0, 140);
        assert!(sm.is_active(), "one error still inside the window keeps it active");
        sm.record_latency(10.0, 170);
        assert!(!sm.is_active(), "empty window and healthy median deactivate");
    }

    #[test]
    fn test_probe_failure_counts_as_error() {
        struct FailingLedger;
        impl Ledger for FailingLedger {
            fn all_balances(&self) -> anyhow::Result<Vec<(String, f64)>> {
                anyhow::bail!("down")
            }
            fn apply_delta(&self, _: &str, _: f64) -> anyhow::Result<f64> {
                anyhow::bail!("down")
            }
            fn ping(&self) -> anyhow::Result<()> {
                anyhow::bail!("down")
            }
        }

        let (mut sm, _) = make(500.0, 2);
        sm.probe_tick(&FailingLedger, 100);
        assert_eq!(sm.error_count(), 1);
        sm.probe_tick(&FailingLedger, 101);
        assert!(sm.is_active());
    }
}
