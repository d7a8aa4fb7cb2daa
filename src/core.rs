//! Process-level wiring of the engines.
//!
//! `EconomyCore` owns one instance of each engine behind its own lock (the
//! engines never share a global lock) and exposes the guarded trade path and
//! the read surface consumed by bank/loan/UI layers. The background loops in
//! `main` drive the `*_tick` methods; a failure in one tick path never stops
//! the others.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::events::{EndedEvent, EventEngine, EventKind, EventStatistics};
use crate::inflation::{CycleForecast, EconomicSnapshot, InflationEngine};
use crate::ledger::Ledger;
use crate::logging::{error_log, obj, v_str};
use crate::market::{ItemQuote, PricingEngine, TradeSide, TrendingItem};
use crate::notify::NotificationSink;
use crate::ratelimit::RateLimiter;
use crate::safemode::SafeMode;

/// Result of a guarded trade attempt. Rejections are normal negative
/// results, not errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TradeOutcome {
    Executed { price: f64 },
    RateLimited,
    SafeMode,
}

/// The stabilized outputs external consumers read.
#[derive(Debug, Clone, Serialize)]
pub struct EconomyReadout {
    pub cycle: String,
    pub cycle_description: String,
    pub health: f64,
    pub inflation_rate: f64,
    pub velocity: f64,
    pub total_money: f64,
    pub average_balance: f64,
    pub gini: f64,
    pub market_activity: f64,
    pub active_events: usize,
    pub safe_mode: bool,
    pub items: Vec<ItemQuote>,
}

pub struct EconomyCore {
    market: Mutex<PricingEngine>,
    inflation: Mutex<InflationEngine>,
    events: Mutex<EventEngine>,
    safemode: Mutex<SafeMode>,
    limiter: RateLimiter,
    ledger: Arc<dyn Ledger>,
}

impl EconomyCore {
    /// `items` is the tradable registry: (name, category, base price).
    pub fn new(
        cfg: Config,
        ledger: Arc<dyn Ledger>,
        sink: Arc<dyn NotificationSink>,
        items: &[(String, String, f64)],
    ) -> Self {
        let mut market = PricingEngine::new(cfg.clone(), sink.clone());
        let mut categories: Vec<String> = Vec::new();
        for (name, category, base) in items {
            market.register_item(name, category, *base);
            if !categories.contains(category) {
                categories.push(category.clone());
            }
        }
        Self {
            market: Mutex::new(market),
            inflation: Mutex::new(InflationEngine::new(cfg.clone(), sink.clone())),
            events: Mutex::new(EventEngine::new(cfg.clone(), categories, sink.clone())),
            safemode: Mutex::new(SafeMode::new(&cfg, sink)),
            limiter: RateLimiter::new(cfg.rate_cap_per_sec),
            ledger,
        }
    }

    /// Guarded mutating entry point: rate limit first, then the safe-mode
    /// gate, then the pricing engine.
    pub fn trade(
        &self,
        actor: &str,
        item: &str,
        side: TradeSide,
        qty: f64,
        now: u64,
    ) -> Result<TradeOutcome> {
        let action = match side {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        };
        if !self.limiter.allow(actor, action, now) {
            return Ok(TradeOutcome::RateLimited);
        }
        if self.safemode.lock().expect("safemode lock poisoned").is_active() {
            return Ok(TradeOutcome::SafeMode);
        }
        let price = self
            .market
            .lock()
            .expect("market lock poisoned")
            .record_trade(item, side, qty, now)?;
        Ok(TradeOutcome::Executed { price })
    }

    /// Market decay tick; returns the post-decay quotes for persistence.
    pub fn decay_tick(&self, now: u64) -> Vec<ItemQuote> {
        let mut market = self.market.lock().expect("market lock poisoned");
        market.decay_tick(now);
        market.quotes(now)
    }

    /// Inflation sampling tick. A failed backend read is recorded as a
    /// critical error and the previous snapshot stays authoritative.
    pub fn sample_tick(&self, now: u64) -> Option<EconomicSnapshot> {
        let shock = self.events.lock().expect("events lock poisoned").shock_cycle();
        let turnover = self.market.lock().expect("market lock poisoned").turnover(now);
        let result = self
            .inflation
            .lock()
            .expect("inflation lock poisoned")
            .sample(self.ledger.as_ref(), turnover, shock, now);
        match result {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                error_log(
                    "inflation",
                    obj(&[
                        ("event", v_str("sample_failed")),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                self.safemode
                    .lock()
                    .expect("safemode lock poisoned")
                    .record_critical_error(now);
                None
            }
        }
    }

    /// Event engine tick: expire, maybe start, republish the modifier set
    /// to pricing as one whole replacement. Returns ended events for
    /// archiving.
    pub fn event_tick(&self, now: u64) -> Vec<EndedEvent> {
        let (cycle, health) = {
            let inflation = self.inflation.lock().expect("inflation lock poisoned");
            (inflation.current_cycle(), inflation.health())
        };
        let (ended, modifiers) = {
            let mut events = self.events.lock().expect("events lock poisoned");
            let ended = events.tick(cycle, health, now);
            (ended, events.modifier_set())
        };
        self.market
            .lock()
            .expect("market lock poisoned")
            .set_modifiers(modifiers);
        ended
    }

    /// Safe-mode probe tick; also prunes idle rate-limit buckets.
    pub fn probe_tick(&self, now: u64) {
        self.safemode
            .lock()
            .expect("safemode lock poisoned")
            .probe_tick(self.ledger.as_ref(), now);
        self.limiter.prune(now, 300);
    }

    /// Explicit event start, used by admin/command surfaces. Fails when the
    /// modifier category is occupied.
    pub fn start_event(&self, kind: EventKind, duration_secs: Option<u64>, now: u64) -> Result<u64> {
        let (id, modifiers) = {
            let mut events = self.events.lock().expect("events lock poisoned");
            let id = events.start_event(kind, duration_secs, now)?;
            (id, events.modifier_set())
        };
        self.market
            .lock()
            .expect("market lock poisoned")
            .set_modifiers(modifiers);
        Ok(id)
    }

    pub fn force_end_event(&self, id: u64, now: u64) -> Result<EndedEvent> {
        let ended = self
            .events
            .lock()
            .expect("events lock poisoned")
            .force_end(id, now)?;
        let modifiers = self.events.lock().expect("events lock poisoned").modifier_set();
        self.market
            .lock()
            .expect("market lock poisoned")
            .set_modifiers(modifiers);
        Ok(ended)
    }

    pub fn safe_mode_active(&self) -> bool {
        self.safemode.lock().expect("safemode lock poisoned").is_active()
    }

    pub fn record_critical_error(&self, now: u64) {
        self.safemode
            .lock()
            .expect("safemode lock poisoned")
            .record_critical_error(now);
    }

    /// Callers that time their own backend calls feed the measurements into
    /// the breaker's latency ring here.
    pub fn record_backend_latency(&self, latency_ms: f64, now: u64) {
        self.safemode
            .lock()
            .expect("safemode lock poisoned")
            .record_latency(latency_ms, now);
    }

    pub fn forecast(&self, horizon_secs: u64) -> CycleForecast {
        self.inflation
            .lock()
            .expect("inflation lock poisoned")
            .forecast(horizon_secs)
    }

    pub fn event_statistics(&self) -> EventStatistics {
        self.events.lock().expect("events lock poisoned").statistics()
    }

    pub fn trending_items(&self, limit: usize, now: u64) -> Vec<TrendingItem> {
        self.market
            .lock()
            .expect("market lock poisoned")
            .trending_items(limit, now)
    }

    pub fn wealth_percentile(&self, balance: f64) -> f64 {
        self.inflation
            .lock()
            .expect("inflation lock poisoned")
            .wealth_percentile(balance)
    }

    pub fn readout(&self, now: u64) -> EconomyReadout {
        let market = self.market.lock().expect("market lock poisoned");
        let inflation = self.inflation.lock().expect("inflation lock poisoned");
        let events = self.events.lock().expect("events lock poisoned");
        let snapshot = inflation.current_snapshot();
        let cycle = inflation.current_cycle();
        EconomyReadout {
            cycle: cycle.as_str().to_string(),
            cycle_description: cycle.description().to_string(),
            health: inflation.health(),
            inflation_rate: inflation.inflation_rate(),
            velocity: inflation.velocity(),
            total_money: snapshot.map(|s| s.total_money).unwrap_or(0.0),
            average_balance: snapshot.map(|s| s.average_balance).unwrap_or(0.0),
            gini: snapshot.map(|s| s.gini).unwrap_or(0.0),
            market_activity: market.market_activity(now),
            active_events: events.active_count(),
            safe_mode: self.safe_mode_active(),
            items: market.quotes(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::notify::MemorySink;

    fn make_core() -> (Arc<EconomyCore>, Arc<MemoryLedger>) {
        let mut cfg = Config::from_env();
        cfg.rate_cap_per_sec = 5;
        cfg.event_start_chance = 0.0; // only explicit starts in these tests
        let ledger = Arc::new(MemoryLedger::with_balances(&[("alice", 1000.0), ("bob", 500.0)]));
        let sink = Arc::new(MemorySink::new());
        let core = EconomyCore::new(
            cfg,
            ledger.clone(),
            sink,
            &[
                ("iron".to_string(), "ores".to_string(), 100.0),
                ("bread".to_string(), "food".to_string(), 10.0),
            ],
        );
        (Arc::new(core), ledger)
    }

    #[test]
    fn test_trade_path_rate_limited_after_cap() {
        let (core, _) = make_core();
        for _ in 0..5 {
            let outcome = core.trade("alice", "iron", TradeSide::Sell, 1.0, 100).unwrap();
            assert!(matches!(outcome, TradeOutcome::Executed { .. }));
        }
        let sixth = core.trade("alice", "iron", TradeSide::Sell, 1.0, 100).unwrap();
        assert_eq!(sixth, TradeOutcome::RateLimited);
        let next_second = core.trade("alice", "iron", TradeSide::Sell, 1.0, 101).unwrap();
        assert!(matches!(next_second, TradeOutcome::Executed { .. }));
    }

    #[test]
    fn test_trade_path_blocked_in_safe_mode() {
        let (core, _) = make_core();
        // Enough critical errors to trip the breaker.
        for i in 0..5 {
            core.record_critical_error(100 + i);
        }
        assert!(core.safe_mode_active());
        let outcome = core.trade("alice", "iron", TradeSide::Buy, 1.0, 105).unwrap();
        assert_eq!(outcome, TradeOutcome::SafeMode);
    }

    #[test]
    fn test_readout_after_sampling() {
        let (core, _) = make_core();
        core.sample_tick(1000);
        let readout = core.readout(1000);
        assert!((readout.total_money - 1500.0).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&readout.health));
        assert!((0.0..=1.0).contains(&readout.gini));
        assert_eq!(readout.items.len(), 2);
        assert!(!readout.safe_mode);
        assert!(!readout.cycle_description.is_empty());
    }

    #[test]
    fn test_sample_tick_survives_backend_outage() {
        struct DownLedger;
        impl crate::ledger::Ledger for DownLedger {
            fn all_balances(&self) -> Result<Vec<(String, f64)>> {
                anyhow::bail!("down")
            }
            fn apply_delta(&self, _: &str, _: f64) -> Result<f64> {
                anyhow::bail!("down")
            }
            fn ping(&self) -> Result<()> {
                anyhow::bail!("down")
            }
        }

        let cfg = Config::from_env();
        let sink = Arc::new(MemorySink::new());
        let core = EconomyCore::new(cfg, Arc::new(DownLedger), sink, &[]);
        assert!(core.sample_tick(1000).is_none());
        // The failure registered with the breaker instead of crashing.
        assert_eq!(
            core.safemode.lock().unwrap().error_count(),
            1
        );
    }

    #[test]
    fn test_event_tick_feeds_pricing_modifiers() {
        let (core, _) = make_core();
        {
            let mut events = core.events.lock().unwrap();
            events
                .start_event(crate::events::EventKind::SpeculativeBubble, Some(600), 1000)
                .unwrap();
        }
        let organic = core.market.lock().unwrap().prices("iron").unwrap();
        core.event_tick(1000);
        let perturbed = core.market.lock().unwrap().prices("iron").unwrap();
        assert!(perturbed.0 > organic.0, "bubble must lift the effective buy price");

        // Expiry withdraws the modifier on a later tick.
        core.event_tick(2000);
        let restored = core.market.lock().unwrap().prices("iron").unwrap();
        assert_eq!(restored, organic);
    }
}
