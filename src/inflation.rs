//! Inflation and cycle intelligence.
//!
//! On each scheduled sampling tick the engine reads every actor balance in
//! one pass, derives total money, Gini, velocity, inflation and a 0..1
//! health score, then classifies the economy into a discrete cycle with
//! hysteresis so the classification never oscillates on a noisy boundary.
//! When health is critical and wealth concentration is extreme it applies a
//! one-time wealth tax, guarded by a cooldown.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::config::{Config, ForecastMode};
use crate::ledger::Ledger;
use crate::logging::{json_log, obj, v_num, v_str};
use crate::notify::{Notification, NotificationSink};
use crate::stats::linear_slope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EconomicCycle {
    Recession,
    Stagnation,
    Growth,
    Boom,
}

impl EconomicCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            EconomicCycle::Recession => "recession",
            EconomicCycle::Stagnation => "stagnation",
            EconomicCycle::Growth => "growth",
            EconomicCycle::Boom => "boom",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            EconomicCycle::Recession => "Contracting economy, depressed prices and activity",
            EconomicCycle::Stagnation => "Flat economy, weak circulation",
            EconomicCycle::Growth => "Healthy expansion, stable prices",
            EconomicCycle::Boom => "Overheated expansion, speculative pricing",
        }
    }

    fn rank(self) -> i8 {
        match self {
            EconomicCycle::Recession => 0,
            EconomicCycle::Stagnation => 1,
            EconomicCycle::Growth => 2,
            EconomicCycle::Boom => 3,
        }
    }

    fn from_rank(rank: i8) -> Self {
        match rank {
            i8::MIN..=0 => EconomicCycle::Recession,
            1 => EconomicCycle::Stagnation,
            2 => EconomicCycle::Growth,
            _ => EconomicCycle::Boom,
        }
    }

    /// One step toward `target`; cycles never skip states organically.
    fn step_toward(self, target: EconomicCycle) -> EconomicCycle {
        let delta = (target.rank() - self.rank()).signum();
        EconomicCycle::from_rank(self.rank() + delta)
    }
}

/// Immutable aggregate state produced by one sampling pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EconomicSnapshot {
    pub total_money: f64,
    pub average_balance: f64,
    pub gini: f64,
    pub velocity: f64,
    pub inflation_rate: f64,
    pub health: f64,
    pub taken_at: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CycleForecast {
    pub predicted: EconomicCycle,
    pub confidence: f64,
    pub horizon_secs: u64,
}

/// Gini coefficient over a balance distribution. Negative balances (debt)
/// are treated as zero holdings for the distribution.
pub fn gini(balances: &[f64]) -> f64 {
    let mut sorted: Vec<f64> = balances.iter().map(|b| b.max(0.0)).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = sorted.iter().sum();
    if sum <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, b)| (i + 1) as f64 * b)
        .sum();
    let nf = n as f64;
    ((2.0 * weighted) / (nf * sum) - (nf + 1.0) / nf).clamp(0.0, 1.0)
}

pub struct InflationEngine {
    cfg: Config,
    history: VecDeque<EconomicSnapshot>,
    current: Option<EconomicSnapshot>,
    cycle: EconomicCycle,
    /// Candidate next step and how many consecutive ticks it has held.
    pending: Option<(EconomicCycle, u32)>,
    last_tax_at: Option<u64>,
    /// Sorted balances from the last sampling pass, for percentile lookups.
    sorted_balances: Vec<f64>,
    sink: Arc<dyn NotificationSink>,
}

impl InflationEngine {
    pub fn new(cfg: Config, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            cfg,
            history: VecDeque::new(),
            current: None,
            cycle: EconomicCycle::Growth,
            pending: None,
            last_tax_at: None,
            sorted_balances: Vec::new(),
            sink,
        }
    }

    /// One scheduled sampling tick. `turnover` is the pricing engine's
    /// traded notional inside the velocity window; `shock` is the event
    /// engine's forced cycle, if a shock event is live. The snapshot used
    /// for the policy decision is the snapshot produced by this same read
    /// pass, so policy never acts on stale aggregates.
    pub fn sample(
        &mut self,
        ledger: &dyn Ledger,
        turnover: f64,
        shock: Option<EconomicCycle>,
        now: u64,
    ) -> Result<EconomicSnapshot> {
        let balances = ledger.all_balances()?;
        let raw: Vec<f64> = balances.iter().map(|(_, b)| *b).collect();

        let total_money: f64 = raw.iter().copied().filter(|b| *b > 0.0).sum();
        let average_balance = if raw.is_empty() { 0.0 } else { total_money / raw.len() as f64 };
        let gini_val = gini(&raw);
        let velocity = if total_money > 0.0 { turnover / total_money } else { 0.0 };
        let inflation_rate = match self.current {
            Some(prev) if prev.total_money > 0.0 => {
                (total_money - prev.total_money) / prev.total_money
            }
            _ => 0.0,
        };
        let health = self.health_score(inflation_rate, gini_val, velocity);

        let snapshot = EconomicSnapshot {
            total_money,
            average_balance,
            gini: gini_val,
            velocity,
            inflation_rate,
            health,
            taken_at: now,
        };

        self.sorted_balances = raw.iter().map(|b| b.max(0.0)).collect();
        self.sorted_balances
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.current = Some(snapshot);
        self.history.push_back(snapshot);
        while self.history.len() > self.cfg.snapshot_history {
            self.history.pop_front();
        }

        json_log(
            "inflation",
            obj(&[
                ("event", v_str("snapshot")),
                ("total_money", v_num(total_money)),
                ("gini", v_num(gini_val)),
                ("velocity", v_num(velocity)),
                ("inflation", v_num(inflation_rate)),
                ("health", v_num(health)),
            ]),
        );

        self.update_cycle(health, inflation_rate, shock);
        self.maybe_wealth_tax(ledger, &balances, &snapshot, now)?;

        Ok(snapshot)
    }

    /// Health formula (documented in tests): weighted sum of
    ///   s_inflation = 1 − min(1, |inflation − target| / band)
    ///   s_equality  = 1 − gini
    ///   s_velocity  = 1 inside [low, high], linear falloff outside
    /// with weights normalized to sum to 1, so the score stays in [0, 1].
    fn health_score(&self, inflation: f64, gini_val: f64, velocity: f64) -> f64 {
        let (w_inflation, w_equality, w_velocity) = self.cfg.health_weights();

        let band = self.cfg.inflation_band.max(1e-9);
        let s_inflation = 1.0 - ((inflation - self.cfg.inflation_target).abs() / band).min(1.0);

        let s_equality = 1.0 - gini_val.clamp(0.0, 1.0);

        let low = self.cfg.velocity_low;
        let high = self.cfg.velocity_high.max(low + 1e-9);
        let s_velocity = if velocity < low {
            if low > 0.0 { (velocity / low).clamp(0.0, 1.0) } else { 1.0 }
        } else if velocity <= high {
            1.0
        } else {
            (1.0 - (velocity - high) / high).clamp(0.0, 1.0)
        };

        (w_inflation * s_inflation + w_equality * s_equality + w_velocity * s_velocity)
            .clamp(0.0, 1.0)
    }

    fn classify(&self, health: f64, inflation: f64) -> EconomicCycle {
        let by_health = if health < self.cfg.recession_health {
            EconomicCycle::Recession
        } else if health < self.cfg.stagnation_health {
            EconomicCycle::Stagnation
        } else if health < self.cfg.boom_health {
            EconomicCycle::Growth
        } else {
            EconomicCycle::Boom
        };
        // Runaway inflation never classifies as a boom.
        if inflation > self.cfg.inflation_target + self.cfg.inflation_band
            && by_health == EconomicCycle::Boom
        {
            EconomicCycle::Growth
        } else {
            by_health
        }
    }

    /// Threshold the next one-step transition would cross, used for the
    /// hysteresis margin.
    fn boundary_toward(&self, step: EconomicCycle, upward: bool) -> f64 {
        let crossed = if upward { step } else { step.step_toward(EconomicCycle::Boom) };
        match crossed {
            EconomicCycle::Stagnation => self.cfg.recession_health,
            EconomicCycle::Growth => self.cfg.stagnation_health,
            EconomicCycle::Boom => self.cfg.boom_health,
            EconomicCycle::Recession => self.cfg.recession_health,
        }
    }

    fn update_cycle(&mut self, health: f64, inflation: f64, shock: Option<EconomicCycle>) {
        if let Some(forced) = shock {
            if forced != self.cycle {
                self.transition(forced, "shock");
            }
            self.pending = None;
            return;
        }

        let target = self.classify(health, inflation);
        if target == self.cycle {
            self.pending = None;
            return;
        }

        let step = self.cycle.step_toward(target);
        let upward = step.rank() > self.cycle.rank();
        let boundary = self.boundary_toward(step, upward);
        let margin_ok = if upward {
            health >= boundary + self.cfg.hysteresis_margin
        } else {
            health < boundary - self.cfg.hysteresis_margin
        };
        if !margin_ok {
            self.pending = None;
            return;
        }

        let held = match self.pending {
            Some((pending_step, ticks)) if pending_step == step => ticks + 1,
            _ => 1,
        };
        if held >= self.cfg.hysteresis_ticks.max(1) {
            self.pending = None;
            self.transition(step, "threshold");
        } else {
            self.pending = Some((step, held));
        }
    }

    fn transition(&mut self, next: EconomicCycle, cause: &str) {
        let old = self.cycle;
        self.cycle = next;
        json_log(
            "inflation",
            obj(&[
                ("event", v_str("cycle_change")),
                ("old", v_str(old.as_str())),
                ("new", v_str(next.as_str())),
                ("cause", v_str(cause)),
            ]),
        );
        self.sink.publish(Notification::CycleChange {
            old: old.as_str().to_string(),
            new: next.as_str().to_string(),
        });
    }

    /// Wealth tax: one-time fractional deduction on the portion of each
    /// balance above the threshold. Never reapplied inside the cooldown,
    /// however often the trigger re-evaluates. Balances come from the same
    /// read pass as the deciding snapshot.
    fn maybe_wealth_tax(
        &mut self,
        ledger: &dyn Ledger,
        balances: &[(String, f64)],
        snapshot: &EconomicSnapshot,
        now: u64,
    ) -> Result<()> {
        if snapshot.health >= self.cfg.health_critical || snapshot.gini <= self.cfg.gini_critical {
            return Ok(());
        }
        if let Some(last) = self.last_tax_at {
            if now.saturating_sub(last) < self.cfg.wealth_tax_cooldown_secs {
                return Ok(());
            }
        }

        let threshold = self.cfg.wealth_tax_threshold;
        let rate = self.cfg.wealth_tax_rate;
        let mut affected = 0u64;
        let mut collected = 0.0;
        for (actor, balance) in balances {
            if *balance > threshold {
                let tax = (balance - threshold) * rate;
                ledger.apply_delta(actor, -tax)?;
                affected += 1;
                collected += tax;
            }
        }
        // Only a completed pass arms the cooldown; a failed pass retries on
        // the next tick.
        self.last_tax_at = Some(now);
        if affected > 0 {
            json_log(
                "inflation",
                obj(&[
                    ("event", v_str("wealth_tax")),
                    ("affected", v_num(affected as f64)),
                    ("rate", v_num(rate)),
                    ("threshold", v_num(threshold)),
                    ("collected", v_num(collected)),
                ]),
            );
            self.sink.publish(Notification::PolicyApplied {
                policy: "wealth_tax".to_string(),
                affected,
                rate,
                threshold,
            });
        }
        Ok(())
    }

    /// Extrapolate recent health samples `horizon_secs` ahead and classify
    /// the result. Confidence shrinks with sample variance and with a
    /// short history.
    pub fn forecast(&self, horizon_secs: u64) -> CycleForecast {
        let healths: Vec<f64> = self
            .history
            .iter()
            .rev()
            .take(self.cfg.forecast_window)
            .rev()
            .map(|s| s.health)
            .collect();

        let Some(&last) = healths.last() else {
            return CycleForecast {
                predicted: self.cycle,
                confidence: 0.0,
                horizon_secs,
            };
        };

        let steps = (horizon_secs as f64 / self.cfg.sample_secs.max(1) as f64).max(1.0);
        let per_step = match self.cfg.forecast_mode {
            ForecastMode::Linear => linear_slope(&healths),
            ForecastMode::Ewma { alpha } => {
                let mut smoothed = 0.0;
                for pair in healths.windows(2) {
                    smoothed = alpha * (pair[1] - pair[0]) + (1.0 - alpha) * smoothed;
                }
                smoothed
            }
        };
        let predicted_health = (last + per_step * steps).clamp(0.0, 1.0);
        let predicted = self.classify(predicted_health, self.inflation_rate());

        let mean = healths.iter().sum::<f64>() / healths.len() as f64;
        let variance =
            healths.iter().map(|h| (h - mean).powi(2)).sum::<f64>() / healths.len() as f64;
        let fill = healths.len() as f64 / self.cfg.forecast_window.max(1) as f64;
        let confidence = ((1.0 / (1.0 + variance * 50.0)) * fill).clamp(0.0, 1.0);

        CycleForecast { predicted, confidence, horizon_secs }
    }

    pub fn current_snapshot(&self) -> Option<EconomicSnapshot> {
        self.current
    }

    pub fn health(&self) -> f64 {
        self.current.map(|s| s.health).unwrap_or(0.5)
    }

    pub fn inflation_rate(&self) -> f64 {
        self.current.map(|s| s.inflation_rate).unwrap_or(0.0)
    }

    pub fn velocity(&self) -> f64 {
        self.current.map(|s| s.velocity).unwrap_or(0.0)
    }

    pub fn current_cycle(&self) -> EconomicCycle {
        self.cycle
    }

    /// Fraction of sampled balances strictly below `balance`.
    pub fn wealth_percentile(&self, balance: f64) -> f64 {
        if self.sorted_balances.is_empty() {
            return 0.0;
        }
        let below = self.sorted_balances.partition_point(|b| *b < balance);
        below as f64 / self.sorted_balances.len() as f64
    }
}
