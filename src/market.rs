//! Dynamic supply/demand pricing engine.
//!
//! Per-item buy/sell prices move on every trade by an elasticity nudge
//! proportional to trade size relative to the item's rolling volume
//! baseline, and a periodic decay task pulls idle prices back toward the
//! configured base so one-off spikes never drift permanently. Trend and
//! volatility are derived from trailing mid-price samples. Active economic
//! events perturb prices through per-category modifiers applied on top of
//! the organic price before clamping.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::logging::{json_log, obj, v_num, v_str};
use crate::notify::{Notification, NotificationSink};
use crate::stats::RollingWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketTrend {
    Rising,
    Falling,
    Stable,
}

impl MarketTrend {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketTrend::Rising => "rising",
            MarketTrend::Falling => "falling",
            MarketTrend::Stable => "stable",
        }
    }
}

/// Multiplicative price perturbation published by the event engine.
/// `buy_delta = 0.2` means buy prices trade 20% above their organic level.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PriceModifier {
    pub buy_delta: f64,
    pub sell_delta: f64,
}

struct ItemState {
    category: String,
    base_price: f64,
    buy: f64,
    sell: f64,
    /// (ts, organic mid) samples from trades and decay ticks.
    history: VecDeque<(u64, f64)>,
    volatility: RollingWindow,
    /// (ts, qty, notional) per trade, pruned to the velocity window.
    trades: VecDeque<(u64, f64, f64)>,
    qty_baseline: RollingWindow,
    last_trade_at: u64,
    last_notified: (f64, f64),
}

impl ItemState {
    fn mid(&self) -> f64 {
        (self.buy + self.sell) / 2.0
    }
}

/// Read surface for one item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemQuote {
    pub item: String,
    pub category: String,
    pub buy: f64,
    pub sell: f64,
    pub trend: MarketTrend,
    pub volatility: f64,
    pub volume_24h: f64,
    pub price_change_24h: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendingItem {
    pub item: String,
    pub change_24h: f64,
    pub trend: MarketTrend,
    pub buy: f64,
}

pub struct PricingEngine {
    cfg: Config,
    items: HashMap<String, ItemState>,
    /// Active modifiers keyed by category; replaced as a whole set by the
    /// event engine so readers see a fully-formed set or none.
    modifiers: HashMap<String, PriceModifier>,
    sink: Arc<dyn NotificationSink>,
}

impl PricingEngine {
    pub fn new(cfg: Config, sink: Arc<dyn NotificationSink>) -> Self {
        Self { cfg, items: HashMap::new(), modifiers: HashMap::new(), sink }
    }

    pub fn register_item(&mut self, name: &str, category: &str, base_price: f64) {
        let base = base_price.clamp(self.cfg.price_floor, self.cfg.price_ceiling);
        let sell = (base * (1.0 - self.cfg.default_spread)).max(self.cfg.price_floor);
        self.items.insert(
            name.to_string(),
            ItemState {
                category: category.to_string(),
                base_price: base,
                buy: base,
                sell,
                history: VecDeque::new(),
                volatility: RollingWindow::new(self.cfg.volatility_window),
                trades: VecDeque::new(),
                qty_baseline: RollingWindow::new(self.cfg.volume_baseline_window),
                last_trade_at: 0,
                last_notified: (base, sell),
            },
        );
    }

    pub fn items(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(|k| k.as_str())
    }

    /// Record one executed trade and return the new effective price for the
    /// traded side.
    pub fn record_trade(&mut self, item: &str, side: TradeSide, qty: f64, now: u64) -> Result<f64> {
        if qty <= 0.0 || !qty.is_finite() {
            bail!("invalid trade quantity {qty} for {item}");
        }
        let floor = self.cfg.price_floor;
        let ceiling = self.cfg.price_ceiling;
        {
            let state = match self.items.get_mut(item) {
                Some(state) => state,
                None => bail!("unknown market item {item}"),
            };
            let baseline = if state.qty_baseline.is_empty() {
                qty.max(1.0)
            } else {
                state.qty_baseline.mean().max(1.0)
            };
            let impact =
                (self.cfg.elasticity * qty / baseline).min(self.cfg.max_trade_impact);

            // Buying pushes the buy price up with the sell price following at
            // the spread ratio; selling mirrors downward.
            match side {
                TradeSide::Buy => {
                    state.buy *= 1.0 + impact;
                    state.sell *= 1.0 + impact * self.cfg.spread_push_ratio;
                }
                TradeSide::Sell => {
                    state.sell *= 1.0 - impact;
                    state.buy *= 1.0 - impact * self.cfg.spread_push_ratio;
                }
            }
            state.buy = state.buy.clamp(floor, ceiling);
            state.sell = state.sell.clamp(floor, ceiling).min(state.buy);

            let exec_price = match side {
                TradeSide::Buy => state.buy,
                TradeSide::Sell => state.sell,
            };
            state.qty_baseline.push(qty);
            state.trades.push_back((now, qty, qty * exec_price));
            state.last_trade_at = now;
            let window = self.cfg.velocity_window_secs;
            while let Some(&(ts, _, _)) = state.trades.front() {
                if now.saturating_sub(ts) > window {
                    state.trades.pop_front();
                } else {
                    break;
                }
            }
            Self::push_sample(state, now, self.cfg.trend_lookback_secs.max(window));
        }
        self.maybe_notify(item);
        let state = &self.items[item];
        let (buy, sell) = self.effective_prices_of(state);
        Ok(match side {
            TradeSide::Buy => buy,
            TradeSide::Sell => sell,
        })
    }

    fn push_sample(state: &mut ItemState, now: u64, retention_secs: u64) {
        let mid = state.mid();
        state.history.push_back((now, mid));
        state.volatility.push(mid);
        // Keep one sample beyond the retention horizon as the lookback anchor.
        while state.history.len() > 2 {
            let second_oldest = state.history[1].0;
            if now.saturating_sub(second_oldest) > retention_secs {
                state.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Periodic decay toward base price for items with no recent trades.
    pub fn decay_tick(&mut self, now: u64) {
        let floor = self.cfg.price_floor;
        let ceiling = self.cfg.price_ceiling;
        let mut decayed = 0u32;
        let retention = self.cfg.trend_lookback_secs.max(self.cfg.velocity_window_secs);
        let names: Vec<String> = self.items.keys().cloned().collect();
        for name in names {
            {
                let Some(state) = self.items.get_mut(&name) else { continue };
                if now.saturating_sub(state.last_trade_at) < self.cfg.decay_secs {
                    continue;
                }
                let sell_anchor =
                    (state.base_price * (1.0 - self.cfg.default_spread)).max(floor);
                state.buy += (state.base_price - state.buy) * self.cfg.decay_rate;
                state.sell += (sell_anchor - state.sell) * self.cfg.decay_rate;
                state.buy = state.buy.clamp(floor, ceiling);
                state.sell = state.sell.clamp(floor, ceiling).min(state.buy);
                Self::push_sample(state, now, retention);
                decayed += 1;
            }
            self.maybe_notify(&name);
        }
        if decayed > 0 {
            json_log(
                "market",
                obj(&[("event", v_str("decay_tick")), ("items", v_num(decayed as f64))]),
            );
        }
    }

    fn maybe_notify(&mut self, item: &str) {
        let threshold = self.cfg.price_notify_threshold;
        let Some(state) = self.items.get_mut(item) else { return };
        let mid = state.mid();
        let old_mid = (state.last_notified.0 + state.last_notified.1) / 2.0;
        if old_mid <= 0.0 {
            state.last_notified = (state.buy, state.sell);
            return;
        }
        let change = (mid - old_mid) / old_mid;
        if change.abs() < threshold {
            return;
        }
        let (old_buy, old_sell) = state.last_notified;
        state.last_notified = (state.buy, state.sell);
        let notification = Notification::PriceChange {
            item: item.to_string(),
            old_buy,
            new_buy: state.buy,
            old_sell,
            new_sell: state.sell,
            volatility: state.volatility.std(),
        };
        json_log(
            "market",
            obj(&[
                ("event", v_str("price_change")),
                ("item", v_str(item)),
                ("change", v_num(change)),
                ("buy", v_num(state.buy)),
                ("sell", v_num(state.sell)),
            ]),
        );
        self.sink.publish(notification);
    }

    /// Replace the whole active-modifier set; called by the bootstrap after
    /// every event-engine tick so pricing never sees a half-applied event.
    pub fn set_modifiers(&mut self, modifiers: HashMap<String, PriceModifier>) {
        if modifiers.keys().len() != self.modifiers.keys().len()
            || modifiers.iter().any(|(k, v)| self.modifiers.get(k) != Some(v))
        {
            json_log(
                "market",
                obj(&[
                    ("event", v_str("modifiers_updated")),
                    ("categories", v_num(modifiers.len() as f64)),
                ]),
            );
        }
        self.modifiers = modifiers;
    }

    fn modifier_for(&self, category: &str) -> PriceModifier {
        self.modifiers
            .get(category)
            .or_else(|| self.modifiers.get("market"))
            .copied()
            .unwrap_or_default()
    }

    fn effective_prices_of(&self, state: &ItemState) -> (f64, f64) {
        let modifier = self.modifier_for(&state.category);
        let buy = (state.buy * (1.0 + modifier.buy_delta))
            .clamp(self.cfg.price_floor, self.cfg.price_ceiling);
        let sell = (state.sell * (1.0 + modifier.sell_delta))
            .clamp(self.cfg.price_floor, self.cfg.price_ceiling)
            .min(buy);
        (buy, sell)
    }

    /// Effective (buy, sell) with any active event modifier applied.
    pub fn prices(&self, item: &str) -> Option<(f64, f64)> {
        self.items.get(item).map(|s| self.effective_prices_of(s))
    }

    pub fn trend(&self, item: &str, now: u64) -> Option<MarketTrend> {
        let state = self.items.get(item)?;
        let cutoff = now.saturating_sub(self.cfg.trend_lookback_secs);
        // Newest sample at or before the lookback horizon; fall back to the
        // oldest sample when history is shorter than the horizon.
        let reference = state
            .history
            .iter()
            .rev()
            .find(|(ts, _)| *ts <= cutoff)
            .or_else(|| state.history.front())
            .map(|(_, mid)| *mid)?;
        if reference <= 0.0 {
            return Some(MarketTrend::Stable);
        }
        let change = (state.mid() - reference) / reference;
        Some(if change > self.cfg.trend_threshold {
            MarketTrend::Rising
        } else if change < -self.cfg.trend_threshold {
            MarketTrend::Falling
        } else {
            MarketTrend::Stable
        })
    }

    pub fn volatility(&self, item: &str) -> Option<f64> {
        self.items.get(item).map(|s| s.volatility.std())
    }

    pub fn volume_24h(&self, item: &str) -> f64 {
        self.items
            .get(item)
            .map(|s| s.trades.iter().map(|(_, qty, _)| qty).sum())
            .unwrap_or(0.0)
    }

    fn price_change_24h(&self, state: &ItemState, now: u64) -> f64 {
        let cutoff = now.saturating_sub(self.cfg.velocity_window_secs);
        let reference = state
            .history
            .iter()
            .rev()
            .find(|(ts, _)| *ts <= cutoff)
            .or_else(|| state.history.front())
            .map(|(_, mid)| *mid)
            .unwrap_or(0.0);
        if reference <= 0.0 {
            return 0.0;
        }
        (state.mid() - reference) / reference
    }

    /// Items ordered by absolute 24h price movement.
    pub fn trending_items(&self, limit: usize, now: u64) -> Vec<TrendingItem> {
        let mut out: Vec<TrendingItem> = self
            .items
            .iter()
            .map(|(name, state)| TrendingItem {
                item: name.clone(),
                change_24h: self.price_change_24h(state, now),
                trend: self.trend(name, now).unwrap_or(MarketTrend::Stable),
                buy: self.effective_prices_of(state).0,
            })
            .collect();
        out.sort_by(|a, b| {
            b.change_24h
                .abs()
                .partial_cmp(&a.change_24h.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out.truncate(limit);
        out
    }

    /// Total traded notional inside the velocity window, read by the
    /// inflation engine as the volume term of velocity-of-money.
    pub fn turnover(&self, now: u64) -> f64 {
        let window = self.cfg.velocity_window_secs;
        self.items
            .values()
            .flat_map(|s| s.trades.iter())
            .filter(|(ts, _, _)| now.saturating_sub(*ts) <= window)
            .map(|(_, _, notional)| notional)
            .sum()
    }

    /// Aggregate activity score in [0, 1].
    pub fn market_activity(&self, now: u64) -> f64 {
        (self.turnover(now) / self.cfg.activity_norm.max(1.0)).min(1.0)
    }

    /// Full read surface, also used for price-history persistence.
    pub fn quotes(&self, now: u64) -> Vec<ItemQuote> {
        self.items
            .iter()
            .map(|(name, state)| {
                let (buy, sell) = self.effective_prices_of(state);
                ItemQuote {
                    item: name.clone(),
                    category: state.category.clone(),
                    buy,
                    sell,
                    trend: self.trend(name, now).unwrap_or(MarketTrend::Stable),
                    volatility: state.volatility.std(),
                    volume_24h: self.volume_24h(name),
                    price_change_24h: self.price_change_24h(state, now),
                }
            })
            .collect()
    }
}
