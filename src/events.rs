//! Economic event engine.
//!
//! Owns the set of transient perturbation events. Each tick expires events
//! past their end and may start a new one biased by the current cycle and
//! health. At most one active event may hold a modifier category; starting
//! into an occupied category is rejected, never queued. Event parameters are
//! immutable once created; forced early termination is the only mutation.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::Config;
use crate::inflation::EconomicCycle;
use crate::logging::{json_log, obj, v_num, v_str, warn_log};
use crate::market::PriceModifier;
use crate::notify::{Notification, NotificationSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Boom-time run-up: buy and sell prices trade above organic levels.
    SpeculativeBubble,
    /// Hard shock: prices collapse and the cycle is forced to recession.
    MarketCrash,
    /// Recession relief: sell prices lifted so actors earn more.
    StimulusRelief,
    /// One item category becomes scarce and expensive.
    SupplyShortage,
    /// Growth-time discount on buy prices.
    TradeFestival,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SpeculativeBubble => "speculative_bubble",
            EventKind::MarketCrash => "market_crash",
            EventKind::StimulusRelief => "stimulus_relief",
            EventKind::SupplyShortage => "supply_shortage",
            EventKind::TradeFestival => "trade_festival",
        }
    }
}

/// Named modifiers carried by an event; immutable after creation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventParameters {
    pub category: String,
    pub buy_delta: f64,
    pub sell_delta: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EconomicEvent {
    pub id: u64,
    pub kind: EventKind,
    pub started_at: u64,
    /// None = indefinite, runs until `force_end`.
    pub ends_at: Option<u64>,
    pub parameters: EventParameters,
}

/// A finished event, handed to the caller for archiving.
#[derive(Debug, Clone)]
pub struct EndedEvent {
    pub event: EconomicEvent,
    pub ended_at: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EventStatistics {
    pub total_events: u64,
    pub active_events: u64,
    pub counts: HashMap<String, u64>,
    pub average_duration_secs: HashMap<String, f64>,
}

pub struct EventEngine {
    cfg: Config,
    rng: StdRng,
    active: Vec<EconomicEvent>,
    next_id: u64,
    total_events: u64,
    started_counts: HashMap<EventKind, u64>,
    ended_counts: HashMap<EventKind, u64>,
    duration_sums: HashMap<EventKind, f64>,
    /// Item categories known to the pricing engine; shortages pick one.
    item_categories: Vec<String>,
    sink: Arc<dyn NotificationSink>,
}

impl EventEngine {
    pub fn new(cfg: Config, item_categories: Vec<String>, sink: Arc<dyn NotificationSink>) -> Self {
        Self::with_rng(cfg, item_categories, sink, StdRng::from_entropy())
    }

    /// Deterministic constructor for tests.
    pub fn with_rng(
        cfg: Config,
        item_categories: Vec<String>,
        sink: Arc<dyn NotificationSink>,
        rng: StdRng,
    ) -> Self {
        Self {
            cfg,
            rng,
            active: Vec::new(),
            next_id: 0,
            total_events: 0,
            started_counts: HashMap::new(),
            ended_counts: HashMap::new(),
            duration_sums: HashMap::new(),
            item_categories,
            sink,
        }
    }

    pub fn seeded(cfg: Config, item_categories: Vec<String>, sink: Arc<dyn NotificationSink>, seed: u64) -> Self {
        Self::with_rng(cfg, item_categories, sink, StdRng::seed_from_u64(seed))
    }

    /// One scheduled tick: expire finished events, then maybe start a new
    /// one biased by the current cycle and health.
    pub fn tick(&mut self, cycle: EconomicCycle, health: f64, now: u64) -> Vec<EndedEvent> {
        let ended = self.expire(now);

        if self.rng.gen::<f64>() < self.cfg.event_start_chance {
            let kind = self.candidate(cycle, health);
            let duration = self
                .rng
                .gen_range(self.cfg.event_min_duration_secs..=self.cfg.event_max_duration_secs.max(self.cfg.event_min_duration_secs));
            match self.start_event(kind, Some(duration), now) {
                Ok(id) => {
                    json_log(
                        "events",
                        obj(&[
                            ("event", v_str("scheduled_start")),
                            ("id", v_num(id as f64)),
                            ("kind", v_str(kind.as_str())),
                            ("cycle", v_str(cycle.as_str())),
                        ]),
                    );
                }
                Err(_) => {
                    // Category occupied; rejection already logged locally.
                }
            }
        }

        ended
    }

    fn expire(&mut self, now: u64) -> Vec<EndedEvent> {
        let mut out = Vec::new();
        let mut idx = 0;
        while idx < self.active.len() {
            let expired = matches!(self.active[idx].ends_at, Some(end) if end <= now);
            if expired {
                let event = self.active.remove(idx);
                let ended_at = event.ends_at.unwrap_or(now);
                self.finish(&event, ended_at, false);
                out.push(EndedEvent { event, ended_at, cancelled: false });
            } else {
                idx += 1;
            }
        }
        out
    }

    fn finish(&mut self, event: &EconomicEvent, ended_at: u64, cancelled: bool) {
        let duration = ended_at.saturating_sub(event.started_at) as f64;
        *self.ended_counts.entry(event.kind).or_insert(0) += 1;
        *self.duration_sums.entry(event.kind).or_insert(0.0) += duration;
        json_log(
            "events",
            obj(&[
                ("event", v_str(if cancelled { "cancelled" } else { "expired" })),
                ("id", v_num(event.id as f64)),
                ("kind", v_str(event.kind.as_str())),
                ("duration_secs", v_num(duration)),
            ]),
        );
        self.sink.publish(Notification::EventEnded {
            id: event.id,
            event: event.kind.as_str().to_string(),
            cancelled,
        });
    }

    /// Pick an event kind biased by cycle; low health in a boom makes the
    /// bubble-pop crash more likely.
    fn candidate(&mut self, cycle: EconomicCycle, health: f64) -> EventKind {
        let roll: f64 = self.rng.gen();
        match cycle {
            EconomicCycle::Boom => {
                if roll < 0.10 || health < 0.3 {
                    EventKind::MarketCrash
                } else if roll < 0.70 {
                    EventKind::SpeculativeBubble
                } else {
                    EventKind::SupplyShortage
                }
            }
            EconomicCycle::Growth => {
                if roll < 0.55 {
                    EventKind::TradeFestival
                } else {
                    EventKind::SupplyShortage
                }
            }
            EconomicCycle::Stagnation => {
                if roll < 0.50 {
                    EventKind::SupplyShortage
                } else {
                    EventKind::StimulusRelief
                }
            }
            EconomicCycle::Recession => {
                if roll < 0.70 {
                    EventKind::StimulusRelief
                } else {
                    EventKind::TradeFestival
                }
            }
        }
    }

    fn draw_parameters(&mut self, kind: EventKind) -> EventParameters {
        match kind {
            EventKind::SpeculativeBubble => EventParameters {
                category: "market".to_string(),
                buy_delta: self.rng.gen_range(0.10..=0.30),
                sell_delta: self.rng.gen_range(0.05..=0.20),
            },
            EventKind::MarketCrash => EventParameters {
                category: "market".to_string(),
                buy_delta: -self.rng.gen_range(0.20..=0.40),
                sell_delta: -self.rng.gen_range(0.25..=0.45),
            },
            EventKind::StimulusRelief => EventParameters {
                category: "market".to_string(),
                buy_delta: 0.0,
                sell_delta: self.rng.gen_range(0.05..=0.15),
            },
            EventKind::SupplyShortage => {
                let category = if self.item_categories.is_empty() {
                    "market".to_string()
                } else {
                    let idx = self.rng.gen_range(0..self.item_categories.len());
                    self.item_categories[idx].clone()
                };
                EventParameters {
                    category,
                    buy_delta: self.rng.gen_range(0.10..=0.25),
                    sell_delta: self.rng.gen_range(0.05..=0.10),
                }
            }
            EventKind::TradeFestival => EventParameters {
                category: "market".to_string(),
                buy_delta: -self.rng.gen_range(0.05..=0.15),
                sell_delta: 0.0,
            },
        }
    }

    /// Start an event now. Fails when the target modifier category already
    /// has an active event; the caller gets the id on success.
    pub fn start_event(&mut self, kind: EventKind, duration_secs: Option<u64>, now: u64) -> Result<u64> {
        let parameters = self.draw_parameters(kind);
        if let Some(holder) = self.active.iter().find(|e| e.parameters.category == parameters.category) {
            warn_log(
                "events",
                obj(&[
                    ("event", v_str("category_conflict")),
                    ("kind", v_str(kind.as_str())),
                    ("category", v_str(&parameters.category)),
                    ("held_by", v_num(holder.id as f64)),
                ]),
            );
            bail!(
                "category {} already held by event {}",
                parameters.category,
                holder.id
            );
        }
        self.next_id += 1;
        self.total_events += 1;
        *self.started_counts.entry(kind).or_insert(0) += 1;
        let event = EconomicEvent {
            id: self.next_id,
            kind,
            started_at: now,
            ends_at: duration_secs.map(|d| now + d),
            parameters,
        };
        self.sink.publish(Notification::EventStarted {
            id: event.id,
            event: kind.as_str().to_string(),
            category: event.parameters.category.clone(),
            ends_at: event.ends_at,
        });
        self.active.push(event);
        Ok(self.next_id)
    }

    /// Forced early termination; the one allowed mutation after creation.
    pub fn force_end(&mut self, id: u64, now: u64) -> Result<EndedEvent> {
        let Some(idx) = self.active.iter().position(|e| e.id == id) else {
            bail!("no active event with id {id}");
        };
        let event = self.active.remove(idx);
        self.finish(&event, now, true);
        Ok(EndedEvent { event, ended_at: now, cancelled: true })
    }

    pub fn active_events(&self) -> &[EconomicEvent] {
        &self.active
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// The active Crash, if any, forces the cycle straight to recession.
    pub fn shock_cycle(&self) -> Option<EconomicCycle> {
        self.active
            .iter()
            .any(|e| e.kind == EventKind::MarketCrash)
            .then_some(EconomicCycle::Recession)
    }

    /// One modifier per category, consumed by the pricing engine as a whole
    /// replacement set.
    pub fn modifier_set(&self) -> HashMap<String, PriceModifier> {
        self.active
            .iter()
            .map(|e| {
                (
                    e.parameters.category.clone(),
                    PriceModifier {
                        buy_delta: e.parameters.buy_delta,
                        sell_delta: e.parameters.sell_delta,
                    },
                )
            })
            .collect()
    }

    pub fn statistics(&self) -> EventStatistics {
        let mut counts = HashMap::new();
        for (kind, n) in &self.started_counts {
            counts.insert(kind.as_str().to_string(), *n);
        }
        let mut average_duration_secs = HashMap::new();
        for (kind, sum) in &self.duration_sums {
            let n = self.ended_counts.get(kind).copied().unwrap_or(0);
            if n > 0 {
                average_duration_secs.insert(kind.as_str().to_string(), sum / n as f64);
            }
        }
        EventStatistics {
            total_events: self.total_events,
            active_events: self.active.len() as u64,
            counts,
            average_duration_secs,
        }
    }
}
