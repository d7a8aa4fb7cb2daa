//! Typed notifications published by the engines.
//!
//! The core only publishes; rendering belongs to the UI/placeholder layers.
//! Sinks are passed in at construction, there is no global listener registry.

use serde::Serialize;
use std::sync::Mutex;

use crate::logging::{json_log, obj, v_str};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    PriceChange {
        item: String,
        old_buy: f64,
        new_buy: f64,
        old_sell: f64,
        new_sell: f64,
        volatility: f64,
    },
    CycleChange {
        old: String,
        new: String,
    },
    PolicyApplied {
        policy: String,
        affected: u64,
        rate: f64,
        threshold: f64,
    },
    SafeModeChange {
        active: bool,
        reason: String,
    },
    EventStarted {
        id: u64,
        event: String,
        category: String,
        ends_at: Option<u64>,
    },
    EventEnded {
        id: u64,
        event: String,
        cancelled: bool,
    },
}

pub trait NotificationSink: Send + Sync {
    fn publish(&self, notification: Notification);
}

/// Default sink: every notification becomes a structured log line.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn publish(&self, notification: Notification) {
        let payload = serde_json::to_value(&notification).unwrap_or_default();
        json_log(
            "notify",
            obj(&[
                ("event", v_str("published")),
                ("notification", payload),
            ]),
        );
    }
}

/// Collecting sink for tests and polling consumers.
#[derive(Default)]
pub struct MemorySink {
    published: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Notification> {
        self.published.lock().map(|mut v| std::mem::take(&mut *v)).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.published.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl NotificationSink for MemorySink {
    fn publish(&self, notification: Notification) {
        if let Ok(mut v) = self.published.lock() {
            v.push(notification);
        }
    }
}
