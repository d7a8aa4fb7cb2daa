//! Per-(actor, action) fixed-window admission control.
//!
//! One bucket per key, one second per window. Buckets are individually
//! locked so unrelated actors never contend on a shared lock; the outer map
//! lock is held only long enough to clone the bucket handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug)]
struct Bucket {
    epoch_second: u64,
    count: u32,
}

pub struct RateLimiter {
    cap_per_sec: u32,
    buckets: RwLock<HashMap<(String, String), Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(cap_per_sec: u32) -> Self {
        Self {
            cap_per_sec: cap_per_sec.max(1),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn bucket(&self, actor: &str, action: &str) -> Arc<Mutex<Bucket>> {
        let key = (actor.to_string(), action.to_string());
        if let Some(bucket) = self.buckets.read().expect("bucket map poisoned").get(&key) {
            return Arc::clone(bucket);
        }
        let mut map = self.buckets.write().expect("bucket map poisoned");
        Arc::clone(map.entry(key).or_insert_with(|| {
            Arc::new(Mutex::new(Bucket { epoch_second: 0, count: 0 }))
        }))
    }

    /// Admit or reject one call at wall-clock second `now`. Rejection is a
    /// normal negative result, not an error.
    pub fn allow(&self, actor: &str, action: &str, now: u64) -> bool {
        let bucket = self.bucket(actor, action);
        let mut bucket = bucket.lock().expect("bucket poisoned");
        if bucket.epoch_second != now {
            bucket.epoch_second = now;
            bucket.count = 0;
        }
        if bucket.count >= self.cap_per_sec {
            return false;
        }
        bucket.count += 1;
        true
    }

    /// Drop buckets whose window is long past; callers invoke this from a
    /// maintenance tick to keep the map from growing with one-shot actors.
    pub fn prune(&self, now: u64, idle_secs: u64) {
        let mut map = self.buckets.write().expect("bucket map poisoned");
        map.retain(|_, bucket| {
            bucket
                .lock()
                .map(|b| now.saturating_sub(b.epoch_second) <= idle_secs)
                .unwrap_or(false)
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.read().map(|m| m.len()).unwrap_or(0)
    }
}
