use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, Duration};

use ecopulse::config::Config;
use ecopulse::core::EconomyCore;
use ecopulse::ledger::SqliteLedger;
use ecopulse::logging::{error_log, json_log, now_ts, obj, v_num, v_str};
use ecopulse::notify::LogSink;
use ecopulse::storage::{PriceRow, StateStore};

/// Tradable item registry: `ITEMS="iron:ores:100,bread:food:10"`.
fn parse_items(spec: &str) -> Vec<(String, String, f64)> {
    spec.split(',')
        .filter_map(|entry| {
            let mut parts = entry.trim().split(':');
            let name = parts.next()?.trim();
            let category = parts.next()?.trim();
            let base: f64 = parts.next()?.trim().parse().ok()?;
            if name.is_empty() || category.is_empty() || base <= 0.0 {
                return None;
            }
            Some((name.to_string(), category.to_string(), base))
        })
        .collect()
}

fn default_items() -> Vec<(String, String, f64)> {
    [
        ("iron", "ores", 100.0),
        ("gold", "ores", 500.0),
        ("diamond", "ores", 2500.0),
        ("bread", "food", 10.0),
        ("steak", "food", 40.0),
        ("oak_log", "materials", 5.0),
        ("stone", "materials", 2.0),
    ]
    .iter()
    .map(|(n, c, b)| (n.to_string(), c.to_string(), *b))
    .collect()
}

async fn decay_loop(
    cfg: Config,
    core: Arc<EconomyCore>,
    store: Arc<Mutex<StateStore>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(Duration::from_secs(cfg.decay_secs.max(1)));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = now_ts();
                let quotes = core.decay_tick(now);
                let rows: Vec<PriceRow> = quotes
                    .iter()
                    .map(|q| PriceRow {
                        item: q.item.clone(),
                        buy: q.buy,
                        sell: q.sell,
                        volume_24h: q.volume_24h,
                    })
                    .collect();
                let result = store.lock().expect("store lock poisoned").persist_prices(now, &rows);
                if let Err(err) = result {
                    error_log(
                        "storage",
                        obj(&[("event", v_str("persist_prices_failed")), ("error", v_str(&err.to_string()))]),
                    );
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn sampling_loop(
    cfg: Config,
    core: Arc<EconomyCore>,
    store: Arc<Mutex<StateStore>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(Duration::from_secs(cfg.sample_secs.max(1)));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = now_ts();
                // A failed sample is already logged and counted against the
                // breaker inside sample_tick; the loop itself never dies.
                if let Some(snapshot) = core.sample_tick(now) {
                    let cycle = core.readout(now).cycle;
                    let result = store
                        .lock()
                        .expect("store lock poisoned")
                        .persist_snapshot(&snapshot, &cycle);
                    if let Err(err) = result {
                        error_log(
                            "storage",
                            obj(&[("event", v_str("persist_snapshot_failed")), ("error", v_str(&err.to_string()))]),
                        );
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn probe_loop(
    cfg: Config,
    core: Arc<EconomyCore>,
    store: Arc<Mutex<StateStore>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut probe = interval(Duration::from_secs(cfg.probe_secs.max(1)));
    let mut events = interval(Duration::from_secs(cfg.event_tick_secs.max(1)));
    loop {
        tokio::select! {
            _ = probe.tick() => {
                core.probe_tick(now_ts());
            }
            _ = events.tick() => {
                let now = now_ts();
                for ended in core.event_tick(now) {
                    let result = store.lock().expect("store lock poisoned").archive_event(
                        ended.event.id,
                        ended.event.kind.as_str(),
                        &ended.event.parameters.category,
                        ended.event.started_at,
                        ended.ended_at,
                        ended.cancelled,
                    );
                    if let Err(err) = result {
                        error_log(
                            "storage",
                            obj(&[("event", v_str("archive_event_failed")), ("error", v_str(&err.to_string()))]),
                        );
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    let ledger = Arc::new(SqliteLedger::open(&cfg.sqlite_path)?);
    let mut store = StateStore::new(&cfg.sqlite_path)?;
    store.init()?;
    let store = Arc::new(Mutex::new(store));

    let items = match std::env::var("ITEMS") {
        Ok(spec) => {
            let parsed = parse_items(&spec);
            if parsed.is_empty() { default_items() } else { parsed }
        }
        Err(_) => default_items(),
    };

    let core = Arc::new(EconomyCore::new(cfg.clone(), ledger, Arc::new(LogSink), &items));

    json_log(
        "system",
        obj(&[
            ("event", v_str("startup")),
            ("items", v_num(items.len() as f64)),
            ("sample_secs", v_num(cfg.sample_secs as f64)),
            ("decay_secs", v_num(cfg.decay_secs as f64)),
            ("probe_secs", v_num(cfg.probe_secs as f64)),
        ]),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let decay = tokio::spawn(decay_loop(cfg.clone(), core.clone(), store.clone(), shutdown_rx.clone()));
    let sampling = tokio::spawn(sampling_loop(cfg.clone(), core.clone(), store.clone(), shutdown_rx.clone()));
    let probing = tokio::spawn(probe_loop(cfg.clone(), core.clone(), store.clone(), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    json_log("system", obj(&[("event", v_str("shutdown"))]));
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(decay, sampling, probing);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_items() {
        let items = parse_items("iron:ores:100, bread:food:10");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], ("iron".to_string(), "ores".to_string(), 100.0));
        // Malformed entries are skipped, not fatal.
        assert!(parse_items("nonsense").is_empty());
        assert!(parse_items("a:b:-5").is_empty());
        assert_eq!(parse_items("x:y:1,broken,z:w:2").len(), 2);
    }

    #[test]
    fn test_default_items_nonempty() {
        let items = default_items();
        assert!(!items.is_empty());
        assert!(items.iter().all(|(_, _, base)| *base > 0.0));
    }
}
