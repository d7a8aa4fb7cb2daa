//! Ledger collaborator: the balance store this core samples and taxes.
//!
//! The core never owns balances; it reads them in one pass per sampling tick
//! and applies deltas for policy actions. `ping` is the trivial round-trip
//! used by the safe-mode latency probe.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::Mutex;

pub trait Ledger: Send + Sync {
    fn all_balances(&self) -> Result<Vec<(String, f64)>>;
    fn apply_delta(&self, actor: &str, delta: f64) -> Result<f64>;
    fn ping(&self) -> Result<()>;
}

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // The history store may hold a second connection to the same file.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS balances (
                actor TEXT PRIMARY KEY,
                balance REAL NOT NULL
            );
            COMMIT;",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn set_balance(&self, actor: &str, balance: f64) -> Result<()> {
        let conn = self.conn.lock().expect("ledger lock poisoned");
        conn.execute(
            "INSERT INTO balances (actor, balance) VALUES (?1, ?2)
             ON CONFLICT(actor) DO UPDATE SET balance = ?2",
            params![actor, balance],
        )?;
        Ok(())
    }
}

impl Ledger for SqliteLedger {
    fn all_balances(&self) -> Result<Vec<(String, f64)>> {
        let conn = self.conn.lock().expect("ledger lock poisoned");
        let mut stmt = conn.prepare("SELECT actor, balance FROM balances")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn apply_delta(&self, actor: &str, delta: f64) -> Result<f64> {
        let conn = self.conn.lock().expect("ledger lock poisoned");
        conn.execute(
            "INSERT INTO balances (actor, balance) VALUES (?1, ?2)
             ON CONFLICT(actor) DO UPDATE SET balance = balance + ?2",
            params![actor, delta],
        )?;
        let balance = conn.query_row(
            "SELECT balance FROM balances WHERE actor = ?1",
            params![actor],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().expect("ledger lock poisoned");
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

/// In-memory ledger, used by tests and as an explicit stub when the crate
/// runs without a persistent backend.
#[derive(Default)]
pub struct MemoryLedger {
    balances: Mutex<HashMap<String, f64>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balances(pairs: &[(&str, f64)]) -> Self {
        let ledger = Self::new();
        {
            let mut map = ledger.balances.lock().expect("ledger lock poisoned");
            for (actor, balance) in pairs {
                map.insert((*actor).to_string(), *balance);
            }
        }
        ledger
    }

    pub fn balance(&self, actor: &str) -> Option<f64> {
        self.balances.lock().ok().and_then(|m| m.get(actor).copied())
    }
}

impl Ledger for MemoryLedger {
    fn all_balances(&self) -> Result<Vec<(String, f64)>> {
        let map = self.balances.lock().expect("ledger lock poisoned");
        Ok(map.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }

    fn apply_delta(&self, actor: &str, delta: f64) -> Result<f64> {
        let mut map = self.balances.lock().expect("ledger lock poisoned");
        let balance = map.entry(actor.to_string()).or_insert(0.0);
        *balance += delta;
        Ok(*balance)
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_ledger_delta() {
        let ledger = MemoryLedger::with_balances(&[("alice", 100.0)]);
        let after = ledger.apply_delta("alice", -30.0).unwrap();
        assert!((after - 70.0).abs() < 1e-9);
        assert_eq!(ledger.balance("bob"), None);
        let created = ledger.apply_delta("bob", 10.0).unwrap();
        assert!((created - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_sqlite_ledger_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.sqlite");
        let ledger = SqliteLedger::open(path.to_str().unwrap()).unwrap();
        ledger.set_balance("alice", 500.0).unwrap();
        ledger.set_balance("bob", 250.0).unwrap();
        let mut balances = ledger.all_balances().unwrap();
        balances.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[0].0, "alice");
        let after = ledger.apply_delta("alice", -100.0).unwrap();
        assert!((after - 400.0).abs() < 1e-9);
        assert!(ledger.ping().is_ok());
    }
}
