use anyhow::Result;
use rusqlite::{params, Connection};

use crate::inflation::EconomicSnapshot;

/// History persistence for snapshots, prices and ended events.
pub struct StateStore {
    conn: Connection,
}

pub struct PriceRow {
    pub item: String,
    pub buy: f64,
    pub sell: f64,
    pub volume_24h: f64,
}

impl StateStore {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS snapshots (
                ts INTEGER NOT NULL,
                total_money REAL NOT NULL,
                average_balance REAL NOT NULL,
                gini REAL NOT NULL,
                velocity REAL NOT NULL,
                inflation REAL NOT NULL,
                health REAL NOT NULL,
                cycle TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS price_history (
                ts INTEGER NOT NULL,
                item TEXT NOT NULL,
                buy REAL NOT NULL,
                sell REAL NOT NULL,
                volume_24h REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS event_history (
                id INTEGER NOT NULL,
                event TEXT NOT NULL,
                category TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER NOT NULL,
                cancelled INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn persist_snapshot(&mut self, snapshot: &EconomicSnapshot, cycle: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO snapshots (ts, total_money, average_balance, gini, velocity, inflation, health, cycle)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.taken_at as i64,
                snapshot.total_money,
                snapshot.average_balance,
                snapshot.gini,
                snapshot.velocity,
                snapshot.inflation_rate,
                snapshot.health,
                cycle
            ],
        )?;
        Ok(())
    }

    pub fn persist_prices(&mut self, ts: u64, rows: &[PriceRow]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for row in rows {
            tx.execute(
                "INSERT INTO price_history (ts, item, buy, sell, volume_24h)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ts as i64, row.item, row.buy, row.sell, row.volume_24h],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn archive_event(
        &mut self,
        id: u64,
        event: &str,
        category: &str,
        started_at: u64,
        ended_at: u64,
        cancelled: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO event_history (id, event, category, started_at, ended_at, cancelled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id as i64,
                event,
                category,
                started_at as i64,
                ended_at as i64,
                cancelled as i64
            ],
        )?;
        Ok(())
    }

    pub fn snapshot_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0))?;
        Ok(count as u64)
    }
}
