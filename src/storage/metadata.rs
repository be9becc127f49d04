use std::path::Path;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::data::{AssetInfo, DataQualityReport, Tick, Timeframe};
use crate::error::Result;

/// SQLite store for asset metadata, quality reports, and last-known ticks.
/// All writes are idempotent upserts.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS assets (
                symbol TEXT NOT NULL,
                broker TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (symbol, broker)
            );
            CREATE TABLE IF NOT EXISTS quality_reports (
                symbol TEXT NOT NULL,
                broker TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                created_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS last_prices (
                symbol TEXT NOT NULL,
                broker TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (symbol, broker)
            );",
        )?;
        Ok(MetadataStore {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (tests and isolated backtest stacks).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE assets (
                symbol TEXT NOT NULL, broker TEXT NOT NULL, payload TEXT NOT NULL,
                PRIMARY KEY (symbol, broker));
            CREATE TABLE quality_reports (
                symbol TEXT NOT NULL, broker TEXT NOT NULL, timeframe TEXT NOT NULL,
                created_at TEXT NOT NULL, payload TEXT NOT NULL);
            CREATE TABLE last_prices (
                symbol TEXT NOT NULL, broker TEXT NOT NULL, payload TEXT NOT NULL,
                PRIMARY KEY (symbol, broker));",
        )?;
        Ok(MetadataStore {
            conn: Mutex::new(conn),
        })
    }

    pub async fn save_asset_info(&self, asset: &AssetInfo) -> Result<()> {
        let payload = serde_json::to_string(asset)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO assets (symbol, broker, payload) VALUES (?1, ?2, ?3)",
            rusqlite::params![asset.symbol, asset.broker, payload],
        )?;
        Ok(())
    }

    pub async fn get_asset_info(&self, symbol: &str, broker: &str) -> Result<Option<AssetInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT payload FROM assets WHERE symbol = ?1 AND broker = ?2")?;
        let mut rows = stmt.query(rusqlite::params![symbol, broker])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    pub async fn list_assets(&self, broker: Option<&str>) -> Result<Vec<AssetInfo>> {
        let conn = self.conn.lock().await;
        let mut assets = Vec::new();
        if let Some(broker) = broker {
            let mut stmt = conn.prepare("SELECT payload FROM assets WHERE broker = ?1")?;
            let rows = stmt.query_map([broker], |row| row.get::<_, String>(0))?;
            for payload in rows {
                assets.push(serde_json::from_str(&payload?)?);
            }
        } else {
            let mut stmt = conn.prepare("SELECT payload FROM assets")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for payload in rows {
                assets.push(serde_json::from_str(&payload?)?);
            }
        }
        Ok(assets)
    }

    pub async fn save_quality_report(&self, report: &DataQualityReport) -> Result<()> {
        let payload = serde_json::to_string(report)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO quality_reports (symbol, broker, timeframe, created_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                report.symbol,
                report.broker,
                report.timeframe.as_str(),
                report.period_end.to_rfc3339(),
                payload
            ],
        )?;
        Ok(())
    }

    pub async fn get_latest_quality_report(
        &self,
        symbol: &str,
        broker: &str,
        timeframe: Timeframe,
    ) -> Result<Option<DataQualityReport>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT payload FROM quality_reports
             WHERE symbol = ?1 AND broker = ?2 AND timeframe = ?3
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(rusqlite::params![symbol, broker, timeframe.as_str()])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    pub async fn update_last_price(&self, tick: &Tick) -> Result<()> {
        let payload = serde_json::to_string(tick)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO last_prices (symbol, broker, payload) VALUES (?1, ?2, ?3)",
            rusqlite::params![tick.symbol, tick.broker, payload],
        )?;
        Ok(())
    }

    pub async fn get_last_price(&self, symbol: &str, broker: &str) -> Result<Option<Tick>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT payload FROM last_prices WHERE symbol = ?1 AND broker = ?2")?;
        let mut rows = stmt.query(rusqlite::params![symbol, broker])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }
}
