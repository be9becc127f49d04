use std::path::Path;

use chrono::Timelike;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::signals::Signal;

use super::{Fill, Order, OrderStatus};

/// Prevent duplicate submissions for the same signal intent.
///
/// Keys are deterministic fingerprints of the intent; records persist in
/// a dedicated SQLite table so restarts keep their dedup history.
pub struct IdempotencyManager {
    conn: Mutex<Connection>,
}

impl IdempotencyManager {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        Ok(IdempotencyManager {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(IdempotencyManager {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS idempotency (
                client_order_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                broker_order_id TEXT,
                order_json TEXT NOT NULL,
                last_fill_json TEXT
            );",
        )?;
        Ok(())
    }

    /// Deterministic fingerprint of one signal intent:
    /// `sha256(signal_id|symbol|direction|timeframe|ts_minute)[..24]`.
    pub fn generate_client_order_id(signal: &Signal) -> String {
        let ts_minute = signal
            .ts
            .with_second(0)
            .and_then(|ts| ts.with_nanosecond(0))
            .unwrap_or(signal.ts)
            .to_rfc3339();
        let raw = format!(
            "{}|{}|{}|{}|{}",
            signal.signal_id,
            signal.symbol,
            signal.direction.as_str(),
            signal.timeframe,
            ts_minute
        );
        let digest = Sha256::digest(raw.as_bytes());
        hex::encode(digest)[..24].to_string()
    }

    /// Register an order under its client order id.
    ///
    /// Returns `(true, existing)` when a record with a live-or-filled
    /// status already exists (duplicate); otherwise upserts the new
    /// attempt and returns `(false, None)`.
    pub async fn check_and_register(
        &self,
        client_order_id: &str,
        order: &Order,
    ) -> Result<(bool, Option<Order>)> {
        let conn = self.conn.lock().await;
        let existing: Option<(String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT status, order_json FROM idempotency WHERE client_order_id = ?1",
            )?;
            let mut rows = stmt.query([client_order_id])?;
            match rows.next()? {
                Some(row) => Some((row.get(0)?, row.get(1)?)),
                None => None,
            }
        };

        if let Some((status_raw, order_json)) = existing {
            let status: OrderStatus =
                serde_json::from_value(serde_json::Value::String(status_raw))?;
            if status.is_live_or_filled() {
                let existing_order: Order = serde_json::from_str(&order_json)?;
                return Ok((true, Some(existing_order)));
            }
            // Terminal record: treat the new order as a retry attempt.
            conn.execute(
                "UPDATE idempotency
                 SET status = ?1, broker_order_id = ?2, order_json = ?3, last_fill_json = NULL
                 WHERE client_order_id = ?4",
                rusqlite::params![
                    order.status.as_str(),
                    order.broker_order_id,
                    serde_json::to_string(order)?,
                    client_order_id
                ],
            )?;
            return Ok((false, None));
        }

        conn.execute(
            "INSERT INTO idempotency (client_order_id, status, broker_order_id, order_json, last_fill_json)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            rusqlite::params![
                client_order_id,
                order.status.as_str(),
                order.broker_order_id,
                serde_json::to_string(order)?
            ],
        )?;
        Ok((false, None))
    }

    pub async fn mark_submitted(
        &self,
        client_order_id: &str,
        broker_order_id: &str,
        order: &Order,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE idempotency
             SET status = ?1, broker_order_id = ?2, order_json = ?3
             WHERE client_order_id = ?4",
            rusqlite::params![
                OrderStatus::Submitted.as_str(),
                broker_order_id,
                serde_json::to_string(order)?,
                client_order_id
            ],
        )?;
        Ok(())
    }

    pub async fn mark_filled(&self, client_order_id: &str, fill: &Fill) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE idempotency
             SET status = ?1,
                 broker_order_id = COALESCE(?2, broker_order_id),
                 last_fill_json = ?3
             WHERE client_order_id = ?4",
            rusqlite::params![
                OrderStatus::Filled.as_str(),
                fill.broker_fill_id,
                serde_json::to_string(fill)?,
                client_order_id
            ],
        )?;
        Ok(())
    }

    pub async fn get_status(&self, client_order_id: &str) -> Result<Option<OrderStatus>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT status FROM idempotency WHERE client_order_id = ?1")?;
        let mut rows = stmt.query([client_order_id])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(serde_json::from_value(serde_json::Value::String(
                    raw,
                ))?))
            }
            None => Ok(None),
        }
    }
}
