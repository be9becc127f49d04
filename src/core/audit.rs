use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::data::{Metadata, Timeframe};
use crate::error::{Error, Result};

/// Immutable audit record for one emitted decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub strategy_id: String,
    pub strategy_version: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub raw_inputs: Metadata,
    pub features: Metadata,
    pub scores: Metadata,
    pub decision: String,
    pub confidence: f64,
    pub reasons: Vec<serde_json::Value>,
    pub triggered_rule: String,
    pub triggered_condition: String,
}

/// Append-only decision journal: JSONL always, SQLite mirror optional.
///
/// The JSONL write is authoritative; mirror failures are logged and never
/// fail the caller.
pub struct AuditJournal {
    jsonl_path: PathBuf,
    mirror: Option<Mutex<Connection>>,
}

impl AuditJournal {
    pub fn new(jsonl_path: impl Into<PathBuf>) -> Self {
        AuditJournal {
            jsonl_path: jsonl_path.into(),
            mirror: None,
        }
    }

    /// Enable the indexed SQLite mirror alongside the JSONL file.
    pub fn with_mirror(jsonl_path: impl Into<PathBuf>, sqlite_path: &Path) -> Result<Self> {
        if let Some(parent) = sqlite_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(sqlite_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS journal (
                entry_id TEXT PRIMARY KEY,
                ts TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_journal_lookup
                ON journal (strategy_id, symbol, ts);",
        )?;
        Ok(AuditJournal {
            jsonl_path: jsonl_path.into(),
            mirror: Some(Mutex::new(conn)),
        })
    }

    /// Append one entry. The JSONL line lands before the mirror insert.
    pub async fn write(&self, entry: &AuditEntry) -> Result<()> {
        if let Some(parent) = self.jsonl_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.jsonl_path)
            .await?;
        file.write_all(line.as_bytes()).await?;

        if let Some(mirror) = &self.mirror {
            let payload = serde_json::to_string(entry)?;
            let conn = mirror.lock().await;
            let inserted = conn.execute(
                "INSERT OR REPLACE INTO journal (entry_id, ts, strategy_id, symbol, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    entry.entry_id,
                    entry.ts.to_rfc3339(),
                    entry.strategy_id,
                    entry.symbol,
                    payload
                ],
            );
            if let Err(err) = inserted {
                tracing::warn!(error = %err, entry_id = %entry.entry_id, "audit mirror write failed");
            }
        }
        Ok(())
    }

    /// Query entries by strategy, symbol, and closed date range.
    pub async fn query(
        &self,
        strategy_id: Option<&str>,
        symbol: Option<&str>,
        date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<AuditEntry>> {
        if let Some(mirror) = &self.mirror {
            let conn = mirror.lock().await;
            return query_mirror(&conn, strategy_id, symbol, date_range);
        }
        self.query_jsonl(strategy_id, symbol, date_range).await
    }

    async fn query_jsonl(
        &self,
        strategy_id: Option<&str>,
        symbol: Option<&str>,
        date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<AuditEntry>> {
        if !self.jsonl_path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&self.jsonl_path).await?;
        let mut entries = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(line)?;
            if matches_filter(&entry, strategy_id, symbol, date_range) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

fn query_mirror(
    conn: &Connection,
    strategy_id: Option<&str>,
    symbol: Option<&str>,
    date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Result<Vec<AuditEntry>> {
    let mut sql = "SELECT payload FROM journal".to_string();
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<String> = Vec::new();
    if let Some(strategy) = strategy_id {
        clauses.push("strategy_id = ?".into());
        params.push(strategy.to_string());
    }
    if let Some(symbol) = symbol {
        clauses.push("symbol = ?".into());
        params.push(symbol.to_string());
    }
    if let Some((start, end)) = date_range {
        clauses.push("ts BETWEEN ? AND ?".into());
        params.push(start.to_rfc3339());
        params.push(end.to_rfc3339());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY ts");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        row.get::<_, String>(0)
    })?;
    let mut entries = Vec::new();
    for payload in rows {
        let entry: AuditEntry =
            serde_json::from_str(&payload?).map_err(|err| Error::Internal(err.to_string()))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn matches_filter(
    entry: &AuditEntry,
    strategy_id: Option<&str>,
    symbol: Option<&str>,
    date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> bool {
    if let Some(strategy) = strategy_id {
        if entry.strategy_id != strategy {
            return false;
        }
    }
    if let Some(symbol) = symbol {
        if entry.symbol != symbol {
            return false;
        }
    }
    if let Some((start, end)) = date_range {
        if entry.ts < start || entry.ts > end {
            return false;
        }
    }
    true
}
