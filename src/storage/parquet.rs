use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, TimeZone, Utc};
use polars::prelude::*;

use crate::data::{AssetClass, OHLCVBar, Timeframe};
use crate::error::{Error, Result};

/// Monthly-partitioned parquet persistence for OHLCV history.
///
/// Layout: `<root>/parquet/<broker>/<symbol>/<timeframe>/<YYYY-MM>.parquet`.
/// Writes are atomic at file granularity (tmp file + rename); concurrent
/// writers to the same partition need external coordination.
pub struct ParquetStore {
    base_path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub file_count: usize,
    pub size_bytes: u64,
    pub asset_count: usize,
}

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ParquetStore {
            base_path: root.into().join("parquet"),
        }
    }

    /// Save bars, deduplicating by `ts_open` per partition (last writer wins).
    pub async fn save_bars(&self, bars: &[OHLCVBar]) -> Result<()> {
        if bars.is_empty() {
            return Ok(());
        }

        let mut grouped: BTreeMap<PathBuf, Vec<OHLCVBar>> = BTreeMap::new();
        for bar in bars {
            grouped
                .entry(self.file_path_for(bar))
                .or_default()
                .push(bar.clone());
        }

        for (file_path, batch) in grouped {
            let existing = read_bars_from_file(&file_path)?;
            let mut merged: BTreeMap<i64, OHLCVBar> = existing
                .into_iter()
                .map(|bar| (bar.ts_open.timestamp_micros(), bar))
                .collect();
            for bar in batch {
                merged.insert(bar.ts_open.timestamp_micros(), bar);
            }
            let sorted: Vec<OHLCVBar> = merged.into_values().collect();
            write_bars_to_file(&file_path, &sorted)?;
        }
        Ok(())
    }

    /// Load bars whose `ts_open` falls in the closed `[start, end]` range.
    pub async fn load_bars(
        &self,
        symbol: &str,
        broker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OHLCVBar>> {
        let mut result = Vec::new();
        for file_path in self.files_for_range(symbol, broker, timeframe, start, end) {
            for bar in read_bars_from_file(&file_path)? {
                if bar.ts_open >= start && bar.ts_open <= end {
                    result.push(bar);
                }
            }
        }
        result.sort_by_key(|bar| bar.ts_open);
        Ok(result)
    }

    /// Delete bars in range, rewriting touched partitions. Returns the count.
    pub async fn delete_bars(
        &self,
        symbol: &str,
        broker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let mut removed = 0;
        for file_path in self.files_for_range(symbol, broker, timeframe, start, end) {
            let bars = read_bars_from_file(&file_path)?;
            let kept: Vec<OHLCVBar> = bars
                .into_iter()
                .filter(|bar| {
                    let inside = bar.ts_open >= start && bar.ts_open <= end;
                    if inside {
                        removed += 1;
                    }
                    !inside
                })
                .collect();
            if kept.is_empty() {
                let _ = std::fs::remove_file(&file_path);
            } else {
                write_bars_to_file(&file_path, &kept)?;
            }
        }
        Ok(removed)
    }

    /// Return `(min ts_open, max ts_close)` for one series, if any.
    pub async fn get_available_range(
        &self,
        symbol: &str,
        broker: &str,
        timeframe: Timeframe,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let dir = self.partition_dir(symbol, broker, timeframe);
        if !dir.exists() {
            return Ok(None);
        }
        let mut min_open: Option<DateTime<Utc>> = None;
        let mut max_close: Option<DateTime<Utc>> = None;
        for file_path in sorted_parquet_files(&dir)? {
            let bars = read_bars_from_file(&file_path)?;
            if let Some(first) = bars.first() {
                min_open = Some(min_open.map_or(first.ts_open, |v| v.min(first.ts_open)));
            }
            if let Some(last) = bars.last() {
                max_close = Some(max_close.map_or(last.ts_close, |v| v.max(last.ts_close)));
            }
        }
        Ok(min_open.zip(max_close))
    }

    /// Enumerate stored partitions as (broker, symbol, timeframe, file name).
    pub fn list_partitions(&self) -> Result<Vec<(String, String, String, String)>> {
        let mut results = Vec::new();
        if !self.base_path.exists() {
            return Ok(results);
        }
        for file_path in walk_parquet_files(&self.base_path)? {
            let rel = file_path
                .strip_prefix(&self.base_path)
                .map_err(|err| Error::Internal(err.to_string()))?;
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            if parts.len() == 4 {
                results.push((
                    parts[0].clone(),
                    parts[1].clone(),
                    parts[2].clone(),
                    parts[3].clone(),
                ));
            }
        }
        results.sort();
        Ok(results)
    }

    pub fn storage_stats(&self) -> Result<StorageStats> {
        let files = if self.base_path.exists() {
            walk_parquet_files(&self.base_path)?
        } else {
            Vec::new()
        };
        let mut size_bytes = 0;
        let mut assets = std::collections::BTreeSet::new();
        for file in &files {
            size_bytes += std::fs::metadata(file)?.len();
            let parts: Vec<_> = file.components().collect();
            if parts.len() >= 3 {
                assets.insert(parts[parts.len() - 3].as_os_str().to_string_lossy().to_string());
            }
        }
        Ok(StorageStats {
            file_count: files.len(),
            size_bytes,
            asset_count: assets.len(),
        })
    }

    fn partition_dir(&self, symbol: &str, broker: &str, timeframe: Timeframe) -> PathBuf {
        self.base_path
            .join(broker)
            .join(symbol)
            .join(timeframe.as_str())
    }

    fn file_path_for(&self, bar: &OHLCVBar) -> PathBuf {
        let month_key = bar.ts_open.format("%Y-%m").to_string();
        self.partition_dir(&bar.symbol, &bar.broker, bar.timeframe)
            .join(format!("{month_key}.parquet"))
    }

    fn files_for_range(
        &self,
        symbol: &str,
        broker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<PathBuf> {
        let dir = self.partition_dir(symbol, broker, timeframe);
        if !dir.exists() {
            return Vec::new();
        }
        let mut files = Vec::new();
        let mut cursor = Utc
            .with_ymd_and_hms(start.year(), start.month(), 1, 0, 0, 0)
            .unwrap();
        let end_month = Utc
            .with_ymd_and_hms(end.year(), end.month(), 1, 0, 0, 0)
            .unwrap();
        while cursor <= end_month {
            let candidate = dir.join(format!("{}.parquet", cursor.format("%Y-%m")));
            if candidate.exists() {
                files.push(candidate);
            }
            cursor = if cursor.month() == 12 {
                Utc.with_ymd_and_hms(cursor.year() + 1, 1, 1, 0, 0, 0).unwrap()
            } else {
                Utc.with_ymd_and_hms(cursor.year(), cursor.month() + 1, 1, 0, 0, 0)
                    .unwrap()
            };
        }
        files
    }
}

fn bars_to_frame(bars: &[OHLCVBar]) -> Result<DataFrame> {
    let symbol: Vec<&str> = bars.iter().map(|b| b.symbol.as_str()).collect();
    let broker: Vec<&str> = bars.iter().map(|b| b.broker.as_str()).collect();
    let timeframe: Vec<&str> = bars.iter().map(|b| b.timeframe.as_str()).collect();
    let ts_open: Vec<i64> = bars.iter().map(|b| b.ts_open.timestamp_micros()).collect();
    let ts_close: Vec<i64> = bars.iter().map(|b| b.ts_close.timestamp_micros()).collect();
    let open: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let high: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let low: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let close: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volume: Vec<f64> = bars.iter().map(|b| b.volume).collect();
    let tick_count: Vec<Option<i64>> = bars
        .iter()
        .map(|b| b.tick_count.map(|v| v as i64))
        .collect();
    let spread: Vec<Option<f64>> = bars.iter().map(|b| b.spread).collect();
    let asset_class: Vec<&str> = bars.iter().map(|b| b.asset_class.as_str()).collect();
    let source: Vec<&str> = bars.iter().map(|b| b.source.as_str()).collect();

    let frame = df!(
        "symbol" => symbol,
        "broker" => broker,
        "timeframe" => timeframe,
        "ts_open" => ts_open,
        "ts_close" => ts_close,
        "open" => open,
        "high" => high,
        "low" => low,
        "close" => close,
        "volume" => volume,
        "tick_count" => tick_count,
        "spread" => spread,
        "asset_class" => asset_class,
        "source" => source,
    )?;
    Ok(frame)
}

fn frame_to_bars(frame: &DataFrame) -> Result<Vec<OHLCVBar>> {
    let symbol = frame.column("symbol")?.str()?;
    let broker = frame.column("broker")?.str()?;
    let timeframe = frame.column("timeframe")?.str()?;
    let ts_open = frame.column("ts_open")?.i64()?;
    let ts_close = frame.column("ts_close")?.i64()?;
    let open = frame.column("open")?.f64()?;
    let high = frame.column("high")?.f64()?;
    let low = frame.column("low")?.f64()?;
    let close = frame.column("close")?.f64()?;
    let volume = frame.column("volume")?.f64()?;
    let tick_count = frame.column("tick_count")?.i64()?;
    let spread = frame.column("spread")?.f64()?;
    let asset_class = frame.column("asset_class")?.str()?;
    let source = frame.column("source")?.str()?;

    let mut bars = Vec::with_capacity(frame.height());
    for i in 0..frame.height() {
        let ts_open_us = ts_open
            .get(i)
            .ok_or_else(|| Error::validation("null ts_open in parquet row"))?;
        let ts_close_us = ts_close
            .get(i)
            .ok_or_else(|| Error::validation("null ts_close in parquet row"))?;
        let bar = OHLCVBar {
            symbol: symbol.get(i).unwrap_or_default().to_string(),
            broker: broker.get(i).unwrap_or_default().to_string(),
            timeframe: timeframe.get(i).unwrap_or("H1").parse()?,
            ts_open: micros_to_datetime(ts_open_us)?,
            ts_close: micros_to_datetime(ts_close_us)?,
            open: open.get(i).unwrap_or(f64::NAN),
            high: high.get(i).unwrap_or(f64::NAN),
            low: low.get(i).unwrap_or(f64::NAN),
            close: close.get(i).unwrap_or(f64::NAN),
            volume: volume.get(i).unwrap_or(0.0),
            tick_count: tick_count.get(i).map(|v| v as u64),
            spread: spread.get(i),
            asset_class: AssetClass::parse(asset_class.get(i).unwrap_or("unknown")),
            source: source.get(i).unwrap_or_default().to_string(),
        }
        .validated()?;
        bars.push(bar);
    }
    bars.sort_by_key(|bar| bar.ts_open);
    Ok(bars)
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::validation(format!("invalid timestamp micros: {micros}")))
}

fn read_bars_from_file(file_path: &Path) -> Result<Vec<OHLCVBar>> {
    if !file_path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(file_path)?;
    let frame = ParquetReader::new(file).finish()?;
    frame_to_bars(&frame)
}

fn write_bars_to_file(file_path: &Path, bars: &[OHLCVBar]) -> Result<()> {
    if bars.is_empty() {
        let _ = std::fs::remove_file(file_path);
        return Ok(());
    }
    if let Some(parent) = file_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut frame = bars_to_frame(bars)?;
    let tmp_path = file_path.with_extension("parquet.tmp");
    {
        let file = std::fs::File::create(&tmp_path)?;
        ParquetWriter::new(file).finish(&mut frame)?;
    }
    std::fs::rename(&tmp_path, file_path)?;
    Ok(())
}

fn sorted_parquet_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "parquet"))
        .collect();
    files.sort();
    Ok(files)
}

fn walk_parquet_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut stack = vec![root.to_path_buf()];
    let mut files = Vec::new();
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "parquet") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_bars(count: usize, start: DateTime<Utc>) -> Vec<OHLCVBar> {
        (0..count)
            .map(|i| {
                let ts_open = start + Duration::hours(i as i64);
                OHLCVBar {
                    symbol: "EURUSD".into(),
                    broker: "paper".into(),
                    timeframe: Timeframe::H1,
                    ts_open,
                    ts_close: ts_open + Duration::hours(1),
                    open: 1.10,
                    high: 1.11,
                    low: 1.09,
                    close: 1.105,
                    volume: 1000.0 + i as f64,
                    tick_count: Some(42),
                    spread: Some(0.0001),
                    asset_class: AssetClass::Forex,
                    source: "test".into(),
                }
                .validated()
                .unwrap()
            })
            .collect()
    }

    fn day_one() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let bars = make_bars(10, day_one());
        store.save_bars(&bars).await.unwrap();

        let loaded = store
            .load_bars(
                "EURUSD",
                "paper",
                Timeframe::H1,
                day_one(),
                day_one() + Duration::days(1),
            )
            .await
            .unwrap();
        assert_eq!(loaded, bars);
    }

    #[tokio::test]
    async fn double_save_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let bars = make_bars(6, day_one());
        store.save_bars(&bars).await.unwrap();
        store.save_bars(&bars).await.unwrap();

        let loaded = store
            .load_bars(
                "EURUSD",
                "paper",
                Timeframe::H1,
                day_one(),
                day_one() + Duration::days(1),
            )
            .await
            .unwrap();
        assert_eq!(loaded.len(), 6);
    }

    #[tokio::test]
    async fn dedup_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let bars = make_bars(3, day_one());
        store.save_bars(&bars).await.unwrap();

        let mut replacement = bars[1].clone();
        replacement.close = 1.1077;
        store.save_bars(std::slice::from_ref(&replacement)).await.unwrap();

        let loaded = store
            .load_bars(
                "EURUSD",
                "paper",
                Timeframe::H1,
                day_one(),
                day_one() + Duration::days(1),
            )
            .await
            .unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].close, 1.1077);
    }

    #[tokio::test]
    async fn load_spans_month_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let jan = make_bars(3, Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap());
        store.save_bars(&jan).await.unwrap();

        let partitions = store.list_partitions().unwrap();
        assert_eq!(partitions.len(), 2); // 2024-01 and 2024-02

        let loaded = store
            .load_bars(
                "EURUSD",
                "paper",
                Timeframe::H1,
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(loaded.len(), 3);
    }

    #[tokio::test]
    async fn delete_range_rewrites_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let bars = make_bars(5, day_one());
        store.save_bars(&bars).await.unwrap();

        let removed = store
            .delete_bars(
                "EURUSD",
                "paper",
                Timeframe::H1,
                bars[1].ts_open,
                bars[2].ts_open,
            )
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let loaded = store
            .load_bars(
                "EURUSD",
                "paper",
                Timeframe::H1,
                day_one(),
                day_one() + Duration::days(1),
            )
            .await
            .unwrap();
        assert_eq!(loaded.len(), 3);
    }

    #[tokio::test]
    async fn available_range_covers_open_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let bars = make_bars(4, day_one());
        store.save_bars(&bars).await.unwrap();

        let (min_open, max_close) = store
            .get_available_range("EURUSD", "paper", Timeframe::H1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(min_open, bars[0].ts_open);
        assert_eq!(max_close, bars[3].ts_close);
    }

    #[tokio::test]
    async fn missing_series_has_no_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        assert!(store
            .get_available_range("GBPUSD", "paper", Timeframe::H1)
            .await
            .unwrap()
            .is_none());
    }
}
