use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{BarCache, MetadataStore, ParquetStore};

use super::connector::{DataConnector, FallbackChain};
use super::{AssetClass, AssetInfo, OHLCVBar, Timeframe};
use crate::error::Result;

/// One detected hole in a stored bar series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataGap {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub missing_bars: i64,
}

/// Unified historical access facade: cache → parquet → connector chain.
pub struct DataRepository {
    parquet: Arc<ParquetStore>,
    metadata: Arc<MetadataStore>,
    cache: Arc<BarCache>,
    connectors: HashMap<String, Arc<dyn DataConnector>>,
    fallback: Option<FallbackChain>,
}

impl DataRepository {
    pub fn new(
        parquet: Arc<ParquetStore>,
        metadata: Arc<MetadataStore>,
        cache: Arc<BarCache>,
        connectors: HashMap<String, Arc<dyn DataConnector>>,
        fallback: Option<FallbackChain>,
    ) -> Self {
        DataRepository {
            parquet,
            metadata,
            cache,
            connectors,
            fallback,
        }
    }

    /// Fetch OHLCV bars. Resolution order: cache, parquet store (populating
    /// the cache), then the broker's connector when `auto_fetch` is set,
    /// with fallback-chain delegation on connector error. Fetched bars are
    /// persisted and cached before returning.
    pub async fn get_ohlcv(
        &self,
        symbol: &str,
        broker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        auto_fetch: bool,
    ) -> Result<Vec<OHLCVBar>> {
        let cache_key = BarCache::make_ohlcv_key(symbol, broker, timeframe, start, end);
        if let Some(cached) = self.cache.get_ohlcv(&cache_key).await {
            return Ok(cached.as_ref().clone());
        }

        let stored = self
            .parquet
            .load_bars(symbol, broker, timeframe, start, end)
            .await?;
        if !stored.is_empty() {
            self.cache.set_ohlcv(cache_key, stored.clone()).await;
            return Ok(stored);
        }

        if !auto_fetch {
            return Ok(Vec::new());
        }

        let mut bars: Vec<OHLCVBar> = Vec::new();
        if let Some(connector) = self.connectors.get(broker) {
            match connector.get_ohlcv(symbol, timeframe, start, end).await {
                Ok(fetched) => bars = fetched,
                Err(err) => match &self.fallback {
                    Some(chain) => {
                        tracing::warn!(
                            %broker,
                            %symbol,
                            error = %err,
                            "primary connector failed, delegating to fallback chain"
                        );
                        bars = chain.get_ohlcv(symbol, timeframe, start, end).await?;
                    }
                    None => return Err(err),
                },
            }
        } else if let Some(chain) = &self.fallback {
            bars = chain.get_ohlcv(symbol, timeframe, start, end).await?;
        }

        if !bars.is_empty() {
            self.save_ohlcv(&bars).await?;
            self.cache.set_ohlcv(cache_key, bars.clone()).await;
        }
        Ok(bars)
    }

    pub async fn save_ohlcv(&self, bars: &[OHLCVBar]) -> Result<()> {
        self.parquet.save_bars(bars).await
    }

    pub async fn get_asset_info(&self, symbol: &str, broker: &str) -> Result<Option<AssetInfo>> {
        self.metadata.get_asset_info(symbol, broker).await
    }

    /// Asset metadata with per-class defaults when nothing is stored.
    pub async fn asset_info_or_default(
        &self,
        symbol: &str,
        broker: &str,
        asset_class: AssetClass,
    ) -> AssetInfo {
        match self.metadata.get_asset_info(symbol, broker).await {
            Ok(Some(info)) => info,
            _ => AssetInfo::defaults_for(symbol, broker, asset_class),
        }
    }

    pub fn list_available_data(&self) -> Result<Vec<(String, String, String, String)>> {
        self.parquet.list_partitions()
    }

    /// Detect holes where consecutive stored opens differ by more than one
    /// timeframe interval.
    pub async fn get_data_gaps(
        &self,
        symbol: &str,
        broker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DataGap>> {
        let bars = self
            .parquet
            .load_bars(symbol, broker, timeframe, start, end)
            .await?;
        let expected = timeframe.seconds();
        let mut gaps = Vec::new();
        for pair in bars.windows(2) {
            let delta = (pair[1].ts_open - pair[0].ts_open).num_seconds();
            if delta <= expected {
                continue;
            }
            gaps.push(DataGap {
                from: pair[0].ts_open,
                to: pair[1].ts_open,
                missing_bars: (delta / expected) - 1,
            });
        }
        Ok(gaps)
    }

    pub async fn invalidate_cache(&self, pattern: &str) {
        self.cache.invalidate(pattern).await;
    }
}
