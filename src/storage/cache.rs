use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;

use crate::data::{OHLCVBar, Tick, Timeframe};
use crate::error::Result;

const OHLCV_TTL: Duration = Duration::from_secs(300);
const TICK_TTL: Duration = Duration::from_secs(60);

/// Optional networked L2 cache with the same key scheme as L1.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn invalidate(&self, pattern: &str) -> Result<()>;
}

struct Entry<T> {
    value: T,
    inserted: Instant,
}

/// In-memory TTL+LRU cache for OHLCV slices and latest ticks.
///
/// Bounded by `max_size` per map; when full, the oldest entry is evicted.
/// `invalidate` accepts glob-like patterns and clears matching L1 entries
/// plus L2 scan matches.
pub struct BarCache {
    ohlcv: DashMap<String, Entry<Arc<Vec<OHLCVBar>>>>,
    ticks: DashMap<String, Entry<Tick>>,
    max_size: usize,
    l2: Option<Arc<dyn CacheLayer>>,
}

impl BarCache {
    pub fn new(max_size: usize) -> Self {
        BarCache {
            ohlcv: DashMap::new(),
            ticks: DashMap::new(),
            max_size: max_size.max(1),
            l2: None,
        }
    }

    pub fn with_l2(max_size: usize, l2: Arc<dyn CacheLayer>) -> Self {
        let mut cache = BarCache::new(max_size);
        cache.l2 = Some(l2);
        cache
    }

    pub fn make_ohlcv_key(
        symbol: &str,
        broker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> String {
        format!(
            "{broker}:{symbol}:{timeframe}:{}:{}",
            start.to_rfc3339_opts(SecondsFormat::Secs, true),
            end.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }

    pub async fn get_ohlcv(&self, key: &str) -> Option<Arc<Vec<OHLCVBar>>> {
        if let Some(hit) = get_fresh(&self.ohlcv, key, OHLCV_TTL) {
            return Some(hit);
        }
        let l2 = self.l2.as_ref()?;
        let payload = l2.get(&format!("ohlcv:{key}")).await.ok().flatten()?;
        let bars: Vec<OHLCVBar> = serde_json::from_str(&payload).ok()?;
        let bars = Arc::new(bars);
        self.insert_ohlcv(key.to_string(), bars.clone());
        Some(bars)
    }

    pub async fn set_ohlcv(&self, key: String, bars: Vec<OHLCVBar>) {
        let bars = Arc::new(bars);
        self.insert_ohlcv(key.clone(), bars.clone());
        if let Some(l2) = &self.l2 {
            if let Ok(payload) = serde_json::to_string(bars.as_ref()) {
                let _ = l2.set(&format!("ohlcv:{key}"), payload, OHLCV_TTL).await;
            }
        }
    }

    pub async fn get_tick(&self, symbol: &str, broker: &str) -> Option<Tick> {
        let key = format!("{broker}:{symbol}");
        if let Some(hit) = get_fresh(&self.ticks, &key, TICK_TTL) {
            return Some(hit);
        }
        let l2 = self.l2.as_ref()?;
        let payload = l2.get(&format!("tick:{key}")).await.ok().flatten()?;
        let tick: Tick = serde_json::from_str(&payload).ok()?;
        self.insert_tick(key, tick.clone());
        Some(tick)
    }

    pub async fn set_tick(&self, tick: Tick) {
        let key = format!("{}:{}", tick.broker, tick.symbol);
        self.insert_tick(key.clone(), tick.clone());
        if let Some(l2) = &self.l2 {
            if let Ok(payload) = serde_json::to_string(&tick) {
                let _ = l2.set(&format!("tick:{key}"), payload, TICK_TTL).await;
            }
        }
    }

    /// Clear entries whose key matches a glob pattern, L1 and L2 alike.
    pub async fn invalidate(&self, pattern: &str) {
        if let Ok(matcher) = glob::Pattern::new(pattern) {
            self.ohlcv.retain(|key, _| !matcher.matches(key));
            self.ticks.retain(|key, _| !matcher.matches(key));
        }
        if let Some(l2) = &self.l2 {
            let _ = l2.invalidate(pattern).await;
        }
    }

    pub fn len(&self) -> usize {
        self.ohlcv.len() + self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_ohlcv(&self, key: String, bars: Arc<Vec<OHLCVBar>>) {
        evict_if_full(&self.ohlcv, self.max_size);
        self.ohlcv.insert(
            key,
            Entry {
                value: bars,
                inserted: Instant::now(),
            },
        );
    }

    fn insert_tick(&self, key: String, tick: Tick) {
        evict_if_full(&self.ticks, self.max_size);
        self.ticks.insert(
            key,
            Entry {
                value: tick,
                inserted: Instant::now(),
            },
        );
    }
}

fn get_fresh<T: Clone>(map: &DashMap<String, Entry<T>>, key: &str, ttl: Duration) -> Option<T> {
    let expired = match map.get(key) {
        Some(entry) if entry.inserted.elapsed() < ttl => return Some(entry.value.clone()),
        Some(_) => true,
        None => false,
    };
    if expired {
        map.remove(key);
    }
    None
}

fn evict_if_full<T>(map: &DashMap<String, Entry<T>>, max_size: usize) {
    if map.len() < max_size {
        return;
    }
    let oldest = map
        .iter()
        .min_by_key(|entry| entry.value().inserted)
        .map(|entry| entry.key().clone());
    if let Some(key) = oldest {
        map.remove(&key);
    }
}
