use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::backtest::synthetic::generate_synthetic_bars;
use crate::error::{Error, Result};

use super::{AssetClass, OHLCVBar, Tick, Timeframe};

/// Historical/market data source for one broker.
///
/// Concrete live connectors (MT5, CCXT, …) are thin out-of-tree shims; the
/// crate ships only the deterministic mock.
#[async_trait]
pub trait DataConnector: Send + Sync {
    fn connector_id(&self) -> &str;
    fn broker(&self) -> &str;

    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OHLCVBar>>;

    async fn get_latest_tick(&self, symbol: &str) -> Result<Tick>;

    /// Round-trip latency in milliseconds.
    async fn ping(&self) -> Result<f64>;
}

/// Deterministic connector producing seeded synthetic data.
pub struct MockConnector {
    broker: String,
    seed: u64,
    base_price: f64,
    asset_class: AssetClass,
    connected: bool,
}

impl MockConnector {
    pub fn new(broker: &str, seed: u64) -> Self {
        MockConnector {
            broker: broker.to_string(),
            seed,
            base_price: 1.1000,
            asset_class: AssetClass::Forex,
            connected: true,
        }
    }

    pub fn with_base_price(mut self, base_price: f64, asset_class: AssetClass) -> Self {
        self.base_price = base_price;
        self.asset_class = asset_class;
        self
    }

    pub fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }
}

#[async_trait]
impl DataConnector for MockConnector {
    fn connector_id(&self) -> &str {
        "mock"
    }

    fn broker(&self) -> &str {
        &self.broker
    }

    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OHLCVBar>> {
        if !self.connected {
            return Err(Error::NotConnected(self.broker.clone()));
        }
        Ok(generate_synthetic_bars(
            symbol,
            &self.broker,
            timeframe,
            start,
            end,
            self.seed,
            self.base_price,
            self.asset_class,
        ))
    }

    async fn get_latest_tick(&self, symbol: &str) -> Result<Tick> {
        if !self.connected {
            return Err(Error::NotConnected(self.broker.clone()));
        }
        let end = Utc::now();
        let start = end - Duration::hours(4);
        let bars = generate_synthetic_bars(
            symbol,
            &self.broker,
            Timeframe::H1,
            start,
            end,
            self.seed,
            self.base_price,
            self.asset_class,
        );
        let last = bars
            .last()
            .ok_or_else(|| Error::Internal("mock connector produced no bars".into()))?;
        let half_spread = last.spread.unwrap_or(0.0001) / 2.0;
        Tick {
            symbol: symbol.to_string(),
            broker: self.broker.clone(),
            ts: last.ts_close,
            bid: last.close - half_spread,
            ask: last.close + half_spread,
            last: Some(last.close),
            volume: Some(last.volume),
            spread: None,
            asset_class: self.asset_class,
            source: "mock".to_string(),
        }
        .validated()
    }

    async fn ping(&self) -> Result<f64> {
        if !self.connected {
            return Err(Error::NotConnected(self.broker.clone()));
        }
        Ok(1.0)
    }
}

/// Ordered fallback connectors, optionally overridden per symbol.
pub struct FallbackChain {
    default_chain: Vec<Arc<dyn DataConnector>>,
    per_symbol: HashMap<String, Vec<Arc<dyn DataConnector>>>,
}

impl FallbackChain {
    pub fn new(default_chain: Vec<Arc<dyn DataConnector>>) -> Self {
        FallbackChain {
            default_chain,
            per_symbol: HashMap::new(),
        }
    }

    pub fn with_symbol_chain(mut self, symbol: &str, chain: Vec<Arc<dyn DataConnector>>) -> Self {
        self.per_symbol.insert(symbol.to_string(), chain);
        self
    }

    /// Walk the chain in order; first successful connector wins.
    pub async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OHLCVBar>> {
        let chain = self
            .per_symbol
            .get(symbol)
            .unwrap_or(&self.default_chain);
        let mut last_error: Option<Error> = None;
        for connector in chain {
            match connector.get_ohlcv(symbol, timeframe, start, end).await {
                Ok(bars) => return Ok(bars),
                Err(err) => {
                    tracing::warn!(
                        connector = connector.connector_id(),
                        broker = connector.broker(),
                        %symbol,
                        error = %err,
                        "fallback connector failed"
                    );
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(Vec::new()),
        }
    }
}
