pub mod connector;
pub mod repository;
pub mod timeframe;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use connector::{DataConnector, FallbackChain, MockConnector};
pub use repository::{DataGap, DataRepository};
pub use timeframe::Timeframe;

/// Free-form metadata attached to signals, orders, and positions.
pub type Metadata = HashMap<String, serde_json::Value>;

pub fn meta_f64(meta: &Metadata, key: &str, default: f64) -> f64 {
    meta.get(key).and_then(serde_json::Value::as_f64).unwrap_or(default)
}

pub fn meta_str<'a>(meta: &'a Metadata, key: &str) -> Option<&'a str> {
    meta.get(key).and_then(serde_json::Value::as_str)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Forex,
    Crypto,
    Stock,
    Etf,
    Cedear,
    Bond,
    Index,
    Commodity,
    Futures,
    Option,
    BinaryOption,
    FixedTerm,
    Unknown,
}

impl AssetClass {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetClass::Forex => "forex",
            AssetClass::Crypto => "crypto",
            AssetClass::Stock => "stock",
            AssetClass::Etf => "etf",
            AssetClass::Cedear => "cedear",
            AssetClass::Bond => "bond",
            AssetClass::Index => "index",
            AssetClass::Commodity => "commodity",
            AssetClass::Futures => "futures",
            AssetClass::Option => "option",
            AssetClass::BinaryOption => "binary_option",
            AssetClass::FixedTerm => "fixed_term",
            AssetClass::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> AssetClass {
        match raw.to_lowercase().as_str() {
            "forex" => AssetClass::Forex,
            "crypto" => AssetClass::Crypto,
            "stock" => AssetClass::Stock,
            "etf" => AssetClass::Etf,
            "cedear" => AssetClass::Cedear,
            "bond" => AssetClass::Bond,
            "index" => AssetClass::Index,
            "commodity" => AssetClass::Commodity,
            "futures" => AssetClass::Futures,
            "option" => AssetClass::Option,
            "binary_option" => AssetClass::BinaryOption,
            "fixed_term" => AssetClass::FixedTerm,
            _ => AssetClass::Unknown,
        }
    }

    /// Symbol-shape heuristic used when no asset metadata is stored.
    pub fn detect(symbol: &str) -> AssetClass {
        let upper = symbol.to_uppercase();
        if upper.starts_with("BTC") || upper.starts_with("ETH") {
            return AssetClass::Crypto;
        }
        if upper.len() == 6 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
            return AssetClass::Forex;
        }
        AssetClass::Unknown
    }
}

/// Normalized OHLCV bar. Construct through [`OHLCVBar::validated`]; the
/// invariants hold for every instance that crosses a module boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OHLCVBar {
    pub symbol: String,
    pub broker: String,
    pub timeframe: Timeframe,
    pub ts_open: DateTime<Utc>,
    pub ts_close: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub tick_count: Option<u64>,
    #[serde(default)]
    pub spread: Option<f64>,
    pub asset_class: AssetClass,
    pub source: String,
}

impl OHLCVBar {
    /// Validate OHLCV coherence and return the bar.
    pub fn validated(self) -> Result<Self> {
        if self.ts_close <= self.ts_open {
            return Err(Error::validation("ts_close must be greater than ts_open"));
        }
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|price| *price <= 0.0 || !price.is_finite()) {
            return Err(Error::validation("all OHLC prices must be finite and > 0"));
        }
        if self.high < self.open.max(self.close) || self.high < self.low {
            return Err(Error::validation("high must be >= max(open, close) and >= low"));
        }
        if self.low > self.open.min(self.close) {
            return Err(Error::validation("low must be <= min(open, close)"));
        }
        if self.volume < 0.0 {
            return Err(Error::validation("volume must be >= 0"));
        }
        Ok(self)
    }
}

/// Real-time quote tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub broker: String,
    pub ts: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub last: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub spread: Option<f64>,
    pub asset_class: AssetClass,
    pub source: String,
}

impl Tick {
    /// Validate quote consistency; derives `spread = ask - bid` when absent.
    pub fn validated(mut self) -> Result<Self> {
        if self.bid <= 0.0 || self.ask <= 0.0 {
            return Err(Error::validation("bid and ask must be > 0"));
        }
        if self.bid > self.ask {
            return Err(Error::validation("bid cannot be greater than ask"));
        }
        if let Some(last) = self.last {
            if last <= 0.0 {
                return Err(Error::validation("last must be > 0 when present"));
            }
        }
        if let Some(volume) = self.volume {
            if volume < 0.0 {
                return Err(Error::validation("volume must be >= 0"));
            }
        }
        match self.spread {
            None => self.spread = Some(self.ask - self.bid),
            Some(spread) if spread < 0.0 => {
                return Err(Error::validation("spread must be >= 0"));
            }
            Some(_) => {}
        }
        Ok(self)
    }

    /// Mid-market reference price: `last` when present, otherwise the mid.
    pub fn reference_price(&self) -> f64 {
        self.last.unwrap_or((self.bid + self.ask) / 2.0)
    }
}

/// Asset metadata from a specific broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetInfo {
    pub symbol: String,
    pub broker: String,
    pub name: String,
    pub asset_class: AssetClass,
    pub currency: String,
    pub contract_size: f64,
    pub pip_size: f64,
    pub digits: u32,
    pub min_volume: f64,
    pub max_volume: f64,
    pub volume_step: f64,
}

impl AssetInfo {
    /// Default per-class instrument parameters when no metadata is stored.
    pub fn defaults_for(symbol: &str, broker: &str, asset_class: AssetClass) -> AssetInfo {
        let (contract_size, pip_size, digits) = match asset_class {
            AssetClass::Forex => (100_000.0, 0.0001, 5),
            _ => (1.0, 0.01, 2),
        };
        AssetInfo {
            symbol: symbol.to_string(),
            broker: broker.to_string(),
            name: symbol.to_string(),
            asset_class,
            currency: "USD".to_string(),
            contract_size,
            pip_size,
            digits,
            min_volume: 0.01,
            max_volume: 1_000_000.0,
            volume_step: 0.01,
        }
    }
}

/// Quality report over one stored bar series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataQualityReport {
    pub symbol: String,
    pub broker: String,
    pub timeframe: Timeframe,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_bars: usize,
    pub missing_bars: usize,
    pub duplicate_bars: usize,
    pub gap_details: Vec<DataGap>,
    pub quality_score: f64,
    pub is_usable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn bar() -> OHLCVBar {
        OHLCVBar {
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            timeframe: Timeframe::H1,
            ts_open: ts(0),
            ts_close: ts(1),
            open: 1.1000,
            high: 1.1020,
            low: 1.0990,
            close: 1.1010,
            volume: 1250.0,
            tick_count: None,
            spread: Some(0.0001),
            asset_class: AssetClass::Forex,
            source: "test".into(),
        }
    }

    #[test]
    fn valid_bar_passes() {
        assert!(bar().validated().is_ok());
    }

    #[test]
    fn bar_rejects_inverted_timestamps() {
        let mut b = bar();
        b.ts_close = b.ts_open;
        assert!(b.validated().is_err());
    }

    #[test]
    fn bar_rejects_high_below_close() {
        let mut b = bar();
        b.high = 1.1005;
        assert!(b.validated().is_err());
    }

    #[test]
    fn bar_rejects_low_above_open() {
        let mut b = bar();
        b.low = 1.1005;
        assert!(b.validated().is_err());
    }

    #[test]
    fn bar_rejects_nonpositive_price() {
        let mut b = bar();
        b.open = 0.0;
        assert!(b.validated().is_err());
    }

    #[test]
    fn bar_rejects_negative_volume() {
        let mut b = bar();
        b.volume = -1.0;
        assert!(b.validated().is_err());
    }

    #[test]
    fn tick_derives_spread() {
        let tick = Tick {
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            ts: ts(0),
            bid: 1.1000,
            ask: 1.1002,
            last: None,
            volume: None,
            spread: None,
            asset_class: AssetClass::Forex,
            source: "test".into(),
        }
        .validated()
        .unwrap();
        assert!((tick.spread.unwrap() - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn tick_rejects_crossed_quote() {
        let tick = Tick {
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            ts: ts(0),
            bid: 1.1005,
            ask: 1.1002,
            last: None,
            volume: None,
            spread: None,
            asset_class: AssetClass::Forex,
            source: "test".into(),
        };
        assert!(tick.validated().is_err());
    }

    #[test]
    fn asset_class_detection() {
        assert_eq!(AssetClass::detect("EURUSD"), AssetClass::Forex);
        assert_eq!(AssetClass::detect("BTCUSD"), AssetClass::Crypto);
        assert_eq!(AssetClass::detect("SPY"), AssetClass::Unknown);
    }

    #[test]
    fn forex_defaults() {
        let info = AssetInfo::defaults_for("EURUSD", "paper", AssetClass::Forex);
        assert_eq!(info.contract_size, 100_000.0);
        assert_eq!(info.pip_size, 0.0001);
    }
}
