pub mod detector;
pub mod news;
pub mod sessions;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::Timeframe;

pub use detector::{RegimeConfig, RegimeDetector};
pub use news::{EconomicEvent, NewsCalendar};
pub use sessions::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendRegime {
    StrongUptrend,
    WeakUptrend,
    Ranging,
    WeakDowntrend,
    StrongDowntrend,
}

impl TrendRegime {
    pub fn as_str(self) -> &'static str {
        match self {
            TrendRegime::StrongUptrend => "strong_uptrend",
            TrendRegime::WeakUptrend => "weak_uptrend",
            TrendRegime::Ranging => "ranging",
            TrendRegime::WeakDowntrend => "weak_downtrend",
            TrendRegime::StrongDowntrend => "strong_downtrend",
        }
    }

    pub fn is_strong(self) -> bool {
        matches!(self, TrendRegime::StrongUptrend | TrendRegime::StrongDowntrend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityRegime {
    VeryLow,
    Low,
    Medium,
    High,
    Extreme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityRegime {
    Liquid,
    Thin,
    Illiquid,
}

/// Unified market regime snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRegime {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub ts: DateTime<Utc>,
    pub trend: TrendRegime,
    pub volatility: VolatilityRegime,
    pub liquidity: LiquidityRegime,
    pub is_tradeable: bool,
    pub no_trade_reasons: Vec<String>,
    pub confidence: f64,
    pub recommended_strategies: Vec<String>,
    pub description: String,
    pub metrics: HashMap<String, f64>,
}

impl MarketRegime {
    /// Neutral regime used when there is not enough data to classify.
    pub fn fallback(symbol: &str, timeframe: Timeframe, ts: DateTime<Utc>) -> Self {
        MarketRegime {
            symbol: symbol.to_string(),
            timeframe,
            ts,
            trend: TrendRegime::Ranging,
            volatility: VolatilityRegime::Medium,
            liquidity: LiquidityRegime::Liquid,
            is_tradeable: true,
            no_trade_reasons: Vec::new(),
            confidence: 0.5,
            recommended_strategies: vec!["mean_reversion".into(), "range_scalp".into()],
            description: "fallback_regime".to_string(),
            metrics: HashMap::new(),
        }
    }
}
