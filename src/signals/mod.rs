pub mod anti_overtrading;
pub mod confidence;
pub mod engine;
pub mod ensemble;
pub mod filters;
pub mod strategies;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{AssetClass, Metadata, Timeframe};
use crate::error::{Error, Result};
use crate::regime::MarketRegime;

pub use anti_overtrading::{AntiOvertradingConfig, AntiOvertradingGuard};
pub use confidence::{ConfidenceConfig, ConfidenceScorer};
pub use engine::{
    EnsembleConfig, FiltersConfig, SignalEngine, SignalStrategyConfig, SignalsConfig,
    ENSEMBLE_STRATEGY_ID,
};
pub use ensemble::{EnsembleMethod, SignalEnsemble};
pub use filters::FilterResult;
pub use strategies::{SignalStrategy, StrategyContext, StrategyParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalDirection {
    Buy,
    Sell,
    Wait,
    NoTrade,
}

impl SignalDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalDirection::Buy => "BUY",
            SignalDirection::Sell => "SELL",
            SignalDirection::Wait => "WAIT",
            SignalDirection::NoTrade => "NO_TRADE",
        }
    }

    pub fn is_actionable(self) -> bool {
        matches!(self, SignalDirection::Buy | SignalDirection::Sell)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStrength {
    None,
    Weak,
    Moderate,
    Strong,
}

/// Band a confidence score into a display strength.
pub fn strength_for(confidence: f64) -> SignalStrength {
    if confidence >= 0.75 {
        SignalStrength::Strong
    } else if confidence >= 0.55 {
        SignalStrength::Moderate
    } else if confidence >= 0.40 {
        SignalStrength::Weak
    } else {
        SignalStrength::None
    }
}

/// One explainable factor behind a signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalReason {
    pub factor: String,
    pub value: serde_json::Value,
    /// Signed contribution in [-1, 1].
    pub contribution: f64,
    /// Relative weight in [0, 1]; renormalized at the ensemble stage.
    pub weight: f64,
    pub description: String,
    pub direction: String,
    pub source: String,
}

/// A strategy's directional recommendation. Frozen after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub strategy_id: String,
    pub strategy_version: String,
    pub symbol: String,
    pub broker: String,
    pub timeframe: Timeframe,
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub direction: SignalDirection,
    pub strength: SignalStrength,
    /// Raw model score in [-100, 100].
    pub raw_score: f64,
    pub confidence: f64,
    pub reasons: Vec<SignalReason>,
    pub regime: MarketRegime,
    pub horizon: String,
    pub entry_price: Option<f64>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Aggregated decision from multiple contributing signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub symbol: String,
    pub broker: String,
    pub timeframe: Timeframe,
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub final_direction: SignalDirection,
    pub final_confidence: f64,
    pub final_strength: SignalStrength,
    pub contributing_signals: Vec<Signal>,
    pub all_reasons: Vec<SignalReason>,
    pub agreement_score: f64,
    pub contradiction_score: f64,
    pub regime: MarketRegime,
    pub horizon: String,
    #[serde(default)]
    pub filters_blocked: Vec<String>,
    #[serde(default)]
    pub filters_passed: Vec<String>,
    #[serde(default)]
    pub explanation: String,
}

/// User-facing packaging of an [`EnsembleResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResult {
    pub ensemble: EnsembleResult,
    pub display_decision: String,
    pub display_color: String,
    pub confidence_percent: u8,
    pub top_reasons: Vec<SignalReason>,
    pub computed_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub asset_class: AssetClass,
    pub horizon_human: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingHorizon {
    Scalp,
    Intraday,
    Swing,
    Position,
    Investment,
}

impl TradingHorizon {
    pub fn as_str(self) -> &'static str {
        match self {
            TradingHorizon::Scalp => "scalp",
            TradingHorizon::Intraday => "intraday",
            TradingHorizon::Swing => "swing",
            TradingHorizon::Position => "position",
            TradingHorizon::Investment => "investment",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HorizonSelection {
    pub horizon_class: TradingHorizon,
    pub timeframe: Timeframe,
    pub canonical: String,
}

/// Parse a compact horizon token (`30m`, `2h`, `3d`, `2w`, `1mn`, `1y`)
/// into a trading class and working timeframe.
pub fn parse_horizon(input: &str) -> Result<HorizonSelection> {
    let raw = input.trim().to_lowercase();
    let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
    let unit: String = raw.chars().skip_while(char::is_ascii_digit).collect();
    let amount: i64 = digits
        .parse()
        .map_err(|_| Error::validation(format!("invalid horizon: {input}")))?;
    if amount <= 0 {
        return Err(Error::validation(format!("invalid horizon: {input}")));
    }
    let selection = match unit.trim() {
        "m" | "min" => HorizonSelection {
            horizon_class: TradingHorizon::Scalp,
            timeframe: Timeframe::M5,
            canonical: format!("{amount}m"),
        },
        "h" => HorizonSelection {
            horizon_class: TradingHorizon::Intraday,
            timeframe: Timeframe::H1,
            canonical: format!("{amount}h"),
        },
        "d" => HorizonSelection {
            horizon_class: TradingHorizon::Swing,
            timeframe: if amount <= 3 { Timeframe::H4 } else { Timeframe::D1 },
            canonical: format!("{amount}d"),
        },
        "w" => HorizonSelection {
            horizon_class: TradingHorizon::Swing,
            timeframe: Timeframe::D1,
            canonical: format!("{amount}w"),
        },
        "mn" => HorizonSelection {
            horizon_class: TradingHorizon::Position,
            timeframe: Timeframe::W1,
            canonical: format!("{amount}mn"),
        },
        "y" => HorizonSelection {
            horizon_class: TradingHorizon::Investment,
            timeframe: Timeframe::MN1,
            canonical: format!("{amount}y"),
        },
        other => {
            return Err(Error::validation(format!("invalid horizon unit: {other}")));
        }
    };
    Ok(selection)
}

/// Human-readable description of a canonical horizon token.
pub fn horizon_to_human(canonical: &str) -> String {
    let digits: String = canonical.chars().take_while(char::is_ascii_digit).collect();
    let unit: String = canonical.chars().skip_while(char::is_ascii_digit).collect();
    let noun = match unit.as_str() {
        "m" => "minute",
        "h" => "hour",
        "d" => "day",
        "w" => "week",
        "mn" => "month",
        "y" => "year",
        _ => return canonical.to_string(),
    };
    let plural = if digits == "1" { "" } else { "s" };
    format!("{digits} {noun}{plural}")
}
