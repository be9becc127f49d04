mod investment_fundamental;
mod mean_reversion;
mod momentum_breakout;
mod range_scalp;
mod scalping_reversal;
mod swing_composite;
mod trend_following;

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::IdGen;
use crate::data::{Metadata, OHLCVBar, Timeframe};
use crate::regime::MarketRegime;

use super::{strength_for, Signal, SignalDirection, SignalReason};

pub use investment_fundamental::InvestmentFundamental;
pub use mean_reversion::MeanReversion;
pub use momentum_breakout::MomentumBreakout;
pub use range_scalp::RangeScalp;
pub use scalping_reversal::ScalpingReversal;
pub use swing_composite::SwingComposite;
pub use trend_following::TrendFollowing;

/// Numeric strategy parameters from config, with typed fallbacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyParams(pub HashMap<String, f64>);

impl StrategyParams {
    pub fn get(&self, key: &str, default: f64) -> f64 {
        self.0.get(key).copied().unwrap_or(default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.0
            .get(key)
            .map_or(default, |value| value.max(0.0) as usize)
    }

    pub fn set(&mut self, key: &str, value: f64) {
        self.0.insert(key.to_string(), value);
    }
}

/// Inputs for one strategy invocation. Strategies are pure functions of
/// this context.
pub struct StrategyContext<'a> {
    pub symbol: &'a str,
    pub broker: &'a str,
    pub timeframe: Timeframe,
    pub horizon: &'a str,
    pub bars: &'a [OHLCVBar],
    pub regime: &'a MarketRegime,
    pub ts: DateTime<Utc>,
    pub params: &'a StrategyParams,
    pub run_id: &'a str,
    pub ids: &'a IdGen,
}

/// Deterministic rule-based signal generator contract.
pub trait SignalStrategy: Send + Sync {
    fn strategy_id(&self) -> &'static str;

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    /// Return at most one signal candidate for the context.
    fn generate(&self, ctx: &StrategyContext<'_>) -> Option<Signal>;
}

/// All built-in strategies keyed by id.
pub fn builtin_strategies() -> Vec<Box<dyn SignalStrategy>> {
    vec![
        Box::new(TrendFollowing),
        Box::new(MeanReversion),
        Box::new(MomentumBreakout),
        Box::new(ScalpingReversal),
        Box::new(SwingComposite),
        Box::new(InvestmentFundamental),
        Box::new(RangeScalp),
    ]
}

pub(crate) struct SignalDraft {
    pub direction: SignalDirection,
    pub raw_score: f64,
    pub confidence: f64,
    pub reasons: Vec<SignalReason>,
    pub entry_price: Option<f64>,
    pub expiry_minutes: i64,
}

impl SignalDraft {
    pub fn new() -> Self {
        SignalDraft {
            direction: SignalDirection::Wait,
            raw_score: 0.0,
            confidence: 0.35,
            reasons: Vec::new(),
            entry_price: None,
            expiry_minutes: 120,
        }
    }
}

pub(crate) fn build_signal(
    ctx: &StrategyContext<'_>,
    strategy_id: &str,
    version: &str,
    draft: SignalDraft,
) -> Signal {
    let confidence = draft.confidence.clamp(0.0, 1.0);
    Signal {
        signal_id: ctx.ids.next("sig"),
        strategy_id: strategy_id.to_string(),
        strategy_version: version.to_string(),
        symbol: ctx.symbol.to_string(),
        broker: ctx.broker.to_string(),
        timeframe: ctx.timeframe,
        ts: ctx.ts,
        run_id: ctx.run_id.to_string(),
        direction: draft.direction,
        strength: strength_for(confidence),
        raw_score: draft.raw_score,
        confidence,
        reasons: draft.reasons,
        regime: ctx.regime.clone(),
        horizon: ctx.horizon.to_string(),
        entry_price: draft.entry_price,
        expires_at: Some(ctx.ts + Duration::minutes(draft.expiry_minutes)),
        metadata: Metadata::new(),
    }
}

pub(crate) fn reason(
    factor: &str,
    value: serde_json::Value,
    contribution: f64,
    weight: f64,
    description: &str,
    direction: &str,
    source: &str,
) -> SignalReason {
    SignalReason {
        factor: factor.to_string(),
        value,
        contribution,
        weight,
        description: description.to_string(),
        direction: direction.to_string(),
        source: source.to_string(),
    }
}

pub(crate) fn direction_label(direction: SignalDirection) -> &'static str {
    match direction {
        SignalDirection::Buy => "bullish",
        SignalDirection::Sell => "bearish",
        _ => "neutral",
    }
}
