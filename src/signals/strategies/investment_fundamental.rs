use serde_json::json;

use crate::indicators::slope_last;
use crate::signals::{Signal, SignalDirection};

use super::{build_signal, reason, SignalDraft, SignalStrategy, StrategyContext};

/// Long-horizon heuristic: 90-bar slope as a fundamental proxy plus a
/// drawdown-from-peak filter. Signals expire after one day.
pub struct InvestmentFundamental;

impl SignalStrategy for InvestmentFundamental {
    fn strategy_id(&self) -> &'static str {
        "investment_fundamental"
    }

    fn generate(&self, ctx: &StrategyContext<'_>) -> Option<Signal> {
        if ctx.bars.len() < 120 {
            return None;
        }

        let closes: Vec<f64> = ctx.bars.iter().map(|b| b.close).collect();
        let slope = slope_last(&closes, 90);

        let log_returns: Vec<f64> = closes
            .windows(2)
            .map(|w| (w[1] / w[0]).ln())
            .collect();
        let vol_window = if log_returns.len() >= 90 {
            &log_returns[log_returns.len() - 90..]
        } else {
            &log_returns[..]
        };
        let vol = population_std(vol_window);

        let recent = &closes[closes.len() - 120..];
        let max_close = recent.iter().copied().fold(f64::MIN, f64::max);
        let current = *closes.last().unwrap();
        let drawdown = if max_close <= 0.0 {
            0.0
        } else {
            (max_close - current) / max_close
        };

        let mut draft = SignalDraft::new();
        draft.confidence = 0.36;
        draft.entry_price = Some(current);
        draft.expiry_minutes = 1440;

        if slope > 0.0 && drawdown < 0.20 {
            draft.direction = SignalDirection::Buy;
            draft.raw_score = 52.0;
            draft.confidence = 0.62;
        } else if slope < 0.0 && drawdown > 0.30 {
            draft.direction = SignalDirection::Sell;
            draft.raw_score = -45.0;
            draft.confidence = 0.56;
        }

        if vol > 0.04 && draft.direction.is_actionable() {
            draft.confidence *= 0.85;
        }

        draft.reasons.push(reason(
            "trend_90",
            json!(slope),
            if slope > 0.0 { 0.25 } else if slope < 0.0 { -0.25 } else { 0.0 },
            0.25,
            "90-bar slope as a long-horizon fundamental proxy",
            if slope > 0.0 { "bullish" } else if slope < 0.0 { "bearish" } else { "neutral" },
            "fundamental",
        ));
        draft.reasons.push(reason(
            "drawdown",
            json!((drawdown * 10_000.0).round() / 10_000.0),
            if drawdown > 0.25 { -0.12 } else { 0.10 },
            0.15,
            "Pullback level relative to the recent peak",
            if drawdown < 0.25 { "bullish" } else { "bearish" },
            "fundamental",
        ));

        Some(build_signal(ctx, self.strategy_id(), self.version(), draft))
    }
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Timeframe;
    use crate::regime::MarketRegime;
    use crate::signals::strategies::test_support::{run_strategy, uptrend_bars};
    use crate::signals::strategies::StrategyParams;
    use chrono::{TimeZone, Utc};

    fn regime() -> MarketRegime {
        MarketRegime::fallback(
            "EURUSD",
            Timeframe::H1,
            Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn rising_structure_buys() {
        let signal = run_strategy(
            &InvestmentFundamental,
            &uptrend_bars(150),
            &regime(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Buy);
        assert!((signal.confidence - 0.62).abs() < 1e-9);
    }

    #[test]
    fn expiry_is_one_day() {
        let signal = run_strategy(
            &InvestmentFundamental,
            &uptrend_bars(150),
            &regime(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(
            (signal.expires_at.unwrap() - signal.ts).num_minutes(),
            1440
        );
    }

    #[test]
    fn needs_long_history() {
        assert!(run_strategy(
            &InvestmentFundamental,
            &uptrend_bars(100),
            &regime(),
            &StrategyParams::default(),
        )
        .is_none());
    }
}
