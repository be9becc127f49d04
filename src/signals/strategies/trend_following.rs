use serde_json::json;

use crate::indicators::{ema_last, rsi_last};
use crate::signals::{Signal, SignalDirection};

use super::{build_signal, direction_label, reason, SignalDraft, SignalStrategy, StrategyContext};

/// EMA trend continuation: monotonic EMA20/50/200 stack confirmed by ADX.
pub struct TrendFollowing;

impl SignalStrategy for TrendFollowing {
    fn strategy_id(&self) -> &'static str {
        "trend_following"
    }

    fn generate(&self, ctx: &StrategyContext<'_>) -> Option<Signal> {
        if ctx.bars.len() < 50 {
            return None;
        }

        let closes: Vec<f64> = ctx.bars.iter().map(|b| b.close).collect();
        let tail = |n: usize| &closes[closes.len().saturating_sub(n)..];
        let ema20 = ema_last(tail(120), 20);
        let ema50 = ema_last(tail(160), 50);
        let ema200 = ema_last(tail(260), 200.min(closes.len().saturating_sub(1)));
        let adx = ctx.regime.metrics.get("adx").copied().unwrap_or(20.0);
        let rsi = rsi_last(&closes, 14);
        let adx_min = ctx.params.get("adx_min", 20.0);

        let mut draft = SignalDraft::new();
        draft.entry_price = closes.last().copied();

        let stacked_up = ema20 > ema50 && (ema200.is_nan() || ema50 > ema200);
        let stacked_down = ema20 < ema50 && (ema200.is_nan() || ema50 < ema200);

        if stacked_up && adx >= adx_min {
            draft.direction = SignalDirection::Buy;
            draft.raw_score = 65.0;
            draft.confidence = 0.72;
            draft.reasons.push(reason(
                "EMA_cross",
                json!(format!("{ema20:.5}>{ema50:.5}>{ema200:.5}")),
                0.45,
                0.45,
                "EMA20 > EMA50 > EMA200 confirms bullish structure",
                "bullish",
                "indicator",
            ));
        } else if stacked_down && adx >= adx_min {
            draft.direction = SignalDirection::Sell;
            draft.raw_score = -65.0;
            draft.confidence = 0.72;
            draft.reasons.push(reason(
                "EMA_cross",
                json!(format!("{ema20:.5}<{ema50:.5}<{ema200:.5}")),
                -0.45,
                0.45,
                "EMA20 < EMA50 < EMA200 confirms bearish structure",
                "bearish",
                "indicator",
            ));
        }

        if adx < adx_min {
            draft.direction = SignalDirection::Wait;
            draft.confidence = 0.30;
            draft.raw_score = 0.0;
            draft.reasons.push(reason(
                "ADX",
                json!(adx),
                -0.30,
                0.30,
                "Low ADX suggests a sideways market",
                "neutral",
                "regime",
            ));
        }

        if ctx.regime.trend.is_strong() {
            draft.confidence = (draft.confidence + 0.08).min(1.0);
            let contribution = if draft.direction.is_actionable() { 0.15 } else { 0.0 };
            draft.reasons.push(reason(
                "regime",
                json!(ctx.regime.trend.as_str()),
                contribution,
                0.15,
                "Strong trend regime favors trend following",
                direction_label(draft.direction),
                "regime",
            ));
        }

        let overbought = ctx.params.get("overbought_rsi", 75.0);
        if draft.direction == SignalDirection::Buy && rsi >= overbought {
            draft.confidence *= 0.82;
            draft.reasons.push(reason(
                "RSI",
                json!(rsi),
                -0.10,
                0.10,
                "High RSI degrades long entry quality",
                "bearish",
                "indicator",
            ));
        }

        Some(build_signal(ctx, self.strategy_id(), self.version(), draft))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Timeframe;
    use crate::regime::{MarketRegime, TrendRegime};
    use crate::signals::strategies::test_support::{run_strategy, uptrend_bars};
    use crate::signals::strategies::StrategyParams;
    use chrono::{TimeZone, Utc};

    fn strong_up_regime(adx: f64) -> MarketRegime {
        let mut regime = MarketRegime::fallback(
            "EURUSD",
            Timeframe::H1,
            Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
        );
        regime.trend = TrendRegime::StrongUptrend;
        regime.metrics.insert("adx".into(), adx);
        regime
    }

    #[test]
    fn stacked_emas_with_adx_buy() {
        let bars = uptrend_bars(260);
        let signal = run_strategy(
            &TrendFollowing,
            &bars,
            &strong_up_regime(30.0),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Buy);
        // Base 0.72 + strong-regime 0.08, then RSI attenuation may apply.
        assert!(signal.confidence > 0.60);
        assert_eq!(signal.raw_score, 65.0);
    }

    #[test]
    fn low_adx_forces_wait() {
        let bars = uptrend_bars(260);
        let signal = run_strategy(
            &TrendFollowing,
            &bars,
            &strong_up_regime(12.0),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Wait);
        assert!(signal.raw_score == 0.0);
    }

    #[test]
    fn too_few_bars_yields_none() {
        let bars = uptrend_bars(30);
        assert!(run_strategy(
            &TrendFollowing,
            &bars,
            &strong_up_regime(30.0),
            &StrategyParams::default(),
        )
        .is_none());
    }

    #[test]
    fn overbought_rsi_attenuates_buy() {
        let bars = uptrend_bars(260);
        let mut params = StrategyParams::default();
        params.set("overbought_rsi", 200.0);
        let unattenuated = run_strategy(&TrendFollowing, &bars, &strong_up_regime(30.0), &params)
            .unwrap();

        // A pure uptrend has RSI near 100, so the default threshold fires.
        let attenuated = run_strategy(
            &TrendFollowing,
            &bars,
            &strong_up_regime(30.0),
            &StrategyParams::default(),
        )
        .unwrap();
        assert!(attenuated.confidence < unattenuated.confidence);
        let ratio = attenuated.confidence / unattenuated.confidence;
        assert!((ratio - 0.82).abs() < 1e-9);
    }
}
