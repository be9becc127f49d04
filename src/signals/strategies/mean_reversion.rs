use serde_json::json;

use crate::indicators::{percent_b_last, rsi_last, stochastic_last};
use crate::signals::{Signal, SignalDirection};

use super::{build_signal, direction_label, reason, SignalDraft, SignalStrategy, StrategyContext};

/// Oversold/overbought reversal: RSI extreme, Bollinger %B location, and a
/// stochastic turn must all agree.
pub struct MeanReversion;

impl SignalStrategy for MeanReversion {
    fn strategy_id(&self) -> &'static str {
        "mean_reversion"
    }

    fn generate(&self, ctx: &StrategyContext<'_>) -> Option<Signal> {
        if ctx.bars.len() < 30 {
            return None;
        }

        let closes: Vec<f64> = ctx.bars.iter().map(|b| b.close).collect();
        let rsi_period = ctx.params.get_usize("rsi_period", 14);
        let rsi = rsi_last(&closes, rsi_period);
        let percent_b = percent_b_last(&closes, 20, 2.0);
        let stoch_k = stochastic_last(&closes, 14);

        let rsi_low = ctx.params.get("rsi_low", 30.0);
        let rsi_high = ctx.params.get("rsi_high", 70.0);

        let mut draft = SignalDraft::new();
        draft.entry_price = closes.last().copied();

        if rsi <= rsi_low && percent_b <= 0.10 && stoch_k <= 25.0 {
            draft.direction = SignalDirection::Buy;
            draft.raw_score = 60.0;
            draft.confidence = 0.68;
            draft.reasons.push(reason(
                "RSI",
                json!(rsi),
                0.35,
                0.35,
                "RSI oversold",
                "bullish",
                "indicator",
            ));
        } else if rsi >= rsi_high && percent_b >= 0.90 && stoch_k >= 75.0 {
            draft.direction = SignalDirection::Sell;
            draft.raw_score = -60.0;
            draft.confidence = 0.68;
            draft.reasons.push(reason(
                "RSI",
                json!(rsi),
                -0.35,
                0.35,
                "RSI overbought",
                "bearish",
                "indicator",
            ));
        }

        let pb_contribution = match draft.direction {
            SignalDirection::Buy => 0.15,
            SignalDirection::Sell => -0.15,
            _ => 0.0,
        };
        draft.reasons.push(reason(
            "%B",
            json!((percent_b * 10_000.0).round() / 10_000.0),
            pb_contribution,
            0.20,
            "Relative position inside the Bollinger bands",
            direction_label(draft.direction),
            "indicator",
        ));

        if ctx.regime.trend.is_strong() && draft.direction.is_actionable() {
            draft.confidence *= 0.75;
            draft.reasons.push(reason(
                "regime",
                json!(ctx.regime.trend.as_str()),
                -0.20,
                0.20,
                "Reversal against a strong trend lowers the odds",
                "neutral",
                "regime",
            ));
        }

        Some(build_signal(ctx, self.strategy_id(), self.version(), draft))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AssetClass, OHLCVBar, Timeframe};
    use crate::regime::{MarketRegime, TrendRegime};
    use crate::signals::strategies::test_support::run_strategy;
    use crate::signals::strategies::StrategyParams;
    use chrono::{Duration, TimeZone, Utc};

    /// Flat series ending in a hard sell-off: RSI, %B, and stochastic all
    /// pin to the oversold extreme.
    fn capitulation_bars() -> Vec<OHLCVBar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..40)
            .map(|i| {
                let open = if i < 25 { 100.0 } else { 100.0 - (i - 24) as f64 * 2.0 };
                let close = if i < 25 { 100.0 } else { open - 2.0 };
                let ts_open = start + Duration::hours(i as i64);
                OHLCVBar {
                    symbol: "EURUSD".into(),
                    broker: "paper".into(),
                    timeframe: Timeframe::H1,
                    ts_open,
                    ts_close: ts_open + Duration::hours(1),
                    open,
                    high: open.max(close) + 0.1,
                    low: open.min(close) - 0.1,
                    close,
                    volume: 1000.0,
                    tick_count: None,
                    spread: Some(0.02),
                    asset_class: AssetClass::Forex,
                    source: "test".into(),
                }
                .validated()
                .unwrap()
            })
            .collect()
    }

    fn ranging_regime() -> MarketRegime {
        MarketRegime::fallback(
            "EURUSD",
            Timeframe::H1,
            Utc.with_ymd_and_hms(2024, 1, 2, 16, 0, 0).unwrap(),
        )
    }

    #[test]
    fn capitulation_triggers_buy() {
        let signal = run_strategy(
            &MeanReversion,
            &capitulation_bars(),
            &ranging_regime(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Buy);
        assert_eq!(signal.raw_score, 60.0);
        assert!((signal.confidence - 0.68).abs() < 1e-9);
    }

    #[test]
    fn counter_trend_attenuated() {
        let mut regime = ranging_regime();
        regime.trend = TrendRegime::StrongDowntrend;
        let signal = run_strategy(
            &MeanReversion,
            &capitulation_bars(),
            &regime,
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Buy);
        assert!((signal.confidence - 0.68 * 0.75).abs() < 1e-9);
    }

    #[test]
    fn quiet_market_waits() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars: Vec<OHLCVBar> = (0..40)
            .map(|i| {
                let ts_open = start + Duration::hours(i as i64);
                let wiggle: f64 = if i % 2 == 0 { 0.1 } else { -0.1 };
                OHLCVBar {
                    symbol: "EURUSD".into(),
                    broker: "paper".into(),
                    timeframe: Timeframe::H1,
                    ts_open,
                    ts_close: ts_open + Duration::hours(1),
                    open: 100.0,
                    high: 100.0 + wiggle.abs() + 0.05,
                    low: 100.0 - wiggle.abs() - 0.05,
                    close: 100.0 + wiggle,
                    volume: 1000.0,
                    tick_count: None,
                    spread: Some(0.02),
                    asset_class: AssetClass::Forex,
                    source: "test".into(),
                }
                .validated()
                .unwrap()
            })
            .collect();
        let signal = run_strategy(
            &MeanReversion,
            &bars,
            &ranging_regime(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Wait);
    }
}
