use serde_json::json;

use crate::indicators::rsi_last;
use crate::signals::{Signal, SignalDirection};

use super::{build_signal, direction_label, reason, SignalDraft, SignalStrategy, StrategyContext};

/// Fast wick-reversal scalp: a fast-RSI extreme plus a dominant wick on a
/// small-bodied candle. Signals expire after 30 minutes.
pub struct ScalpingReversal;

impl SignalStrategy for ScalpingReversal {
    fn strategy_id(&self) -> &'static str {
        "scalping_reversal"
    }

    fn generate(&self, ctx: &StrategyContext<'_>) -> Option<Signal> {
        if ctx.bars.len() < 15 {
            return None;
        }

        let closes: Vec<f64> = ctx.bars.iter().map(|b| b.close).collect();
        let fast_period = ctx.params.get_usize("fast_rsi_period", 7);
        let fast_rsi = rsi_last(&closes, fast_period);

        let last = &ctx.bars[ctx.bars.len() - 1];
        let body = (last.close - last.open).abs();
        let upper_wick = last.high - last.close.max(last.open);
        let lower_wick = last.close.min(last.open) - last.low;

        let mut draft = SignalDraft::new();
        draft.confidence = 0.33;
        draft.entry_price = Some(last.close);
        draft.expiry_minutes = 30;

        if fast_rsi <= 25.0 && lower_wick > body * 1.2 {
            draft.direction = SignalDirection::Buy;
            draft.confidence = 0.63;
            draft.raw_score = 52.0;
            draft.reasons.push(reason(
                "wick_reversal",
                json!(lower_wick),
                0.35,
                0.35,
                "Dominant lower wick with depressed fast RSI",
                "bullish",
                "pattern",
            ));
        } else if fast_rsi >= 75.0 && upper_wick > body * 1.2 {
            draft.direction = SignalDirection::Sell;
            draft.confidence = 0.63;
            draft.raw_score = -52.0;
            draft.reasons.push(reason(
                "wick_reversal",
                json!(upper_wick),
                -0.35,
                0.35,
                "Dominant upper wick with elevated fast RSI",
                "bearish",
                "pattern",
            ));
        }

        let rsi_contribution = match draft.direction {
            SignalDirection::Buy => 0.18,
            SignalDirection::Sell => -0.18,
            _ => 0.0,
        };
        draft.reasons.push(reason(
            "RSI_fast",
            json!((fast_rsi * 100.0).round() / 100.0),
            rsi_contribution,
            0.25,
            "Very short-term momentum",
            direction_label(draft.direction),
            "momentum",
        ));

        Some(build_signal(ctx, self.strategy_id(), self.version(), draft))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AssetClass, OHLCVBar, Timeframe};
    use crate::regime::MarketRegime;
    use crate::signals::strategies::test_support::run_strategy;
    use crate::signals::strategies::StrategyParams;
    use chrono::{Duration, TimeZone, Utc};

    /// Selling pressure into a hammer candle: long lower wick, tiny body.
    fn hammer_bars() -> Vec<OHLCVBar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..20)
            .map(|i| {
                let last = i == 19;
                let open = 100.0 - i as f64;
                let close = if last { open - 0.1 } else { open - 1.0 };
                let low = if last { close - 3.0 } else { close - 0.1 };
                let ts_open = start + Duration::hours(i as i64);
                OHLCVBar {
                    symbol: "EURUSD".into(),
                    broker: "paper".into(),
                    timeframe: Timeframe::H1,
                    ts_open,
                    ts_close: ts_open + Duration::hours(1),
                    open,
                    high: open + 0.1,
                    low,
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

    fn regime() -> MarketRegime {
        MarketRegime::fallback(
            "EURUSD",
            Timeframe::H1,
            Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap(),
        )
    }

    #[test]
    fn hammer_with_low_rsi_buys() {
        let signal = run_strategy(
            &ScalpingReversal,
            &hammer_bars(),
            &regime(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Buy);
        assert!((signal.confidence - 0.63).abs() < 1e-9);
    }

    #[test]
    fn expiry_is_thirty_minutes() {
        let bars = hammer_bars();
        let signal = run_strategy(
            &ScalpingReversal,
            &bars,
            &regime(),
            &StrategyParams::default(),
        )
        .unwrap();
        let expires = signal.expires_at.unwrap();
        assert_eq!((expires - signal.ts).num_minutes(), 30);
    }

    #[test]
    fn no_wick_no_signal_direction() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars: Vec<OHLCVBar> = (0..20)
            .map(|i| {
                let open = 100.0 + (i % 2) as f64 * 0.1;
                let ts_open = start + Duration::hours(i as i64);
                OHLCVBar {
                    symbol: "EURUSD".into(),
                    broker: "paper".into(),
                    timeframe: Timeframe::H1,
                    ts_open,
                    ts_close: ts_open + Duration::hours(1),
                    open,
                    high: open + 0.5,
                    low: open - 0.5,
                    close: open + 0.4,
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
            &ScalpingReversal,
            &bars,
            &regime(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Wait);
    }
}
