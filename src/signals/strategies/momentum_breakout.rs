use serde_json::json;

use crate::signals::{Signal, SignalDirection};

use super::{build_signal, direction_label, reason, SignalDraft, SignalStrategy, StrategyContext};

/// Breakout above/below the recent range with volume confirmation.
pub struct MomentumBreakout;

impl SignalStrategy for MomentumBreakout {
    fn strategy_id(&self) -> &'static str {
        "momentum_breakout"
    }

    fn generate(&self, ctx: &StrategyContext<'_>) -> Option<Signal> {
        let lookback = ctx.params.get_usize("lookback", 20);
        if lookback == 0 || ctx.bars.len() < lookback + 5 {
            return None;
        }

        let n = ctx.bars.len();
        let window = &ctx.bars[n - lookback - 1..n - 1];
        let resistance = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let support = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let current = ctx.bars[n - 1].close;

        let avg_volume =
            window.iter().map(|b| b.volume).sum::<f64>() / window.len() as f64;
        let volume_ratio = if avg_volume <= 0.0 {
            0.0
        } else {
            ctx.bars[n - 1].volume / avg_volume.max(1e-9)
        };
        let volume_ratio_min = ctx.params.get("volume_ratio_min", 1.1);

        let mut draft = SignalDraft::new();
        draft.entry_price = Some(current);

        if current >= resistance * 0.999 && volume_ratio >= volume_ratio_min {
            draft.direction = SignalDirection::Buy;
            draft.raw_score = 62.0;
            draft.confidence = (0.55 + (volume_ratio - 1.0) * 0.2).min(0.85);
            draft.reasons.push(reason(
                "breakout",
                json!(current - resistance),
                0.40,
                0.40,
                "Bullish break above resistance with volume confirmation",
                "bullish",
                "pattern",
            ));
        } else if current <= support * 1.001 && volume_ratio >= volume_ratio_min {
            draft.direction = SignalDirection::Sell;
            draft.raw_score = -62.0;
            draft.confidence = (0.55 + (volume_ratio - 1.0) * 0.2).min(0.85);
            draft.reasons.push(reason(
                "breakout",
                json!(support - current),
                -0.40,
                0.40,
                "Bearish break below support with volume confirmation",
                "bearish",
                "pattern",
            ));
        }

        let vr_contribution = match draft.direction {
            SignalDirection::Buy => 0.15,
            SignalDirection::Sell => -0.15,
            _ => 0.0,
        };
        draft.reasons.push(reason(
            "volume_ratio",
            json!((volume_ratio * 1000.0).round() / 1000.0),
            vr_contribution,
            0.20,
            "Volume relative to the recent average",
            direction_label(draft.direction),
            "volume",
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

    /// Range-bound series whose last bar breaks the range high on volume.
    fn breakout_bars(volume_spike: f64) -> Vec<OHLCVBar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..30)
            .map(|i| {
                let last = i == 29;
                let open = 100.0;
                let close = if last { 102.5 } else { 100.2 };
                let high = if last { 102.6 } else { 101.0 };
                let ts_open = start + Duration::hours(i as i64);
                OHLCVBar {
                    symbol: "EURUSD".into(),
                    broker: "paper".into(),
                    timeframe: Timeframe::H1,
                    ts_open,
                    ts_close: ts_open + Duration::hours(1),
                    open,
                    high,
                    low: 99.5,
                    close,
                    volume: if last { volume_spike } else { 1000.0 },
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
            Utc.with_ymd_and_hms(2024, 1, 2, 6, 0, 0).unwrap(),
        )
    }

    #[test]
    fn high_break_with_volume_buys() {
        let signal = run_strategy(
            &MomentumBreakout,
            &breakout_bars(2000.0),
            &regime(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Buy);
        // volume_ratio = 2.0 -> 0.55 + 0.2 = 0.75
        assert!((signal.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn confidence_capped_at_085() {
        let signal = run_strategy(
            &MomentumBreakout,
            &breakout_bars(10_000.0),
            &regime(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert!((signal.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn break_without_volume_waits() {
        let signal = run_strategy(
            &MomentumBreakout,
            &breakout_bars(900.0),
            &regime(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Wait);
    }

    #[test]
    fn insufficient_history_yields_none() {
        let bars = breakout_bars(2000.0);
        assert!(run_strategy(
            &MomentumBreakout,
            &bars[..10],
            &regime(),
            &StrategyParams::default(),
        )
        .is_none());
    }
}
