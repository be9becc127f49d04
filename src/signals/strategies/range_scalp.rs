use serde_json::json;

use crate::regime::TrendRegime;
use crate::signals::{Signal, SignalDirection};

use super::{build_signal, direction_label, reason, SignalDraft, SignalStrategy, StrategyContext};

/// Mean-reversion entries at the outer 15% of the recent range, intended
/// for ranging regimes. Signals expire after 45 minutes.
pub struct RangeScalp;

impl SignalStrategy for RangeScalp {
    fn strategy_id(&self) -> &'static str {
        "range_scalp"
    }

    fn generate(&self, ctx: &StrategyContext<'_>) -> Option<Signal> {
        let lookback = ctx.params.get_usize("range_lookback", 40);
        if lookback == 0 || ctx.bars.len() < lookback {
            return None;
        }

        let closes: Vec<f64> = ctx.bars.iter().map(|b| b.close).collect();
        let recent = &closes[closes.len() - lookback..];
        let support = recent.iter().copied().fold(f64::MAX, f64::min);
        let resistance = recent.iter().copied().fold(f64::MIN, f64::max);
        let current = *recent.last().unwrap();
        let width = resistance - support;
        if width <= 0.0 {
            return None;
        }

        let position = (current - support) / width;
        let mut draft = SignalDraft::new();
        draft.confidence = 0.34;
        draft.entry_price = Some(current);
        draft.expiry_minutes = 45;

        if position <= 0.15 {
            draft.direction = SignalDirection::Buy;
            draft.confidence = 0.64;
            draft.raw_score = 48.0;
        } else if position >= 0.85 {
            draft.direction = SignalDirection::Sell;
            draft.confidence = 0.64;
            draft.raw_score = -48.0;
        }

        if ctx.regime.trend != TrendRegime::Ranging && draft.direction.is_actionable() {
            draft.confidence *= 0.70;
        }

        let contribution = match draft.direction {
            SignalDirection::Buy => 0.30,
            SignalDirection::Sell => -0.30,
            _ => 0.0,
        };
        draft.reasons.push(reason(
            "range_position",
            json!((position * 1000.0).round() / 1000.0),
            contribution,
            0.30,
            "Relative position inside the recent range",
            direction_label(draft.direction),
            "pattern",
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

    fn range_bars(final_close: f64) -> Vec<OHLCVBar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..45)
            .map(|i| {
                let last = i == 44;
                let close = if last {
                    final_close
                } else if i % 2 == 0 {
                    100.0
                } else {
                    110.0
                };
                let open = if i % 2 == 0 { 101.0 } else { 109.0 };
                let ts_open = start + Duration::hours(i as i64);
                OHLCVBar {
                    symbol: "EURUSD".into(),
                    broker: "paper".into(),
                    timeframe: Timeframe::H1,
                    ts_open,
                    ts_close: ts_open + Duration::hours(1),
                    open,
                    high: open.max(close) + 0.5,
                    low: open.min(close) - 0.5,
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

    fn ranging() -> MarketRegime {
        MarketRegime::fallback(
            "EURUSD",
            Timeframe::H1,
            Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap(),
        )
    }

    #[test]
    fn bottom_of_range_buys() {
        let signal = run_strategy(
            &RangeScalp,
            &range_bars(100.5),
            &ranging(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Buy);
        assert!((signal.confidence - 0.64).abs() < 1e-9);
    }

    #[test]
    fn top_of_range_sells() {
        let signal = run_strategy(
            &RangeScalp,
            &range_bars(109.8),
            &ranging(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Sell);
    }

    #[test]
    fn trending_regime_attenuates() {
        let mut regime = ranging();
        regime.trend = TrendRegime::StrongUptrend;
        let signal = run_strategy(
            &RangeScalp,
            &range_bars(100.5),
            &regime,
            &StrategyParams::default(),
        )
        .unwrap();
        assert!((signal.confidence - 0.64 * 0.70).abs() < 1e-9);
    }

    #[test]
    fn mid_range_waits() {
        let signal = run_strategy(
            &RangeScalp,
            &range_bars(105.0),
            &ranging(),
            &StrategyParams::default(),
        )
        .unwrap();
        assert_eq!(signal.direction, SignalDirection::Wait);
    }
}
