use serde_json::json;

use crate::indicators::{ema_last, rsi_last, slope_last};
use crate::signals::{Signal, SignalDirection};

use super::{build_signal, direction_label, reason, SignalDraft, SignalStrategy, StrategyContext};

/// Medium-horizon composite: EMA21/55 stack, 30-bar slope sign, RSI bias.
pub struct SwingComposite;

impl SignalStrategy for SwingComposite {
    fn strategy_id(&self) -> &'static str {
        "swing_composite"
    }

    fn generate(&self, ctx: &StrategyContext<'_>) -> Option<Signal> {
        if ctx.bars.len() < 90 {
            return None;
        }

        let closes: Vec<f64> = ctx.bars.iter().map(|b| b.close).collect();
        let tail = |n: usize| &closes[closes.len().saturating_sub(n)..];
        let ema21 = ema_last(tail(120), 21);
        let ema55 = ema_last(tail(160), 55);
        let slope = slope_last(&closes, 30);
        let rsi = rsi_last(&closes, 14);

        let mut draft = SignalDraft::new();
        draft.confidence = 0.38;
        draft.entry_price = closes.last().copied();
        draft.expiry_minutes = 360;

        if ema21 > ema55 && slope > 0.0 && rsi > 48.0 {
            draft.direction = SignalDirection::Buy;
            draft.raw_score = 58.0;
            draft.confidence = 0.66;
        } else if ema21 < ema55 && slope < 0.0 && rsi < 52.0 {
            draft.direction = SignalDirection::Sell;
            draft.raw_score = -58.0;
            draft.confidence = 0.66;
        }

        let ema_contribution = match draft.direction {
            SignalDirection::Buy => 0.30,
            SignalDirection::Sell => -0.30,
            _ => 0.0,
        };
        draft.reasons.push(reason(
            "EMA_swing",
            json!(format!("{ema21:.5}/{ema55:.5}")),
            ema_contribution,
            0.30,
            "EMA21/EMA55 relation sets the base swing direction",
            direction_label(draft.direction),
            "indicator",
        ));
        let slope_contribution = if slope > 0.0 {
            0.20
        } else if slope < 0.0 {
            -0.20
        } else {
            0.0
        };
        draft.reasons.push(reason(
            "slope",
            json!(slope),
            slope_contribution,
            0.20,
            "30-bar price slope",
            if slope > 0.0 { "bullish" } else if slope < 0.0 { "bearish" } else { "neutral" },
            "pattern",
        ));

        if ctx.regime.trend.is_strong() && draft.direction.is_actionable() {
            draft.confidence = (draft.confidence + 0.05).min(0.9);
        }

        Some(build_signal(ctx, self.strategy_id(), self.version(), draft))
    }
}
