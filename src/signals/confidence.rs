use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::regime::{LiquidityRegime, TrendRegime, VolatilityRegime};

use super::{strength_for, EnsembleResult, SignalDirection, SignalStrength};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConfidenceConfig {
    #[garde(range(min = 0.0, max = 1.0))]
    pub contradiction_penalty: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub non_trade_penalty: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub regime_mismatch_penalty: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub extreme_volatility_cap: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub illiquid_cap: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        ConfidenceConfig {
            contradiction_penalty: 0.25,
            non_trade_penalty: 0.15,
            regime_mismatch_penalty: 0.20,
            extreme_volatility_cap: 0.30,
            illiquid_cap: 0.20,
        }
    }
}

/// Regime-aware penalties and display mapping for ensemble confidence.
pub struct ConfidenceScorer {
    config: ConfidenceConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ConfidenceConfig) -> Self {
        ConfidenceScorer { config }
    }

    /// Adjusted confidence in [0, 1].
    pub fn score(&self, ensemble: &EnsembleResult) -> f64 {
        let mut confidence = ensemble.final_confidence;
        confidence -= ensemble.contradiction_score * self.config.contradiction_penalty;

        if !ensemble.regime.is_tradeable {
            confidence -= self.config.non_trade_penalty;
        }
        if regime_mismatch(ensemble.final_direction, ensemble.regime.trend) {
            confidence -= self.config.regime_mismatch_penalty;
        }

        confidence = confidence.clamp(0.0, 1.0);

        if ensemble.regime.volatility == VolatilityRegime::Extreme {
            confidence = confidence.min(self.config.extreme_volatility_cap);
        }
        if ensemble.regime.liquidity == LiquidityRegime::Illiquid {
            confidence = confidence.min(self.config.illiquid_cap);
        }
        confidence
    }

    /// UI-friendly percent plus strength band.
    pub fn display_confidence(&self, confidence: f64) -> (u8, SignalStrength) {
        let pct = (confidence.clamp(0.0, 1.0) * 100.0).round() as u8;
        (pct, strength_for(confidence))
    }
}

fn regime_mismatch(direction: SignalDirection, trend: TrendRegime) -> bool {
    match direction {
        SignalDirection::Buy => trend == TrendRegime::StrongDowntrend,
        SignalDirection::Sell => trend == TrendRegime::StrongUptrend,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Timeframe;
    use crate::regime::MarketRegime;
    use chrono::{TimeZone, Utc};

    fn make_ensemble(direction: SignalDirection, confidence: f64) -> EnsembleResult {
        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let regime = MarketRegime::fallback("EURUSD", Timeframe::H1, ts);
        EnsembleResult {
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            timeframe: Timeframe::H1,
            ts,
            run_id: "test".into(),
            final_direction: direction,
            final_confidence: confidence,
            final_strength: strength_for(confidence),
            contributing_signals: vec![],
            all_reasons: vec![],
            agreement_score: 1.0,
            contradiction_score: 0.0,
            regime,
            horizon: "2h".into(),
            filters_blocked: vec![],
            filters_passed: vec![],
            explanation: String::new(),
        }
    }

    #[test]
    fn clean_signal_untouched() {
        let scorer = ConfidenceScorer::new(ConfidenceConfig::default());
        let ensemble = make_ensemble(SignalDirection::Buy, 0.7);
        assert!((scorer.score(&ensemble) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn contradiction_subtracts() {
        let scorer = ConfidenceScorer::new(ConfidenceConfig::default());
        let mut ensemble = make_ensemble(SignalDirection::Buy, 0.7);
        ensemble.contradiction_score = 0.4;
        assert!((scorer.score(&ensemble) - (0.7 - 0.4 * 0.25)).abs() < 1e-12);
    }

    #[test]
    fn buy_in_strong_downtrend_is_penalized() {
        let scorer = ConfidenceScorer::new(ConfidenceConfig::default());
        let mut ensemble = make_ensemble(SignalDirection::Buy, 0.7);
        ensemble.regime.trend = TrendRegime::StrongDowntrend;
        let adjusted = scorer.score(&ensemble);
        assert!(adjusted <= 0.7 - ConfidenceConfig::default().regime_mismatch_penalty + 1e-12);
    }

    #[test]
    fn extreme_volatility_caps() {
        let scorer = ConfidenceScorer::new(ConfidenceConfig::default());
        let mut ensemble = make_ensemble(SignalDirection::Buy, 0.9);
        ensemble.regime.volatility = VolatilityRegime::Extreme;
        assert!(scorer.score(&ensemble) <= 0.30 + 1e-12);
    }

    #[test]
    fn illiquid_caps_harder() {
        let scorer = ConfidenceScorer::new(ConfidenceConfig::default());
        let mut ensemble = make_ensemble(SignalDirection::Buy, 0.9);
        ensemble.regime.liquidity = LiquidityRegime::Illiquid;
        assert!(scorer.score(&ensemble) <= 0.20 + 1e-12);
    }

    #[test]
    fn non_tradeable_penalty_applies() {
        let scorer = ConfidenceScorer::new(ConfidenceConfig::default());
        let mut ensemble = make_ensemble(SignalDirection::Buy, 0.7);
        ensemble.regime.is_tradeable = false;
        assert!((scorer.score(&ensemble) - 0.55).abs() < 1e-12);
    }

    #[test]
    fn score_never_negative() {
        let scorer = ConfidenceScorer::new(ConfidenceConfig::default());
        let mut ensemble = make_ensemble(SignalDirection::Buy, 0.1);
        ensemble.contradiction_score = 1.0;
        ensemble.regime.is_tradeable = false;
        assert!(scorer.score(&ensemble) >= 0.0);
    }

    #[test]
    fn display_percent_rounds() {
        let scorer = ConfidenceScorer::new(ConfidenceConfig::default());
        let (pct, strength) = scorer.display_confidence(0.678);
        assert_eq!(pct, 68);
        assert_eq!(strength, SignalStrength::Moderate);
    }
}
