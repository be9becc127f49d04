use std::collections::HashMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::regime::MarketRegime;

use super::{strength_for, EnsembleResult, Signal, SignalDirection, SignalReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleMethod {
    #[default]
    WeightedVote,
    MajorityVote,
    Unanimous,
    BestConfidence,
    RegimeWeighted,
}

impl EnsembleMethod {
    fn is_vote_like(self) -> bool {
        matches!(
            self,
            EnsembleMethod::WeightedVote | EnsembleMethod::MajorityVote | EnsembleMethod::Unanimous
        )
    }
}

/// Combine strategy-level signals into one final direction/confidence.
pub struct SignalEnsemble {
    strategy_weights: HashMap<String, f64>,
    wait_threshold: f64,
    contradiction_threshold: f64,
}

impl SignalEnsemble {
    pub fn new(
        strategy_weights: HashMap<String, f64>,
        wait_threshold: f64,
        contradiction_threshold: f64,
    ) -> Self {
        SignalEnsemble {
            strategy_weights,
            wait_threshold,
            contradiction_threshold,
        }
    }

    pub fn combine(
        &self,
        signals: Vec<Signal>,
        regime: &MarketRegime,
        method: EnsembleMethod,
    ) -> EnsembleResult {
        if signals.is_empty() {
            return self.empty_result(regime, SignalDirection::NoTrade, 0.0, Vec::new());
        }
        if signals
            .iter()
            .all(|signal| signal.direction == SignalDirection::Wait)
        {
            return self.empty_result(regime, SignalDirection::Wait, 0.2, signals);
        }

        let (mut direction, mut confidence) = match method {
            EnsembleMethod::MajorityVote => majority_vote(&signals),
            EnsembleMethod::Unanimous => unanimous(&signals),
            EnsembleMethod::BestConfidence => best_confidence(&signals),
            EnsembleMethod::RegimeWeighted => self.regime_weighted(&signals, regime),
            EnsembleMethod::WeightedVote => self.weighted_vote(&signals),
        };

        let agreement = agreement_score(&signals);
        let contradiction = 1.0 - agreement;
        if method.is_vote_like()
            && contradiction >= self.contradiction_threshold
            && direction.is_actionable()
        {
            direction = SignalDirection::Wait;
            confidence = confidence.min(0.45);
        }

        let ts = signals.iter().map(|signal| signal.ts).max().unwrap();
        let confidence = confidence.clamp(0.0, 1.0);
        EnsembleResult {
            symbol: signals[0].symbol.clone(),
            broker: signals[0].broker.clone(),
            timeframe: signals[0].timeframe,
            ts,
            run_id: signals[0].run_id.clone(),
            final_direction: direction,
            final_confidence: confidence,
            final_strength: strength_for(confidence),
            all_reasons: collect_reasons(&signals),
            agreement_score: agreement,
            contradiction_score: contradiction,
            regime: regime.clone(),
            horizon: signals[0].horizon.clone(),
            contributing_signals: signals,
            filters_blocked: Vec::new(),
            filters_passed: Vec::new(),
            explanation: String::new(),
        }
    }

    fn weighted_vote(&self, signals: &[Signal]) -> (SignalDirection, f64) {
        let mut total_score = 0.0;
        let mut weight_sum = 0.0;
        for signal in signals {
            let weight = self.weight_for(&signal.strategy_id);
            match signal.direction {
                SignalDirection::Buy => total_score += signal.confidence * weight,
                SignalDirection::Sell => total_score -= signal.confidence * weight,
                SignalDirection::NoTrade => total_score -= 0.15 * weight,
                SignalDirection::Wait => {}
            }
            weight_sum += weight;
        }
        let normalized = total_score / weight_sum.max(1e-9);
        if normalized.abs() <= self.wait_threshold {
            (SignalDirection::Wait, (0.5 - normalized.abs()).max(0.2))
        } else if normalized > 0.0 {
            (SignalDirection::Buy, normalized.abs().min(1.0))
        } else {
            (SignalDirection::Sell, normalized.abs().min(1.0))
        }
    }

    fn regime_weighted(&self, signals: &[Signal], regime: &MarketRegime) -> (SignalDirection, f64) {
        let mut total_score = 0.0;
        let mut total_weight = 0.0;
        for signal in signals {
            let base = self.weight_for(&signal.strategy_id);
            let boost = if regime
                .recommended_strategies
                .iter()
                .any(|id| id == &signal.strategy_id)
            {
                1.25
            } else {
                1.0
            };
            let weight = base * boost;
            let direction = match signal.direction {
                SignalDirection::Buy => 1.0,
                SignalDirection::Sell => -1.0,
                _ => 0.0,
            };
            total_score += direction * signal.confidence * weight;
            total_weight += weight;
        }
        let normalized = total_score / total_weight.max(1e-9);
        if normalized.abs() <= self.wait_threshold {
            (SignalDirection::Wait, 0.35)
        } else if normalized > 0.0 {
            (SignalDirection::Buy, normalized.abs().min(1.0))
        } else {
            (SignalDirection::Sell, normalized.abs().min(1.0))
        }
    }

    fn weight_for(&self, strategy_id: &str) -> f64 {
        self.strategy_weights.get(strategy_id).copied().unwrap_or(1.0)
    }

    fn empty_result(
        &self,
        regime: &MarketRegime,
        direction: SignalDirection,
        confidence: f64,
        signals: Vec<Signal>,
    ) -> EnsembleResult {
        let source = signals.first();
        EnsembleResult {
            symbol: source.map_or_else(|| regime.symbol.clone(), |s| s.symbol.clone()),
            broker: source.map_or_else(|| "unknown".to_string(), |s| s.broker.clone()),
            timeframe: source.map_or(regime.timeframe, |s| s.timeframe),
            ts: source.map_or(regime.ts, |s| s.ts),
            run_id: source.map_or_else(|| "unknown".to_string(), |s| s.run_id.clone()),
            final_direction: direction,
            final_confidence: confidence,
            final_strength: strength_for(confidence),
            all_reasons: Vec::new(),
            agreement_score: 0.0,
            contradiction_score: if direction == SignalDirection::Wait { 1.0 } else { 0.0 },
            regime: regime.clone(),
            horizon: source.map_or_else(|| "unknown".to_string(), |s| s.horizon.clone()),
            contributing_signals: signals,
            filters_blocked: Vec::new(),
            filters_passed: Vec::new(),
            explanation: String::new(),
        }
    }
}

fn actionable(signals: &[Signal]) -> impl Iterator<Item = &Signal> {
    signals
        .iter()
        .filter(|signal| signal.direction.is_actionable())
}

fn majority_vote(signals: &[Signal]) -> (SignalDirection, f64) {
    let buys = actionable(signals)
        .filter(|s| s.direction == SignalDirection::Buy)
        .count();
    let sells = actionable(signals)
        .filter(|s| s.direction == SignalDirection::Sell)
        .count();
    let total = buys + sells;
    if total == 0 {
        return (SignalDirection::Wait, 0.2);
    }
    if buys == sells {
        return (SignalDirection::Wait, 0.3);
    }
    let winner = if buys > sells {
        SignalDirection::Buy
    } else {
        SignalDirection::Sell
    };
    (winner, buys.max(sells) as f64 / total as f64)
}

fn unanimous(signals: &[Signal]) -> (SignalDirection, f64) {
    let actionable: Vec<&Signal> = signals
        .iter()
        .filter(|signal| signal.direction.is_actionable())
        .collect();
    if actionable.is_empty() {
        return (SignalDirection::Wait, 0.2);
    }
    let first = actionable[0].direction;
    if actionable.iter().any(|signal| signal.direction != first) {
        return (SignalDirection::Wait, 0.25);
    }
    let confidence =
        actionable.iter().map(|s| s.confidence).sum::<f64>() / actionable.len() as f64;
    (first, confidence)
}

fn best_confidence(signals: &[Signal]) -> (SignalDirection, f64) {
    let best = signals
        .iter()
        .filter(|signal| signal.direction.is_actionable())
        .max_by_key(|signal| OrderedFloat(signal.confidence));
    match best {
        Some(signal) => (signal.direction, signal.confidence),
        None => (SignalDirection::Wait, 0.2),
    }
}

fn agreement_score(signals: &[Signal]) -> f64 {
    let buys = actionable(signals)
        .filter(|s| s.direction == SignalDirection::Buy)
        .count();
    let sells = actionable(signals)
        .filter(|s| s.direction == SignalDirection::Sell)
        .count();
    let total = buys + sells;
    if total == 0 {
        return 0.0;
    }
    buys.max(sells) as f64 / total as f64
}

/// Merge reasons across signals, renormalizing weights to sum to one and
/// sorting by weight descending.
fn collect_reasons(signals: &[Signal]) -> Vec<SignalReason> {
    let mut reasons: Vec<SignalReason> = signals
        .iter()
        .flat_map(|signal| signal.reasons.iter().cloned())
        .collect();
    if reasons.is_empty() {
        return reasons;
    }
    let total: f64 = reasons.iter().map(|reason| reason.weight).sum();
    if total > 0.0 {
        for reason in &mut reasons {
            reason.weight /= total;
        }
    }
    reasons.sort_by_key(|reason| std::cmp::Reverse(OrderedFloat(reason.weight)));
    reasons
}
