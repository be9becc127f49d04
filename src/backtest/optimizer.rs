use std::collections::BTreeMap;

use rand::prelude::IndexedRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::engine::BacktestEngine;
use super::BacktestMetrics;

/// Bounded parameter axis: (low, high, step).
pub type ParamSpace = BTreeMap<String, (f64, f64, f64)>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub params: BTreeMap<String, f64>,
    pub raw_metric: f64,
    pub score: f64,
}

/// Optimization output with anti-overfit diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub strategy_id: String,
    pub best_params: BTreeMap<String, f64>,
    pub best_score: f64,
    pub best_metrics: BacktestMetrics,
    pub n_trials: usize,
    pub n_successful_trials: usize,
    pub param_importance: BTreeMap<String, f64>,
    pub all_trials: Vec<TrialRecord>,
    pub overfitting_risk: String,
    pub verdict: String,
}

/// Random-search parameter optimization with an anti-overfit penalty:
/// `score = sharpe - lambda*ln(#params) - mu*std(monthly returns)`.
pub struct StrategyOptimizer<'a> {
    engine: &'a BacktestEngine,
    lambda_complexity: f64,
    mu_instability: f64,
    seed: u64,
}

impl<'a> StrategyOptimizer<'a> {
    pub fn new(engine: &'a BacktestEngine) -> Self {
        StrategyOptimizer {
            engine,
            lambda_complexity: 0.05,
            mu_instability: 0.10,
            seed: 42,
        }
    }

    pub async fn optimize(
        &self,
        strategy_id: &str,
        param_space: &ParamSpace,
        n_trials: usize,
        metric: &str,
        mut on_trial: impl FnMut(usize, &TrialRecord),
    ) -> Result<OptimizationResult> {
        let n_trials = n_trials.max(1);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let config = self.engine.config();

        let mut trials: Vec<(TrialRecord, BacktestMetrics)> = Vec::with_capacity(n_trials);
        for trial_idx in 0..n_trials {
            let params = sample_params(param_space, &mut rng)?;
            let metrics = self
                .engine
                .run_single_strategy(
                    strategy_id,
                    &params.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                    config.start_date,
                    config.end_date,
                    &format!("opt{trial_idx}"),
                )
                .await?;
            let raw = metric_value(&metrics, metric);
            let score = self.penalty_score(&metrics, params.len());
            let record = TrialRecord {
                params,
                raw_metric: raw,
                score,
            };
            on_trial(trial_idx, &record);
            tracing::info!(
                trial = trial_idx + 1,
                n_trials,
                score,
                raw_metric = raw,
                "optimization trial finished"
            );
            trials.push((record, metrics));
        }

        let best_index = trials
            .iter()
            .enumerate()
            .max_by(|a, b| {
                a.1 .0
                    .score
                    .partial_cmp(&b.1 .0.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(idx, _)| idx)
            .ok_or_else(|| Error::Internal("no optimization trials produced".into()))?;
        let (best_record, best_metrics) = trials[best_index].clone();

        let importance = param_importance(&trials, param_space);
        let risk = overfitting_risk(&best_metrics);
        let verdict = if best_metrics.total_trades < 10 {
            "strategy_not_viable"
        } else if best_metrics.profit_factor >= 1.0 {
            "use_params"
        } else {
            "use_defaults"
        };

        Ok(OptimizationResult {
            strategy_id: strategy_id.to_string(),
            best_params: best_record.params.clone(),
            best_score: best_record.score,
            best_metrics,
            n_trials,
            n_successful_trials: trials.len(),
            param_importance: importance,
            all_trials: trials.into_iter().map(|(record, _)| record).collect(),
            overfitting_risk: risk.to_string(),
            verdict: verdict.to_string(),
        })
    }

    fn penalty_score(&self, metrics: &BacktestMetrics, n_params: usize) -> f64 {
        let complexity = (n_params.max(1) as f64).ln();
        let monthly: Vec<f64> = metrics.monthly_returns.values().copied().collect();
        let instability = population_std(&monthly);
        metrics.sharpe_ratio - self.lambda_complexity * complexity - self.mu_instability * instability
    }
}

fn sample_params(space: &ParamSpace, rng: &mut StdRng) -> Result<BTreeMap<String, f64>> {
    let mut params = BTreeMap::new();
    for (name, (low, high, step)) in space {
        let (low, high) = if high < low { (*high, *low) } else { (*low, *high) };
        if *step <= 0.0 {
            params.insert(name.clone(), low);
            continue;
        }
        let count = ((high - low) / step).round() as usize;
        let candidates: Vec<f64> = (0..=count).map(|idx| low + step * idx as f64).collect();
        let value = candidates
            .choose(rng)
            .copied()
            .ok_or_else(|| Error::validation(format!("empty parameter grid for {name}")))?;
        params.insert(name.clone(), value);
    }
    Ok(params)
}

/// Normalized |correlation| of each parameter against the trial scores.
fn param_importance(
    trials: &[(TrialRecord, BacktestMetrics)],
    space: &ParamSpace,
) -> BTreeMap<String, f64> {
    if trials.is_empty() || space.is_empty() {
        return BTreeMap::new();
    }
    let scores: Vec<f64> = trials.iter().map(|(record, _)| record.score).collect();
    let score_std = population_std(&scores);
    let mut raw = BTreeMap::new();
    for name in space.keys() {
        let values: Vec<f64> = trials
            .iter()
            .map(|(record, _)| record.params.get(name).copied().unwrap_or(0.0))
            .collect();
        let value_std = population_std(&values);
        let corr = if value_std > 1e-12 && score_std > 1e-12 {
            (covariance(&values, &scores) / (value_std * score_std)).abs()
        } else {
            0.0
        };
        raw.insert(name.clone(), corr);
    }
    let total: f64 = raw.values().sum();
    if total <= 1e-12 {
        let equal = 1.0 / raw.len() as f64;
        return raw.keys().map(|name| (name.clone(), equal)).collect();
    }
    raw.into_iter().map(|(name, value)| (name, value / total)).collect()
}

fn overfitting_risk(metrics: &BacktestMetrics) -> &'static str {
    if metrics.sharpe_ratio >= 1.0 && metrics.stability_score >= 0.6 {
        "low"
    } else if metrics.sharpe_ratio >= 0.5 && metrics.stability_score >= 0.3 {
        "medium"
    } else {
        "high"
    }
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

fn covariance(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mean_a = a.iter().sum::<f64>() / a.len() as f64;
    let mean_b = b.iter().sum::<f64>() / b.len() as f64;
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum::<f64>()
        / a.len() as f64
}

fn metric_value(metrics: &BacktestMetrics, metric: &str) -> f64 {
    match metric {
        "sharpe_ratio" => metrics.sharpe_ratio,
        "sortino_ratio" => metrics.sortino_ratio,
        "profit_factor" => metrics.profit_factor,
        "total_pnl_net" => metrics.total_pnl_net,
        "win_rate" => metrics.win_rate,
        "expectancy" => metrics.expectancy,
        _ => metrics.sharpe_ratio,
    }
}

/// Parse a CLI `name=lo:hi:step,...` parameter-space expression.
pub fn parse_param_space(raw: &str) -> Result<ParamSpace> {
    let mut space = ParamSpace::new();
    for chunk in raw.split(',').map(str::trim).filter(|chunk| !chunk.is_empty()) {
        let (name, bounds) = chunk
            .split_once('=')
            .ok_or_else(|| Error::validation(format!("invalid param expression: {chunk}")))?;
        let parts: Vec<&str> = bounds.split(':').collect();
        if parts.len() != 3 {
            return Err(Error::validation(format!(
                "expected name=lo:hi:step, got: {chunk}"
            )));
        }
        let parse = |value: &str| -> Result<f64> {
            value
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::validation(format!("invalid number in: {chunk}")))
        };
        space.insert(
            name.trim().to_string(),
            (parse(parts[0])?, parse(parts[1])?, parse(parts[2])?),
        );
    }
    Ok(space)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_param_space_expression() {
        let space = parse_param_space("adx_min=15:30:5, rsi_low=20:40:10").unwrap();
        assert_eq!(space.len(), 2);
        assert_eq!(space["adx_min"], (15.0, 30.0, 5.0));
        assert_eq!(space["rsi_low"], (20.0, 40.0, 10.0));
        assert!(parse_param_space("bad").is_err());
        assert!(parse_param_space("x=1:2").is_err());
    }

    #[test]
    fn sampling_stays_on_grid_and_is_seeded() {
        let mut space = ParamSpace::new();
        space.insert("adx_min".into(), (15.0, 30.0, 5.0));
        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);
        for _ in 0..20 {
            let a = sample_params(&space, &mut rng_a).unwrap();
            let b = sample_params(&space, &mut rng_b).unwrap();
            assert_eq!(a, b);
            let value = a["adx_min"];
            assert!([15.0, 20.0, 25.0, 30.0].contains(&value));
        }
    }

    #[test]
    fn importance_normalizes_to_one() {
        let mut space = ParamSpace::new();
        space.insert("a".into(), (0.0, 10.0, 1.0));
        space.insert("b".into(), (0.0, 10.0, 1.0));
        let trials: Vec<(TrialRecord, BacktestMetrics)> = (0..10)
            .map(|i| {
                let mut params = BTreeMap::new();
                params.insert("a".to_string(), i as f64);
                params.insert("b".to_string(), 5.0);
                (
                    TrialRecord {
                        params,
                        raw_metric: i as f64,
                        score: i as f64, // perfectly correlated with `a`
                    },
                    BacktestMetrics::default(),
                )
            })
            .collect();
        let importance = param_importance(&trials, &space);
        let total: f64 = importance.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(importance["a"] > importance["b"]);
    }

    #[test]
    fn overfitting_risk_thresholds() {
        let mut metrics = BacktestMetrics::default();
        metrics.sharpe_ratio = 1.5;
        metrics.stability_score = 0.8;
        assert_eq!(overfitting_risk(&metrics), "low");
        metrics.sharpe_ratio = 0.6;
        metrics.stability_score = 0.4;
        assert_eq!(overfitting_risk(&metrics), "medium");
        metrics.sharpe_ratio = 0.1;
        assert_eq!(overfitting_risk(&metrics), "high");
    }
}
