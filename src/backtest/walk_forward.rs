use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::data::Timeframe;
use crate::error::{Error, Result};

use super::engine::BacktestEngine;
use super::WalkForwardWindow;

/// Statistical summary over all walk-forward windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardSummary {
    pub avg_degradation_score: f64,
    pub pct_windows_profitable: f64,
    pub sharpe_stability: f64,
    pub overall_verdict: String,
}

/// Rolling train/test windows measuring out-of-sample degradation.
pub struct WalkForwardAnalyzer<'a> {
    engine: &'a BacktestEngine,
}

impl<'a> WalkForwardAnalyzer<'a> {
    pub fn new(engine: &'a BacktestEngine) -> Self {
        WalkForwardAnalyzer { engine }
    }

    pub async fn run(&self) -> Result<Vec<WalkForwardWindow>> {
        let config = self.engine.config();
        let strategy_id = config.strategy_ids[0].clone();
        let windows = generate_windows(
            config.start_date,
            config.end_date,
            config.wf_train_periods,
            config.wf_test_periods,
            config.wf_step_periods,
            config.timeframe(),
        )?;

        let mut result = Vec::with_capacity(windows.len());
        for (idx, (train_start, train_end, test_start, test_end)) in
            windows.into_iter().enumerate()
        {
            let train_metrics = self
                .engine
                .run_single_strategy(
                    &strategy_id,
                    &Default::default(),
                    train_start,
                    train_end,
                    &format!("wf{idx}-train"),
                )
                .await?;
            let test_metrics = self
                .engine
                .run_single_strategy(
                    &strategy_id,
                    &Default::default(),
                    test_start,
                    test_end,
                    &format!("wf{idx}-test"),
                )
                .await?;
            let degradation = WalkForwardWindow::degradation(&train_metrics, &test_metrics);
            result.push(WalkForwardWindow {
                window_id: idx,
                train_start,
                train_end,
                test_start,
                test_end,
                train_metrics,
                test_metrics,
                degradation_score: degradation,
            });
        }
        Ok(result)
    }

    pub fn summarize(&self, windows: &[WalkForwardWindow]) -> WalkForwardSummary {
        summarize(windows)
    }
}

/// Generate rolling (train_start, train_end, test_start, test_end)
/// windows. Fewer than 3 possible windows is an error.
pub fn generate_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    train_periods: usize,
    test_periods: usize,
    step_periods: usize,
    timeframe: Timeframe,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>, DateTime<Utc>, DateTime<Utc>)>> {
    let tf_seconds = timeframe.seconds();
    let train_delta = Duration::seconds(train_periods as i64 * tf_seconds);
    let test_delta = Duration::seconds(test_periods as i64 * tf_seconds);
    let step_delta = Duration::seconds(step_periods.max(1) as i64 * tf_seconds);

    let mut windows = Vec::new();
    let mut cursor = start;
    loop {
        let train_start = cursor;
        let train_end = train_start + train_delta;
        let test_start = train_end;
        let test_end = test_start + test_delta;
        if test_end > end {
            break;
        }
        windows.push((train_start, train_end, test_start, test_end));
        cursor += step_delta;
    }

    if windows.len() < 3 {
        return Err(Error::validation(
            "period is too short to generate at least 3 walk-forward windows",
        ));
    }
    Ok(windows)
}

pub fn summarize(windows: &[WalkForwardWindow]) -> WalkForwardSummary {
    if windows.is_empty() {
        return WalkForwardSummary {
            avg_degradation_score: 0.0,
            pct_windows_profitable: 0.0,
            sharpe_stability: 0.0,
            overall_verdict: "overfit".to_string(),
        };
    }
    let degradations: Vec<f64> = windows.iter().map(|w| w.degradation_score).collect();
    let avg_degradation = degradations.iter().sum::<f64>() / degradations.len() as f64;
    let profitable = windows
        .iter()
        .filter(|w| w.test_metrics.sharpe_ratio > 0.0)
        .count();
    let pct_profitable = profitable as f64 / windows.len() as f64;
    let test_sharpes: Vec<f64> = windows.iter().map(|w| w.test_metrics.sharpe_ratio).collect();
    let stability = population_std(&test_sharpes);

    let verdict = if avg_degradation >= 0.8 && pct_profitable >= 0.7 {
        "robust"
    } else if avg_degradation >= 0.5 && pct_profitable >= 0.5 {
        "marginal"
    } else {
        "overfit"
    };
    WalkForwardSummary {
        avg_degradation_score: avg_degradation,
        pct_windows_profitable: pct_profitable,
        sharpe_stability: stability,
        overall_verdict: verdict.to_string(),
    }
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}
