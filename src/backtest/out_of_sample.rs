use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::data::Timeframe;
use crate::error::Result;

use super::engine::{BacktestEngine, SpanOutcome};
use super::BacktestMetrics;

/// Compact in-sample vs out-of-sample validation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OosReport {
    pub is_vs_oos_sharpe_ratio: f64,
    pub is_vs_oos_profit_factor: f64,
    pub verdict: String,
    pub recommendations: Vec<String>,
}

/// Split the period with purge and embargo, run SIMPLE on each half, and
/// compare robustness.
pub struct OutOfSampleValidator<'a> {
    engine: &'a BacktestEngine,
}

impl<'a> OutOfSampleValidator<'a> {
    pub fn new(engine: &'a BacktestEngine) -> Self {
        OutOfSampleValidator { engine }
    }

    pub(crate) async fn run(&self) -> Result<(SpanOutcome, SpanOutcome)> {
        let config = self.engine.config();
        let (is_start, is_end, oos_start, oos_end) = split_period(
            config.start_date,
            config.end_date,
            config.oos_pct,
            config.purge_bars,
            config.timeframe(),
        );
        let strategy_ids = config.strategy_ids.clone();
        let signals = self
            .engine
            .signals_config_for(&strategy_ids, &Default::default());
        let is_outcome = self
            .engine
            .run_simple_span(is_start, is_end, signals.clone(), &format!("{}-is", config.run_id))
            .await?;
        let oos_outcome = self
            .engine
            .run_simple_span(oos_start, oos_end, signals, &format!("{}-oos", config.run_id))
            .await?;
        Ok((is_outcome, oos_outcome))
    }

    pub fn report(&self, is_metrics: &BacktestMetrics, oos_metrics: &BacktestMetrics) -> OosReport {
        build_report(is_metrics, oos_metrics)
    }
}

/// IS/OOS boundaries: the IS end is purged back by `purge_bars` intervals
/// and the OOS start embargoed forward by the same amount.
pub fn split_period(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    oos_pct: f64,
    purge_bars: usize,
    timeframe: Timeframe,
) -> (DateTime<Utc>, DateTime<Utc>, DateTime<Utc>, DateTime<Utc>) {
    let total_seconds = (end - start).num_seconds().max(0);
    let oos_seconds = (total_seconds as f64 * oos_pct) as i64;
    let is_end_raw = end - Duration::seconds(oos_seconds);
    let purge_seconds = purge_bars as i64 * timeframe.seconds();
    let is_end = is_end_raw - Duration::seconds(purge_seconds);
    let oos_start = is_end_raw + Duration::seconds(purge_seconds);
    (start, is_end, oos_start, end)
}

pub fn build_report(is_metrics: &BacktestMetrics, oos_metrics: &BacktestMetrics) -> OosReport {
    let is_sharpe = is_metrics.sharpe_ratio;
    let oos_sharpe = oos_metrics.sharpe_ratio;
    let is_pf = is_metrics.profit_factor;
    let oos_pf = oos_metrics.profit_factor;
    let win_rate_delta = (oos_metrics.win_rate - is_metrics.win_rate).abs();

    let sharpe_ratio = if is_sharpe.abs() > 1e-12 {
        oos_sharpe / is_sharpe
    } else {
        0.0
    };
    let pf_ratio = if is_pf > 0.0 && is_pf.is_finite() {
        oos_pf / is_pf
    } else {
        0.0
    };

    let verdict = if sharpe_ratio >= 0.8 && oos_pf >= 1.0 && win_rate_delta <= 0.15 {
        "validated"
    } else if sharpe_ratio >= 0.5 && oos_pf >= 0.9 {
        "marginal"
    } else {
        "overfit"
    };

    let mut recommendations = Vec::new();
    if verdict == "overfit" {
        recommendations.push("reduce strategy parameter complexity".to_string());
        recommendations.push("expand the training period and retest".to_string());
    }
    if oos_pf < 1.0 {
        recommendations.push("improve the risk/reward profile before live usage".to_string());
    }
    if win_rate_delta > 0.15 {
        recommendations.push("investigate distribution drift between IS and OOS".to_string());
    }

    OosReport {
        is_vs_oos_sharpe_ratio: sharpe_ratio,
        is_vs_oos_profit_factor: pf_ratio,
        verdict: verdict.to_string(),
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn split_applies_purge_and_embargo() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 11, 0, 0, 0).unwrap(); // 240 H1 bars
        let (is_start, is_end, oos_start, oos_end) =
            split_period(start, end, 0.2, 10, Timeframe::H1);
        assert_eq!(is_start, start);
        assert_eq!(oos_end, end);
        // OOS is 20% = 48h; boundary at day 9; purge/embargo of 10h each.
        let boundary = end - Duration::hours(48);
        assert_eq!(is_end, boundary - Duration::hours(10));
        assert_eq!(oos_start, boundary + Duration::hours(10));
        assert!(is_end < oos_start);
    }

    fn metrics(sharpe: f64, pf: f64, win_rate: f64) -> BacktestMetrics {
        let mut m = BacktestMetrics::default();
        m.sharpe_ratio = sharpe;
        m.profit_factor = pf;
        m.win_rate = win_rate;
        m
    }

    #[test]
    fn validated_when_oos_holds_up() {
        let report = build_report(&metrics(1.2, 1.5, 0.55), &metrics(1.1, 1.3, 0.52));
        assert_eq!(report.verdict, "validated");
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn overfit_when_oos_collapses() {
        let report = build_report(&metrics(2.0, 2.0, 0.60), &metrics(0.2, 0.7, 0.35));
        assert_eq!(report.verdict, "overfit");
        assert!(!report.recommendations.is_empty());
    }

    #[test]
    fn zero_is_sharpe_guard() {
        let report = build_report(&metrics(0.0, 1.0, 0.5), &metrics(1.0, 1.0, 0.5));
        assert_eq!(report.is_vs_oos_sharpe_ratio, 0.0);
    }
}
