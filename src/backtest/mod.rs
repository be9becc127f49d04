pub mod engine;
pub mod metrics;
pub mod optimizer;
pub mod out_of_sample;
pub mod synthetic;
pub mod walk_forward;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::data::Timeframe;
use crate::error::{Error, Result};
use crate::risk::OrderSide;

pub use engine::{BacktestEngine, BacktestRuntime};
pub use metrics::MetricsCalculator;
pub use optimizer::{parse_param_space, OptimizationResult, ParamSpace, StrategyOptimizer};
pub use out_of_sample::{OosReport, OutOfSampleValidator};
pub use synthetic::generate_synthetic_bars;
pub use walk_forward::{WalkForwardAnalyzer, WalkForwardSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BacktestMode {
    #[default]
    Simple,
    WalkForward,
    OutOfSample,
}

/// Complete runtime configuration for one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BacktestConfig {
    #[garde(skip)]
    pub run_id: String,
    #[garde(length(min = 1))]
    pub strategy_ids: Vec<String>,
    #[garde(length(min = 1))]
    pub symbols: Vec<String>,
    #[garde(length(min = 1))]
    pub brokers: Vec<String>,
    #[garde(length(min = 1))]
    pub timeframes: Vec<Timeframe>,
    #[garde(skip)]
    pub start_date: DateTime<Utc>,
    #[garde(skip)]
    pub end_date: DateTime<Utc>,
    #[garde(skip)]
    pub mode: BacktestMode,
    #[garde(range(min = 1))]
    pub wf_train_periods: usize,
    #[garde(range(min = 1))]
    pub wf_test_periods: usize,
    #[garde(range(min = 1))]
    pub wf_step_periods: usize,
    #[garde(range(min = 0.01, max = 0.99))]
    pub oos_pct: f64,
    #[garde(skip)]
    pub purge_bars: usize,
    #[garde(range(min = 0.01))]
    pub initial_capital: f64,
    #[garde(skip)]
    pub currency: String,
    #[garde(skip)]
    pub use_realistic_fills: bool,
    #[garde(skip)]
    pub warmup_bars: usize,
    #[garde(skip)]
    pub seed: u64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            run_id: "backtest".to_string(),
            strategy_ids: vec!["trend_following".to_string()],
            symbols: vec!["EURUSD".to_string()],
            brokers: vec!["paper".to_string()],
            timeframes: vec![Timeframe::H1],
            start_date: DateTime::<Utc>::MIN_UTC,
            end_date: DateTime::<Utc>::MAX_UTC,
            mode: BacktestMode::Simple,
            wf_train_periods: 12,
            wf_test_periods: 3,
            wf_step_periods: 3,
            oos_pct: 0.20,
            purge_bars: 10,
            initial_capital: 10_000.0,
            currency: "USD".to_string(),
            use_realistic_fills: true,
            warmup_bars: 200,
            seed: 42,
        }
    }
}

impl BacktestConfig {
    pub fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|err| Error::ConfigInvalid(err.to_string()))?;
        if self.end_date <= self.start_date {
            return Err(Error::validation("end_date must be greater than start_date"));
        }
        Ok(self)
    }

    pub fn symbol(&self) -> &str {
        &self.symbols[0]
    }

    pub fn broker(&self) -> &str {
        &self.brokers[0]
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframes[0]
    }
}

/// One simulated round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub trade_id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub side: OrderSide,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub pnl_net: f64,
    pub commission: f64,
    pub slippage: f64,
    pub bars_held: u32,
    pub exit_reason: String,
    pub r_multiple: Option<f64>,
    pub stop_loss: Option<f64>,
    pub regime_at_entry: String,
    pub volatility_at_entry: String,
    pub signal_confidence: f64,
    pub max_favorable_excursion: f64,
    pub max_adverse_excursion: f64,
}

impl BacktestTrade {
    /// Derive the R multiple from the stop when not supplied.
    pub fn with_derived_r_multiple(mut self) -> Self {
        if self.r_multiple.is_none() {
            if let Some(stop) = self.stop_loss {
                let risk_per_unit = (self.entry_price - stop).abs();
                if risk_per_unit > 0.0 {
                    let direction = self.side.sign();
                    let price_move = (self.exit_price - self.entry_price) * direction;
                    self.r_multiple = Some(price_move / risk_per_unit);
                }
            }
        }
        self
    }
}

/// Scalar performance summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub breakeven_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub total_pnl_net: f64,
    pub total_commission: f64,
    pub total_slippage: f64,
    pub avg_pnl_per_trade: f64,
    pub avg_pnl_winners: f64,
    pub avg_pnl_losers: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub payoff_ratio: f64,
    pub avg_r_multiple: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown_duration_bars: usize,
    pub avg_drawdown_pct: f64,
    pub ulcer_index: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub omega_ratio: f64,
    pub longest_winning_streak: usize,
    pub longest_losing_streak: usize,
    pub monthly_returns: std::collections::BTreeMap<String, f64>,
    pub yearly_returns: std::collections::BTreeMap<String, f64>,
    pub stability_score: f64,
    pub avg_bars_in_trade: f64,
    pub avg_seconds_between_trades: f64,
    pub trades_per_month: f64,
}

/// One train/test window in walk-forward analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardWindow {
    pub window_id: usize,
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
    pub train_metrics: BacktestMetrics,
    pub test_metrics: BacktestMetrics,
    /// `test.sharpe / train.sharpe`; 0 when the train sharpe is ~0.
    pub degradation_score: f64,
}

impl WalkForwardWindow {
    pub fn degradation(train: &BacktestMetrics, test: &BacktestMetrics) -> f64 {
        if train.sharpe_ratio.abs() <= 1e-12 {
            0.0
        } else {
            test.sharpe_ratio / train.sharpe_ratio
        }
    }
}

/// Full backtest output consumed by CLIs and reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub config: BacktestConfig,
    pub metrics: BacktestMetrics,
    pub trades: Vec<BacktestTrade>,
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    pub drawdown_curve: Vec<(DateTime<Utc>, f64)>,
    pub metrics_by_strategy: HashMap<String, BacktestMetrics>,
    pub metrics_by_regime: HashMap<String, BacktestMetrics>,
    pub metrics_by_session: HashMap<String, BacktestMetrics>,
    pub metrics_by_month: HashMap<String, BacktestMetrics>,
    pub wf_windows: Option<Vec<WalkForwardWindow>>,
    pub wf_summary: Option<WalkForwardSummary>,
    pub is_metrics: Option<BacktestMetrics>,
    pub oos_metrics: Option<BacktestMetrics>,
    pub oos_report: Option<OosReport>,
    pub duration_seconds: f64,
}
