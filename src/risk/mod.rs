pub mod drawdown;
pub mod exposure;
pub mod kill_switch;
pub mod manager;
pub mod sizer;
pub mod slippage;
pub mod stops;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

pub use drawdown::DrawdownTracker;
pub use exposure::{ExposureLimits, ExposureTracker};
pub use kill_switch::{KillSwitch, KillSwitchConfig, SystemMetrics};
pub use manager::{PositionAction, RiskManager};
pub use sizer::{PositionSize, PositionSizer, SizingRequest};
pub use slippage::{
    CommissionMethod, CommissionRule, CommissionsConfig, SlippageConfig, SlippageMethod,
    SlippageModel,
};
pub use stops::{
    StopConfig, StopLossMethod, StopManager, TakeProfitMethod, TimeExitConfig, TrailingConfig,
    TrailingMethod,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for long exposure, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "STOP",
            OrderType::StopLimit => "STOP_LIMIT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizingMethod {
    FixedUnits,
    FixedAmount,
    PercentEquity,
    #[default]
    PercentRisk,
    AtrBased,
    KellyFractional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCheckStatus {
    Approved,
    Rejected,
    Modified,
}

/// Result of validating one signal under risk rules.
///
/// Invariants: REJECTED implies `approved_size == 0` and at least one
/// rejection reason; APPROVED/MODIFIED imply `approved_side` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCheck {
    pub check_id: String,
    pub signal_id: String,
    pub symbol: String,
    pub broker: String,
    pub ts: DateTime<Utc>,
    pub status: RiskCheckStatus,
    pub approved_size: f64,
    pub approved_side: Option<OrderSide>,
    pub suggested_sl: Option<f64>,
    pub suggested_tp: Option<f64>,
    pub suggested_trailing: Option<f64>,
    pub risk_amount: f64,
    pub risk_percent: f64,
    pub reward_risk_ratio: f64,
    pub rejection_reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub portfolio_snapshot: HashMap<String, f64>,
}

impl RiskCheck {
    pub fn is_executable(&self) -> bool {
        matches!(
            self.status,
            RiskCheckStatus::Approved | RiskCheckStatus::Modified
        ) && self.approved_size > 0.0
    }
}

/// Portfolio-level risk snapshot recorded alongside each evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskReport {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub equity: f64,
    pub balance: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl_today: f64,
    pub realized_pnl_week: f64,
    pub daily_drawdown_pct: f64,
    pub weekly_drawdown_pct: f64,
    pub max_drawdown_pct: f64,
    pub current_drawdown_pct: f64,
    pub open_positions_count: usize,
    pub total_exposure_notional: f64,
    pub total_exposure_pct: f64,
    pub exposure_by_asset: HashMap<String, f64>,
    pub exposure_by_asset_class: HashMap<String, f64>,
    pub kill_switch_active: bool,
    pub kill_switch_reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RiskLimitsConfig {
    #[garde(range(min = 0.0, max = 100.0))]
    pub max_daily_drawdown_pct: f64,
    #[garde(range(min = 0.0, max = 100.0))]
    pub max_weekly_drawdown_pct: f64,
    /// Equity floor as a percent of the initial balance.
    #[garde(range(min = 0.0, max = 100.0))]
    pub min_equity_threshold_pct: f64,
    #[garde(range(min = 1))]
    pub max_open_positions: usize,
    #[garde(range(min = 0.0, max = 100.0))]
    pub max_exposure_per_symbol_pct: f64,
    #[garde(range(min = 0.0, max = 100.0))]
    pub max_exposure_per_asset_class_pct: f64,
    #[garde(range(min = 0.0, max = 100.0))]
    pub max_correlated_exposure_pct: f64,
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        RiskLimitsConfig {
            max_daily_drawdown_pct: 3.0,
            max_weekly_drawdown_pct: 8.0,
            min_equity_threshold_pct: 70.0,
            max_open_positions: 5,
            max_exposure_per_symbol_pct: 20.0,
            max_exposure_per_asset_class_pct: 40.0,
            max_correlated_exposure_pct: 30.0,
        }
    }
}

impl RiskLimitsConfig {
    pub fn exposure_limits(&self) -> ExposureLimits {
        ExposureLimits {
            max_exposure_per_symbol_pct: self.max_exposure_per_symbol_pct,
            max_exposure_per_asset_class_pct: self.max_exposure_per_asset_class_pct,
            max_correlated_exposure_pct: self.max_correlated_exposure_pct,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PaperConfig {
    #[garde(range(min = 0.01))]
    pub initial_balance: f64,
    #[garde(skip)]
    pub currency: String,
    #[garde(range(min = 1.0))]
    pub leverage: f64,
    #[garde(skip)]
    pub fill_mode: crate::execution::FillMode,
    #[garde(range(min = 0.0, max = 1.0))]
    pub partial_fill_probability: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        PaperConfig {
            initial_balance: 10_000.0,
            currency: "USD".to_string(),
            leverage: 30.0,
            fill_mode: crate::execution::FillMode::Realistic,
            partial_fill_probability: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RiskConfig {
    #[garde(skip)]
    pub enabled: bool,
    #[garde(range(min = 0.0))]
    pub min_rr_ratio: f64,
    /// Values above 1.0 are percent and get divided by 100 by the sizer;
    /// values at or below 1.0 are fractions. 2.0 and 0.02 both mean 2%.
    #[garde(range(min = 0.0))]
    pub max_risk_per_trade_pct: f64,
    /// Same dual interpretation as `max_risk_per_trade_pct`; the default
    /// is the fraction form (0.01 = 1%) to stay clear of the 1.0 boundary.
    #[garde(range(min = 0.0))]
    pub default_risk_per_trade_pct: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub kelly_fraction: f64,
    #[garde(skip)]
    pub default_sizing_method: PositionSizingMethod,
    #[garde(dive)]
    pub limits: RiskLimitsConfig,
    #[garde(dive)]
    pub stops: StopConfig,
    #[garde(dive)]
    pub trailing: TrailingConfig,
    #[garde(skip)]
    pub time_exit: TimeExitConfig,
    #[garde(dive)]
    pub kill_switch: KillSwitchConfig,
    #[garde(dive)]
    pub slippage: SlippageConfig,
    #[garde(skip)]
    pub commissions: CommissionsConfig,
    #[garde(dive)]
    pub paper: PaperConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            enabled: true,
            min_rr_ratio: 1.5,
            max_risk_per_trade_pct: 2.0,
            default_risk_per_trade_pct: 0.01,
            kelly_fraction: 0.25,
            default_sizing_method: PositionSizingMethod::PercentRisk,
            limits: RiskLimitsConfig::default(),
            stops: StopConfig::default(),
            trailing: TrailingConfig::default(),
            time_exit: TimeExitConfig::default(),
            kill_switch: KillSwitchConfig::default(),
            slippage: SlippageConfig::default(),
            commissions: CommissionsConfig::default(),
            paper: PaperConfig::default(),
        }
    }
}
