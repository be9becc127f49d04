pub mod adapter;
pub mod fill_simulator;
pub mod idempotency;
pub mod order_manager;
pub mod paper;
pub mod reconciler;
pub mod retry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{meta_f64, AssetClass, Metadata};
use crate::risk::{OrderSide, OrderType};

pub use adapter::{BrokerAdapter, MockBrokerAdapter};
pub use fill_simulator::{FillMode, FillSimulator, FillSimulatorConfig};
pub use idempotency::IdempotencyManager;
pub use order_manager::OrderManager;
pub use paper::PaperAdapter;
pub use reconciler::{Reconciler, ReconcilerConfig, ReconciliationReport};
pub use retry::RetryHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        }
    }

    /// Statuses that make a later submission with the same client order id
    /// a duplicate.
    pub fn is_live_or_filled(self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::Submitted
                | OrderStatus::PartiallyFilled
                | OrderStatus::Filled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
        }
    }
}

/// Order tracked by the OMS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub broker_order_id: Option<String>,
    pub client_order_id: String,
    pub signal_id: String,
    pub risk_check_id: String,
    pub symbol: String,
    pub broker: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub trailing_stop: Option<f64>,
    pub time_in_force: String,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub filled_quantity: f64,
    pub average_fill_price: Option<f64>,
    pub commission: f64,
    pub slippage: f64,
    pub reject_reason: Option<String>,
    pub retry_count: u32,
    pub is_paper: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Order {
    /// Position id this order closes, when it is a close order.
    pub fn close_position_id(&self) -> Option<&str> {
        crate::data::meta_str(&self.metadata, "close_position_id")
    }
}

/// One execution fill. Append-only.
///
/// `position_id` links broker-side and OMS-side position state: open
/// fills carry the freshly-minted id, close fills the id being reduced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: String,
    pub broker_fill_id: Option<String>,
    pub symbol: String,
    pub broker: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
    pub ts: DateTime<Utc>,
    pub is_partial: bool,
    pub is_paper: bool,
    #[serde(default)]
    pub position_id: Option<String>,
}

/// Open or closed position owned by the OMS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub symbol: String,
    pub broker: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub trailing_stop_price: Option<f64>,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub realized_pnl: Option<f64>,
    pub commission_total: f64,
    pub signal_id: String,
    pub strategy_id: String,
    pub asset_class: AssetClass,
    pub is_paper: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Position {
    pub fn contract_size(&self) -> f64 {
        meta_f64(&self.metadata, "contract_size", 1.0)
    }

    pub fn pip_size(&self) -> f64 {
        meta_f64(&self.metadata, "pip_size", 0.0001)
    }

    /// PnL in multiples of the initial risk (entry-to-stop distance).
    pub fn r_multiple(&self) -> Option<f64> {
        let stop = self.stop_loss?;
        let risk_per_unit = (self.entry_price - stop).abs();
        if risk_per_unit <= 0.0 {
            return None;
        }
        let exit = self.close_price.unwrap_or(self.current_price);
        let price_move = match self.side {
            OrderSide::Buy => exit - self.entry_price,
            OrderSide::Sell => self.entry_price - exit,
        };
        Some(price_move / risk_per_unit)
    }
}

/// Trading account snapshot. Equity and free margin are derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub broker: String,
    pub balance: f64,
    pub equity: f64,
    pub margin_used: f64,
    pub margin_free: f64,
    pub currency: String,
    pub leverage: f64,
    pub unrealized_pnl: f64,
    pub is_paper: bool,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        account_id: &str,
        broker: &str,
        balance: f64,
        currency: &str,
        leverage: f64,
        is_paper: bool,
        ts: DateTime<Utc>,
    ) -> Self {
        let mut account = Account {
            account_id: account_id.to_string(),
            broker: broker.to_string(),
            balance,
            equity: balance,
            margin_used: 0.0,
            margin_free: balance,
            currency: currency.to_string(),
            leverage,
            unrealized_pnl: 0.0,
            is_paper,
            updated_at: ts,
        };
        account.refresh_derived();
        account
    }

    /// Recompute equity and free margin from balance and unrealized PnL.
    pub fn refresh_derived(&mut self) {
        self.equity = self.balance + self.unrealized_pnl;
        self.margin_free = (self.equity - self.margin_used).max(0.0);
    }
}
