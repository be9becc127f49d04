use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::meta_f64;
use crate::error::Result;

use super::adapter::BrokerAdapter;
use super::{Order, OrderStatus, Position};

/// Reconciliation thresholds. The reference implementation hardcoded 1%
/// for both; they are explicit and configurable here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub price_deviation_pct: f64,
    pub equity_mismatch_critical_pct: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            price_deviation_pct: 1.0,
            equity_mismatch_critical_pct: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionDivergence {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissedFill {
    pub order_id: String,
    pub broker_order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceDeviation {
    pub order_id: String,
    pub deviation_pct: f64,
}

/// Divergences between broker-side and internal OMS state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub ts: DateTime<Utc>,
    pub broker: String,
    /// Broker has them, we don't.
    pub phantom_positions: Vec<PositionDivergence>,
    /// We have them, broker doesn't.
    pub ghost_positions: Vec<PositionDivergence>,
    pub missed_fills: Vec<MissedFill>,
    pub price_deviations: Vec<PriceDeviation>,
    pub equity_mismatch_pct: Option<f64>,
    pub severity: String,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.phantom_positions.is_empty()
            && self.ghost_positions.is_empty()
            && self.missed_fills.is_empty()
            && self.price_deviations.is_empty()
            && self.equity_mismatch_pct.unwrap_or(0.0) <= 0.0
    }

    pub fn is_critical(&self) -> bool {
        self.severity == "critical"
    }
}

/// Compare internal OMS state against the broker's view.
pub struct Reconciler {
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Reconciler { config }
    }

    pub async fn reconcile(
        &self,
        adapter: &dyn BrokerAdapter,
        internal_positions: &[Position],
        internal_orders: &[Order],
        ts: DateTime<Utc>,
    ) -> Result<ReconciliationReport> {
        let broker_positions = adapter.get_open_positions().await?;
        let broker_orders = adapter.list_orders().await?;
        let broker_account = adapter.get_account().await?;

        let key_of = |position: &Position| (position.symbol.clone(), position.side.as_str());
        let internal_keys: Vec<_> = internal_positions.iter().map(key_of).collect();
        let broker_keys: Vec<_> = broker_positions.iter().map(key_of).collect();

        let phantom_positions: Vec<PositionDivergence> = broker_positions
            .iter()
            .filter(|position| !internal_keys.contains(&key_of(position)))
            .map(|position| PositionDivergence {
                symbol: position.symbol.clone(),
                side: position.side.as_str().to_string(),
                quantity: position.quantity,
            })
            .collect();
        let ghost_positions: Vec<PositionDivergence> = internal_positions
            .iter()
            .filter(|position| !broker_keys.contains(&key_of(position)))
            .map(|position| PositionDivergence {
                symbol: position.symbol.clone(),
                side: position.side.as_str().to_string(),
                quantity: position.quantity,
            })
            .collect();

        let mut missed_fills = Vec::new();
        for order in internal_orders {
            let Some(broker_order_id) = order.broker_order_id.as_deref() else {
                continue;
            };
            let broker_status = broker_orders
                .iter()
                .find(|item| item.broker_order_id.as_deref() == Some(broker_order_id))
                .map(|item| item.status);
            if broker_status == Some(OrderStatus::Filled)
                && !matches!(
                    order.status,
                    OrderStatus::Filled | OrderStatus::PartiallyFilled
                )
            {
                missed_fills.push(MissedFill {
                    order_id: order.order_id.clone(),
                    broker_order_id: broker_order_id.to_string(),
                });
            }
        }

        let mut price_deviations = Vec::new();
        for order in internal_orders {
            let Some(avg_fill) = order.average_fill_price else {
                continue;
            };
            let expected = order.price.unwrap_or(avg_fill);
            if expected <= 0.0 {
                continue;
            }
            let deviation = (avg_fill - expected).abs() / expected * 100.0;
            if deviation > self.config.price_deviation_pct {
                price_deviations.push(PriceDeviation {
                    order_id: order.order_id.clone(),
                    deviation_pct: deviation,
                });
            }
        }

        let internal_equity = extract_internal_equity(internal_orders);
        let equity_mismatch_pct = internal_equity.and_then(|equity| {
            (broker_account.equity > 0.0)
                .then(|| (equity - broker_account.equity).abs() / broker_account.equity * 100.0)
        });

        let has_divergence = !phantom_positions.is_empty()
            || !ghost_positions.is_empty()
            || !missed_fills.is_empty()
            || !price_deviations.is_empty();
        let severity = if equity_mismatch_pct.unwrap_or(0.0) > self.config.equity_mismatch_critical_pct
        {
            "critical"
        } else if has_divergence {
            "warning"
        } else {
            "ok"
        };

        Ok(ReconciliationReport {
            ts,
            broker: adapter.broker().to_string(),
            phantom_positions,
            ghost_positions,
            missed_fills,
            price_deviations,
            equity_mismatch_pct,
            severity: severity.to_string(),
        })
    }

    /// Advisory auto-fix actions; critical divergences escalate instead.
    pub fn auto_fix(&self, report: &ReconciliationReport) -> Vec<String> {
        let mut actions = Vec::new();
        if report.is_critical() {
            actions.push("escalate_kill_switch".to_string());
            return actions;
        }
        if !report.missed_fills.is_empty() {
            actions.push("replay_missed_fills".to_string());
        }
        if !report.ghost_positions.is_empty() {
            actions.push("mark_ghost_positions_closed".to_string());
        }
        if !report.phantom_positions.is_empty() {
            actions.push("register_phantom_positions".to_string());
        }
        actions
    }
}

fn extract_internal_equity(orders: &[Order]) -> Option<f64> {
    orders
        .iter()
        .rev()
        .map(|order| meta_f64(&order.metadata, "account_equity", 0.0))
        .find(|equity| *equity > 0.0)
}
