use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use tokio::sync::Mutex;

use crate::core::events::{Event, OrderCancelEvent, OrderSubmitEvent};
use crate::core::{EventBus, IdGen};
use crate::data::{AssetClass, AssetInfo};
use crate::error::{Error, Result};
use crate::risk::{OrderSide, OrderType, RiskCheck, RiskManager};
use crate::signals::{Signal, SignalDirection};

use super::adapter::BrokerAdapter;
use super::idempotency::IdempotencyManager;
use super::reconciler::{Reconciler, ReconciliationReport};
use super::retry::RetryHandler;
use super::{Account, Fill, Order, OrderStatus, Position, PositionStatus};

struct OmsState {
    orders: BTreeMap<String, Order>,
    by_broker_id: BTreeMap<String, String>,
    positions: BTreeMap<String, Position>,
    history: Vec<String>,
}

/// Single writer of order and position state.
///
/// All mutations (registration, fill application, persistence) happen
/// under one internal mutex; every transition lands in the durable OMS
/// log before the call returns.
pub struct OrderManager {
    adapter: Arc<dyn BrokerAdapter>,
    risk_manager: Arc<RiskManager>,
    idempotency: Arc<IdempotencyManager>,
    reconciler: Reconciler,
    retry: RetryHandler,
    bus: Arc<EventBus>,
    ids: Arc<IdGen>,
    run_id: String,
    db: Mutex<Connection>,
    state: Mutex<OmsState>,
    unexpected_fills: AtomicUsize,
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<dyn BrokerAdapter>,
        risk_manager: Arc<RiskManager>,
        idempotency: Arc<IdempotencyManager>,
        reconciler: Reconciler,
        retry: RetryHandler,
        bus: Arc<EventBus>,
        ids: Arc<IdGen>,
        run_id: &str,
        db_path: Option<&Path>,
    ) -> Result<Self> {
        let conn = match db_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                broker_order_id TEXT,
                status TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS fills (
                fill_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS positions (
                position_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                payload TEXT NOT NULL
            );",
        )?;
        Ok(OrderManager {
            adapter,
            risk_manager,
            idempotency,
            reconciler,
            retry,
            bus,
            ids,
            run_id: run_id.to_string(),
            db: Mutex::new(conn),
            state: Mutex::new(OmsState {
                orders: BTreeMap::new(),
                by_broker_id: BTreeMap::new(),
                positions: BTreeMap::new(),
                history: Vec::new(),
            }),
            unexpected_fills: AtomicUsize::new(0),
        })
    }

    pub fn adapter(&self) -> &Arc<dyn BrokerAdapter> {
        &self.adapter
    }

    pub async fn account(&self) -> Result<Account> {
        self.adapter.get_account().await
    }

    /// Submit an order derived from a signal and its risk check.
    ///
    /// Rejected checks produce an audit-only REJECTED order. Duplicate
    /// submissions (same client order id) return the existing order.
    pub async fn submit_from_signal(
        &self,
        signal: &Signal,
        risk_check: &RiskCheck,
        account: &Account,
    ) -> Result<Order> {
        if !risk_check.is_executable() {
            let mut rejected = self.build_order(signal, risk_check, account);
            rejected.status = OrderStatus::Rejected;
            rejected.reject_reason = Some(if risk_check.rejection_reasons.is_empty() {
                "risk_rejected".to_string()
            } else {
                risk_check.rejection_reasons.join(";")
            });
            self.register_order(rejected.clone()).await;
            self.persist_order(&rejected).await?;
            return Ok(rejected);
        }

        let client_order_id = IdempotencyManager::generate_client_order_id(signal);
        let mut order = self.build_order(signal, risk_check, account);
        order.client_order_id = client_order_id.clone();

        let (is_duplicate, existing) = self
            .idempotency
            .check_and_register(&client_order_id, &order)
            .await?;
        if is_duplicate {
            if let Some(existing) = existing {
                tracing::info!(
                    client_order_id = %client_order_id,
                    "duplicate submission, returning existing order"
                );
                return Ok(existing);
            }
        }

        self.register_order(order.clone()).await;
        self.persist_order(&order).await?;

        let submit_result = self
            .retry
            .run(|| {
                let order = order.clone();
                let adapter = self.adapter.clone();
                async move { adapter.submit_order(&order).await }
            })
            .await;
        let broker_order_id = match submit_result {
            Ok(id) => id,
            Err(err) => {
                let mut failed = order.clone();
                failed.status = OrderStatus::Rejected;
                failed.reject_reason = Some(err.to_string());
                self.register_order(failed.clone()).await;
                self.persist_order(&failed).await?;
                return Err(err);
            }
        };

        let mut submitted = order.clone();
        submitted.broker_order_id = Some(broker_order_id.clone());
        submitted.status = OrderStatus::Submitted;
        submitted.submitted_at = Some(signal.ts);
        self.register_order(submitted.clone()).await;
        self.persist_order(&submitted).await?;
        self.idempotency
            .mark_submitted(&client_order_id, &broker_order_id, &submitted)
            .await?;

        self.bus
            .publish(Event::OrderSubmit(OrderSubmitEvent {
                source: "execution.order_manager".into(),
                run_id: self.run_id.clone(),
                order_id: submitted.order_id.clone(),
                client_order_id: submitted.client_order_id.clone(),
                symbol: submitted.symbol.clone(),
                broker: submitted.broker.clone(),
                side: submitted.side.as_str().to_string(),
                order_type: submitted.order_type.as_str().to_string(),
                quantity: submitted.quantity,
                price: submitted.price,
                stop_loss: submitted.stop_loss,
                take_profit: submitted.take_profit,
                status: submitted.status.as_str().to_string(),
                is_paper: submitted.is_paper,
                metadata: submitted.metadata.clone(),
            }))
            .await;

        self.process_fills().await?;
        let latest = self
            .state
            .lock()
            .await
            .orders
            .get(&submitted.order_id)
            .cloned()
            .unwrap_or(submitted);
        Ok(latest)
    }

    /// Drain adapter fills and apply them to orders and positions.
    pub async fn process_fills(&self) -> Result<()> {
        let fills = self.adapter.drain_fills().await?;
        for fill in fills {
            self.apply_fill(fill).await?;
        }
        Ok(())
    }

    async fn apply_fill(&self, fill: Fill) -> Result<()> {
        let mut state = self.state.lock().await;

        let order_id = if state.orders.contains_key(&fill.order_id) {
            Some(fill.order_id.clone())
        } else {
            state.by_broker_id.get(&fill.order_id).cloned()
        };

        let mut filled_client_order_id = None;
        if let Some(order_id) = order_id {
            let order = state.orders.get(&order_id).cloned();
            if let Some(order) = order {
                let total_qty = order.filled_quantity + fill.quantity;
                let weighted = (order.average_fill_price.unwrap_or(0.0) * order.filled_quantity
                    + fill.price * fill.quantity)
                    / total_qty.max(1e-12);
                let mut updated = order;
                updated.filled_quantity = total_qty;
                updated.average_fill_price = Some(weighted);
                updated.commission += fill.commission;
                updated.filled_at = Some(fill.ts);
                updated.status = if total_qty + 1e-12 < updated.quantity {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::Filled
                };
                if updated.status == OrderStatus::Filled {
                    filled_client_order_id = Some(updated.client_order_id.clone());
                }
                state.orders.insert(updated.order_id.clone(), updated.clone());
                self.persist_order(&updated).await?;
            }
        }
        self.persist_fill(&fill).await?;

        match fill.position_id.clone() {
            Some(position_id) => {
                if state.positions.contains_key(&position_id) {
                    self.apply_close_fill(&mut state, &position_id, &fill).await?;
                } else {
                    self.apply_open_fill(&mut state, &position_id, &fill).await?;
                }
            }
            None => {
                self.unexpected_fills.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    fill_id = %fill.fill_id,
                    order_id = %fill.order_id,
                    "fill without position linkage recorded as reconciliation divergence"
                );
            }
        }

        if let Some(client_order_id) = filled_client_order_id {
            self.idempotency.mark_filled(&client_order_id, &fill).await?;
        }
        Ok(())
    }

    async fn apply_open_fill(
        &self,
        state: &mut OmsState,
        position_id: &str,
        fill: &Fill,
    ) -> Result<()> {
        let source_order = state
            .orders
            .get(&fill.order_id)
            .or_else(|| {
                state
                    .by_broker_id
                    .get(&fill.order_id)
                    .and_then(|id| state.orders.get(id))
            })
            .cloned();
        let Some(order) = source_order else {
            // A broker-side open we never initiated.
            self.unexpected_fills.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                fill_id = %fill.fill_id,
                "open fill for unknown order recorded as reconciliation divergence"
            );
            return Ok(());
        };
        let asset_class = crate::data::meta_str(&order.metadata, "asset_class")
            .map_or(AssetClass::Unknown, AssetClass::parse);
        let mut metadata = order.metadata.clone();
        metadata.insert("entry_quantity".into(), json!(fill.quantity));
        metadata.insert("entry_commission".into(), json!(fill.commission));
        let position = Position {
            position_id: position_id.to_string(),
            symbol: order.symbol.clone(),
            broker: order.broker.clone(),
            side: order.side,
            quantity: fill.quantity,
            entry_price: fill.price,
            current_price: fill.price,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            trailing_stop_price: None,
            status: PositionStatus::Open,
            opened_at: fill.ts,
            closed_at: None,
            close_price: None,
            unrealized_pnl: 0.0,
            realized_pnl: None,
            commission_total: fill.commission,
            signal_id: order.signal_id.clone(),
            strategy_id: crate::data::meta_str(&order.metadata, "strategy_id")
                .unwrap_or("signal_ensemble")
                .to_string(),
            asset_class,
            is_paper: order.is_paper,
            metadata,
        };
        state.positions.insert(position_id.to_string(), position.clone());
        self.persist_position(&position).await
    }

    async fn apply_close_fill(
        &self,
        state: &mut OmsState,
        position_id: &str,
        fill: &Fill,
    ) -> Result<()> {
        let Some(position) = state.positions.get_mut(position_id) else {
            return Ok(());
        };
        let close_qty = fill.quantity.min(position.quantity);
        let contract = position.contract_size();
        let pnl_per_unit = match position.side {
            OrderSide::Buy => fill.price - position.entry_price,
            OrderSide::Sell => position.entry_price - fill.price,
        };
        let realized = pnl_per_unit * close_qty * contract - fill.commission;
        position.quantity -= close_qty;
        position.commission_total += fill.commission;
        position.realized_pnl = Some(position.realized_pnl.unwrap_or(0.0) + realized);
        if position.quantity <= 1e-12 {
            position.quantity = 0.0;
            position.status = PositionStatus::Closed;
            position.closed_at = Some(fill.ts);
            position.close_price = Some(fill.price);
        }
        let snapshot = position.clone();
        self.persist_position(&snapshot).await?;
        self.risk_manager
            .update_on_close(&snapshot, realized, fill.ts)
            .await;
        Ok(())
    }

    pub async fn cancel(&self, order_id: &str, reason: &str) -> Result<Order> {
        let order = {
            let state = self.state.lock().await;
            state
                .orders
                .get(order_id)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("unknown order: {order_id}")))?
        };
        if let Some(broker_order_id) = order.broker_order_id.as_deref() {
            self.adapter.cancel_order(broker_order_id).await?;
        }
        let mut cancelled = order;
        cancelled.status = OrderStatus::Cancelled;
        self.register_order(cancelled.clone()).await;
        self.persist_order(&cancelled).await?;
        self.bus
            .publish(Event::OrderCancel(OrderCancelEvent {
                source: "execution.order_manager".into(),
                run_id: self.run_id.clone(),
                order_id: cancelled.order_id.clone(),
                symbol: cancelled.symbol.clone(),
                broker: cancelled.broker.clone(),
                reason: reason.to_string(),
            }))
            .await;
        Ok(cancelled)
    }

    pub async fn modify(
        &self,
        order_id: &str,
        new_sl: Option<f64>,
        new_tp: Option<f64>,
        new_trailing: Option<f64>,
    ) -> Result<Order> {
        let order = {
            let state = self.state.lock().await;
            state
                .orders
                .get(order_id)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("unknown order: {order_id}")))?
        };
        if let Some(broker_order_id) = order.broker_order_id.as_deref() {
            self.adapter
                .modify_order(broker_order_id, new_sl, new_tp)
                .await?;
        }
        let mut updated = order;
        updated.stop_loss = new_sl;
        updated.take_profit = new_tp;
        updated.trailing_stop = new_trailing;
        self.register_order(updated.clone()).await;
        self.persist_order(&updated).await?;
        Ok(updated)
    }

    /// Update a position's stops (trailing moves).
    pub async fn update_position_stops(
        &self,
        position_id: &str,
        new_sl: Option<f64>,
        new_tp: Option<f64>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(position) = state.positions.get_mut(position_id) {
            if new_sl.is_some() {
                position.stop_loss = new_sl;
                position.trailing_stop_price = new_sl;
            }
            if new_tp.is_some() {
                position.take_profit = new_tp;
            }
            let snapshot = position.clone();
            drop(state);
            self.persist_position(&snapshot).await?;
        }
        Ok(())
    }

    pub async fn close_position(
        &self,
        position_id: &str,
        reason: &str,
        partial_pct: f64,
    ) -> Result<()> {
        let position = {
            let state = self.state.lock().await;
            state
                .positions
                .get(position_id)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("unknown position: {position_id}")))?
        };
        tracing::info!(position_id, reason, partial_pct, "closing position");
        self.adapter.close_position(&position, partial_pct).await?;
        self.process_fills().await
    }

    pub async fn close_all_positions(&self, reason: &str) -> Result<usize> {
        let open: Vec<String> = self
            .open_positions()
            .await
            .into_iter()
            .map(|position| position.position_id)
            .collect();
        let count = open.len();
        for position_id in open {
            self.close_position(&position_id, reason, 1.0).await?;
        }
        Ok(count)
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        self.state
            .lock()
            .await
            .positions
            .values()
            .filter(|position| position.status != PositionStatus::Closed)
            .cloned()
            .collect()
    }

    pub async fn all_positions(&self) -> Vec<Position> {
        self.state.lock().await.positions.values().cloned().collect()
    }

    pub async fn order_history(&self, limit: usize) -> Vec<Order> {
        let state = self.state.lock().await;
        let skip = state.history.len().saturating_sub(limit);
        state
            .history
            .iter()
            .skip(skip)
            .filter_map(|order_id| state.orders.get(order_id).cloned())
            .collect()
    }

    pub fn unexpected_fill_count(&self) -> usize {
        self.unexpected_fills.load(Ordering::SeqCst)
    }

    /// Reconcile against the broker and attempt advisory auto-fixes.
    /// Critical divergences escalate to the kill switch.
    pub async fn sync_with_broker(
        &self,
        ts: DateTime<Utc>,
    ) -> Result<(ReconciliationReport, Vec<String>)> {
        let (positions, orders) = {
            let state = self.state.lock().await;
            (
                state
                    .positions
                    .values()
                    .filter(|position| position.status != PositionStatus::Closed)
                    .cloned()
                    .collect::<Vec<_>>(),
                state.orders.values().cloned().collect::<Vec<_>>(),
            )
        };
        let report = self
            .reconciler
            .reconcile(self.adapter.as_ref(), &positions, &orders, ts)
            .await?;
        let fixes = self.reconciler.auto_fix(&report);
        if report.is_critical() {
            self.risk_manager
                .kill_switch()
                .activate(&["reconciliation_critical".to_string()], ts)
                .await;
        }
        Ok((report, fixes))
    }

    fn build_order(&self, signal: &Signal, risk_check: &RiskCheck, account: &Account) -> Order {
        let side = risk_check.approved_side.unwrap_or(match signal.direction {
            SignalDirection::Sell => OrderSide::Sell,
            _ => OrderSide::Buy,
        });
        let asset_class = crate::data::meta_str(&signal.metadata, "asset_class")
            .map_or(AssetClass::Unknown, AssetClass::parse);
        let asset_info = AssetInfo::defaults_for(&signal.symbol, &signal.broker, asset_class);

        let mut metadata = signal.metadata.clone();
        metadata.insert("strategy_id".into(), json!(signal.strategy_id));
        metadata.insert("asset_class".into(), json!(asset_class.as_str()));
        metadata.insert("contract_size".into(), json!(asset_info.contract_size));
        metadata.insert("pip_size".into(), json!(asset_info.pip_size));
        metadata.insert("account_equity".into(), json!(account.equity));
        metadata.insert("timeframe".into(), json!(signal.timeframe.as_str()));

        Order {
            order_id: self.ids.next("ord"),
            broker_order_id: None,
            client_order_id: format!("rejected-{}", &signal.signal_id),
            signal_id: signal.signal_id.clone(),
            risk_check_id: risk_check.check_id.clone(),
            symbol: signal.symbol.clone(),
            broker: signal.broker.clone(),
            side,
            order_type: OrderType::Market,
            quantity: risk_check.approved_size.max(1e-7),
            price: signal.entry_price,
            stop_price: None,
            stop_loss: risk_check.suggested_sl,
            take_profit: risk_check.suggested_tp,
            trailing_stop: risk_check.suggested_trailing,
            time_in_force: "GTC".to_string(),
            status: OrderStatus::Pending,
            created_at: signal.ts,
            submitted_at: None,
            filled_at: None,
            cancelled_at: None,
            filled_quantity: 0.0,
            average_fill_price: None,
            commission: 0.0,
            slippage: 0.0,
            reject_reason: None,
            retry_count: 0,
            is_paper: self.adapter.is_paper(),
            metadata,
        }
    }

    async fn register_order(&self, order: Order) {
        let mut state = self.state.lock().await;
        if let Some(broker_order_id) = order.broker_order_id.clone() {
            state.by_broker_id.insert(broker_order_id, order.order_id.clone());
        }
        state.history.push(order.order_id.clone());
        state.orders.insert(order.order_id.clone(), order);
    }

    async fn persist_order(&self, order: &Order) -> Result<()> {
        let payload = serde_json::to_string(order)?;
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO orders (order_id, broker_order_id, status, payload)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                order.order_id,
                order.broker_order_id,
                order.status.as_str(),
                payload
            ],
        )?;
        Ok(())
    }

    async fn persist_fill(&self, fill: &Fill) -> Result<()> {
        let payload = serde_json::to_string(fill)?;
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO fills (fill_id, order_id, payload) VALUES (?1, ?2, ?3)",
            rusqlite::params![fill.fill_id, fill.order_id, payload],
        )?;
        Ok(())
    }

    async fn persist_position(&self, position: &Position) -> Result<()> {
        let payload = serde_json::to_string(position)?;
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO positions (position_id, status, payload) VALUES (?1, ?2, ?3)",
            rusqlite::params![position.position_id, position.status.as_str(), payload],
        )?;
        Ok(())
    }
}
