use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use crate::core::events::{Event, OrderFillEvent};
use crate::core::{EventBus, IdGen};
use crate::data::{AssetClass, Tick};
use crate::error::{Error, Result};
use crate::risk::{OrderSide, OrderType};

use super::adapter::BrokerAdapter;
use super::fill_simulator::{FillSimulator, FillSimulatorConfig};
use super::{Account, Fill, Order, OrderStatus, Position, PositionStatus};

struct PaperState {
    orders: BTreeMap<String, Order>,
    positions: BTreeMap<String, Position>,
    latest_ticks: BTreeMap<String, Tick>,
    pending_fills: VecDeque<Fill>,
    account: Account,
    last_event_ts: DateTime<Utc>,
}

/// In-memory paper broker. Mutations are serialized behind one mutex so a
/// tick processed while a submit is in flight sees a consistent snapshot.
pub struct PaperAdapter {
    run_id: String,
    ids: Arc<IdGen>,
    bus: Arc<EventBus>,
    simulator: FillSimulator,
    config: FillSimulatorConfig,
    state: Mutex<PaperState>,
}

impl PaperAdapter {
    pub fn new(
        initial_balance: f64,
        currency: &str,
        leverage: f64,
        config: FillSimulatorConfig,
        seed: u64,
        bus: Arc<EventBus>,
        ids: Arc<IdGen>,
        run_id: &str,
        start_ts: DateTime<Utc>,
    ) -> Self {
        let account = Account::new(
            &format!("paper-{run_id}"),
            "paper",
            initial_balance,
            currency,
            leverage,
            true,
            start_ts,
        );
        PaperAdapter {
            run_id: run_id.to_string(),
            ids,
            bus,
            simulator: FillSimulator::new(seed),
            config,
            state: Mutex::new(PaperState {
                orders: BTreeMap::new(),
                positions: BTreeMap::new(),
                latest_ticks: BTreeMap::new(),
                pending_fills: VecDeque::new(),
                account,
                last_event_ts: start_ts,
            }),
        }
    }

    async fn apply_fill(&self, state: &mut PaperState, broker_order_id: &str, mut fill: Fill) {
        let Some(order) = state.orders.get(broker_order_id).cloned() else {
            return;
        };
        let total_qty = order.filled_quantity + fill.quantity;
        let weighted = (order.average_fill_price.unwrap_or(0.0) * order.filled_quantity
            + fill.price * fill.quantity)
            / total_qty.max(1e-12);
        let status = if fill.is_partial && total_qty < order.quantity {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Filled
        };
        let mut updated = order.clone();
        updated.filled_quantity = total_qty;
        updated.average_fill_price = Some(weighted);
        updated.filled_at = Some(fill.ts);
        updated.status = status;
        updated.commission += fill.commission;
        state.orders.insert(broker_order_id.to_string(), updated.clone());

        match updated.close_position_id().map(str::to_string) {
            Some(position_id) => {
                fill.position_id = Some(position_id.clone());
                self.apply_close_fill(state, &position_id, &fill);
            }
            None => {
                let position_id = self.apply_open_fill(state, &updated, &fill);
                fill.position_id = Some(position_id);
            }
        }
        self.refresh_account(state, fill.ts);

        self.bus
            .publish(Event::OrderFill(OrderFillEvent {
                source: "execution.paper_adapter".into(),
                run_id: self.run_id.clone(),
                order_id: updated.order_id.clone(),
                symbol: updated.symbol.clone(),
                broker: updated.broker.clone(),
                side: updated.side.as_str().to_string(),
                fill_price: fill.price,
                fill_quantity: fill.quantity,
                commission: fill.commission,
                is_partial: fill.is_partial,
                ts: fill.ts,
            }))
            .await;
        state.pending_fills.push_back(fill);
    }

    fn apply_open_fill(&self, state: &mut PaperState, order: &Order, fill: &Fill) -> String {
        let position_id = self.ids.next("pos");
        let asset_class = crate::data::meta_str(&order.metadata, "asset_class")
            .map_or(AssetClass::Unknown, AssetClass::parse);
        let position = Position {
            position_id: position_id.clone(),
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
            is_paper: true,
            metadata: order.metadata.clone(),
        };
        state.positions.insert(position_id.clone(), position);
        state.account.balance -= fill.commission;
        position_id
    }

    fn apply_close_fill(&self, state: &mut PaperState, position_id: &str, fill: &Fill) {
        let Some(position) = state.positions.get_mut(position_id) else {
            return;
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
            position.unrealized_pnl = 0.0;
        }
        state.account.balance += realized;
    }

    fn refresh_account(&self, state: &mut PaperState, ts: DateTime<Utc>) {
        let unrealized: f64 = state
            .positions
            .values()
            .filter(|position| position.status == PositionStatus::Open)
            .map(|position| position.unrealized_pnl)
            .sum();
        state.account.unrealized_pnl = unrealized;
        state.account.updated_at = ts;
        state.last_event_ts = ts;
        state.account.refresh_derived();
    }

    fn build_close_order(&self, position: &Position, partial_pct: f64, reason: &str) -> Order {
        let close_qty = (partial_pct.clamp(0.0, 1.0) * position.quantity).max(1e-7);
        let mut metadata = position.metadata.clone();
        metadata.insert("close_position_id".into(), json!(position.position_id));
        metadata.insert("close_reason".into(), json!(reason));
        Order {
            order_id: self.ids.next("ord"),
            broker_order_id: None,
            client_order_id: self.ids.next("cls"),
            signal_id: position.signal_id.clone(),
            risk_check_id: "close_position".into(),
            symbol: position.symbol.clone(),
            broker: position.broker.clone(),
            side: position.side.opposite(),
            order_type: OrderType::Market,
            quantity: close_qty,
            price: Some(position.current_price),
            stop_price: None,
            stop_loss: None,
            take_profit: None,
            trailing_stop: None,
            time_in_force: "IOC".into(),
            status: OrderStatus::Pending,
            created_at: position.opened_at,
            submitted_at: None,
            filled_at: None,
            cancelled_at: None,
            filled_quantity: 0.0,
            average_fill_price: None,
            commission: 0.0,
            slippage: 0.0,
            reject_reason: None,
            retry_count: 0,
            is_paper: true,
            metadata,
        }
    }

    /// All positions, including closed ones (round-trip extraction).
    pub async fn all_positions(&self) -> Vec<Position> {
        self.state.lock().await.positions.values().cloned().collect()
    }

    /// Apply a trailing-stop or target move to a broker-side position.
    pub async fn update_position_stops(
        &self,
        position_id: &str,
        new_sl: Option<f64>,
        new_tp: Option<f64>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(position) = state.positions.get_mut(position_id) {
            if new_sl.is_some() {
                position.stop_loss = new_sl;
                position.trailing_stop_price = new_sl;
            }
            if new_tp.is_some() {
                position.take_profit = new_tp;
            }
        }
    }

    pub async fn latest_tick(&self, symbol: &str) -> Option<Tick> {
        self.state.lock().await.latest_ticks.get(symbol).cloned()
    }
}

#[async_trait]
impl BrokerAdapter for PaperAdapter {
    fn broker(&self) -> &str {
        "paper"
    }

    fn is_paper(&self) -> bool {
        true
    }

    async fn get_account(&self) -> Result<Account> {
        Ok(self.state.lock().await.account.clone())
    }

    async fn get_open_positions(&self) -> Result<Vec<Position>> {
        Ok(self
            .state
            .lock()
            .await
            .positions
            .values()
            .filter(|position| position.status != PositionStatus::Closed)
            .cloned()
            .collect())
    }

    async fn list_orders(&self) -> Result<Vec<Order>> {
        Ok(self.state.lock().await.orders.values().cloned().collect())
    }

    async fn submit_order(&self, order: &Order) -> Result<String> {
        let mut state = self.state.lock().await;
        let broker_order_id = self.ids.next("po");

        let tick = match state.latest_ticks.get(&order.symbol) {
            Some(tick) => tick.clone(),
            None => {
                // Synthesize a flat quote from the order price so market
                // orders can fill before any tick arrives.
                let base = order.price.unwrap_or(1.0);
                let tick = Tick {
                    symbol: order.symbol.clone(),
                    broker: order.broker.clone(),
                    ts: order.created_at,
                    bid: base,
                    ask: base,
                    last: Some(base),
                    volume: Some(0.0),
                    spread: Some(0.0),
                    asset_class: crate::data::meta_str(&order.metadata, "asset_class")
                        .map_or(AssetClass::Unknown, AssetClass::parse),
                    source: "paper_adapter".into(),
                }
                .validated()
                .map_err(|err| Error::AdapterUnavailable(err.to_string()))?;
                state.latest_ticks.insert(order.symbol.clone(), tick.clone());
                tick
            }
        };

        let mut submitted = order.clone();
        submitted.broker_order_id = Some(broker_order_id.clone());
        submitted.status = OrderStatus::Submitted;
        submitted.submitted_at = Some(tick.ts);
        submitted.is_paper = true;
        state.orders.insert(broker_order_id.clone(), submitted.clone());

        if let Some(fill) = self
            .simulator
            .simulate_fill(&submitted, &tick, &self.config, &self.ids)
            .await
        {
            self.apply_fill(&mut state, &broker_order_id, fill).await;
        }
        Ok(broker_order_id)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let ts = state.last_event_ts;
        let Some(order) = state.orders.get_mut(broker_order_id) else {
            return Ok(false);
        };
        if matches!(
            order.status,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        ) {
            return Ok(false);
        }
        order.status = OrderStatus::Cancelled;
        order.cancelled_at = Some(ts);
        Ok(true)
    }

    async fn modify_order(
        &self,
        broker_order_id: &str,
        new_sl: Option<f64>,
        new_tp: Option<f64>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(broker_order_id) {
            Some(order) => {
                order.stop_loss = new_sl;
                order.take_profit = new_tp;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close_position(&self, position: &Position, partial_pct: f64) -> Result<String> {
        let close_order = {
            let state = self.state.lock().await;
            let live = state.positions.get(&position.position_id).ok_or_else(|| {
                Error::AdapterUnavailable(format!(
                    "unknown paper position: {}",
                    position.position_id
                ))
            })?;
            self.build_close_order(live, partial_pct, "manual_close")
        };
        self.submit_order(&close_order).await
    }

    async fn process_tick(&self, tick: &Tick) -> Result<()> {
        let to_close: Vec<Position> = {
            let mut state = self.state.lock().await;
            state
                .latest_ticks
                .insert(tick.symbol.clone(), tick.clone());

            let mut triggered = Vec::new();
            for position in state.positions.values_mut() {
                if position.status != PositionStatus::Open || position.symbol != tick.symbol {
                    continue;
                }
                let mark = match position.side {
                    OrderSide::Buy => tick.bid,
                    OrderSide::Sell => tick.ask,
                };
                let contract = position.contract_size();
                let pnl_per_unit = match position.side {
                    OrderSide::Buy => mark - position.entry_price,
                    OrderSide::Sell => position.entry_price - mark,
                };
                position.current_price = mark;
                position.unrealized_pnl =
                    pnl_per_unit * position.quantity * contract - position.commission_total;
            }
            for position in state.positions.values() {
                if position.status != PositionStatus::Open || position.symbol != tick.symbol {
                    continue;
                }
                if self.simulator.should_trigger_sl(position, tick)
                    || self.simulator.should_trigger_tp(position, tick)
                {
                    triggered.push(position.clone());
                }
            }
            self.refresh_account(&mut state, tick.ts);
            triggered
        };

        for position in to_close {
            let reason = if self.simulator.should_trigger_sl(&position, tick) {
                "stop_loss"
            } else {
                "take_profit"
            };
            let close_order = self.build_close_order(&position, 1.0, reason);
            self.submit_order(&close_order).await?;
        }
        Ok(())
    }

    async fn drain_fills(&self) -> Result<Vec<Fill>> {
        let mut state = self.state.lock().await;
        Ok(state.pending_fills.drain(..).collect())
    }

    async fn ping(&self) -> Result<f64> {
        Ok(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Metadata;
    use crate::execution::FillMode;
    use chrono::TimeZone;

    fn adapter(seed: u64) -> PaperAdapter {
        let config = FillSimulatorConfig {
            fill_mode: FillMode::Instant,
            partial_fill_probability: 0.0,
            ..FillSimulatorConfig::default()
        };
        PaperAdapter::new(
            10_000.0,
            "USD",
            30.0,
            config,
            seed,
            Arc::new(EventBus::new()),
            Arc::new(IdGen::new("test")),
            "test",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn market_order(quantity: f64, stop_loss: Option<f64>, take_profit: Option<f64>) -> Order {
        let mut metadata = Metadata::new();
        metadata.insert("asset_class".into(), json!("forex"));
        metadata.insert("contract_size".into(), json!(1.0));
        metadata.insert("pip_size".into(), json!(0.0001));
        Order {
            order_id: "ord-ext-1".into(),
            broker_order_id: None,
            client_order_id: "cid-1".into(),
            signal_id: "sig-1".into(),
            risk_check_id: "rc-1".into(),
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity,
            price: Some(1.1000),
            stop_price: None,
            stop_loss,
            take_profit,
            trailing_stop: None,
            time_in_force: "GTC".into(),
            status: OrderStatus::Pending,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
            submitted_at: None,
            filled_at: None,
            cancelled_at: None,
            filled_quantity: 0.0,
            average_fill_price: None,
            commission: 0.0,
            slippage: 0.0,
            reject_reason: None,
            retry_count: 0,
            is_paper: true,
            metadata,
        }
    }

    fn tick_at(bid: f64, ask: f64, minute: u32) -> Tick {
        Tick {
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            ts: Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0).unwrap(),
            bid,
            ask,
            last: None,
            volume: None,
            spread: None,
            asset_class: AssetClass::Forex,
            source: "test".into(),
        }
        .validated()
        .unwrap()
    }

    #[tokio::test]
    async fn market_submit_fills_and_opens_position() {
        let adapter = adapter(42);
        adapter.process_tick(&tick_at(1.0999, 1.1001, 0)).await.unwrap();
        let broker_id = adapter.submit_order(&market_order(1.0, None, None)).await.unwrap();
        assert!(broker_id.starts_with("po-"));

        let fills = adapter.drain_fills().await.unwrap();
        assert_eq!(fills.len(), 1);
        assert!(fills[0].position_id.is_some());

        let positions = adapter.get_open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 1.0);
    }

    #[tokio::test]
    async fn stop_loss_tick_closes_position() {
        let adapter = adapter(42);
        adapter.process_tick(&tick_at(1.0999, 1.1001, 0)).await.unwrap();
        adapter
            .submit_order(&market_order(1.0, Some(1.0950), None))
            .await
            .unwrap();
        adapter.drain_fills().await.unwrap();

        // Price trades through the stop.
        adapter.process_tick(&tick_at(1.0940, 1.0942, 5)).await.unwrap();
        let fills = adapter.drain_fills().await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].side, OrderSide::Sell);

        assert!(adapter.get_open_positions().await.unwrap().is_empty());
        let all = adapter.all_positions().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, PositionStatus::Closed);
        assert!(all[0].realized_pnl.unwrap() < 0.0);
    }

    #[tokio::test]
    async fn losing_close_reduces_balance() {
        let adapter = adapter(42);
        adapter.process_tick(&tick_at(1.0999, 1.1001, 0)).await.unwrap();
        adapter
            .submit_order(&market_order(100.0, Some(1.0950), None))
            .await
            .unwrap();
        adapter.process_tick(&tick_at(1.0940, 1.0942, 5)).await.unwrap();
        let account = adapter.get_account().await.unwrap();
        assert!(account.balance < 10_000.0);
        assert_eq!(account.equity, account.balance + account.unrealized_pnl);
    }

    #[tokio::test]
    async fn unrealized_pnl_marks_to_tick() {
        let adapter = adapter(42);
        adapter.process_tick(&tick_at(1.0999, 1.1001, 0)).await.unwrap();
        adapter.submit_order(&market_order(100.0, None, None)).await.unwrap();
        adapter.process_tick(&tick_at(1.1101, 1.1103, 5)).await.unwrap();
        let positions = adapter.get_open_positions().await.unwrap();
        assert!(positions[0].unrealized_pnl > 0.0);
        let account = adapter.get_account().await.unwrap();
        assert!(account.equity > account.balance);
    }

    #[tokio::test]
    async fn seeded_runs_replay_identically() {
        let mut balances = Vec::new();
        for _ in 0..2 {
            let adapter = adapter(7);
            adapter.process_tick(&tick_at(1.0999, 1.1001, 0)).await.unwrap();
            adapter
                .submit_order(&market_order(100.0, Some(1.0990), Some(1.1050)))
                .await
                .unwrap();
            adapter.process_tick(&tick_at(1.1051, 1.1053, 5)).await.unwrap();
            balances.push(adapter.get_account().await.unwrap().balance);
        }
        assert_eq!(balances[0], balances[1]);
    }
}
