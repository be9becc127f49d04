use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::data::Tick;
use crate::error::{Error, Result};

use super::{Account, Fill, Order, OrderStatus, Position};

/// Broker contract used by the order manager. Live adapters (MT5, CCXT,
/// …) are thin out-of-tree shims; in-tree implementations are the paper
/// adapter and this file's injectable mock.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn broker(&self) -> &str;
    fn is_paper(&self) -> bool;

    async fn get_account(&self) -> Result<Account>;
    async fn get_open_positions(&self) -> Result<Vec<Position>>;
    async fn list_orders(&self) -> Result<Vec<Order>>;

    /// Submit an order; returns the broker-assigned order id.
    async fn submit_order(&self, order: &Order) -> Result<String>;
    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool>;
    async fn modify_order(
        &self,
        broker_order_id: &str,
        new_sl: Option<f64>,
        new_tp: Option<f64>,
    ) -> Result<bool>;
    /// Close (part of) a position; returns the close order's broker id.
    async fn close_position(&self, position: &Position, partial_pct: f64) -> Result<String>;

    /// Update mark prices and trigger stops from an incoming tick.
    async fn process_tick(&self, tick: &Tick) -> Result<()>;

    /// Drain fills produced since the last call, in occurrence order.
    async fn drain_fills(&self) -> Result<Vec<Fill>>;

    /// Round-trip latency in milliseconds; feeds the kill-switch.
    async fn ping(&self) -> Result<f64>;
}

#[derive(Default)]
struct MockState {
    account: Option<Account>,
    positions: Vec<Position>,
    orders: Vec<Order>,
    pending_fills: Vec<Fill>,
    submitted: Vec<Order>,
}

/// Configurable in-memory adapter for tests and reconciliation drills.
pub struct MockBrokerAdapter {
    broker: String,
    state: Mutex<MockState>,
    fail_submits_remaining: AtomicUsize,
    submit_counter: AtomicUsize,
}

impl MockBrokerAdapter {
    pub fn new(broker: &str) -> Self {
        MockBrokerAdapter {
            broker: broker.to_string(),
            state: Mutex::new(MockState::default()),
            fail_submits_remaining: AtomicUsize::new(0),
            submit_counter: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` submissions with a transient error.
    pub fn fail_next_submits(&self, n: usize) {
        self.fail_submits_remaining.store(n, Ordering::SeqCst);
    }

    pub async fn set_account(&self, account: Account) {
        self.state.lock().await.account = Some(account);
    }

    pub async fn set_positions(&self, positions: Vec<Position>) {
        self.state.lock().await.positions = positions;
    }

    pub async fn set_orders(&self, orders: Vec<Order>) {
        self.state.lock().await.orders = orders;
    }

    pub async fn push_fill(&self, fill: Fill) {
        self.state.lock().await.pending_fills.push(fill);
    }

    pub async fn submitted_orders(&self) -> Vec<Order> {
        self.state.lock().await.submitted.clone()
    }
}

#[async_trait]
impl BrokerAdapter for MockBrokerAdapter {
    fn broker(&self) -> &str {
        &self.broker
    }

    fn is_paper(&self) -> bool {
        true
    }

    async fn get_account(&self) -> Result<Account> {
        self.state
            .lock()
            .await
            .account
            .clone()
            .ok_or_else(|| Error::AdapterUnavailable("mock account not configured".into()))
    }

    async fn get_open_positions(&self) -> Result<Vec<Position>> {
        Ok(self.state.lock().await.positions.clone())
    }

    async fn list_orders(&self) -> Result<Vec<Order>> {
        Ok(self.state.lock().await.orders.clone())
    }

    async fn submit_order(&self, order: &Order) -> Result<String> {
        let remaining = self.fail_submits_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_submits_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Transient("mock submit failure".into()));
        }
        let seq = self.submit_counter.fetch_add(1, Ordering::SeqCst);
        let broker_order_id = format!("mock-{}-{seq:04}", self.broker);
        let mut state = self.state.lock().await;
        let mut submitted = order.clone();
        submitted.broker_order_id = Some(broker_order_id.clone());
        submitted.status = OrderStatus::Submitted;
        state.submitted.push(submitted.clone());
        state.orders.push(submitted);
        Ok(broker_order_id)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        for order in &mut state.orders {
            if order.broker_order_id.as_deref() == Some(broker_order_id)
                && !matches!(
                    order.status,
                    OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
                )
            {
                order.status = OrderStatus::Cancelled;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn modify_order(
        &self,
        broker_order_id: &str,
        new_sl: Option<f64>,
        new_tp: Option<f64>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        for order in &mut state.orders {
            if order.broker_order_id.as_deref() == Some(broker_order_id) {
                order.stop_loss = new_sl;
                order.take_profit = new_tp;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn close_position(&self, position: &Position, _partial_pct: f64) -> Result<String> {
        let seq = self.submit_counter.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.positions.retain(|item| item.position_id != position.position_id);
        Ok(format!("mock-close-{seq:04}"))
    }

    async fn process_tick(&self, _tick: &Tick) -> Result<()> {
        Ok(())
    }

    async fn drain_fills(&self) -> Result<Vec<Fill>> {
        Ok(std::mem::take(&mut self.state.lock().await.pending_fills))
    }

    async fn ping(&self) -> Result<f64> {
        Ok(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Metadata;
    use crate::risk::{OrderSide, OrderType};
    use chrono::{TimeZone, Utc};

    fn order() -> Order {
        Order {
            order_id: "o1".into(),
            broker_order_id: None,
            client_order_id: "c1".into(),
            signal_id: "s1".into(),
            risk_check_id: "rc1".into(),
            symbol: "EURUSD".into(),
            broker: "mock".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: 0.1,
            price: Some(1.1),
            stop_price: None,
            stop_loss: None,
            take_profit: None,
            trailing_stop: None,
            time_in_force: "GTC".into(),
            status: OrderStatus::Pending,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
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
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn submit_assigns_sequential_ids() {
        let adapter = MockBrokerAdapter::new("mock");
        let a = adapter.submit_order(&order()).await.unwrap();
        let b = adapter.submit_order(&order()).await.unwrap();
        assert_eq!(a, "mock-mock-0000");
        assert_eq!(b, "mock-mock-0001");
        assert_eq!(adapter.submitted_orders().await.len(), 2);
    }

    #[tokio::test]
    async fn configured_failures_then_success() {
        let adapter = MockBrokerAdapter::new("mock");
        adapter.fail_next_submits(2);
        assert!(adapter.submit_order(&order()).await.is_err());
        assert!(adapter.submit_order(&order()).await.is_err());
        assert!(adapter.submit_order(&order()).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_only_live_orders() {
        let adapter = MockBrokerAdapter::new("mock");
        let broker_id = adapter.submit_order(&order()).await.unwrap();
        assert!(adapter.cancel_order(&broker_id).await.unwrap());
        assert!(!adapter.cancel_order(&broker_id).await.unwrap());
        assert!(!adapter.cancel_order("missing").await.unwrap());
    }
}
