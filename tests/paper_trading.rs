mod common;

use std::sync::Arc;

use atp::core::{EventBus, EventKind, IdGen};
use atp::execution::{
    FillMode, FillSimulatorConfig, IdempotencyManager, OrderManager, OrderStatus, PaperAdapter,
    Reconciler, RetryHandler,
};
use atp::risk::{OrderSide, RiskCheck, RiskCheckStatus};

use common::{account_with_equity, buy_signal, day, risk_manager};

fn paper_stack() -> (Arc<OrderManager>, Arc<PaperAdapter>, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new());
    let ids = Arc::new(IdGen::new("e2e"));
    let adapter = Arc::new(PaperAdapter::new(
        10_000.0,
        "USD",
        30.0,
        FillSimulatorConfig {
            fill_mode: FillMode::Instant,
            partial_fill_probability: 0.0,
            ..FillSimulatorConfig::default()
        },
        42,
        bus.clone(),
        ids.clone(),
        "e2e",
        day(1),
    ));
    let (risk, _risk_bus) = risk_manager("e2e");
    let oms = Arc::new(
        OrderManager::new(
            adapter.clone(),
            risk,
            Arc::new(IdempotencyManager::in_memory().unwrap()),
            Reconciler::new(Default::default()),
            RetryHandler::new(
                3,
                std::time::Duration::from_millis(1),
                std::time::Duration::from_millis(4),
                42,
            ),
            bus.clone(),
            ids,
            "e2e",
            None,
        )
        .unwrap(),
    );
    (oms, adapter, bus)
}

fn approved(signal: &atp::signals::Signal) -> RiskCheck {
    RiskCheck {
        check_id: "rc-e2e".into(),
        signal_id: signal.signal_id.clone(),
        symbol: signal.symbol.clone(),
        broker: signal.broker.clone(),
        ts: signal.ts,
        status: RiskCheckStatus::Approved,
        approved_size: 0.5,
        approved_side: Some(OrderSide::Buy),
        suggested_sl: Some(1.0950),
        suggested_tp: Some(1.1075),
        suggested_trailing: Some(0.0010),
        risk_amount: 100.0,
        risk_percent: 1.0,
        reward_risk_ratio: 1.5,
        rejection_reasons: vec![],
        warnings: vec![],
        portfolio_snapshot: Default::default(),
    }
}

#[tokio::test]
async fn submitting_the_same_signal_twice_is_idempotent() {
    let (oms, _adapter, bus) = paper_stack();
    let mut submit_events = bus.subscribe(EventKind::OrderSubmit).await;

    let signal = buy_signal("s-1", "EURUSD", day(1));
    let check = approved(&signal);
    let account = account_with_equity(10_000.0, 10_000.0, day(1));

    let first = oms.submit_from_signal(&signal, &check, &account).await.unwrap();
    assert!(matches!(
        first.status,
        OrderStatus::Submitted | OrderStatus::Filled
    ));
    let first_broker_id = first.broker_order_id.clone().unwrap();

    let second = oms.submit_from_signal(&signal, &check, &account).await.unwrap();
    assert_eq!(second.broker_order_id.as_ref().unwrap(), &first_broker_id);

    // Exactly one position and one submit event reached the bus.
    assert_eq!(oms.open_positions().await.len(), 1);
    let mut submits = 0;
    while submit_events.try_recv().is_ok() {
        submits += 1;
    }
    assert_eq!(submits, 1);
}

#[tokio::test]
async fn fill_events_are_published_for_paper_fills() {
    let (oms, _adapter, bus) = paper_stack();
    let mut fill_events = bus.subscribe(EventKind::OrderFill).await;

    let signal = buy_signal("s-2", "EURUSD", day(1));
    let check = approved(&signal);
    let account = account_with_equity(10_000.0, 10_000.0, day(1));
    oms.submit_from_signal(&signal, &check, &account).await.unwrap();

    assert!(fill_events.try_recv().is_ok(), "paper fill must publish ORDER_FILL");
}

#[tokio::test]
async fn reconciliation_is_divergence_free_after_round_trip() {
    let (oms, _adapter, _bus) = paper_stack();
    let signal = buy_signal("s-3", "EURUSD", day(1));
    let check = approved(&signal);
    let account = account_with_equity(10_000.0, 10_000.0, day(1));
    oms.submit_from_signal(&signal, &check, &account).await.unwrap();

    let position_id = oms.open_positions().await[0].position_id.clone();
    oms.close_position(&position_id, "flatten", 1.0).await.unwrap();

    let (report, fixes) = oms.sync_with_broker(day(2)).await.unwrap();
    assert!(report.phantom_positions.is_empty());
    assert!(report.ghost_positions.is_empty());
    assert!(report.missed_fills.is_empty());
    assert!(!fixes.contains(&"escalate_kill_switch".to_string()));
}
