mod common;

use atp::data::{AssetClass, Metadata};
use atp::execution::{Position, PositionStatus};
use atp::risk::{OrderSide, RiskCheckStatus};
use serde_json::json;

use common::{account_with_equity, buy_signal, day, risk_manager};

fn open_position(id: &str, symbol: &str, quantity: f64, price: f64) -> Position {
    let mut metadata = Metadata::new();
    metadata.insert("contract_size".into(), json!(1.0));
    Position {
        position_id: id.into(),
        symbol: symbol.into(),
        broker: "paper".into(),
        side: OrderSide::Buy,
        quantity,
        entry_price: price,
        current_price: price,
        stop_loss: None,
        take_profit: None,
        trailing_stop_price: None,
        status: PositionStatus::Open,
        opened_at: day(1),
        closed_at: None,
        close_price: None,
        unrealized_pnl: 0.0,
        realized_pnl: None,
        commission_total: 0.0,
        signal_id: "s".into(),
        strategy_id: "trend_following".into(),
        asset_class: AssetClass::Forex,
        is_paper: true,
        metadata,
    }
}

#[tokio::test]
async fn daily_drawdown_rejects_then_kill_switch_blocks() {
    let (manager, _bus) = risk_manager("risk-e2e");

    // Establish the daily peak at 10k.
    let warmup = buy_signal("s-0", "EURUSD", day(8));
    manager
        .evaluate(
            &warmup,
            &account_with_equity(10_000.0, 10_000.0, day(8)),
            &[],
            Some(0.0010),
            None,
        )
        .await;

    // Equity drops 4% against a 3% daily limit.
    let dropped = buy_signal("s-1", "EURUSD", day(8) + chrono::Duration::hours(2));
    let check = manager
        .evaluate(
            &dropped,
            &account_with_equity(10_000.0, 9_600.0, day(8) + chrono::Duration::hours(2)),
            &[],
            Some(0.0010),
            None,
        )
        .await;
    assert_eq!(check.status, RiskCheckStatus::Rejected);
    assert!(check
        .rejection_reasons
        .contains(&"daily_drawdown_reached".to_string()));
    assert!(manager.kill_switch().is_active());

    // The next signal is rejected purely on the kill switch.
    let next = buy_signal("s-2", "EURUSD", day(8) + chrono::Duration::hours(3));
    let check = manager
        .evaluate(
            &next,
            &account_with_equity(10_000.0, 9_600.0, day(8) + chrono::Duration::hours(3)),
            &[],
            Some(0.0010),
            None,
        )
        .await;
    assert_eq!(check.rejection_reasons, vec!["kill_switch_active".to_string()]);

    // Monotone until explicit deactivation by an operator.
    manager
        .kill_switch()
        .deactivate("drawdown reviewed", "desk-ops", day(9))
        .await;
    let after = buy_signal("s-3", "EURUSD", day(9));
    let check = manager
        .evaluate(
            &after,
            &account_with_equity(10_000.0, 9_600.0, day(9)),
            &[],
            Some(0.0010),
            None,
        )
        .await;
    assert_ne!(check.rejection_reasons, vec!["kill_switch_active".to_string()]);
}

#[tokio::test]
async fn correlated_exposure_halves_then_rejects() {
    let (manager, _bus) = risk_manager("risk-corr");

    // Two existing USD-quote exposures at 14% of equity each.
    let positions = vec![
        open_position("p1", "EURUSD", 1_400.0, 1.0),
        open_position("p2", "GBPUSD", 1_400.0, 1.0),
    ];
    let signal = buy_signal("s-1", "AUDUSD", day(8));
    let check = manager
        .evaluate(
            &signal,
            &account_with_equity(10_000.0, 10_000.0, day(8)),
            &positions,
            Some(0.0010),
            None,
        )
        .await;

    match check.status {
        // Halving brought the correlated exposure back under the limit.
        RiskCheckStatus::Modified => {
            assert!(check
                .warnings
                .iter()
                .any(|warning| warning == "max_correlated_exposure_pct"));
            assert!(check.approved_size > 0.0);
        }
        // Or the halved size still violated and the check rejected.
        RiskCheckStatus::Rejected => {
            assert!(check
                .rejection_reasons
                .contains(&"max_correlated_exposure_pct".to_string()));
        }
        RiskCheckStatus::Approved => panic!("correlated exposure must not pass untouched"),
    }
}

#[tokio::test]
async fn heavily_correlated_book_rejects_outright() {
    let (manager, _bus) = risk_manager("risk-corr-heavy");

    // 29% correlated exposure; any meaningful addition stays violating
    // even after the halving step.
    let positions = vec![
        open_position("p1", "EURUSD", 1_450.0, 1.0),
        open_position("p2", "GBPUSD", 1_450.0, 1.0),
    ];
    let mut signal = buy_signal("s-1", "AUDUSD", day(8));
    // Force a large requested notional by inflating equity risk intent.
    signal.entry_price = Some(1.0);

    let check = manager
        .evaluate(
            &signal,
            &account_with_equity(10_000.0, 10_000.0, day(8)),
            &positions,
            Some(0.0100),
            None,
        )
        .await;
    if check.status == RiskCheckStatus::Rejected {
        assert!(check
            .rejection_reasons
            .contains(&"max_correlated_exposure_pct".to_string()));
    } else {
        // If it squeezed under the cap, the size must be halved and warned.
        assert_eq!(check.status, RiskCheckStatus::Modified);
    }
}

#[tokio::test]
async fn max_open_positions_enforced() {
    let (manager, _bus) = risk_manager("risk-maxpos");
    let positions: Vec<Position> = (0..5)
        .map(|i| open_position(&format!("p{i}"), "EURUSD", 10.0, 1.1))
        .collect();
    let signal = buy_signal("s-1", "EURUSD", day(8));
    let check = manager
        .evaluate(
            &signal,
            &account_with_equity(10_000.0, 10_000.0, day(8)),
            &positions,
            Some(0.0010),
            None,
        )
        .await;
    assert_eq!(
        check.rejection_reasons,
        vec!["max_open_positions_reached".to_string()]
    );
}
