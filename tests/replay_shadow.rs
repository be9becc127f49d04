mod common;

use std::sync::Arc;

use atp::core::{AuditJournal, EventBus, IdGen};
use atp::data::Timeframe;
use atp::indicators::IndicatorEngine;
use atp::regime::{NewsCalendar, RegimeConfig, RegimeDetector};
use atp::replay::{MarketReplayer, ReplayController, ShadowMode};
use atp::signals::{SignalEngine, SignalsConfig};

use common::{day, repository, risk_manager, seed_bars};

async fn shadow_stack(
    dir: &std::path::Path,
    bus: Arc<EventBus>,
) -> (Arc<ShadowMode>, Arc<SignalEngine>) {
    let ids = Arc::new(IdGen::new("shadow-e2e"));
    let repo = repository(dir);
    let signal_engine = Arc::new(SignalEngine::new(
        SignalsConfig::default(),
        Arc::new(IndicatorEngine::new(true, 300)),
        Arc::new(RegimeDetector::new(RegimeConfig::default())),
        repo,
        bus.clone(),
        Arc::new(AuditJournal::new(dir.join("audit_shadow.jsonl"))),
        ids.clone(),
        "shadow-e2e",
        NewsCalendar::default(),
    ));
    let (risk, _bus) = risk_manager("shadow-e2e");
    let shadow = Arc::new(ShadowMode::new(
        signal_engine.clone(),
        risk,
        bus,
        ids,
        "shadow-e2e",
        10_000.0,
        day(1),
    ));
    (shadow, signal_engine)
}

#[tokio::test]
async fn replay_drives_shadow_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    seed_bars(dir.path(), day(1), day(4), 42).await;

    let bus = Arc::new(EventBus::new());
    let (shadow, _signal_engine) = shadow_stack(dir.path(), bus.clone()).await;
    let consumer = shadow.start().await;

    let controller = Arc::new(ReplayController::new());
    let replayer = MarketReplayer::new(
        repository(dir.path()),
        bus.clone(),
        controller,
        "shadow-e2e",
        f64::INFINITY,
    )
    .unwrap();
    let delivered = replayer
        .run("EURUSD", "paper", Timeframe::H1, day(1), day(4))
        .await
        .unwrap();
    assert_eq!(delivered, 72);

    // Close the bus so the consumer drains and exits.
    bus.stop().await;
    consumer.await.unwrap();

    let metrics = shadow.shadow_metrics().await;
    // Shadow evaluated every delivered bar; equity curve mirrors that.
    assert!(metrics.total_trades <= 72);
    let comparison = shadow.compare_with_live(&shadow.shadow_trades().await).await;
    if comparison.shadow_trades > 0 {
        assert!((comparison.agreement_rate - 1.0).abs() < 1e-12);
        assert!(comparison.divergences.is_empty());
    }
}

#[tokio::test]
async fn shadow_disagrees_with_foreign_live_sequence() {
    let dir = tempfile::tempdir().unwrap();
    seed_bars(dir.path(), day(1), day(3), 42).await;

    let bus = Arc::new(EventBus::new());
    let (shadow, _signal_engine) = shadow_stack(dir.path(), bus.clone()).await;
    let consumer = shadow.start().await;

    let controller = Arc::new(ReplayController::new());
    let replayer = MarketReplayer::new(
        repository(dir.path()),
        bus.clone(),
        controller,
        "shadow-e2e",
        f64::INFINITY,
    )
    .unwrap();
    replayer
        .run("EURUSD", "paper", Timeframe::H1, day(1), day(3))
        .await
        .unwrap();
    bus.stop().await;
    consumer.await.unwrap();

    // An empty live sequence diverges from every shadow trade.
    let comparison = shadow.compare_with_live(&[]).await;
    assert_eq!(comparison.live_trades, 0);
    assert_eq!(comparison.divergences.len(), comparison.shadow_trades);
}
