#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use atp::backtest::generate_synthetic_bars;
use atp::core::{EventBus, IdGen};
use atp::data::{AssetClass, DataRepository, Metadata, Timeframe};
use atp::execution::Account;
use atp::regime::MarketRegime;
use atp::risk::{KillSwitch, KillSwitchConfig, RiskConfig, RiskManager};
use atp::signals::{strength_for, Signal, SignalDirection};
use atp::storage::{BarCache, MetadataStore, ParquetStore};

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
}

pub async fn seed_bars(dir: &Path, start: DateTime<Utc>, end: DateTime<Utc>, seed: u64) {
    let store = ParquetStore::new(dir);
    let bars = generate_synthetic_bars(
        "EURUSD",
        "paper",
        Timeframe::H1,
        start,
        end,
        seed,
        1.1000,
        AssetClass::Forex,
    );
    store.save_bars(&bars).await.unwrap();
}

pub fn repository(dir: &Path) -> Arc<DataRepository> {
    Arc::new(DataRepository::new(
        Arc::new(ParquetStore::new(dir)),
        Arc::new(MetadataStore::in_memory().unwrap()),
        Arc::new(BarCache::new(128)),
        HashMap::new(),
        None,
    ))
}

pub fn risk_manager(run_id: &str) -> (Arc<RiskManager>, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new());
    let kill_switch = Arc::new(KillSwitch::new(
        KillSwitchConfig::default(),
        bus.clone(),
        run_id,
    ));
    let manager = Arc::new(RiskManager::new(
        RiskConfig::default(),
        kill_switch,
        Arc::new(IdGen::new(run_id)),
        run_id,
    ));
    (manager, bus)
}

pub fn buy_signal(signal_id: &str, symbol: &str, ts: DateTime<Utc>) -> Signal {
    let mut metadata = Metadata::new();
    metadata.insert("asset_class".into(), json!("forex"));
    Signal {
        signal_id: signal_id.into(),
        strategy_id: "trend_following".into(),
        strategy_version: "1.0.0".into(),
        symbol: symbol.into(),
        broker: "paper".into(),
        timeframe: Timeframe::H1,
        ts,
        run_id: "test".into(),
        direction: SignalDirection::Buy,
        strength: strength_for(0.7),
        raw_score: 65.0,
        confidence: 0.7,
        reasons: vec![],
        regime: MarketRegime::fallback(symbol, Timeframe::H1, ts),
        horizon: "2h".into(),
        entry_price: Some(1.1000),
        expires_at: None,
        metadata,
    }
}

pub fn account_with_equity(balance: f64, equity: f64, ts: DateTime<Utc>) -> Account {
    let mut account = Account::new("acct-test", "paper", balance, "USD", 30.0, true, ts);
    account.unrealized_pnl = equity - balance;
    account.refresh_derived();
    account
}
