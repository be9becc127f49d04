use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::backtest::{BacktestMetrics, BacktestTrade, MetricsCalculator};
use crate::core::events::{BarCloseEvent, Event};
use crate::core::{EventBus, EventKind, IdGen};
use crate::data::AssetClass;
use crate::error::Result;
use crate::execution::{Account, Position, PositionStatus};
use crate::risk::{OrderSide, RiskManager};
use crate::signals::{SignalEngine, ENSEMBLE_STRATEGY_ID};

/// Agreement report between shadow and live trade sequences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowComparison {
    pub agreement_rate: f64,
    pub shadow_trades: usize,
    pub live_trades: usize,
    pub divergences: Vec<(String, String, String)>,
}

struct ShadowState {
    open_positions: BTreeMap<String, Position>,
    trades: Vec<BacktestTrade>,
    equity_curve: Vec<(DateTime<Utc>, f64)>,
    account: Account,
}

/// Run the signal→risk pipeline in parallel with live trading without
/// touching the order manager.
///
/// Every shadow entry is held exactly one bar; an intentional
/// simplification that keeps the comparison sequence cheap to produce.
pub struct ShadowMode {
    signal_engine: Arc<SignalEngine>,
    risk_manager: Arc<RiskManager>,
    bus: Arc<EventBus>,
    ids: Arc<IdGen>,
    run_id: String,
    metrics: MetricsCalculator,
    state: Mutex<ShadowState>,
}

impl ShadowMode {
    pub fn new(
        signal_engine: Arc<SignalEngine>,
        risk_manager: Arc<RiskManager>,
        bus: Arc<EventBus>,
        ids: Arc<IdGen>,
        run_id: &str,
        initial_balance: f64,
        start_ts: DateTime<Utc>,
    ) -> Self {
        ShadowMode {
            signal_engine,
            risk_manager,
            bus,
            ids,
            run_id: run_id.to_string(),
            metrics: MetricsCalculator::new(),
            state: Mutex::new(ShadowState {
                open_positions: BTreeMap::new(),
                trades: Vec::new(),
                equity_curve: Vec::new(),
                account: Account::new(
                    &format!("shadow-{run_id}"),
                    "shadow",
                    initial_balance,
                    "USD",
                    1.0,
                    true,
                    start_ts,
                ),
            }),
        }
    }

    /// Spawn a consumer over BAR_CLOSE events. The task ends when the bus
    /// closes the subscription.
    pub async fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.bus.subscribe(EventKind::BarClose).await;
        let shadow = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Event::BarClose(bar_close) = event {
                    if let Err(err) = shadow.on_bar_close(&bar_close).await {
                        tracing::warn!(error = %err, "shadow bar processing failed");
                    }
                }
            }
        })
    }

    /// Process one bar: close the previous one-bar holds, then evaluate
    /// the pipeline and open a shadow position for approved checks.
    pub async fn on_bar_close(&self, event: &BarCloseEvent) -> Result<()> {
        let now = event.ts_close;
        {
            let mut state = self.state.lock().await;
            let to_close: Vec<Position> = state
                .open_positions
                .values()
                .filter(|position| position.symbol == event.symbol)
                .cloned()
                .collect();
            for position in to_close {
                let pnl = close_shadow_position(&mut state, &position, event.close, now);
                state.account.balance += pnl;
                state.account.refresh_derived();
                drop(state);
                self.risk_manager.update_on_close(&position, pnl, now).await;
                self.signal_engine
                    .register_outcome(&position.strategy_id, &position.symbol, pnl >= 0.0, now)
                    .await;
                state = self.state.lock().await;
            }
        }

        let decision = self
            .signal_engine
            .analyze(
                &event.symbol,
                &event.broker,
                event.timeframe,
                "2h",
                None,
                Some(event.ts_close),
            )
            .await?;
        if !decision.ensemble.final_direction.is_actionable() {
            self.record_equity(now).await;
            return Ok(());
        }

        let mut signal = self.signal_engine.final_signal(&decision);
        signal.entry_price = Some(event.close);
        signal.metadata.insert("atr".into(), json!(event.close * 0.001));
        signal
            .metadata
            .insert("signal_confidence".into(), json!(decision.ensemble.final_confidence));
        signal.metadata.insert(
            "regime_trend".into(),
            json!(decision.ensemble.regime.trend.as_str()),
        );
        signal.metadata.insert(
            "regime_volatility".into(),
            json!(format!("{:?}", decision.ensemble.regime.volatility).to_lowercase()),
        );

        let (account, open_positions) = {
            let state = self.state.lock().await;
            (
                state.account.clone(),
                state.open_positions.values().cloned().collect::<Vec<_>>(),
            )
        };
        let check = self
            .risk_manager
            .evaluate(
                &signal,
                &account,
                &open_positions,
                Some(event.close * 0.001),
                None,
            )
            .await;
        if !check.is_executable() {
            self.record_equity(now).await;
            return Ok(());
        }

        let side = if signal.direction == crate::signals::SignalDirection::Buy {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let mut metadata = signal.metadata.clone();
        metadata.insert("contract_size".into(), json!(1.0));
        metadata.insert("entry_quantity".into(), json!(check.approved_size));
        let position = Position {
            position_id: self.ids.next("shadow"),
            symbol: event.symbol.clone(),
            broker: event.broker.clone(),
            side,
            quantity: check.approved_size,
            entry_price: event.close,
            current_price: event.close,
            stop_loss: check.suggested_sl,
            take_profit: check.suggested_tp,
            trailing_stop_price: check.suggested_trailing,
            status: PositionStatus::Open,
            opened_at: event.ts_close,
            closed_at: None,
            close_price: None,
            unrealized_pnl: 0.0,
            realized_pnl: None,
            commission_total: 0.0,
            signal_id: signal.signal_id.clone(),
            strategy_id: ENSEMBLE_STRATEGY_ID.to_string(),
            asset_class: AssetClass::parse(
                crate::data::meta_str(&signal.metadata, "asset_class").unwrap_or("unknown"),
            ),
            is_paper: true,
            metadata,
        };
        self.state
            .lock()
            .await
            .open_positions
            .insert(position.position_id.clone(), position);
        self.record_equity(now).await;
        Ok(())
    }

    pub async fn shadow_trades(&self) -> Vec<BacktestTrade> {
        self.state.lock().await.trades.clone()
    }

    pub async fn shadow_metrics(&self) -> BacktestMetrics {
        let state = self.state.lock().await;
        let initial = state
            .equity_curve
            .first()
            .map_or(state.account.balance, |point| point.1);
        self.metrics
            .calculate(&state.trades, &state.equity_curve, initial)
    }

    /// Agreement rate and symmetric difference on
    /// (symbol, entry_time, side) against a live trade sequence.
    pub async fn compare_with_live(&self, live_trades: &[BacktestTrade]) -> ShadowComparison {
        let state = self.state.lock().await;
        let key_of = |trade: &BacktestTrade| {
            (
                trade.symbol.clone(),
                trade.entry_time.to_rfc3339(),
                trade.side.as_str().to_string(),
            )
        };
        let shadow_keys: BTreeSet<_> = state.trades.iter().map(key_of).collect();
        let live_keys: BTreeSet<_> = live_trades.iter().map(key_of).collect();
        let common = shadow_keys.intersection(&live_keys).count();
        let divergences: Vec<_> = shadow_keys
            .symmetric_difference(&live_keys)
            .cloned()
            .collect();
        let agreement_rate = if shadow_keys.is_empty() {
            0.0
        } else {
            common as f64 / shadow_keys.len() as f64
        };
        ShadowComparison {
            agreement_rate,
            shadow_trades: shadow_keys.len(),
            live_trades: live_keys.len(),
            divergences,
        }
    }

    async fn record_equity(&self, ts: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        let equity = state.account.equity;
        state.equity_curve.push((ts, equity));
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

fn close_shadow_position(
    state: &mut ShadowState,
    position: &Position,
    exit_price: f64,
    when: DateTime<Utc>,
) -> f64 {
    state.open_positions.remove(&position.position_id);
    let pnl_per_unit = match position.side {
        OrderSide::Buy => exit_price - position.entry_price,
        OrderSide::Sell => position.entry_price - exit_price,
    };
    let pnl = pnl_per_unit * position.quantity;
    let trade = BacktestTrade {
        trade_id: position.position_id.clone(),
        symbol: position.symbol.clone(),
        strategy_id: position.strategy_id.clone(),
        side: position.side,
        entry_time: position.opened_at,
        exit_time: when,
        entry_price: position.entry_price,
        exit_price,
        quantity: position.quantity,
        pnl,
        pnl_net: pnl,
        commission: 0.0,
        slippage: 0.0,
        bars_held: 1,
        exit_reason: "shadow_one_bar".to_string(),
        r_multiple: None,
        stop_loss: position.stop_loss,
        regime_at_entry: crate::data::meta_str(&position.metadata, "regime_trend")
            .unwrap_or("unknown")
            .to_string(),
        volatility_at_entry: crate::data::meta_str(&position.metadata, "regime_volatility")
            .unwrap_or("unknown")
            .to_string(),
        signal_confidence: crate::data::meta_f64(&position.metadata, "signal_confidence", 0.0),
        max_favorable_excursion: pnl.max(0.0),
        max_adverse_excursion: pnl.min(0.0),
    }
    .with_derived_r_multiple();
    state.trades.push(trade);
    pnl
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Metadata;
    use chrono::TimeZone;

    fn trade(symbol: &str, hour: u32, side: OrderSide) -> BacktestTrade {
        let entry = Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap();
        BacktestTrade {
            trade_id: format!("{symbol}-{hour}"),
            symbol: symbol.into(),
            strategy_id: ENSEMBLE_STRATEGY_ID.into(),
            side,
            entry_time: entry,
            exit_time: entry + chrono::Duration::hours(1),
            entry_price: 1.1,
            exit_price: 1.101,
            quantity: 1.0,
            pnl: 0.001,
            pnl_net: 0.001,
            commission: 0.0,
            slippage: 0.0,
            bars_held: 1,
            exit_reason: "shadow_one_bar".into(),
            r_multiple: None,
            stop_loss: None,
            regime_at_entry: "ranging".into(),
            volatility_at_entry: "medium".into(),
            signal_confidence: 0.7,
            max_favorable_excursion: 0.001,
            max_adverse_excursion: 0.0,
        }
    }

    fn shadow_with_trades(trades: Vec<BacktestTrade>) -> ShadowState {
        ShadowState {
            open_positions: BTreeMap::new(),
            trades,
            equity_curve: vec![],
            account: Account::new(
                "shadow-test",
                "shadow",
                10_000.0,
                "USD",
                1.0,
                true,
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ),
        }
    }

    fn make_shadow(state: ShadowState) -> ShadowMode {
        use crate::core::{EventBus, IdGen};
        use crate::risk::{KillSwitch, KillSwitchConfig, RiskConfig};
        let bus = Arc::new(EventBus::new());
        let ids = Arc::new(IdGen::new("shadow-test"));
        let kill_switch = Arc::new(KillSwitch::new(
            KillSwitchConfig::default(),
            bus.clone(),
            "shadow-test",
        ));
        let risk_manager = Arc::new(RiskManager::new(
            RiskConfig::default(),
            kill_switch,
            ids.clone(),
            "shadow-test",
        ));
        // Minimal signal engine over an empty repository; comparison-only
        // tests never call analyze.
        let repository = Arc::new(crate::data::DataRepository::new(
            Arc::new(crate::storage::ParquetStore::new(std::env::temp_dir().join("shadow-x"))),
            Arc::new(crate::storage::MetadataStore::in_memory().unwrap()),
            Arc::new(crate::storage::BarCache::new(4)),
            Default::default(),
            None,
        ));
        let signal_engine = Arc::new(SignalEngine::new(
            crate::signals::SignalsConfig::default(),
            Arc::new(crate::indicators::IndicatorEngine::new(false, 0)),
            Arc::new(crate::regime::RegimeDetector::new(Default::default())),
            repository,
            bus.clone(),
            Arc::new(crate::core::AuditJournal::new(
                std::env::temp_dir().join("shadow-x-audit.jsonl"),
            )),
            ids.clone(),
            "shadow-test",
            crate::regime::NewsCalendar::default(),
        ));
        let mut shadow = ShadowMode::new(
            signal_engine,
            risk_manager,
            bus,
            ids,
            "shadow-test",
            10_000.0,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        shadow.state = Mutex::new(state);
        shadow
    }

    #[tokio::test]
    async fn full_agreement_when_sequences_match() {
        let trades = vec![trade("EURUSD", 1, OrderSide::Buy), trade("EURUSD", 5, OrderSide::Sell)];
        let shadow = make_shadow(shadow_with_trades(trades.clone()));
        let comparison = shadow.compare_with_live(&trades).await;
        assert!((comparison.agreement_rate - 1.0).abs() < 1e-12);
        assert!(comparison.divergences.is_empty());
    }

    #[tokio::test]
    async fn divergences_are_symmetric() {
        let shadow_trades = vec![trade("EURUSD", 1, OrderSide::Buy)];
        let live_trades = vec![trade("EURUSD", 2, OrderSide::Buy)];
        let shadow = make_shadow(shadow_with_trades(shadow_trades));
        let comparison = shadow.compare_with_live(&live_trades).await;
        assert_eq!(comparison.agreement_rate, 0.0);
        assert_eq!(comparison.divergences.len(), 2);
    }

    #[tokio::test]
    async fn one_bar_close_produces_trade() {
        let shadow = make_shadow(shadow_with_trades(vec![]));
        let position = Position {
            position_id: "shadow-1".into(),
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            side: OrderSide::Buy,
            quantity: 2.0,
            entry_price: 1.1000,
            current_price: 1.1000,
            stop_loss: Some(1.0950),
            take_profit: None,
            trailing_stop_price: None,
            status: PositionStatus::Open,
            opened_at: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
            closed_at: None,
            close_price: None,
            unrealized_pnl: 0.0,
            realized_pnl: None,
            commission_total: 0.0,
            signal_id: "sig-1".into(),
            strategy_id: ENSEMBLE_STRATEGY_ID.into(),
            asset_class: AssetClass::Forex,
            is_paper: true,
            metadata: Metadata::new(),
        };
        {
            let mut state = shadow.state.lock().await;
            state.open_positions.insert("shadow-1".into(), position.clone());
            let pnl = close_shadow_position(
                &mut state,
                &position,
                1.1050,
                Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap(),
            );
            assert!((pnl - 0.01).abs() < 1e-12);
            assert_eq!(state.trades.len(), 1);
            assert_eq!(state.trades[0].bars_held, 1);
            assert!(state.open_positions.is_empty());
        }
    }
}
