use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::core::{AuditJournal, EventBus, IdGen};
use crate::data::{DataRepository, OHLCVBar, Tick};
use crate::error::{Error, Result};
use crate::execution::{
    BrokerAdapter, FillMode, FillSimulatorConfig, IdempotencyManager, OrderManager, PaperAdapter,
    Position, PositionStatus, Reconciler, RetryHandler,
};
use crate::indicators::{self, IndicatorEngine};
use crate::regime::{NewsCalendar, RegimeConfig, RegimeDetector};
use crate::risk::{KillSwitch, PositionAction, RiskConfig, RiskManager};
use crate::signals::{SignalEngine, SignalsConfig};
use crate::storage::{BarCache, MetadataStore, ParquetStore};

use super::metrics::MetricsCalculator;
use super::out_of_sample::OutOfSampleValidator;
use super::walk_forward::WalkForwardAnalyzer;
use super::{BacktestConfig, BacktestMetrics, BacktestMode, BacktestResult, BacktestTrade};

/// Isolated component stack for one deterministic run.
pub struct BacktestRuntime {
    pub bus: Arc<EventBus>,
    pub ids: Arc<IdGen>,
    pub repository: Arc<DataRepository>,
    pub indicator_engine: Arc<IndicatorEngine>,
    pub regime_detector: Arc<RegimeDetector>,
    pub signal_engine: Arc<SignalEngine>,
    pub risk_manager: Arc<RiskManager>,
    pub paper: Arc<PaperAdapter>,
    pub order_manager: Arc<OrderManager>,
}

impl BacktestRuntime {
    /// Assemble a fresh stack over an existing on-disk data store.
    pub fn build(
        run_id: &str,
        data_store: &Path,
        signals_config: SignalsConfig,
        risk_config: &RiskConfig,
        initial_capital: f64,
        use_realistic_fills: bool,
        seed: u64,
        start_ts: DateTime<Utc>,
    ) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let ids = Arc::new(IdGen::new(run_id));
        let repository = Arc::new(DataRepository::new(
            Arc::new(ParquetStore::new(data_store)),
            Arc::new(MetadataStore::in_memory()?),
            Arc::new(BarCache::new(256)),
            HashMap::new(),
            None,
        ));
        let indicator_engine = Arc::new(IndicatorEngine::new(true, 300));
        let regime_detector = Arc::new(RegimeDetector::new(RegimeConfig::default()));
        let journal = Arc::new(AuditJournal::new(
            data_store.join(format!("audit_{run_id}.jsonl")),
        ));
        let signal_engine = Arc::new(SignalEngine::new(
            signals_config,
            indicator_engine.clone(),
            regime_detector.clone(),
            repository.clone(),
            bus.clone(),
            journal,
            ids.clone(),
            run_id,
            NewsCalendar::default(),
        ));

        let kill_switch = Arc::new(KillSwitch::new(
            risk_config.kill_switch.clone(),
            bus.clone(),
            run_id,
        ));
        let risk_manager = Arc::new(RiskManager::new(
            risk_config.clone(),
            kill_switch,
            ids.clone(),
            run_id,
        ));

        let fill_config = FillSimulatorConfig {
            fill_mode: if use_realistic_fills {
                FillMode::Realistic
            } else {
                FillMode::Instant
            },
            partial_fill_probability: risk_config.paper.partial_fill_probability,
            slippage: risk_config.slippage.clone(),
            commissions: risk_config.commissions.clone(),
        };
        let paper = Arc::new(PaperAdapter::new(
            initial_capital,
            &risk_config.paper.currency,
            risk_config.paper.leverage,
            fill_config,
            seed,
            bus.clone(),
            ids.clone(),
            run_id,
            start_ts,
        ));
        // Isolated in-memory OMS and idempotency stores: repeated seeded
        // runs must not observe a previous run's dedup history.
        let order_manager = Arc::new(OrderManager::new(
            paper.clone(),
            risk_manager.clone(),
            Arc::new(IdempotencyManager::in_memory()?),
            Reconciler::new(Default::default()),
            RetryHandler::with_defaults(seed),
            bus.clone(),
            ids.clone(),
            run_id,
            None,
        )?);

        Ok(BacktestRuntime {
            bus,
            ids,
            repository,
            indicator_engine,
            regime_detector,
            signal_engine,
            risk_manager,
            paper,
            order_manager,
        })
    }
}

pub(crate) struct SpanOutcome {
    pub metrics: BacktestMetrics,
    pub trades: Vec<BacktestTrade>,
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    pub drawdown_curve: Vec<(DateTime<Utc>, f64)>,
}

/// Deterministic event-ordered replay of the signal→risk→execution
/// pipeline over a historical bar stream with a paper broker.
pub struct BacktestEngine {
    config: BacktestConfig,
    signals_config: SignalsConfig,
    risk_config: RiskConfig,
    data_store: PathBuf,
    metrics_calculator: MetricsCalculator,
}

impl BacktestEngine {
    pub fn new(
        config: BacktestConfig,
        signals_config: SignalsConfig,
        risk_config: RiskConfig,
        data_store: &Path,
    ) -> Result<Self> {
        Ok(BacktestEngine {
            config: config.validated()?,
            signals_config,
            risk_config,
            data_store: data_store.to_path_buf(),
            metrics_calculator: MetricsCalculator::new(),
        })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<BacktestResult> {
        let started = Instant::now();
        let mut result = match self.config.mode {
            BacktestMode::Simple => self.run_simple().await?,
            BacktestMode::WalkForward => {
                let mut result = self.run_simple().await?;
                let analyzer = WalkForwardAnalyzer::new(self);
                let windows = analyzer.run().await?;
                result.wf_summary = Some(analyzer.summarize(&windows));
                result.wf_windows = Some(windows);
                result
            }
            BacktestMode::OutOfSample => {
                let validator = OutOfSampleValidator::new(self);
                let (is_outcome, oos_outcome) = validator.run().await?;
                let report = validator.report(&is_outcome.metrics, &oos_outcome.metrics);
                let mut result = self.result_from_outcome(oos_outcome);
                result.is_metrics = Some(is_outcome.metrics);
                result.oos_metrics = Some(result.metrics.clone());
                result.oos_report = Some(report);
                result
            }
        };
        result.duration_seconds = started.elapsed().as_secs_f64();
        Ok(result)
    }

    async fn run_simple(&self) -> Result<BacktestResult> {
        let signals_config = self.signals_config_for(&self.config.strategy_ids, &HashMap::new());
        let outcome = self
            .run_simple_span(
                self.config.start_date,
                self.config.end_date,
                signals_config,
                &self.config.run_id,
            )
            .await?;
        Ok(self.result_from_outcome(outcome))
    }

    /// Run SIMPLE restricted to one strategy with parameter overrides.
    pub async fn run_single_strategy(
        &self,
        strategy_id: &str,
        params: &HashMap<String, f64>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        label: &str,
    ) -> Result<BacktestMetrics> {
        let signals_config = self.signals_config_for(&[strategy_id.to_string()], params);
        let run_id = format!("{}-{label}", self.config.run_id);
        let outcome = self.run_simple_span(start, end, signals_config, &run_id).await?;
        Ok(outcome.metrics)
    }

    pub(crate) async fn run_simple_span(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        signals_config: SignalsConfig,
        run_id: &str,
    ) -> Result<SpanOutcome> {
        let runtime = BacktestRuntime::build(
            run_id,
            &self.data_store,
            signals_config,
            &self.risk_config,
            self.config.initial_capital,
            self.config.use_realistic_fills,
            self.config.seed,
            start,
        )?;

        let symbol = self.config.symbol();
        let broker = self.config.broker();
        let timeframe = self.config.timeframe();
        let mut bars = runtime
            .repository
            .get_ohlcv(symbol, broker, timeframe, start, end, false)
            .await?;
        if bars.is_empty() {
            return Err(Error::validation(format!(
                "no stored bars for {symbol}/{broker}/{timeframe} in the requested range"
            )));
        }
        bars.sort_by(|a, b| {
            a.ts_open
                .cmp(&b.ts_open)
                .then_with(|| a.symbol.cmp(&b.symbol))
                .then_with(|| a.broker.cmp(&b.broker))
        });

        // Precompute the ATR series once; index i only sees bars up to i.
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
        let atr = indicators::atr_series(&closes, &highs, &lows, 14);

        let horizon = runtime_default_horizon(&self.signals_config);
        let mut equity_curve = Vec::new();
        let mut excursions: HashMap<String, (f64, f64)> = HashMap::new();
        let mut bars_held: HashMap<String, u32> = HashMap::new();
        let mut reported_closed: std::collections::HashSet<String> = std::collections::HashSet::new();

        for (idx, bar) in bars.iter().enumerate() {
            let tick = synthetic_close_tick(bar);
            runtime.paper.process_tick(&tick).await?;
            runtime.order_manager.process_fills().await?;

            // Feed closed round trips back to the anti-overtrading guard.
            for position in runtime.order_manager.all_positions().await {
                if position.status != PositionStatus::Closed
                    || !reported_closed.insert(position.position_id.clone())
                {
                    continue;
                }
                let won = position.realized_pnl.unwrap_or(0.0) >= 0.0;
                runtime
                    .signal_engine
                    .register_outcome(&position.strategy_id, &position.symbol, won, bar.ts_close)
                    .await;
            }

            let open_positions = runtime.order_manager.open_positions().await;
            track_excursions(&runtime, &open_positions, &mut excursions).await;

            let bar_atr = if atr[idx].is_finite() {
                atr[idx]
            } else {
                bar.close * 0.001
            };

            // Trailing stops and time exits before the new decision.
            if !open_positions.is_empty() {
                let mut annotated = open_positions.clone();
                for position in &mut annotated {
                    let held = bars_held.entry(position.position_id.clone()).or_insert(0);
                    *held += 1;
                    position
                        .metadata
                        .insert("bars_held".into(), json!(*held));
                    position
                        .metadata
                        .insert("timeframe".into(), json!(timeframe.as_str()));
                }
                let prices = HashMap::from([(symbol.to_string(), bar.close)]);
                let atrs = HashMap::from([(symbol.to_string(), bar_atr)]);
                let actions = runtime
                    .risk_manager
                    .monitor_open_positions(&annotated, &prices, &atrs, bar.ts_close)
                    .await;
                for action in actions {
                    match action {
                        PositionAction::UpdateTrailing { position_id, new_sl } => {
                            runtime
                                .order_manager
                                .update_position_stops(&position_id, Some(new_sl), None)
                                .await?;
                            runtime
                                .paper
                                .update_position_stops(&position_id, Some(new_sl), None)
                                .await;
                        }
                        PositionAction::Close { position_id, reason } => {
                            runtime
                                .order_manager
                                .close_position(&position_id, &reason, 1.0)
                                .await?;
                        }
                    }
                }
            }

            let decision = runtime
                .signal_engine
                .analyze(
                    symbol,
                    broker,
                    timeframe,
                    &horizon,
                    Some(bar.asset_class),
                    Some(bar.ts_close),
                )
                .await?;

            if decision.ensemble.final_direction.is_actionable() {
                let mut signal = runtime.signal_engine.final_signal(&decision);
                if signal.entry_price.is_none() {
                    signal.entry_price = Some(bar.close);
                }
                signal.metadata.insert("atr".into(), json!(bar_atr));
                signal.metadata.insert(
                    "regime_trend".into(),
                    json!(decision.ensemble.regime.trend.as_str()),
                );
                signal.metadata.insert(
                    "regime_volatility".into(),
                    json!(format!("{:?}", decision.ensemble.regime.volatility).to_lowercase()),
                );
                signal.metadata.insert(
                    "signal_confidence".into(),
                    json!(decision.ensemble.final_confidence),
                );

                let account = runtime.order_manager.account().await?;
                let open_positions = runtime.order_manager.open_positions().await;
                let check = runtime
                    .risk_manager
                    .evaluate(&signal, &account, &open_positions, Some(bar_atr), None)
                    .await;
                if check.is_executable() {
                    runtime
                        .order_manager
                        .submit_from_signal(&signal, &check, &account)
                        .await?;
                    runtime.order_manager.process_fills().await?;
                }
            }

            if idx >= self.config.warmup_bars {
                let account = runtime.order_manager.account().await?;
                equity_curve.push((bar.ts_close, account.equity));
            }
        }

        // Flatten at the end of the span so every entry becomes a round
        // trip and final equity ties out to the trade PnL sum.
        runtime
            .order_manager
            .close_all_positions("end_of_backtest")
            .await?;

        let trades = self.collect_trades(&runtime, &bars, &excursions).await;
        let metrics =
            self.metrics_calculator
                .calculate(&trades, &equity_curve, self.config.initial_capital);
        let drawdown_curve = drawdown_curve(&equity_curve);
        runtime.bus.stop().await;

        Ok(SpanOutcome {
            metrics,
            trades,
            equity_curve,
            drawdown_curve,
        })
    }

    async fn collect_trades(
        &self,
        runtime: &BacktestRuntime,
        bars: &[OHLCVBar],
        excursions: &HashMap<String, (f64, f64)>,
    ) -> Vec<BacktestTrade> {
        let tf_seconds = self.config.timeframe().seconds();
        let last_ts = bars.last().map(|bar| bar.ts_close);
        let mut trades = Vec::new();
        for position in runtime.order_manager.all_positions().await {
            if position.status != PositionStatus::Closed {
                continue;
            }
            let Some(trade) = trade_from_position(&position, tf_seconds, last_ts, excursions)
            else {
                continue;
            };
            trades.push(trade);
        }
        trades.sort_by(|a, b| {
            a.entry_time
                .cmp(&b.entry_time)
                .then_with(|| a.trade_id.cmp(&b.trade_id))
        });
        trades
    }

    fn result_from_outcome(&self, outcome: SpanOutcome) -> BacktestResult {
        let by_strategy = self.decompose(&outcome.trades, |trade| trade.strategy_id.clone());
        let by_regime = self.decompose(&outcome.trades, |trade| trade.regime_at_entry.clone());
        let by_session = self.decompose(&outcome.trades, |trade| {
            session_bucket(trade.entry_time).to_string()
        });
        let by_month = self.decompose(&outcome.trades, |trade| {
            trade.entry_time.format("%Y-%m").to_string()
        });
        BacktestResult {
            config: self.config.clone(),
            metrics: outcome.metrics,
            trades: outcome.trades,
            equity_curve: outcome.equity_curve,
            drawdown_curve: outcome.drawdown_curve,
            metrics_by_strategy: by_strategy,
            metrics_by_regime: by_regime,
            metrics_by_session: by_session,
            metrics_by_month: by_month,
            wf_windows: None,
            wf_summary: None,
            is_metrics: None,
            oos_metrics: None,
            oos_report: None,
            duration_seconds: 0.0,
        }
    }

    fn decompose<F>(
        &self,
        trades: &[BacktestTrade],
        key_of: F,
    ) -> HashMap<String, BacktestMetrics>
    where
        F: Fn(&BacktestTrade) -> String,
    {
        let mut grouped: HashMap<String, Vec<BacktestTrade>> = HashMap::new();
        for trade in trades {
            grouped.entry(key_of(trade)).or_default().push(trade.clone());
        }
        grouped
            .into_iter()
            .map(|(key, group)| {
                // Per-group equity from cumulative net PnL over the same
                // starting capital.
                let mut equity = self.config.initial_capital;
                let curve: Vec<(DateTime<Utc>, f64)> = group
                    .iter()
                    .map(|trade| {
                        equity += trade.pnl_net;
                        (trade.exit_time, equity)
                    })
                    .collect();
                let metrics = self.metrics_calculator.calculate(
                    &group,
                    &curve,
                    self.config.initial_capital,
                );
                (key, metrics)
            })
            .collect()
    }

    pub(crate) fn signals_config_for(
        &self,
        strategy_ids: &[String],
        params: &HashMap<String, f64>,
    ) -> SignalsConfig {
        let mut config = self.signals_config.clone();
        for strategy in &mut config.strategies {
            strategy.enabled = strategy_ids.iter().any(|id| *id == strategy.strategy_id);
            if strategy.enabled {
                for (key, value) in params {
                    strategy.params.set(key, *value);
                }
            }
        }
        config
    }
}

fn runtime_default_horizon(config: &SignalsConfig) -> String {
    config.default_horizon.clone()
}

fn synthetic_close_tick(bar: &OHLCVBar) -> Tick {
    Tick {
        symbol: bar.symbol.clone(),
        broker: bar.broker.clone(),
        ts: bar.ts_close,
        bid: bar.close,
        ask: bar.close,
        last: Some(bar.close),
        volume: Some(bar.volume),
        spread: Some(bar.spread.unwrap_or(0.0)),
        asset_class: bar.asset_class,
        source: "backtest".into(),
    }
}

async fn track_excursions(
    runtime: &BacktestRuntime,
    open_positions: &[Position],
    excursions: &mut HashMap<String, (f64, f64)>,
) {
    // The paper adapter carries the marked prices.
    let marked = runtime.paper.all_positions().await;
    for position in open_positions {
        let Some(live) = marked
            .iter()
            .find(|item| item.position_id == position.position_id)
        else {
            continue;
        };
        let entry = excursions
            .entry(position.position_id.clone())
            .or_insert((0.0, 0.0));
        entry.0 = entry.0.min(live.unrealized_pnl);
        entry.1 = entry.1.max(live.unrealized_pnl);
    }
}

fn trade_from_position(
    position: &Position,
    tf_seconds: i64,
    fallback_exit: Option<DateTime<Utc>>,
    excursions: &HashMap<String, (f64, f64)>,
) -> Option<BacktestTrade> {
    let exit_time = position.closed_at.or(fallback_exit)?;
    let exit_price = position.close_price?;
    let quantity = crate::data::meta_f64(&position.metadata, "entry_quantity", 0.0);
    if quantity <= 0.0 {
        return None;
    }
    // Net PnL from realized accounting: realized already nets close
    // commissions, so only the entry commission remains to subtract. This
    // keeps (final equity - initial capital) == sum of pnl_net exactly,
    // partial closes included.
    let entry_commission = crate::data::meta_f64(&position.metadata, "entry_commission", 0.0);
    let commission = position.commission_total;
    let pnl_net = position.realized_pnl.unwrap_or(0.0) - entry_commission;
    let gross = pnl_net + commission;
    let bars_held = (((exit_time - position.opened_at).num_seconds()) / tf_seconds.max(1)).max(0);
    let (mae, mfe) = excursions
        .get(&position.position_id)
        .copied()
        .unwrap_or((gross.min(0.0), gross.max(0.0)));

    let exit_reason = match (position.stop_loss, position.take_profit) {
        (Some(sl), _) if cross_tolerance(exit_price, sl) => "stop_loss",
        (_, Some(tp)) if cross_tolerance(exit_price, tp) => "take_profit",
        _ => "signal_or_time",
    };

    Some(
        BacktestTrade {
            trade_id: position.position_id.clone(),
            symbol: position.symbol.clone(),
            strategy_id: position.strategy_id.clone(),
            side: position.side,
            entry_time: position.opened_at,
            exit_time,
            entry_price: position.entry_price,
            exit_price,
            quantity,
            pnl: gross,
            pnl_net,
            commission,
            slippage: 0.0,
            bars_held: bars_held as u32,
            exit_reason: exit_reason.to_string(),
            r_multiple: None,
            stop_loss: position.stop_loss,
            regime_at_entry: crate::data::meta_str(&position.metadata, "regime_trend")
                .unwrap_or("unknown")
                .to_string(),
            volatility_at_entry: crate::data::meta_str(&position.metadata, "regime_volatility")
                .unwrap_or("unknown")
                .to_string(),
            signal_confidence: crate::data::meta_f64(&position.metadata, "signal_confidence", 0.0),
            max_favorable_excursion: mfe,
            max_adverse_excursion: mae,
        }
        .with_derived_r_multiple(),
    )
}

fn cross_tolerance(price: f64, level: f64) -> bool {
    if level <= 0.0 {
        return false;
    }
    (price - level).abs() / level < 0.002
}

fn session_bucket(ts: DateTime<Utc>) -> &'static str {
    use chrono::Timelike;
    match ts.hour() {
        0..=7 => "asia",
        8..=12 => "london",
        13..=21 => "newyork",
        _ => "late",
    }
}

fn drawdown_curve(equity_curve: &[(DateTime<Utc>, f64)]) -> Vec<(DateTime<Utc>, f64)> {
    let mut peak = f64::MIN;
    equity_curve
        .iter()
        .map(|(ts, value)| {
            peak = peak.max(*value);
            let dd = if peak > 0.0 { (peak - value) / peak * 100.0 } else { 0.0 };
            (*ts, dd)
        })
        .collect()
}
