use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::core::events::{Event, SignalEvent};
use crate::core::{AuditEntry, AuditJournal, EventBus, IdGen};
use crate::data::{AssetClass, DataRepository, Metadata, OHLCVBar, Tick, Timeframe};
use crate::error::Result;
use crate::indicators::IndicatorEngine;
use crate::regime::{MarketRegime, NewsCalendar, RegimeDetector};

use super::anti_overtrading::{AntiOvertradingConfig, AntiOvertradingGuard};
use super::confidence::{ConfidenceConfig, ConfidenceScorer};
use super::ensemble::{EnsembleMethod, SignalEnsemble};
use super::filters::{CorrelationFilter, NewsFilter, RegimeFilter, SessionFilter, SpreadFilter};
use super::strategies::{builtin_strategies, SignalStrategy, StrategyContext, StrategyParams};
use super::{
    horizon_to_human, parse_horizon, strength_for, DecisionResult, EnsembleResult, Signal,
    SignalDirection,
};

pub const ENSEMBLE_STRATEGY_ID: &str = "signal_ensemble";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EnsembleConfig {
    #[garde(skip)]
    pub method: EnsembleMethod,
    #[garde(range(min = 0.0, max = 1.0))]
    pub wait_threshold: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub contradiction_threshold: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        EnsembleConfig {
            method: EnsembleMethod::WeightedVote,
            wait_threshold: 0.10,
            contradiction_threshold: 0.50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FiltersConfig {
    #[garde(skip)]
    pub regime_filter: bool,
    #[garde(skip)]
    pub news_filter: bool,
    #[garde(skip)]
    pub session_filter: bool,
    #[garde(skip)]
    pub spread_filter: bool,
    #[garde(skip)]
    pub correlation_filter: bool,
    #[garde(range(min = 1.0))]
    pub max_spread_multiplier: f64,
    #[garde(range(min = 1))]
    pub correlation_window_minutes: i64,
    #[garde(range(min = 1))]
    pub correlation_group_limit: usize,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        FiltersConfig {
            regime_filter: true,
            news_filter: true,
            session_filter: true,
            spread_filter: true,
            correlation_filter: true,
            max_spread_multiplier: 3.0,
            correlation_window_minutes: 60,
            correlation_group_limit: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalStrategyConfig {
    pub strategy_id: String,
    pub enabled: bool,
    pub weight: f64,
    pub params: StrategyParams,
    /// Empty lists mean "compatible with everything".
    pub compatible_asset_classes: Vec<String>,
    pub compatible_regimes: Vec<String>,
    pub horizons: Vec<String>,
}

impl Default for SignalStrategyConfig {
    fn default() -> Self {
        SignalStrategyConfig {
            strategy_id: String::new(),
            enabled: true,
            weight: 1.0,
            params: StrategyParams::default(),
            compatible_asset_classes: Vec::new(),
            compatible_regimes: Vec::new(),
            horizons: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    pub enabled: bool,
    pub emit_on_bar_close: bool,
    pub default_horizon: String,
    pub default_lookback_bars: usize,
    pub signal_history_limit: usize,
    pub signal_expiry_minutes: i64,
    pub max_active_signals: usize,
    pub ensemble: EnsembleConfig,
    pub confidence: ConfidenceConfig,
    pub anti_overtrading: AntiOvertradingConfig,
    pub filters: FiltersConfig,
    pub strategies: Vec<SignalStrategyConfig>,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        let strategies = builtin_strategies()
            .iter()
            .map(|strategy| SignalStrategyConfig {
                strategy_id: strategy.strategy_id().to_string(),
                ..SignalStrategyConfig::default()
            })
            .collect();
        SignalsConfig {
            enabled: true,
            emit_on_bar_close: true,
            default_horizon: "2h".to_string(),
            default_lookback_bars: 300,
            signal_history_limit: 500,
            signal_expiry_minutes: 120,
            max_active_signals: 200,
            ensemble: EnsembleConfig::default(),
            confidence: ConfidenceConfig::default(),
            anti_overtrading: AntiOvertradingConfig::default(),
            filters: FiltersConfig::default(),
            strategies,
        }
    }
}

struct EngineState {
    anti: AntiOvertradingGuard,
    correlation: CorrelationFilter,
    active_signals: Vec<Signal>,
    history: VecDeque<Signal>,
}

/// Orchestrates regime detection, strategy generation, filtering,
/// ensembling, and decision emission for one run.
pub struct SignalEngine {
    config: SignalsConfig,
    #[allow(dead_code)]
    indicator_engine: Arc<IndicatorEngine>,
    regime_detector: Arc<RegimeDetector>,
    repository: Arc<DataRepository>,
    bus: Arc<EventBus>,
    journal: Arc<AuditJournal>,
    ids: Arc<IdGen>,
    run_id: String,
    ensemble: SignalEnsemble,
    scorer: ConfidenceScorer,
    regime_filter: RegimeFilter,
    news_filter: NewsFilter,
    session_filter: SessionFilter,
    spread_filter: SpreadFilter,
    strategies: Vec<(SignalStrategyConfig, Box<dyn SignalStrategy>)>,
    state: Mutex<EngineState>,
}

impl SignalEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SignalsConfig,
        indicator_engine: Arc<IndicatorEngine>,
        regime_detector: Arc<RegimeDetector>,
        repository: Arc<DataRepository>,
        bus: Arc<EventBus>,
        journal: Arc<AuditJournal>,
        ids: Arc<IdGen>,
        run_id: &str,
        news: NewsCalendar,
    ) -> Self {
        let weights: HashMap<String, f64> = config
            .strategies
            .iter()
            .map(|item| (item.strategy_id.clone(), item.weight))
            .collect();
        let ensemble = SignalEnsemble::new(
            weights,
            config.ensemble.wait_threshold,
            config.ensemble.contradiction_threshold,
        );
        let scorer = ConfidenceScorer::new(config.confidence.clone());
        let state = EngineState {
            anti: AntiOvertradingGuard::new(config.anti_overtrading.clone()),
            correlation: CorrelationFilter::new(
                config.filters.correlation_window_minutes,
                config.filters.correlation_group_limit,
            ),
            active_signals: Vec::new(),
            history: VecDeque::with_capacity(config.signal_history_limit),
        };
        let strategies = builtin_strategies()
            .into_iter()
            .filter_map(|strategy| {
                config
                    .strategies
                    .iter()
                    .find(|cfg| cfg.strategy_id == strategy.strategy_id())
                    .map(|cfg| (cfg.clone(), strategy))
            })
            .collect();
        SignalEngine {
            spread_filter: SpreadFilter::new(config.filters.max_spread_multiplier),
            config,
            indicator_engine,
            regime_detector,
            repository,
            bus,
            journal,
            ids,
            run_id: run_id.to_string(),
            ensemble,
            scorer,
            regime_filter: RegimeFilter,
            news_filter: NewsFilter::new(news),
            session_filter: SessionFilter::new(),
            strategies,
            state: Mutex::new(state),
        }
    }

    /// Run the full analysis pipeline for one symbol/timeframe.
    pub async fn analyze(
        &self,
        symbol: &str,
        broker: &str,
        timeframe: Timeframe,
        horizon: &str,
        asset_class: Option<AssetClass>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<DecisionResult> {
        let end = as_of.unwrap_or_else(Utc::now);
        let lookback = self.config.default_lookback_bars as i64;
        let start = end - Duration::seconds(timeframe.seconds() * lookback);

        let bars = self
            .repository
            .get_ohlcv(symbol, broker, timeframe, start, end, true)
            .await?;
        if bars.is_empty() {
            let regime = MarketRegime::fallback(symbol, timeframe, end);
            let ensemble =
                self.ensemble
                    .combine(Vec::new(), &regime, self.config.ensemble.method);
            return Ok(self.to_decision(
                ensemble,
                asset_class.unwrap_or(AssetClass::Unknown),
                end,
            ));
        }

        let last = bars.last().expect("non-empty bars");
        let resolved_class = asset_class.unwrap_or(last.asset_class);
        let synthetic_tick = synthetic_tick_from(last);
        let regime = self.regime_detector.detect(&bars, &synthetic_tick);

        let selection = parse_horizon(horizon)?;
        let mut signals = Vec::new();
        let mut blocked: Vec<String> = Vec::new();
        let mut passed: Vec<String> = Vec::new();

        for (cfg, strategy) in self.selected_strategies(resolved_class, &regime, &selection.canonical)
        {
            let ctx = StrategyContext {
                symbol,
                broker,
                timeframe,
                horizon: &selection.canonical,
                bars: &bars,
                regime: &regime,
                ts: last.ts_close,
                params: &cfg.params,
                run_id: &self.run_id,
                ids: &self.ids,
            };
            let Some(mut signal) = strategy.generate(&ctx) else {
                continue;
            };
            signal
                .metadata
                .insert("asset_class".into(), json!(resolved_class.as_str()));

            let (ok, mut reasons, multiplier, mut ok_names) =
                self.apply_filters(&signal, resolved_class, &bars).await;
            if !ok {
                blocked.append(&mut reasons);
                continue;
            }
            passed.append(&mut ok_names);
            signal.confidence = (signal.confidence * multiplier).min(1.0);
            signal.strength = strength_for(signal.confidence);
            signals.push(signal);
        }

        let mut ensemble = self
            .ensemble
            .combine(signals, &regime, self.config.ensemble.method);
        blocked.sort();
        blocked.dedup();
        passed.sort();
        passed.dedup();
        ensemble.filters_blocked = blocked;
        ensemble.filters_passed = passed;

        let adjusted = self.scorer.score(&ensemble);
        ensemble.final_confidence = adjusted;
        ensemble.final_strength = strength_for(adjusted);
        ensemble.explanation = explain(&ensemble);

        let mut decision = self.to_decision(ensemble, resolved_class, end);
        self.register_and_emit(&mut decision, timeframe.seconds())
            .await?;
        Ok(decision)
    }

    /// Analyze the same symbol across several timeframes.
    pub async fn analyze_multi_timeframe(
        &self,
        symbol: &str,
        broker: &str,
        timeframes: &[Timeframe],
        horizon: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<HashMap<Timeframe, DecisionResult>> {
        let mut results = HashMap::new();
        for timeframe in timeframes {
            let decision = self
                .analyze(symbol, broker, *timeframe, horizon, None, as_of)
                .await?;
            results.insert(*timeframe, decision);
        }
        Ok(results)
    }

    /// BAR_CLOSE subscriber entry point.
    pub async fn on_bar_close(
        &self,
        symbol: &str,
        broker: &str,
        timeframe: Timeframe,
        ts_close: DateTime<Utc>,
    ) -> Result<Option<DecisionResult>> {
        if !self.config.enabled || !self.config.emit_on_bar_close {
            return Ok(None);
        }
        let decision = self
            .analyze(
                symbol,
                broker,
                timeframe,
                &self.config.default_horizon,
                None,
                Some(ts_close),
            )
            .await?;
        Ok(Some(decision))
    }

    /// Non-expired active signals; expired entries are purged on query.
    pub async fn active_signals(&self, as_of: DateTime<Utc>) -> Vec<Signal> {
        let mut state = self.state.lock().await;
        state
            .active_signals
            .retain(|signal| signal.expires_at.is_none_or(|expiry| expiry > as_of));
        state.active_signals.clone()
    }

    pub async fn signal_history(&self, symbol: Option<&str>, limit: usize) -> Vec<Signal> {
        let state = self.state.lock().await;
        let filtered: Vec<Signal> = state
            .history
            .iter()
            .filter(|signal| symbol.is_none_or(|wanted| signal.symbol == wanted))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    /// Feed a trade outcome back to the anti-overtrading guard.
    pub async fn register_outcome(
        &self,
        strategy_id: &str,
        symbol: &str,
        won: bool,
        ts: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().await;
        state.anti.register_outcome(strategy_id, symbol, won, ts);
    }

    fn selected_strategies<'a>(
        &'a self,
        asset_class: AssetClass,
        regime: &MarketRegime,
        horizon: &str,
    ) -> Vec<(&'a SignalStrategyConfig, &'a dyn SignalStrategy)> {
        let horizon_class = parse_horizon(horizon)
            .map(|sel| sel.horizon_class.as_str().to_string())
            .unwrap_or_default();
        self.strategies
            .iter()
            .filter(|(cfg, _)| cfg.enabled)
            .filter(|(cfg, _)| {
                cfg.compatible_asset_classes.is_empty()
                    || cfg
                        .compatible_asset_classes
                        .iter()
                        .any(|item| item == asset_class.as_str())
            })
            .filter(|(cfg, _)| {
                cfg.compatible_regimes.is_empty()
                    || cfg
                        .compatible_regimes
                        .iter()
                        .any(|item| item == regime.trend.as_str())
            })
            .filter(|(cfg, _)| {
                cfg.horizons.is_empty() || cfg.horizons.iter().any(|item| *item == horizon_class)
            })
            .map(|(cfg, strategy)| (cfg, strategy.as_ref()))
            .collect()
    }

    async fn apply_filters(
        &self,
        signal: &Signal,
        asset_class: AssetClass,
        bars: &[OHLCVBar],
    ) -> (bool, Vec<String>, f64, Vec<String>) {
        let mut blocked = Vec::new();
        let mut passed = Vec::new();
        let mut multiplier = 1.0;
        let filters = &self.config.filters;

        if filters.regime_filter {
            let result = self.regime_filter.apply(signal);
            if result.passed {
                passed.push("regime_filter".to_string());
                multiplier *= result.confidence_multiplier;
            } else {
                blocked.push(result.reason.unwrap_or_else(|| "regime_filter".into()));
            }
        }
        if filters.news_filter && blocked.is_empty() {
            let result = self.news_filter.apply(signal, asset_class);
            if result.passed {
                passed.push("news_filter".to_string());
            } else {
                blocked.push(result.reason.unwrap_or_else(|| "news_filter".into()));
            }
        }
        if filters.session_filter && blocked.is_empty() {
            let result = self.session_filter.apply(signal, asset_class);
            if result.passed {
                passed.push("session_filter".to_string());
            } else {
                blocked.push(result.reason.unwrap_or_else(|| "session_filter".into()));
            }
        }
        if filters.spread_filter && blocked.is_empty() {
            let current = bars.last().and_then(|bar| bar.spread);
            let spreads: Vec<f64> = bars
                .iter()
                .rev()
                .take(30)
                .filter_map(|bar| bar.spread)
                .filter(|value| *value > 0.0)
                .collect();
            let average = if spreads.is_empty() {
                None
            } else {
                Some(spreads.iter().sum::<f64>() / spreads.len() as f64)
            };
            let result = self.spread_filter.apply(signal, current, average);
            if result.passed {
                passed.push("spread_filter".to_string());
            } else {
                blocked.push(result.reason.unwrap_or_else(|| "spread_filter".into()));
            }
        }
        if filters.correlation_filter && blocked.is_empty() {
            let mut state = self.state.lock().await;
            let result = state.correlation.apply(signal);
            if result.passed {
                passed.push("correlation_filter".to_string());
            } else {
                blocked.push(result.reason.unwrap_or_else(|| "correlation_filter".into()));
            }
        }

        if blocked.is_empty() {
            (true, blocked, multiplier, passed)
        } else {
            (false, blocked, 1.0, passed)
        }
    }

    fn to_decision(
        &self,
        ensemble: EnsembleResult,
        asset_class: AssetClass,
        computed_at: DateTime<Utc>,
    ) -> DecisionResult {
        let (display_decision, display_color) = match ensemble.final_direction {
            SignalDirection::Buy => ("BUY", "green"),
            SignalDirection::Sell => ("SELL", "red"),
            SignalDirection::NoTrade => ("NO TRADE", "gray"),
            SignalDirection::Wait => ("NO CLEAR SIGNAL", "yellow"),
        };
        let (pct, _strength) = self.scorer.display_confidence(ensemble.final_confidence);
        let valid_until = computed_at + Duration::minutes(self.config.signal_expiry_minutes);
        let top_reasons = ensemble.all_reasons.iter().take(5).cloned().collect();
        let horizon_human = horizon_to_human(&ensemble.horizon);
        DecisionResult {
            ensemble,
            display_decision: display_decision.to_string(),
            display_color: display_color.to_string(),
            confidence_percent: pct,
            top_reasons,
            computed_at,
            valid_until,
            asset_class,
            horizon_human,
        }
    }

    async fn register_and_emit(&self, decision: &mut DecisionResult, tf_seconds: i64) -> Result<()> {
        let signal = self.final_signal(decision);

        {
            let mut state = self.state.lock().await;
            let verdict = state.anti.evaluate(&signal, tf_seconds);
            if !verdict.allowed {
                let reason = verdict.reason.unwrap_or_else(|| "anti_overtrading".into());
                decision.ensemble.final_direction = SignalDirection::NoTrade;
                decision.ensemble.filters_blocked.push(reason.clone());
                decision.ensemble.explanation = format!("blocked by anti-overtrading: {reason}");
                decision.display_decision = "NO TRADE".to_string();
                decision.display_color = "gray".to_string();
                decision.confidence_percent = decision.confidence_percent.min(30);
                return Ok(());
            }
            state.anti.register_signal(&signal);
            state.correlation.register(&signal);
            state.active_signals.push(signal.clone());
            if state.active_signals.len() > self.config.max_active_signals {
                state.active_signals.remove(0);
            }
            if state.history.len() == self.config.signal_history_limit {
                state.history.pop_front();
            }
            state.history.push_back(signal.clone());
        }

        self.bus
            .publish(Event::Signal(SignalEvent {
                source: "signals.engine".into(),
                run_id: self.run_id.clone(),
                symbol: signal.symbol.clone(),
                broker: signal.broker.clone(),
                strategy_id: ENSEMBLE_STRATEGY_ID.into(),
                direction: signal.direction.as_str().to_string(),
                confidence: signal.confidence,
                timeframe: signal.timeframe,
                horizon: signal.horizon.clone(),
                ts: signal.ts,
            }))
            .await;

        let mut raw_inputs = Metadata::new();
        raw_inputs.insert("broker".into(), json!(signal.broker));
        raw_inputs.insert("horizon".into(), json!(signal.horizon));
        raw_inputs.insert("entry_price".into(), json!(signal.entry_price));
        let mut features = Metadata::new();
        features.insert(
            "top_reasons".into(),
            json!(signal
                .reasons
                .iter()
                .take(5)
                .map(|reason| reason.factor.clone())
                .collect::<Vec<_>>()),
        );
        let mut scores = Metadata::new();
        scores.insert("raw_score".into(), json!(signal.raw_score));
        scores.insert(
            "agreement_score".into(),
            json!(decision.ensemble.agreement_score),
        );
        scores.insert(
            "regime_trend".into(),
            json!(decision.ensemble.regime.trend.as_str()),
        );

        self.journal
            .write(&AuditEntry {
                entry_id: signal.signal_id.clone(),
                ts: signal.ts,
                run_id: self.run_id.clone(),
                strategy_id: ENSEMBLE_STRATEGY_ID.into(),
                strategy_version: "1.0.0".into(),
                symbol: signal.symbol.clone(),
                timeframe: signal.timeframe,
                raw_inputs,
                features,
                scores,
                decision: signal.direction.as_str().to_string(),
                confidence: signal.confidence,
                reasons: signal
                    .reasons
                    .iter()
                    .map(|reason| serde_json::to_value(reason).unwrap_or_default())
                    .collect(),
                triggered_rule: ENSEMBLE_STRATEGY_ID.into(),
                triggered_condition: "pipeline".into(),
            })
            .await?;

        tracing::info!(
            symbol = %decision.ensemble.symbol,
            timeframe = %decision.ensemble.timeframe,
            direction = %decision.display_decision,
            confidence = decision.confidence_percent,
            "signal decision"
        );
        Ok(())
    }

    /// Collapse a decision into the final ensemble-level signal.
    pub fn final_signal(&self, decision: &DecisionResult) -> Signal {
        let ensemble = &decision.ensemble;
        let direction_sign = match ensemble.final_direction {
            SignalDirection::Buy => 1.0,
            SignalDirection::Sell => -1.0,
            _ => 0.0,
        };
        let mut metadata = Metadata::new();
        metadata.insert("asset_class".into(), json!(decision.asset_class.as_str()));
        Signal {
            signal_id: self.ids.next("sig"),
            strategy_id: ENSEMBLE_STRATEGY_ID.into(),
            strategy_version: "1.0.0".into(),
            symbol: ensemble.symbol.clone(),
            broker: ensemble.broker.clone(),
            timeframe: ensemble.timeframe,
            ts: ensemble.ts,
            run_id: self.run_id.clone(),
            direction: ensemble.final_direction,
            strength: ensemble.final_strength,
            raw_score: ensemble.final_confidence * 100.0 * direction_sign,
            confidence: ensemble.final_confidence,
            reasons: ensemble.all_reasons.iter().take(10).cloned().collect(),
            regime: ensemble.regime.clone(),
            horizon: ensemble.horizon.clone(),
            entry_price: ensemble
                .contributing_signals
                .first()
                .and_then(|signal| signal.entry_price),
            expires_at: Some(decision.valid_until),
            metadata,
        }
    }
}

fn synthetic_tick_from(bar: &OHLCVBar) -> Tick {
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
        source: "signal_engine".into(),
    }
}

fn explain(ensemble: &EnsembleResult) -> String {
    let top = ensemble
        .all_reasons
        .first()
        .map_or_else(|| "no dominant factor".to_string(), |r| r.factor.clone());
    format!(
        "{} at {:.0}% confidence ({} contributing, top factor {top})",
        ensemble.final_direction.as_str(),
        ensemble.final_confidence * 100.0,
        ensemble.contributing_signals.len(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MockConnector;
    use crate::regime::RegimeConfig;
    use crate::storage::{BarCache, MetadataStore, ParquetStore};
    use chrono::TimeZone;

    async fn engine_fixture(dir: &std::path::Path) -> SignalEngine {
        let mut connectors: HashMap<String, Arc<dyn crate::data::DataConnector>> = HashMap::new();
        connectors.insert("mock_dev".into(), Arc::new(MockConnector::new("mock_dev", 42)));
        let repository = Arc::new(DataRepository::new(
            Arc::new(ParquetStore::new(dir)),
            Arc::new(MetadataStore::in_memory().unwrap()),
            Arc::new(BarCache::new(64)),
            connectors,
            None,
        ));
        SignalEngine::new(
            SignalsConfig::default(),
            Arc::new(IndicatorEngine::new(true, 300)),
            Arc::new(RegimeDetector::new(RegimeConfig::default())),
            repository,
            Arc::new(EventBus::new()),
            Arc::new(AuditJournal::new(dir.join("audit.jsonl"))),
            Arc::new(IdGen::new("test")),
            "test",
            NewsCalendar::default(),
        )
    }

    #[tokio::test]
    async fn analyze_produces_a_decision() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_fixture(dir.path()).await;
        let as_of = Utc.with_ymd_and_hms(2024, 2, 1, 15, 0, 0).unwrap();
        let decision = engine
            .analyze("EURUSD", "mock_dev", Timeframe::H1, "2h", None, Some(as_of))
            .await
            .unwrap();
        assert!(decision.confidence_percent <= 100);
        assert_eq!(decision.valid_until, decision.computed_at + Duration::minutes(120));
        assert!(!decision.display_decision.is_empty());
    }

    #[tokio::test]
    async fn analyze_writes_audit_trail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_fixture(dir.path()).await;
        let as_of = Utc.with_ymd_and_hms(2024, 2, 1, 15, 0, 0).unwrap();
        engine
            .analyze("EURUSD", "mock_dev", Timeframe::H1, "2h", None, Some(as_of))
            .await
            .unwrap();
        let audit = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        assert_eq!(audit.lines().count(), 1);
        assert!(audit.contains("signal_ensemble"));
    }

    #[tokio::test]
    async fn repeated_analysis_hits_anti_overtrading() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_fixture(dir.path()).await;
        let as_of = Utc.with_ymd_and_hms(2024, 2, 1, 15, 0, 0).unwrap();
        engine
            .analyze("EURUSD", "mock_dev", Timeframe::H1, "2h", None, Some(as_of))
            .await
            .unwrap();
        // Second decision one minute later: inside the cooldown window.
        let second = engine
            .analyze(
                "EURUSD",
                "mock_dev",
                Timeframe::H1,
                "2h",
                None,
                Some(as_of + Duration::minutes(1)),
            )
            .await
            .unwrap();
        assert_eq!(second.ensemble.final_direction, SignalDirection::NoTrade);
        assert!(second
            .ensemble
            .filters_blocked
            .iter()
            .any(|reason| reason == "cooldown_bars"));
    }

    #[tokio::test]
    async fn empty_data_yields_no_trade() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_fixture(dir.path()).await;
        // Replace repository with one that has no connectors.
        engine.repository = Arc::new(DataRepository::new(
            Arc::new(ParquetStore::new(dir.path().join("empty"))),
            Arc::new(MetadataStore::in_memory().unwrap()),
            Arc::new(BarCache::new(8)),
            HashMap::new(),
            None,
        ));
        let as_of = Utc.with_ymd_and_hms(2024, 2, 1, 15, 0, 0).unwrap();
        let decision = engine
            .analyze("EURUSD", "missing", Timeframe::H1, "2h", None, Some(as_of))
            .await
            .unwrap();
        assert_eq!(decision.ensemble.final_direction, SignalDirection::NoTrade);
    }

    #[tokio::test]
    async fn active_signals_purge_expired() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_fixture(dir.path()).await;
        let as_of = Utc.with_ymd_and_hms(2024, 2, 1, 15, 0, 0).unwrap();
        engine
            .analyze("EURUSD", "mock_dev", Timeframe::H1, "2h", None, Some(as_of))
            .await
            .unwrap();
        let live = engine.active_signals(as_of).await;
        assert_eq!(live.len(), 1);
        let after_expiry = engine
            .active_signals(as_of + Duration::minutes(121 + 120))
            .await;
        assert!(after_expiry.is_empty());
    }
}
