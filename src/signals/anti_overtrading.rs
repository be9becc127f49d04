use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use garde::Validate;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::Signal;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AntiOvertradingConfig {
    #[garde(skip)]
    pub enabled: bool,
    #[garde(range(min = 0))]
    pub cooldown_bars: i64,
    #[garde(range(min = 1))]
    pub max_signals_per_hour: usize,
    #[garde(range(min = 1))]
    pub consecutive_loss_pause_count: usize,
    #[garde(range(min = 0.0))]
    pub pause_hours: f64,
}

impl Default for AntiOvertradingConfig {
    fn default() -> Self {
        AntiOvertradingConfig {
            enabled: true,
            cooldown_bars: 3,
            max_signals_per_hour: 6,
            consecutive_loss_pause_count: 3,
            pause_hours: 4.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AntiOvertradingDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl AntiOvertradingDecision {
    fn allowed() -> Self {
        AntiOvertradingDecision {
            allowed: true,
            reason: None,
        }
    }

    fn blocked(reason: &str) -> Self {
        AntiOvertradingDecision {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Per (strategy, symbol) guard against signal churn: cooldown in bars,
/// hourly rate limit, and pause after consecutive losses.
pub struct AntiOvertradingGuard {
    config: AntiOvertradingConfig,
    signal_times: FxHashMap<String, VecDeque<DateTime<Utc>>>,
    last_signal: FxHashMap<String, DateTime<Utc>>,
    paused_until: FxHashMap<String, DateTime<Utc>>,
    loss_streak: FxHashMap<String, usize>,
}

impl AntiOvertradingGuard {
    pub fn new(config: AntiOvertradingConfig) -> Self {
        AntiOvertradingGuard {
            config,
            signal_times: FxHashMap::default(),
            last_signal: FxHashMap::default(),
            paused_until: FxHashMap::default(),
            loss_streak: FxHashMap::default(),
        }
    }

    pub fn evaluate(&mut self, signal: &Signal, timeframe_seconds: i64) -> AntiOvertradingDecision {
        if !self.config.enabled {
            return AntiOvertradingDecision::allowed();
        }

        let key = guard_key(&signal.strategy_id, &signal.symbol);
        let now = signal.ts;

        if let Some(paused_until) = self.paused_until.get(&key) {
            if now < *paused_until {
                return AntiOvertradingDecision::blocked("strategy_pause_after_losses");
            }
        }

        if let Some(last) = self.last_signal.get(&key) {
            let cooldown = Duration::seconds(timeframe_seconds * self.config.cooldown_bars);
            if now - *last < cooldown {
                return AntiOvertradingDecision::blocked("cooldown_bars");
            }
        }

        let one_hour_ago = now - Duration::hours(1);
        let window = self.signal_times.entry(key).or_default();
        while window.front().is_some_and(|ts| *ts < one_hour_ago) {
            window.pop_front();
        }
        if window.len() >= self.config.max_signals_per_hour {
            return AntiOvertradingDecision::blocked("max_signals_per_hour");
        }

        AntiOvertradingDecision::allowed()
    }

    /// Record an accepted signal in the rate counters.
    pub fn register_signal(&mut self, signal: &Signal) {
        let key = guard_key(&signal.strategy_id, &signal.symbol);
        self.last_signal.insert(key.clone(), signal.ts);
        self.signal_times.entry(key).or_default().push_back(signal.ts);
    }

    /// Track trade outcomes; N consecutive losses pause the pair.
    pub fn register_outcome(
        &mut self,
        strategy_id: &str,
        symbol: &str,
        won: bool,
        ts: DateTime<Utc>,
    ) {
        let key = guard_key(strategy_id, symbol);
        if won {
            self.loss_streak.insert(key, 0);
            return;
        }
        let streak = self.loss_streak.entry(key.clone()).or_insert(0);
        *streak += 1;
        if *streak < self.config.consecutive_loss_pause_count {
            return;
        }
        let pause = Duration::seconds((self.config.pause_hours * 3600.0) as i64);
        self.paused_until.insert(key.clone(), ts + pause);
        self.loss_streak.insert(key, 0);
    }
}

fn guard_key(strategy_id: &str, symbol: &str) -> String {
    format!("{strategy_id}|{symbol}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IdGen;
    use crate::data::{Metadata, Timeframe};
    use crate::regime::MarketRegime;
    use crate::signals::{strength_for, SignalDirection};
    use chrono::TimeZone;

    fn signal_at(ts: DateTime<Utc>) -> Signal {
        let ids = IdGen::new("test");
        Signal {
            signal_id: ids.next("sig"),
            strategy_id: "trend_following".into(),
            strategy_version: "1.0.0".into(),
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            timeframe: Timeframe::H1,
            ts,
            run_id: "test".into(),
            direction: SignalDirection::Buy,
            strength: strength_for(0.7),
            raw_score: 65.0,
            confidence: 0.7,
            reasons: vec![],
            regime: MarketRegime::fallback("EURUSD", Timeframe::H1, ts),
            horizon: "2h".into(),
            entry_price: Some(1.1),
            expires_at: None,
            metadata: Metadata::new(),
        }
    }

    fn base_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn cooldown_blocks_second_signal() {
        let mut guard = AntiOvertradingGuard::new(AntiOvertradingConfig::default());
        let first = signal_at(base_ts());
        assert!(guard.evaluate(&first, 3600).allowed);
        guard.register_signal(&first);

        // Two bars later: still inside the 3-bar cooldown.
        let second = signal_at(base_ts() + Duration::hours(2));
        let decision = guard.evaluate(&second, 3600);
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("cooldown_bars"));

        // After the cooldown the signal passes again.
        let third = signal_at(base_ts() + Duration::hours(3));
        assert!(guard.evaluate(&third, 3600).allowed);
    }

    #[test]
    fn hourly_rate_limit() {
        let mut config = AntiOvertradingConfig::default();
        config.cooldown_bars = 0;
        config.max_signals_per_hour = 2;
        let mut guard = AntiOvertradingGuard::new(config);

        for i in 0..2 {
            let signal = signal_at(base_ts() + Duration::minutes(i * 10));
            assert!(guard.evaluate(&signal, 60).allowed);
            guard.register_signal(&signal);
        }
        let third = signal_at(base_ts() + Duration::minutes(30));
        let decision = guard.evaluate(&third, 60);
        assert_eq!(decision.reason.as_deref(), Some("max_signals_per_hour"));

        // The sliding window frees up after an hour.
        let later = signal_at(base_ts() + Duration::minutes(90));
        assert!(guard.evaluate(&later, 60).allowed);
    }

    #[test]
    fn losses_pause_the_pair() {
        let mut guard = AntiOvertradingGuard::new(AntiOvertradingConfig::default());
        for _ in 0..3 {
            guard.register_outcome("trend_following", "EURUSD", false, base_ts());
        }
        let during_pause = signal_at(base_ts() + Duration::hours(1));
        let decision = guard.evaluate(&during_pause, 3600);
        assert_eq!(
            decision.reason.as_deref(),
            Some("strategy_pause_after_losses")
        );

        let after_pause = signal_at(base_ts() + Duration::hours(5));
        assert!(guard.evaluate(&after_pause, 3600).allowed);
    }

    #[test]
    fn win_resets_streak() {
        let mut guard = AntiOvertradingGuard::new(AntiOvertradingConfig::default());
        guard.register_outcome("trend_following", "EURUSD", false, base_ts());
        guard.register_outcome("trend_following", "EURUSD", false, base_ts());
        guard.register_outcome("trend_following", "EURUSD", true, base_ts());
        guard.register_outcome("trend_following", "EURUSD", false, base_ts());
        let signal = signal_at(base_ts() + Duration::hours(1));
        assert!(guard.evaluate(&signal, 3600).allowed);
    }

    #[test]
    fn disabled_guard_allows_everything() {
        let mut config = AntiOvertradingConfig::default();
        config.enabled = false;
        let mut guard = AntiOvertradingGuard::new(config);
        let first = signal_at(base_ts());
        guard.register_signal(&first);
        assert!(guard.evaluate(&first, 3600).allowed);
    }
}
