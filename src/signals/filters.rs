use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;

use crate::data::AssetClass;
use crate::regime::{NewsCalendar, SessionManager, TrendRegime, VolatilityRegime};

use super::{Signal, SignalDirection};

/// Result of applying one signal filter.
#[derive(Debug, Clone)]
pub struct FilterResult {
    pub passed: bool,
    pub reason: Option<String>,
    pub confidence_multiplier: f64,
}

impl FilterResult {
    pub fn pass() -> Self {
        FilterResult {
            passed: true,
            reason: None,
            confidence_multiplier: 1.0,
        }
    }

    pub fn pass_attenuated(reason: &str, multiplier: f64) -> Self {
        FilterResult {
            passed: true,
            reason: Some(reason.to_string()),
            confidence_multiplier: multiplier,
        }
    }

    pub fn block(reason: &str) -> Self {
        FilterResult {
            passed: false,
            reason: Some(reason.to_string()),
            confidence_multiplier: 1.0,
        }
    }
}

/// Block or attenuate signals based on the market regime.
#[derive(Debug, Default)]
pub struct RegimeFilter;

impl RegimeFilter {
    pub fn apply(&self, signal: &Signal) -> FilterResult {
        let regime = &signal.regime;

        if regime.volatility == VolatilityRegime::Extreme {
            return FilterResult::block("extreme_volatility");
        }
        if signal.direction == SignalDirection::Buy
            && regime.trend == TrendRegime::StrongDowntrend
        {
            return FilterResult::block("buy_vs_strong_downtrend");
        }
        if signal.direction == SignalDirection::Sell
            && regime.trend == TrendRegime::StrongUptrend
        {
            return FilterResult::block("sell_vs_strong_uptrend");
        }
        if signal.strategy_id == "trend_following" && regime.trend == TrendRegime::Ranging {
            return FilterResult::pass_attenuated("trend_following_in_range", 0.70);
        }
        FilterResult::pass()
    }
}

/// Block signals inside scheduled macro-news windows.
pub struct NewsFilter {
    calendar: NewsCalendar,
    minutes_before: i64,
    minutes_after: i64,
}

impl NewsFilter {
    pub fn new(calendar: NewsCalendar) -> Self {
        NewsFilter {
            calendar,
            minutes_before: 30,
            minutes_after: 15,
        }
    }

    pub fn apply(&self, signal: &Signal, asset_class: AssetClass) -> FilterResult {
        match self.calendar.in_news_window(
            &signal.symbol,
            asset_class,
            signal.ts,
            self.minutes_before,
            self.minutes_after,
        ) {
            Some(event) => FilterResult::block(&format!("news_window_{}", event.event_id)),
            None => FilterResult::pass(),
        }
    }
}

/// Reject signals in low-quality sessions; crypto always passes.
pub struct SessionFilter {
    sessions: SessionManager,
    min_quality: f64,
}

impl SessionFilter {
    pub fn new() -> Self {
        SessionFilter {
            sessions: SessionManager::new(),
            min_quality: 0.4,
        }
    }

    pub fn apply(&self, signal: &Signal, asset_class: AssetClass) -> FilterResult {
        let quality = self.sessions.session_quality(asset_class, signal.ts);
        if quality >= self.min_quality {
            FilterResult::pass()
        } else {
            FilterResult::block("bad_session")
        }
    }
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject signals when the current spread spikes above the recent average.
pub struct SpreadFilter {
    max_multiplier: f64,
}

impl SpreadFilter {
    pub fn new(max_multiplier: f64) -> Self {
        SpreadFilter { max_multiplier }
    }

    pub fn apply(
        &self,
        _signal: &Signal,
        current_spread: Option<f64>,
        average_spread: Option<f64>,
    ) -> FilterResult {
        let (Some(current), Some(average)) = (current_spread, average_spread) else {
            return FilterResult::pass();
        };
        if average <= 0.0 {
            return FilterResult::pass();
        }
        if current / average > self.max_multiplier {
            FilterResult::block("spread_spike")
        } else {
            FilterResult::pass()
        }
    }
}

/// Throttle simultaneous exposures within a correlation group over a
/// sliding window.
pub struct CorrelationFilter {
    window: Duration,
    group_limit: usize,
    history: FxHashMap<String, VecDeque<DateTime<Utc>>>,
}

impl CorrelationFilter {
    pub fn new(window_minutes: i64, group_limit: usize) -> Self {
        CorrelationFilter {
            window: Duration::minutes(window_minutes),
            group_limit,
            history: FxHashMap::default(),
        }
    }

    pub fn apply(&mut self, signal: &Signal) -> FilterResult {
        let group = correlation_group(&signal.symbol);
        let boundary = signal.ts - self.window;
        let bucket = self.history.entry(group.clone()).or_default();
        while bucket.front().is_some_and(|ts| *ts < boundary) {
            bucket.pop_front();
        }
        if bucket.len() >= self.group_limit {
            FilterResult::block(&format!("correlation_limit_{group}"))
        } else {
            FilterResult::pass()
        }
    }

    pub fn register(&mut self, signal: &Signal) {
        let group = correlation_group(&signal.symbol);
        self.history.entry(group).or_default().push_back(signal.ts);
    }
}

/// Correlation group key: USD-quoted symbols share one bucket; otherwise
/// the base-currency prefix.
pub fn correlation_group(symbol: &str) -> String {
    let upper = symbol.to_uppercase();
    if upper.contains("USD") {
        return "usd".to_string();
    }
    if upper.len() >= 6 {
        return upper[..3].to_string();
    }
    upper
}
