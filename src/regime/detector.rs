use serde::{Deserialize, Serialize};

use crate::data::{AssetClass, OHLCVBar, Tick};
use crate::indicators;

use super::sessions::SessionManager;
use super::{LiquidityRegime, MarketRegime, NewsCalendar, TrendRegime, VolatilityRegime};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub adx_strong_threshold: f64,
    pub atr_period: usize,
    pub atr_history_bars: usize,
    pub spread_spike_multiplier: f64,
    pub min_bars: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            adx_strong_threshold: 25.0,
            atr_period: 14,
            atr_history_bars: 100,
            spread_spike_multiplier: 3.0,
            min_bars: 50,
        }
    }
}

/// Trend / volatility / liquidity classifier over a bar window plus the
/// current tick. Pure function of its inputs.
pub struct RegimeDetector {
    config: RegimeConfig,
    sessions: SessionManager,
    news: NewsCalendar,
}

impl RegimeDetector {
    pub fn new(config: RegimeConfig) -> Self {
        RegimeDetector {
            config,
            sessions: SessionManager::new(),
            news: NewsCalendar::default(),
        }
    }

    pub fn with_news(mut self, news: NewsCalendar) -> Self {
        self.news = news;
        self
    }

    pub fn detect(&self, bars: &[OHLCVBar], current_tick: &Tick) -> MarketRegime {
        let Some(last) = bars.last() else {
            return MarketRegime::fallback(
                &current_tick.symbol,
                crate::data::Timeframe::H1,
                current_tick.ts,
            );
        };
        if bars.len() < self.config.min_bars {
            return MarketRegime::fallback(&last.symbol, last.timeframe, last.ts_close);
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();

        let ema20 = indicators::ema_last(&closes, 20);
        let ema50 = indicators::ema_last(&closes, 50);
        let ema200 = indicators::ema_last(&closes, 200.min(closes.len().saturating_sub(1)).max(2));
        let adx = indicators::adx_last(&closes, &highs, &lows, 14);

        let trend = classify_trend(ema20, ema50, ema200, adx, self.config.adx_strong_threshold);

        let atr_series =
            indicators::atr_series(&closes, &highs, &lows, self.config.atr_period);
        let (volatility, atr, atr_percentile) =
            classify_volatility(&atr_series, self.config.atr_history_bars);

        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        let (liquidity, volume_ratio) = classify_liquidity(&volumes);

        let spread = current_tick
            .spread
            .unwrap_or(current_tick.ask - current_tick.bid);
        let spreads: Vec<f64> = bars
            .iter()
            .filter_map(|b| b.spread)
            .filter(|s| *s > 0.0)
            .collect();
        let avg_spread = if spreads.is_empty() {
            current_tick.reference_price().max(1e-9) * 0.0002
        } else {
            spreads.iter().sum::<f64>() / spreads.len() as f64
        };
        let spread_ratio = if avg_spread <= 1e-12 { 0.0 } else { spread / avg_spread };

        let mut reasons: Vec<String> = Vec::new();
        if volatility == VolatilityRegime::Extreme {
            reasons.push("extreme_volatility".into());
        }
        if liquidity == LiquidityRegime::Illiquid {
            reasons.push("illiquid".into());
        }
        if spread_ratio > self.config.spread_spike_multiplier {
            reasons.push("spread_spike".into());
        }
        if price_frozen(&closes) {
            reasons.push("price_freeze".into());
        }
        if last.asset_class != AssetClass::Crypto
            && self.sessions.session_quality(last.asset_class, last.ts_close) < 0.4
        {
            reasons.push("bad_session".into());
        }
        if self
            .news
            .in_news_window(&last.symbol, last.asset_class, last.ts_close, 30, 15)
            .is_some()
        {
            reasons.push("news_window".into());
        }

        let confidence = regime_confidence(trend, adx, atr_percentile);
        let recommended = recommended_strategies(trend);
        let description = format!(
            "{} / {:?} volatility / {:?} liquidity",
            trend.as_str(),
            volatility,
            liquidity
        )
        .to_lowercase();

        let mut metrics = std::collections::HashMap::new();
        metrics.insert("adx".into(), adx);
        metrics.insert("atr".into(), atr);
        metrics.insert("atr_percentile".into(), atr_percentile);
        metrics.insert("ema20".into(), ema20);
        metrics.insert("ema50".into(), ema50);
        metrics.insert("ema200".into(), ema200);
        metrics.insert("volume_ratio".into(), volume_ratio);
        metrics.insert("spread_ratio".into(), spread_ratio);

        MarketRegime {
            symbol: last.symbol.clone(),
            timeframe: last.timeframe,
            ts: last.ts_close,
            trend,
            volatility,
            liquidity,
            is_tradeable: reasons.is_empty(),
            no_trade_reasons: reasons,
            confidence,
            recommended_strategies: recommended,
            description,
            metrics,
        }
    }
}

fn classify_trend(
    ema20: f64,
    ema50: f64,
    ema200: f64,
    adx: f64,
    adx_strong: f64,
) -> TrendRegime {
    if !ema20.is_finite() || !ema50.is_finite() {
        return TrendRegime::Ranging;
    }
    let stacked_up = ema20 > ema50 && (!ema200.is_finite() || ema50 > ema200);
    let stacked_down = ema20 < ema50 && (!ema200.is_finite() || ema50 < ema200);
    if stacked_up && adx >= adx_strong {
        TrendRegime::StrongUptrend
    } else if stacked_down && adx >= adx_strong {
        TrendRegime::StrongDowntrend
    } else if stacked_up {
        TrendRegime::WeakUptrend
    } else if stacked_down {
        TrendRegime::WeakDowntrend
    } else {
        TrendRegime::Ranging
    }
}

fn classify_volatility(atr_series: &[f64], history_bars: usize) -> (VolatilityRegime, f64, f64) {
    let finite: Vec<f64> = atr_series.iter().copied().filter(|v| v.is_finite()).collect();
    let Some(&current) = finite.last() else {
        return (VolatilityRegime::Medium, 0.0, 0.5);
    };
    let window: Vec<f64> = finite
        .iter()
        .copied()
        .rev()
        .take(history_bars)
        .collect();
    // Midrank percentile so a flat volatility series reads as mid-bucket.
    let below = window.iter().filter(|v| **v < current).count();
    let equal = window.iter().filter(|v| **v == current).count();
    let percentile = (below as f64 + 0.5 * equal as f64) / window.len() as f64;
    let bucket = if percentile < 0.2 {
        VolatilityRegime::VeryLow
    } else if percentile < 0.4 {
        VolatilityRegime::Low
    } else if percentile < 0.7 {
        VolatilityRegime::Medium
    } else if percentile < 0.9 {
        VolatilityRegime::High
    } else {
        VolatilityRegime::Extreme
    };
    (bucket, current, percentile)
}

fn classify_liquidity(volumes: &[f64]) -> (LiquidityRegime, f64) {
    if volumes.len() < 20 {
        return (LiquidityRegime::Liquid, 1.0);
    }
    let current = *volumes.last().unwrap_or(&0.0);
    let mut sorted = volumes.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let p5 = sorted[(0.05 * sorted.len() as f64).floor() as usize];
    let median = sorted[sorted.len() / 2];
    let ratio = if median <= 1e-12 { 0.0 } else { current / median };
    let bucket = if current <= p5 {
        LiquidityRegime::Illiquid
    } else if ratio < 0.5 {
        LiquidityRegime::Thin
    } else {
        LiquidityRegime::Liquid
    };
    (bucket, ratio)
}

fn price_frozen(closes: &[f64]) -> bool {
    if closes.len() < 5 {
        return false;
    }
    let recent = &closes[closes.len() - 5..];
    let max = recent.iter().copied().fold(f64::MIN, f64::max);
    let min = recent.iter().copied().fold(f64::MAX, f64::min);
    (max - min).abs() <= 1e-10
}

fn regime_confidence(trend: TrendRegime, adx: f64, atr_percentile: f64) -> f64 {
    let trend_term = match trend {
        TrendRegime::StrongUptrend | TrendRegime::StrongDowntrend => (adx / 100.0).min(0.4),
        TrendRegime::WeakUptrend | TrendRegime::WeakDowntrend => (adx / 150.0).min(0.25),
        TrendRegime::Ranging => 0.15,
    };
    // Mid-distribution volatility reads cleaner than the extremes.
    let vol_term = 0.1 * (1.0 - (atr_percentile - 0.5).abs() * 2.0).max(0.0);
    (0.5 + trend_term + vol_term).clamp(0.0, 1.0)
}

fn recommended_strategies(trend: TrendRegime) -> Vec<String> {
    match trend {
        TrendRegime::StrongUptrend | TrendRegime::StrongDowntrend => vec![
            "trend_following".into(),
            "momentum_breakout".into(),
            "swing_composite".into(),
        ],
        TrendRegime::WeakUptrend | TrendRegime::WeakDowntrend => vec![
            "trend_following".into(),
            "swing_composite".into(),
        ],
        TrendRegime::Ranging => vec![
            "mean_reversion".into(),
            "range_scalp".into(),
            "scalping_reversal".into(),
        ],
    }
}
