use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rustc_hash::FxHashMap;

use crate::data::OHLCVBar;

/// Indicator request with parameters. `key()` is the canonical cache/series
/// identifier, stable across runs.
#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorSpec {
    Ema { period: usize },
    Sma { period: usize },
    Rsi { period: usize },
    Atr { period: usize },
    Adx { period: usize },
    BollingerPercentB { period: usize, std_dev: f64 },
    StochasticK { period: usize },
    MacdHistogram,
    Slope { period: usize },
    VolumeRatio { lookback: usize },
}

impl IndicatorSpec {
    pub fn key(&self) -> String {
        match self {
            IndicatorSpec::Ema { period } => format!("ema_{period}"),
            IndicatorSpec::Sma { period } => format!("sma_{period}"),
            IndicatorSpec::Rsi { period } => format!("rsi_{period}"),
            IndicatorSpec::Atr { period } => format!("atr_{period}"),
            IndicatorSpec::Adx { period } => format!("adx_{period}"),
            IndicatorSpec::BollingerPercentB { period, std_dev } => {
                format!("percent_b_{period}_{std_dev:.1}")
            }
            IndicatorSpec::StochasticK { period } => format!("stoch_k_{period}"),
            IndicatorSpec::MacdHistogram => "macd_histogram".to_string(),
            IndicatorSpec::Slope { period } => format!("slope_{period}"),
            IndicatorSpec::VolumeRatio { lookback } => format!("volume_ratio_{lookback}"),
        }
    }
}

type Batch = Arc<FxHashMap<String, Vec<f64>>>;

/// Deterministic batch/per-bar indicator computation with a TTL cache.
///
/// Series are padded with NaN to the input length so indexes line up with
/// the source bars.
pub struct IndicatorEngine {
    cache: DashMap<u64, (Instant, Batch)>,
    cache_enabled: bool,
    cache_ttl: Duration,
}

impl IndicatorEngine {
    pub fn new(cache_enabled: bool, cache_ttl_seconds: u64) -> Self {
        IndicatorEngine {
            cache: DashMap::new(),
            cache_enabled,
            cache_ttl: Duration::from_secs(cache_ttl_seconds),
        }
    }

    /// Compute every requested series over the bars. O(specs × bars).
    pub fn compute_batch(
        &self,
        specs: &[IndicatorSpec],
        bars: &[OHLCVBar],
        use_cache: bool,
    ) -> Batch {
        let cache_key = self.cache_key(specs, bars);
        if self.cache_enabled && use_cache {
            if let Some(entry) = self.cache.get(&cache_key) {
                if entry.0.elapsed() < self.cache_ttl {
                    return entry.1.clone();
                }
            }
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

        let mut result = FxHashMap::default();
        for spec in specs {
            let series = match spec {
                IndicatorSpec::Ema { period } => ema_series(&closes, *period),
                IndicatorSpec::Sma { period } => sma_series(&closes, *period),
                IndicatorSpec::Rsi { period } => rsi_series(&closes, *period),
                IndicatorSpec::Atr { period } => atr_series(&closes, &highs, &lows, *period),
                IndicatorSpec::Adx { period } => adx_series(&closes, &highs, &lows, *period),
                IndicatorSpec::BollingerPercentB { period, std_dev } => {
                    percent_b_series(&closes, *period, *std_dev)
                }
                IndicatorSpec::StochasticK { period } => stochastic_series(&closes, *period),
                IndicatorSpec::MacdHistogram => macd_histogram_series(&closes),
                IndicatorSpec::Slope { period } => slope_series(&closes, *period),
                IndicatorSpec::VolumeRatio { lookback } => volume_ratio_series(&volumes, *lookback),
            };
            result.insert(spec.key(), series);
        }

        let batch: Batch = Arc::new(result);
        if self.cache_enabled && use_cache {
            self.cache.insert(cache_key, (Instant::now(), batch.clone()));
        }
        batch
    }

    /// Latest finite value per spec for the newest bar.
    pub fn compute_for_bar(
        &self,
        specs: &[IndicatorSpec],
        bars: &[OHLCVBar],
    ) -> FxHashMap<String, f64> {
        let batch = self.compute_batch(specs, bars, true);
        let mut latest = FxHashMap::default();
        for (key, series) in batch.iter() {
            if let Some(value) = series.iter().rev().find(|v| v.is_finite()) {
                latest.insert(key.clone(), *value);
            }
        }
        latest
    }

    fn cache_key(&self, specs: &[IndicatorSpec], bars: &[OHLCVBar]) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        for spec in specs {
            spec.key().hash(&mut hasher);
        }
        if let Some(first) = bars.first() {
            first.symbol.hash(&mut hasher);
            first.broker.hash(&mut hasher);
            first.timeframe.as_str().hash(&mut hasher);
        }
        // Tail hash: the last 64 bars identify the series state.
        for bar in bars.iter().rev().take(64) {
            bar.ts_open.timestamp().hash(&mut hasher);
            bar.close.to_bits().hash(&mut hasher);
        }
        bars.len().hash(&mut hasher);
        hasher.finish()
    }
}

/// Left-pad a shorter bulk output with NaN so it aligns with the input.
fn pad_series(values: &[f64], n: usize) -> Vec<f64> {
    let mut padded = vec![f64::NAN; n.saturating_sub(values.len())];
    padded.extend_from_slice(values);
    padded.truncate(n);
    padded
}

pub fn ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    let n = prices.len();
    if n < period || period == 0 {
        return vec![f64::NAN; n];
    }
    let ema = rust_ti::standard_indicators::bulk::exponential_moving_average(prices, period);
    pad_series(&ema, n)
}

pub fn sma_series(prices: &[f64], period: usize) -> Vec<f64> {
    let n = prices.len();
    if n < period || period == 0 {
        return vec![f64::NAN; n];
    }
    let sma = rust_ti::standard_indicators::bulk::simple_moving_average(prices, period);
    pad_series(&sma, n)
}

pub fn rsi_series(prices: &[f64], period: usize) -> Vec<f64> {
    let n = prices.len();
    if n <= period || period == 0 {
        return vec![f64::NAN; n];
    }
    let rsi = rust_ti::momentum_indicators::bulk::relative_strength_index(
        prices,
        rust_ti::ConstantModelType::SmoothedMovingAverage,
        period,
    );
    pad_series(&rsi, n)
}

pub fn macd_histogram_series(prices: &[f64]) -> Vec<f64> {
    let n = prices.len();
    if n < 34 {
        return vec![f64::NAN; n];
    }
    let macd = rust_ti::standard_indicators::bulk::macd(prices);
    let histogram: Vec<f64> = macd.iter().map(|t| t.2).collect();
    pad_series(&histogram, n)
}

pub fn atr_series(close: &[f64], high: &[f64], low: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    if n < period || period == 0 {
        return vec![f64::NAN; n];
    }
    let atr: Vec<f64> = (0..=n - period)
        .map(|i| {
            let end = i + period;
            rust_ti::other_indicators::single::average_true_range(
                &close[i..end],
                &high[i..end],
                &low[i..end],
                rust_ti::ConstantModelType::SimpleMovingAverage,
            )
        })
        .collect();
    pad_series(&atr, n)
}

pub fn percent_b_series(prices: &[f64], period: usize, std_dev: f64) -> Vec<f64> {
    let n = prices.len();
    if n < period || period == 0 {
        return vec![f64::NAN; n];
    }
    let bands = rust_ti::candle_indicators::bulk::moving_constant_bands(
        prices,
        rust_ti::ConstantModelType::SimpleMovingAverage,
        rust_ti::DeviationModel::StandardDeviation,
        std_dev,
        period,
    );
    let lower: Vec<f64> = bands.iter().map(|t| t.0).collect();
    let upper: Vec<f64> = bands.iter().map(|t| t.2).collect();
    let lower = pad_series(&lower, n);
    let upper = pad_series(&upper, n);
    prices
        .iter()
        .zip(lower.iter().zip(upper.iter()))
        .map(|(&price, (&lo, &hi))| {
            if !lo.is_finite() || !hi.is_finite() || (hi - lo).abs() <= 1e-12 {
                f64::NAN
            } else {
                (price - lo) / (hi - lo)
            }
        })
        .collect()
}

pub fn stochastic_series(prices: &[f64], period: usize) -> Vec<f64> {
    let n = prices.len();
    if n < period || period == 0 {
        return vec![f64::NAN; n];
    }
    let stoch: Vec<f64> = prices
        .windows(period)
        .map(|w| rust_ti::momentum_indicators::single::stochastic_oscillator(w))
        .collect();
    pad_series(&stoch, n)
}

/// Directional-movement trend strength (ADX). Simple moving-average
/// smoothing over the DX series, matching the SMA models used elsewhere.
pub fn adx_series(close: &[f64], high: &[f64], low: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    if period == 0 || n < 2 * period + 1 {
        return vec![f64::NAN; n];
    }

    let mut tr = Vec::with_capacity(n - 1);
    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    for i in 1..n {
        let range = (high[i] - low[i])
            .max((high[i] - close[i - 1]).abs())
            .max((low[i] - close[i - 1]).abs());
        tr.push(range);
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let window_mean = |values: &[f64], idx: usize| -> f64 {
        values[idx + 1 - period..=idx].iter().sum::<f64>() / period as f64
    };

    let mut dx = Vec::new();
    for i in period - 1..tr.len() {
        let atr = window_mean(&tr, i);
        if atr <= 1e-12 {
            dx.push(0.0);
            continue;
        }
        let plus_di = 100.0 * window_mean(&plus_dm, i) / atr;
        let minus_di = 100.0 * window_mean(&minus_dm, i) / atr;
        let sum = plus_di + minus_di;
        dx.push(if sum <= 1e-12 {
            0.0
        } else {
            100.0 * (plus_di - minus_di).abs() / sum
        });
    }

    let adx: Vec<f64> = (period - 1..dx.len())
        .map(|i| window_mean(&dx, i))
        .collect();
    pad_series(&adx, n)
}

/// Rolling least-squares slope over a trailing window.
pub fn slope_series(prices: &[f64], period: usize) -> Vec<f64> {
    let n = prices.len();
    if n < period || period < 2 {
        return vec![f64::NAN; n];
    }
    let slopes: Vec<f64> = prices.windows(period).map(|w| slope_of(w)).collect();
    pad_series(&slopes, n)
}

fn slope_of(window: &[f64]) -> f64 {
    let len = window.len() as f64;
    let mean_x = (len - 1.0) / 2.0;
    let mean_y = window.iter().sum::<f64>() / len;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &y) in window.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den.abs() <= 1e-12 {
        0.0
    } else {
        num / den
    }
}

/// Volume relative to the trailing average, excluding the current bar.
pub fn volume_ratio_series(volumes: &[f64], lookback: usize) -> Vec<f64> {
    let n = volumes.len();
    let mut out = vec![f64::NAN; n];
    if lookback == 0 {
        return out;
    }
    for i in lookback..n {
        let avg = volumes[i - lookback..i].iter().sum::<f64>() / lookback as f64;
        out[i] = if avg.abs() <= 1e-9 {
            0.0
        } else {
            volumes[i] / avg
        };
    }
    out
}

pub fn last_value(series: &[f64]) -> Option<f64> {
    series.iter().rev().find(|v| v.is_finite()).copied()
}

/// Convenience single-value helpers used by the signal strategies.
pub fn ema_last(prices: &[f64], period: usize) -> f64 {
    last_value(&ema_series(prices, period)).unwrap_or(f64::NAN)
}

pub fn rsi_last(prices: &[f64], period: usize) -> f64 {
    last_value(&rsi_series(prices, period)).unwrap_or(50.0)
}

pub fn percent_b_last(prices: &[f64], period: usize, std_dev: f64) -> f64 {
    last_value(&percent_b_series(prices, period, std_dev)).unwrap_or(0.5)
}

pub fn stochastic_last(prices: &[f64], period: usize) -> f64 {
    last_value(&stochastic_series(prices, period)).unwrap_or(50.0)
}

pub fn atr_last(close: &[f64], high: &[f64], low: &[f64], period: usize) -> f64 {
    last_value(&atr_series(close, high, low, period)).unwrap_or(f64::NAN)
}

pub fn adx_last(close: &[f64], high: &[f64], low: &[f64], period: usize) -> f64 {
    last_value(&adx_series(close, high, low, period)).unwrap_or(20.0)
}

pub fn slope_last(prices: &[f64], period: usize) -> f64 {
    last_value(&slope_series(prices, period)).unwrap_or(0.0)
}
