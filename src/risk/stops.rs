use std::collections::HashMap;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::data::{meta_f64, AssetInfo, Timeframe};
use crate::execution::Position;

use super::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopLossMethod {
    #[default]
    AtrBased,
    FixedPips,
    Percent,
    SupportResistance,
    Chandelier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TakeProfitMethod {
    #[default]
    RrRatio,
    FixedPips,
    SupportResistance,
    AtrBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrailingMethod {
    FixedDistance,
    Breakeven,
    Step,
    #[default]
    AtrBased,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StopConfig {
    #[garde(skip)]
    pub sl_method: StopLossMethod,
    #[garde(range(min = 0.0))]
    pub atr_multiplier_sl: f64,
    #[garde(skip)]
    pub tp_method: TakeProfitMethod,
    #[garde(range(min = 0.0))]
    pub min_rr_ratio: f64,
    #[garde(skip)]
    pub trailing_enabled: bool,
    #[garde(skip)]
    pub trailing_method: TrailingMethod,
    #[garde(range(min = 0.0))]
    pub trailing_atr_multiplier: f64,
}

impl Default for StopConfig {
    fn default() -> Self {
        StopConfig {
            sl_method: StopLossMethod::AtrBased,
            atr_multiplier_sl: 2.0,
            tp_method: TakeProfitMethod::RrRatio,
            min_rr_ratio: 1.5,
            trailing_enabled: true,
            trailing_method: TrailingMethod::AtrBased,
            trailing_atr_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TrailingConfig {
    #[garde(skip)]
    pub method: TrailingMethod,
    #[garde(range(min = 0.0))]
    pub fixed_distance_pips: f64,
    #[garde(range(min = 0.0))]
    pub breakeven_r_multiple: f64,
    #[garde(range(min = 0.0))]
    pub step_r_multiple: f64,
    #[garde(range(min = 0.0))]
    pub atr_multiplier: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        TrailingConfig {
            method: TrailingMethod::AtrBased,
            fixed_distance_pips: 20.0,
            breakeven_r_multiple: 1.0,
            step_r_multiple: 0.5,
            atr_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeExitConfig {
    /// Max bars held per timeframe before a forced exit.
    pub max_hold_bars: HashMap<Timeframe, u32>,
    pub force_end_of_day: bool,
}

impl Default for TimeExitConfig {
    fn default() -> Self {
        let mut max_hold_bars = HashMap::new();
        max_hold_bars.insert(Timeframe::M5, 48);
        max_hold_bars.insert(Timeframe::H1, 48);
        max_hold_bars.insert(Timeframe::H4, 30);
        max_hold_bars.insert(Timeframe::D1, 20);
        TimeExitConfig {
            max_hold_bars,
            force_end_of_day: false,
        }
    }
}

/// Deterministic stop-loss, take-profit, trailing, and time exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopManager;

impl StopManager {
    /// Return (stop loss, take profit, optional trailing distance).
    pub fn calculate_stops(
        &self,
        side: OrderSide,
        entry_price: f64,
        atr: f64,
        asset_info: &AssetInfo,
        config: &StopConfig,
        support_resistance: Option<&[f64]>,
    ) -> (f64, f64, Option<f64>) {
        let atr = atr.max(entry_price * 0.0001);
        let pip = asset_info.pip_size.max(1e-12);

        let stop_loss = match config.sl_method {
            StopLossMethod::FixedPips => {
                let distance = config.atr_multiplier_sl.max(1.0) * pip;
                offset(entry_price, distance, side, true)
            }
            StopLossMethod::Percent => {
                let distance = entry_price * (config.atr_multiplier_sl / 100.0);
                offset(entry_price, distance, side, true)
            }
            StopLossMethod::SupportResistance => match support_resistance {
                Some(levels) if !levels.is_empty() => {
                    sl_from_levels(side, entry_price, levels, pip)
                }
                _ => offset(entry_price, atr * config.atr_multiplier_sl, side, true),
            },
            StopLossMethod::Chandelier => match support_resistance {
                Some(levels) if !levels.is_empty() => {
                    let extreme = if side == OrderSide::Buy {
                        levels.iter().copied().fold(f64::MAX, f64::min)
                    } else {
                        levels.iter().copied().fold(f64::MIN, f64::max)
                    };
                    offset(extreme, atr * config.atr_multiplier_sl, side, true)
                }
                _ => offset(entry_price, atr * config.atr_multiplier_sl, side, true),
            },
            StopLossMethod::AtrBased => {
                offset(entry_price, atr * config.atr_multiplier_sl, side, true)
            }
        };

        let take_profit = match config.tp_method {
            TakeProfitMethod::FixedPips => {
                let distance = (entry_price - stop_loss).abs();
                offset(entry_price, distance, side, false)
            }
            TakeProfitMethod::SupportResistance => match support_resistance {
                Some(levels) if !levels.is_empty() => tp_from_levels(side, entry_price, levels, atr),
                _ => rr_take_profit(entry_price, stop_loss, side, config.min_rr_ratio),
            },
            TakeProfitMethod::AtrBased => {
                let distance = atr * config.min_rr_ratio.max(1.0);
                offset(entry_price, distance, side, false)
            }
            TakeProfitMethod::RrRatio => {
                rr_take_profit(entry_price, stop_loss, side, config.min_rr_ratio)
            }
        };

        let trailing = if config.trailing_enabled {
            Some(match config.trailing_method {
                TrailingMethod::AtrBased => atr * config.trailing_atr_multiplier,
                _ => (entry_price - stop_loss).abs(),
            })
        } else {
            None
        };

        (stop_loss, take_profit, trailing)
    }

    /// Updated stop-loss when trailing should move. Trailing only ever
    /// tightens in the position's favor; None means "leave it".
    pub fn should_trail(
        &self,
        position: &Position,
        current_price: f64,
        atr: f64,
        config: &TrailingConfig,
    ) -> Option<f64> {
        let stop_loss = position.stop_loss?;
        let atr = atr.max(position.entry_price * 0.001);
        let pip = position.pip_size().max(1e-12);

        let candidate = match config.method {
            TrailingMethod::FixedDistance => {
                let distance = config.fixed_distance_pips * pip;
                match position.side {
                    OrderSide::Buy => current_price - distance,
                    OrderSide::Sell => current_price + distance,
                }
            }
            TrailingMethod::Breakeven => {
                let initial_r = (position.entry_price - stop_loss).abs();
                if initial_r <= 0.0 {
                    return None;
                }
                let favorable_move = match position.side {
                    OrderSide::Buy => current_price - position.entry_price,
                    OrderSide::Sell => position.entry_price - current_price,
                };
                if favorable_move >= initial_r * config.breakeven_r_multiple {
                    position.entry_price
                } else {
                    return None;
                }
            }
            TrailingMethod::Step => {
                let initial_r = (position.entry_price - stop_loss).abs();
                if initial_r <= 0.0 {
                    return None;
                }
                let favorable_move = match position.side {
                    OrderSide::Buy => current_price - position.entry_price,
                    OrderSide::Sell => position.entry_price - current_price,
                };
                let step = (initial_r * config.step_r_multiple).max(1e-12);
                let steps = (favorable_move / step).floor();
                if steps <= 0.0 {
                    return None;
                }
                let delta = steps * initial_r * config.step_r_multiple;
                match position.side {
                    OrderSide::Buy => position.entry_price + delta,
                    OrderSide::Sell => position.entry_price - delta,
                }
            }
            TrailingMethod::AtrBased => {
                let distance = atr * config.atr_multiplier;
                match position.side {
                    OrderSide::Buy => current_price - distance,
                    OrderSide::Sell => current_price + distance,
                }
            }
        };

        match position.side {
            OrderSide::Buy if candidate > stop_loss => Some(candidate),
            OrderSide::Sell if candidate < stop_loss => Some(candidate),
            _ => None,
        }
    }

    /// Whether a position must close for time reasons and why.
    pub fn should_exit_by_time(
        &self,
        position: &Position,
        current_time: DateTime<Utc>,
        config: &TimeExitConfig,
    ) -> Option<&'static str> {
        let timeframe = crate::data::meta_str(&position.metadata, "timeframe")
            .and_then(|raw| raw.parse::<Timeframe>().ok())
            .unwrap_or(Timeframe::H1);
        let bars_held = meta_f64(&position.metadata, "bars_held", 0.0) as u32;
        if let Some(max_bars) = config.max_hold_bars.get(&timeframe) {
            if bars_held >= *max_bars {
                return Some("max_hold_bars");
            }
        }
        if meta_f64(&position.metadata, "session_end_imminent", 0.0) > 0.0 {
            return Some("end_of_session");
        }
        if meta_f64(&position.metadata, "high_impact_news_imminent", 0.0) > 0.0 {
            return Some("pre_news");
        }
        if config.force_end_of_day && position.opened_at.date_naive() != current_time.date_naive() {
            return Some("end_of_day");
        }
        None
    }

    /// Reward-risk ratio; 0 for degenerate stops.
    pub fn calculate_rr_ratio(
        &self,
        entry: f64,
        stop_loss: f64,
        take_profit: f64,
        side: OrderSide,
    ) -> f64 {
        let (reward, risk) = match side {
            OrderSide::Buy => (take_profit - entry, entry - stop_loss),
            OrderSide::Sell => (entry - take_profit, stop_loss - entry),
        };
        if risk <= 0.0 {
            return 0.0;
        }
        (reward / risk).max(0.0)
    }
}

fn offset(base: f64, distance: f64, side: OrderSide, adverse: bool) -> f64 {
    let sign = match (side, adverse) {
        (OrderSide::Buy, true) | (OrderSide::Sell, false) => -1.0,
        (OrderSide::Buy, false) | (OrderSide::Sell, true) => 1.0,
    };
    base + sign * distance
}

fn rr_take_profit(entry: f64, stop_loss: f64, side: OrderSide, min_rr: f64) -> f64 {
    let rr = min_rr.max(0.1);
    let distance = (entry - stop_loss).abs() * rr;
    offset(entry, distance, side, false)
}

fn sl_from_levels(side: OrderSide, entry: f64, levels: &[f64], pip: f64) -> f64 {
    match side {
        OrderSide::Buy => {
            let support = levels
                .iter()
                .copied()
                .filter(|level| *level < entry)
                .fold(f64::MIN, f64::max);
            let base = if support == f64::MIN { entry - 10.0 * pip } else { support };
            base - pip
        }
        OrderSide::Sell => {
            let resistance = levels
                .iter()
                .copied()
                .filter(|level| *level > entry)
                .fold(f64::MAX, f64::min);
            let base = if resistance == f64::MAX { entry + 10.0 * pip } else { resistance };
            base + pip
        }
    }
}

fn tp_from_levels(side: OrderSide, entry: f64, levels: &[f64], atr: f64) -> f64 {
    match side {
        OrderSide::Buy => {
            let target = levels
                .iter()
                .copied()
                .filter(|level| *level > entry)
                .fold(f64::MAX, f64::min);
            if target == f64::MAX { entry + atr * 2.0 } else { target }
        }
        OrderSide::Sell => {
            let target = levels
                .iter()
                .copied()
                .filter(|level| *level < entry)
                .fold(f64::MIN, f64::max);
            if target == f64::MIN { entry - atr * 2.0 } else { target }
        }
    }
}
