use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::data::{AssetClass, AssetInfo, Tick};

use super::{OrderSide, OrderType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlippageMethod {
    FixedPips,
    Percent,
    VolatilityBased,
    #[default]
    SpreadBased,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SlippageConfig {
    #[garde(skip)]
    pub method: SlippageMethod,
    #[garde(range(min = 0.0))]
    pub fixed_pips: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub percent: f64,
}

impl Default for SlippageConfig {
    fn default() -> Self {
        SlippageConfig {
            method: SlippageMethod::SpreadBased,
            fixed_pips: 1.0,
            percent: 0.0001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommissionMethod {
    PerLot,
    #[default]
    Percent,
    PerShare,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionRule {
    pub method: CommissionMethod,
    pub amount_per_lot: f64,
    pub pct: f64,
    pub amount_per_share: f64,
    pub fixed_amount: f64,
}

impl Default for CommissionRule {
    fn default() -> Self {
        CommissionRule {
            method: CommissionMethod::Percent,
            amount_per_lot: 7.0,
            pct: 0.0002,
            amount_per_share: 0.005,
            fixed_amount: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CommissionsConfig {
    pub forex: CommissionRule,
    pub crypto: CommissionRule,
    pub stock: CommissionRule,
    pub binary_option: CommissionRule,
    pub fixed_term: CommissionRule,
}

/// Deterministic execution slippage and commission model.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlippageModel;

impl SlippageModel {
    /// Slippage-adjusted fill price. LIMIT and STOP_LIMIT orders fill at
    /// their price without slippage.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_slippage(
        &self,
        order_price: f64,
        side: OrderSide,
        order_type: OrderType,
        current_tick: Option<&Tick>,
        atr: Option<f64>,
        asset_info: &AssetInfo,
        config: &SlippageConfig,
    ) -> f64 {
        if matches!(order_type, OrderType::Limit | OrderType::StopLimit) {
            return order_price;
        }

        let pip = asset_info.pip_size.max(1e-12);
        let bid = current_tick.map_or(order_price, |tick| tick.bid);
        let ask = current_tick.map_or(order_price, |tick| tick.ask);
        let spread = current_tick
            .and_then(|tick| tick.spread)
            .unwrap_or_else(|| (ask - bid).max(pip));

        let slip = match config.method {
            SlippageMethod::FixedPips => pip * config.fixed_pips,
            SlippageMethod::Percent => {
                let base = if side == OrderSide::Buy { ask } else { bid };
                base * config.percent
            }
            SlippageMethod::VolatilityBased => (atr.unwrap_or(0.0) * 0.1).max(pip),
            SlippageMethod::SpreadBased => spread,
        };

        let base = if order_type == OrderType::Market {
            if side == OrderSide::Buy {
                ask
            } else {
                bid
            }
        } else {
            order_price
        };
        match side {
            OrderSide::Buy => base + slip,
            OrderSide::Sell => base - slip,
        }
    }

    /// Commission for one fill, by asset class.
    pub fn calculate_commission(
        &self,
        fill_price: f64,
        units: f64,
        asset_info: &AssetInfo,
        config: &CommissionsConfig,
    ) -> f64 {
        let rule = select_rule(asset_info.asset_class, config);
        match rule.method {
            CommissionMethod::PerLot => units * rule.amount_per_lot,
            CommissionMethod::Percent => {
                fill_price * units * asset_info.contract_size.max(1.0) * rule.pct
            }
            CommissionMethod::PerShare => {
                units * asset_info.contract_size.max(1.0) * rule.amount_per_share
            }
            CommissionMethod::Fixed => rule.fixed_amount,
        }
    }
}

/// FUTURES and OPTIONS have no dedicated rule and fall through to the
/// stock rule, mirroring the reference behavior.
fn select_rule(asset_class: AssetClass, config: &CommissionsConfig) -> &CommissionRule {
    match asset_class {
        AssetClass::Forex => &config.forex,
        AssetClass::Crypto => &config.crypto,
        AssetClass::BinaryOption => &config.binary_option,
        AssetClass::FixedTerm => &config.fixed_term,
        _ => &config.stock,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn forex_info() -> AssetInfo {
        AssetInfo::defaults_for("EURUSD", "paper", AssetClass::Forex)
    }

    fn tick(bid: f64, ask: f64) -> Tick {
        Tick {
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            ts: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            bid,
            ask,
            last: None,
            volume: None,
            spread: None,
            asset_class: AssetClass::Forex,
            source: "test".into(),
        }
        .validated()
        .unwrap()
    }

    #[test]
    fn limit_orders_have_no_slippage() {
        let model = SlippageModel;
        let config = SlippageConfig::default();
        let price = model.apply_slippage(
            1.1000,
            OrderSide::Buy,
            OrderType::Limit,
            Some(&tick(1.0999, 1.1001)),
            None,
            &forex_info(),
            &config,
        );
        assert_eq!(price, 1.1000);
    }

    #[test]
    fn fixed_pips_buy_pays_up() {
        let model = SlippageModel;
        let config = SlippageConfig {
            method: SlippageMethod::FixedPips,
            fixed_pips: 2.0,
            percent: 0.0,
        };
        let price = model.apply_slippage(
            1.1000,
            OrderSide::Buy,
            OrderType::Market,
            Some(&tick(1.0999, 1.1001)),
            None,
            &forex_info(),
            &config,
        );
        assert!((price - (1.1001 + 0.0002)).abs() < 1e-12);
    }

    #[test]
    fn sell_side_slips_down() {
        let model = SlippageModel;
        let config = SlippageConfig {
            method: SlippageMethod::FixedPips,
            fixed_pips: 1.0,
            percent: 0.0,
        };
        let price = model.apply_slippage(
            1.1000,
            OrderSide::Sell,
            OrderType::Market,
            Some(&tick(1.0999, 1.1001)),
            None,
            &forex_info(),
            &config,
        );
        assert!((price - (1.0999 - 0.0001)).abs() < 1e-12);
    }

    #[test]
    fn volatility_based_uses_atr_fraction() {
        let model = SlippageModel;
        let config = SlippageConfig {
            method: SlippageMethod::VolatilityBased,
            fixed_pips: 0.0,
            percent: 0.0,
        };
        let price = model.apply_slippage(
            1.1000,
            OrderSide::Buy,
            OrderType::Market,
            Some(&tick(1.1000, 1.1000)),
            Some(0.0050),
            &forex_info(),
            &config,
        );
        assert!((price - (1.1000 + 0.0005)).abs() < 1e-12);
    }

    #[test]
    fn commission_percent_of_notional() {
        let model = SlippageModel;
        let config = CommissionsConfig::default();
        let commission = model.calculate_commission(1.1, 0.5, &forex_info(), &config);
        // 1.1 * 0.5 * 100_000 * 0.0002
        assert!((commission - 11.0).abs() < 1e-9);
    }

    #[test]
    fn futures_fall_through_to_stock_rule() {
        let model = SlippageModel;
        let mut config = CommissionsConfig::default();
        config.stock = CommissionRule {
            method: CommissionMethod::Fixed,
            fixed_amount: 9.0,
            ..CommissionRule::default()
        };
        let info = AssetInfo::defaults_for("ES", "paper", AssetClass::Futures);
        assert_eq!(model.calculate_commission(100.0, 2.0, &info, &config), 9.0);
    }
}
