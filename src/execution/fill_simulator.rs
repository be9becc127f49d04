use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::IdGen;
use crate::data::{AssetClass, AssetInfo, Tick};
use crate::risk::{CommissionsConfig, OrderSide, OrderType, SlippageConfig, SlippageModel};

use super::{Fill, Order, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    Instant,
    #[default]
    Realistic,
}

#[derive(Debug, Clone, Default)]
pub struct FillSimulatorConfig {
    pub fill_mode: FillMode,
    pub partial_fill_probability: f64,
    pub slippage: SlippageConfig,
    pub commissions: CommissionsConfig,
}

/// Simulate fills from the current tick and order constraints.
///
/// The RNG (partial fills) is seeded so paper runs replay identically;
/// fill timestamps come from the driving tick, never the wall clock.
pub struct FillSimulator {
    slippage_model: SlippageModel,
    rng: Mutex<StdRng>,
}

impl FillSimulator {
    pub fn new(seed: u64) -> Self {
        FillSimulator {
            slippage_model: SlippageModel,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Return a fill when the order would execute against the tick.
    pub async fn simulate_fill(
        &self,
        order: &Order,
        tick: &Tick,
        config: &FillSimulatorConfig,
        ids: &IdGen,
    ) -> Option<Fill> {
        let asset_info = asset_info_for(order);

        let fill_price = match order.order_type {
            OrderType::Limit => {
                let price = order.price?;
                match order.side {
                    OrderSide::Buy if tick.ask > price => return None,
                    OrderSide::Sell if tick.bid < price => return None,
                    _ => price,
                }
            }
            OrderType::Stop | OrderType::StopLimit => {
                let stop = order.stop_price?;
                match order.side {
                    OrderSide::Buy if tick.ask < stop => return None,
                    OrderSide::Sell if tick.bid > stop => return None,
                    _ => self.slippage_model.apply_slippage(
                        stop,
                        order.side,
                        OrderType::Market,
                        Some(tick),
                        None,
                        &asset_info,
                        &config.slippage,
                    ),
                }
            }
            OrderType::Market => {
                let reference = order.price.unwrap_or_else(|| tick.reference_price());
                self.slippage_model.apply_slippage(
                    reference,
                    order.side,
                    OrderType::Market,
                    Some(tick),
                    None,
                    &asset_info,
                    &config.slippage,
                )
            }
        };

        let mut quantity = order.quantity;
        let mut is_partial = false;
        if config.fill_mode == FillMode::Realistic {
            let mut rng = self.rng.lock().await;
            if rng.random_range(0.0..1.0) < config.partial_fill_probability {
                quantity = (order.quantity * rng.random_range(0.25..0.95)).max(1e-7);
                is_partial = true;
            }
        }

        let commission = self.slippage_model.calculate_commission(
            fill_price,
            quantity,
            &asset_info,
            &config.commissions,
        );

        Some(Fill {
            fill_id: ids.next("fill"),
            order_id: order.order_id.clone(),
            broker_fill_id: None,
            symbol: order.symbol.clone(),
            broker: order.broker.clone(),
            side: order.side,
            quantity,
            price: fill_price,
            commission,
            ts: tick.ts,
            is_partial,
            is_paper: order.is_paper,
            position_id: None,
        })
    }

    pub fn should_trigger_sl(&self, position: &Position, tick: &Tick) -> bool {
        let Some(stop_loss) = position.stop_loss else {
            return false;
        };
        match position.side {
            OrderSide::Buy => tick.bid <= stop_loss,
            OrderSide::Sell => tick.ask >= stop_loss,
        }
    }

    pub fn should_trigger_tp(&self, position: &Position, tick: &Tick) -> bool {
        let Some(take_profit) = position.take_profit else {
            return false;
        };
        match position.side {
            OrderSide::Buy => tick.bid >= take_profit,
            OrderSide::Sell => tick.ask <= take_profit,
        }
    }
}

fn asset_info_for(order: &Order) -> AssetInfo {
    let asset_class = crate::data::meta_str(&order.metadata, "asset_class")
        .map_or(AssetClass::Unknown, AssetClass::parse);
    let mut info = AssetInfo::defaults_for(&order.symbol, &order.broker, asset_class);
    let contract = crate::data::meta_f64(&order.metadata, "contract_size", info.contract_size);
    let pip = crate::data::meta_f64(&order.metadata, "pip_size", info.pip_size);
    info.contract_size = contract;
    info.pip_size = pip;
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Metadata;
    use crate::execution::{OrderStatus, PositionStatus};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn tick(bid: f64, ask: f64) -> Tick {
        Tick {
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            ts: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
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

    fn order(order_type: OrderType, side: OrderSide) -> Order {
        let mut metadata = Metadata::new();
        metadata.insert("asset_class".into(), json!("forex"));
        Order {
            order_id: "o1".into(),
            broker_order_id: None,
            client_order_id: "c1".into(),
            signal_id: "s1".into(),
            risk_check_id: "rc1".into(),
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            side,
            order_type,
            quantity: 1.0,
            price: Some(1.1000),
            stop_price: Some(1.1010),
            stop_loss: None,
            take_profit: None,
            trailing_stop: None,
            time_in_force: "GTC".into(),
            status: OrderStatus::Submitted,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
            submitted_at: None,
            filled_at: None,
            cancelled_at: None,
            filled_quantity: 0.0,
            average_fill_price: None,
            commission: 0.0,
            slippage: 0.0,
            reject_reason: None,
            retry_count: 0,
            is_paper: true,
            metadata,
        }
    }

    fn instant_config() -> FillSimulatorConfig {
        FillSimulatorConfig {
            fill_mode: FillMode::Instant,
            partial_fill_probability: 0.0,
            ..FillSimulatorConfig::default()
        }
    }

    #[tokio::test]
    async fn limit_buy_fills_only_at_or_below_limit() {
        let simulator = FillSimulator::new(42);
        let ids = IdGen::new("test");
        let limit_order = order(OrderType::Limit, OrderSide::Buy);

        // Ask above the limit: no fill.
        assert!(simulator
            .simulate_fill(&limit_order, &tick(1.1005, 1.1007), &instant_config(), &ids)
            .await
            .is_none());

        // Ask at the limit: fills at limit price, no slippage.
        let fill = simulator
            .simulate_fill(&limit_order, &tick(1.0998, 1.1000), &instant_config(), &ids)
            .await
            .unwrap();
        assert_eq!(fill.price, 1.1000);
        assert!(!fill.is_partial);
    }

    #[tokio::test]
    async fn stop_buy_waits_for_trigger_then_slips() {
        let simulator = FillSimulator::new(42);
        let ids = IdGen::new("test");
        let stop_order = order(OrderType::Stop, OrderSide::Buy);

        assert!(simulator
            .simulate_fill(&stop_order, &tick(1.1000, 1.1002), &instant_config(), &ids)
            .await
            .is_none());

        let fill = simulator
            .simulate_fill(&stop_order, &tick(1.1010, 1.1012), &instant_config(), &ids)
            .await
            .unwrap();
        // Market execution after trigger: ask plus spread-based slippage.
        assert!(fill.price > 1.1012);
    }

    #[tokio::test]
    async fn market_order_uses_tick_timestamp() {
        let simulator = FillSimulator::new(42);
        let ids = IdGen::new("test");
        let fill = simulator
            .simulate_fill(
                &order(OrderType::Market, OrderSide::Buy),
                &tick(1.0999, 1.1001),
                &instant_config(),
                &ids,
            )
            .await
            .unwrap();
        assert_eq!(fill.ts, Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn realistic_mode_partial_fills_bounded() {
        let simulator = FillSimulator::new(7);
        let ids = IdGen::new("test");
        let config = FillSimulatorConfig {
            fill_mode: FillMode::Realistic,
            partial_fill_probability: 1.0,
            ..FillSimulatorConfig::default()
        };
        let fill = simulator
            .simulate_fill(
                &order(OrderType::Market, OrderSide::Buy),
                &tick(1.0999, 1.1001),
                &config,
                &ids,
            )
            .await
            .unwrap();
        assert!(fill.is_partial);
        assert!(fill.quantity >= 0.25 && fill.quantity <= 0.95);
    }

    #[tokio::test]
    async fn partial_fill_sequence_is_seeded() {
        let config = FillSimulatorConfig {
            fill_mode: FillMode::Realistic,
            partial_fill_probability: 1.0,
            ..FillSimulatorConfig::default()
        };
        let mut quantities_a = Vec::new();
        let mut quantities_b = Vec::new();
        for quantities in [&mut quantities_a, &mut quantities_b] {
            let simulator = FillSimulator::new(99);
            let ids = IdGen::new("test");
            for _ in 0..5 {
                let fill = simulator
                    .simulate_fill(
                        &order(OrderType::Market, OrderSide::Buy),
                        &tick(1.0999, 1.1001),
                        &config,
                        &ids,
                    )
                    .await
                    .unwrap();
                quantities.push(fill.quantity);
            }
        }
        assert_eq!(quantities_a, quantities_b);
    }

    #[test]
    fn sl_tp_triggers_respect_side() {
        let simulator = FillSimulator::new(42);
        let position = Position {
            position_id: "p1".into(),
            symbol: "EURUSD".into(),
            broker: "paper".into(),
            side: OrderSide::Buy,
            quantity: 1.0,
            entry_price: 1.1000,
            current_price: 1.1000,
            stop_loss: Some(1.0950),
            take_profit: Some(1.1100),
            trailing_stop_price: None,
            status: PositionStatus::Open,
            opened_at: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
            closed_at: None,
            close_price: None,
            unrealized_pnl: 0.0,
            realized_pnl: None,
            commission_total: 0.0,
            signal_id: "s1".into(),
            strategy_id: "t".into(),
            asset_class: AssetClass::Forex,
            is_paper: true,
            metadata: Metadata::new(),
        };
        assert!(simulator.should_trigger_sl(&position, &tick(1.0949, 1.0951)));
        assert!(!simulator.should_trigger_sl(&position, &tick(1.0960, 1.0962)));
        assert!(simulator.should_trigger_tp(&position, &tick(1.1101, 1.1103)));
        assert!(!simulator.should_trigger_tp(&position, &tick(1.1050, 1.1052)));
    }
}
