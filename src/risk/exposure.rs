use std::collections::HashMap;

use crate::data::AssetClass;
use crate::execution::Position;
use crate::signals::filters::correlation_group;

/// Exposure ceilings as percent of equity.
#[derive(Debug, Clone, Copy)]
pub struct ExposureLimits {
    pub max_exposure_per_symbol_pct: f64,
    pub max_exposure_per_asset_class_pct: f64,
    pub max_correlated_exposure_pct: f64,
}

/// Track open-position notional exposure per symbol, asset class, and
/// correlation group.
#[derive(Debug, Default)]
pub struct ExposureTracker {
    positions: HashMap<String, Position>,
}

impl ExposureTracker {
    pub fn new() -> Self {
        ExposureTracker::default()
    }

    pub fn add_position(&mut self, position: Position) {
        self.positions.insert(position.position_id.clone(), position);
    }

    pub fn remove_position(&mut self, position_id: &str) {
        self.positions.remove(position_id);
    }

    pub fn update_price(&mut self, symbol: &str, price: f64) {
        for position in self.positions.values_mut() {
            if position.symbol == symbol {
                position.current_price = price;
            }
        }
    }

    pub fn exposure_pct(&self, symbol: &str, equity: f64) -> f64 {
        let notional: f64 = self
            .positions
            .values()
            .filter(|position| position.symbol == symbol)
            .map(position_notional)
            .sum();
        pct(notional, equity)
    }

    pub fn exposure_by_asset_class(&self, equity: f64) -> HashMap<String, f64> {
        let mut grouped: HashMap<String, f64> = HashMap::new();
        for position in self.positions.values() {
            *grouped
                .entry(position.asset_class.as_str().to_string())
                .or_default() += position_notional(position);
        }
        grouped
            .into_iter()
            .map(|(key, notional)| (key, pct(notional, equity)))
            .collect()
    }

    pub fn correlated_exposure_pct(&self, symbol: &str, equity: f64) -> f64 {
        let group = correlation_group(symbol);
        let notional: f64 = self
            .positions
            .values()
            .filter(|position| correlation_group(&position.symbol) == group)
            .map(position_notional)
            .sum();
        pct(notional, equity)
    }

    pub fn total_exposure_pct(&self, equity: f64) -> f64 {
        let notional: f64 = self.positions.values().map(position_notional).sum();
        pct(notional, equity)
    }

    pub fn total_exposure_notional(&self) -> f64 {
        self.positions.values().map(position_notional).sum()
    }

    /// Simulate adding a notional exposure and return violated limit names.
    pub fn would_exceed_limits(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        new_exposure_notional: f64,
        equity: f64,
        limits: &ExposureLimits,
    ) -> Vec<String> {
        let mut violations = Vec::new();

        let current_symbol: f64 = self
            .positions
            .values()
            .filter(|position| position.symbol == symbol)
            .map(position_notional)
            .sum();
        if pct(current_symbol + new_exposure_notional, equity) > limits.max_exposure_per_symbol_pct
        {
            violations.push("max_exposure_per_symbol_pct".to_string());
        }

        let current_class: f64 = self
            .positions
            .values()
            .filter(|position| position.asset_class == asset_class)
            .map(position_notional)
            .sum();
        if pct(current_class + new_exposure_notional, equity)
            > limits.max_exposure_per_asset_class_pct
        {
            violations.push("max_exposure_per_asset_class_pct".to_string());
        }

        let correlated = self.correlated_exposure_pct(symbol, equity);
        if correlated + pct(new_exposure_notional, equity) > limits.max_correlated_exposure_pct {
            violations.push("max_correlated_exposure_pct".to_string());
        }

        violations
    }

    pub fn positions(&self) -> Vec<&Position> {
        self.positions.values().collect()
    }
}

fn position_notional(position: &Position) -> f64 {
    (position.quantity * position.current_price * position.contract_size()).abs()
}

fn pct(value: f64, equity: f64) -> f64 {
    if equity <= 0.0 {
        return 0.0;
    }
    value / equity * 100.0
}
