use serde::{Deserialize, Serialize};

use crate::data::AssetInfo;

use super::{OrderSide, PositionSizingMethod};

/// Output of a position sizing calculation. `was_capped` always carries a
/// `cap_reason`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSize {
    pub method: PositionSizingMethod,
    pub units: f64,
    pub notional_value: f64,
    pub risk_amount: f64,
    /// Fraction of equity at risk (0.01 = 1%).
    pub risk_percent: f64,
    pub max_allowed_units: f64,
    pub was_capped: bool,
    pub cap_reason: Option<String>,
    pub warnings: Vec<String>,
}

/// Inputs shared by every sizing method.
pub struct SizingRequest<'a> {
    pub method: PositionSizingMethod,
    pub side: OrderSide,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub equity: f64,
    pub asset_info: &'a AssetInfo,
    pub atr: Option<f64>,
    pub atr_multiplier: f64,
    pub win_rate: f64,
    pub avg_win_loss_ratio: f64,
    pub kelly_fraction: f64,
    /// Raw percent or fraction; normalized by the sizer.
    pub risk_pct: f64,
    pub fixed_units: f64,
    pub fixed_amount: f64,
    pub max_position_pct: Option<f64>,
    pub max_units: Option<f64>,
    pub max_risk_per_trade_pct: f64,
}

/// Conservative position sizing. Every path returns a safe (possibly
/// zero) size; caps scale all derived fields proportionally.
#[derive(Debug, Default, Clone, Copy)]
pub struct PositionSizer;

impl PositionSizer {
    pub fn calculate(&self, request: &SizingRequest<'_>) -> PositionSize {
        let size = match request.method {
            PositionSizingMethod::FixedUnits => self.fixed_units(request, request.fixed_units),
            PositionSizingMethod::FixedAmount => self.fixed_amount(request),
            PositionSizingMethod::PercentEquity | PositionSizingMethod::PercentRisk => {
                let risk_pct = Self::normalize_pct(request.risk_pct);
                self.percent_risk(request, risk_pct, request.stop_loss, request.method)
            }
            PositionSizingMethod::AtrBased => self.atr_based(request),
            PositionSizingMethod::KellyFractional => self.kelly_fractional(request),
        };
        self.apply_caps(size, request)
    }

    fn fixed_units(&self, request: &SizingRequest<'_>, units: f64) -> PositionSize {
        let units = units.max(0.0);
        let contract = contract_size(request.asset_info);
        let notional = units * request.entry_price * contract;
        let risk_amount = units * (request.entry_price - request.stop_loss).abs() * contract;
        let risk_percent = if request.equity > 0.0 {
            risk_amount / request.equity
        } else {
            0.0
        };
        PositionSize {
            method: PositionSizingMethod::FixedUnits,
            units,
            notional_value: notional,
            risk_amount,
            risk_percent,
            max_allowed_units: units,
            was_capped: false,
            cap_reason: None,
            warnings: Vec::new(),
        }
    }

    fn fixed_amount(&self, request: &SizingRequest<'_>) -> PositionSize {
        let contract = contract_size(request.asset_info);
        let units =
            request.fixed_amount.max(0.0) / (request.entry_price * contract).max(1e-12);
        let mut size = self.fixed_units(request, units);
        size.method = PositionSizingMethod::FixedAmount;
        size
    }

    fn percent_risk(
        &self,
        request: &SizingRequest<'_>,
        risk_pct: f64,
        stop_loss: f64,
        method: PositionSizingMethod,
    ) -> PositionSize {
        let risk_pct = risk_pct.max(0.0);
        let risk_usd = request.equity.max(0.0) * risk_pct;
        let sl_distance = (request.entry_price - stop_loss).abs();
        let contract = contract_size(request.asset_info);
        let units = risk_usd / (sl_distance * contract).max(1e-12);
        let notional = units * request.entry_price * contract;
        PositionSize {
            method,
            units: units.max(0.0),
            notional_value: notional.max(0.0),
            risk_amount: risk_usd.max(0.0),
            risk_percent: if request.equity > 0.0 {
                risk_usd / request.equity
            } else {
                0.0
            },
            max_allowed_units: units.max(0.0),
            was_capped: false,
            cap_reason: None,
            warnings: Vec::new(),
        }
    }

    fn atr_based(&self, request: &SizingRequest<'_>) -> PositionSize {
        let atr = request.atr.unwrap_or(0.0).max(0.0);
        let sl_distance = atr * request.atr_multiplier.max(0.1);
        let stop_loss = match request.side {
            OrderSide::Buy => request.entry_price - sl_distance,
            OrderSide::Sell => request.entry_price + sl_distance,
        };
        let risk_pct = Self::normalize_pct(request.risk_pct);
        let mut size =
            self.percent_risk(request, risk_pct, stop_loss, PositionSizingMethod::AtrBased);
        size.method = PositionSizingMethod::AtrBased;
        size
    }

    fn kelly_fractional(&self, request: &SizingRequest<'_>) -> PositionSize {
        let ratio = request.avg_win_loss_ratio.max(1e-12);
        let p = request.win_rate.clamp(0.0, 1.0);
        let full_kelly = (p * (ratio + 1.0) - 1.0) / ratio;
        if full_kelly <= 0.0 {
            let mut size = zero_size(PositionSizingMethod::KellyFractional);
            size.warnings.push("negative_expectancy_no_bet".to_string());
            return size;
        }
        let mut warnings = Vec::new();
        if request.kelly_fraction > 0.5 {
            warnings.push("kelly_fraction_aggressive".to_string());
        }
        let effective = (full_kelly * request.kelly_fraction.max(0.0)).clamp(0.0, 1.0);
        let mut size = self.percent_risk(
            request,
            effective,
            request.stop_loss,
            PositionSizingMethod::KellyFractional,
        );
        size.warnings = warnings;
        size
    }

    fn apply_caps(&self, size: PositionSize, request: &SizingRequest<'_>) -> PositionSize {
        let mut units = size.units;
        let mut was_capped = size.was_capped;
        let mut cap_reason = size.cap_reason.clone();
        let equity = request.equity;
        let max_risk_pct = Self::normalize_pct(request.max_risk_per_trade_pct);

        if let Some(max_position_pct) = request.max_position_pct.map(Self::normalize_pct) {
            if max_position_pct > 0.0
                && equity > 0.0
                && size.notional_value > equity * max_position_pct
            {
                let ratio = (equity * max_position_pct) / size.notional_value.max(1e-12);
                units *= ratio;
                was_capped = true;
                cap_reason.get_or_insert_with(|| "max_position_pct".to_string());
            }
        }
        if let Some(max_units) = request.max_units {
            if units > max_units {
                units = max_units;
                was_capped = true;
                cap_reason.get_or_insert_with(|| "max_units".to_string());
            }
        }
        if equity > 0.0 && size.risk_amount > equity * max_risk_pct {
            let ratio = (equity * max_risk_pct) / size.risk_amount.max(1e-12);
            units *= ratio;
            was_capped = true;
            cap_reason.get_or_insert_with(|| "max_risk_per_trade_pct".to_string());
        }

        if units == size.units {
            return size;
        }
        let scale = units / size.units.max(1e-12);
        PositionSize {
            units: units.max(0.0),
            notional_value: (size.notional_value * scale).max(0.0),
            risk_amount: (size.risk_amount * scale).max(0.0),
            risk_percent: (size.risk_percent * scale).max(0.0),
            max_allowed_units: units.max(0.0),
            was_capped,
            cap_reason,
            ..size
        }
    }

    /// Values above 1.0 are interpreted as percent and divided by 100;
    /// values in (0, 1] are taken as fractions. Idempotent by design of
    /// the reference implementation; kept as-is.
    pub fn normalize_pct(raw: f64) -> f64 {
        if raw > 1.0 {
            raw / 100.0
        } else {
            raw.max(0.0)
        }
    }
}

fn contract_size(asset_info: &AssetInfo) -> f64 {
    asset_info.contract_size.max(1e-12)
}

fn zero_size(method: PositionSizingMethod) -> PositionSize {
    PositionSize {
        method,
        units: 0.0,
        notional_value: 0.0,
        risk_amount: 0.0,
        risk_percent: 0.0,
        max_allowed_units: 0.0,
        was_capped: false,
        cap_reason: None,
        warnings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::AssetClass;

    fn request(method: PositionSizingMethod) -> SizingRequest<'static> {
        static INFO: std::sync::OnceLock<AssetInfo> = std::sync::OnceLock::new();
        let info =
            INFO.get_or_init(|| AssetInfo::defaults_for("EURUSD", "paper", AssetClass::Forex));
        SizingRequest {
            method,
            side: OrderSide::Buy,
            entry_price: 1.1000,
            stop_loss: 1.0950,
            equity: 10_000.0,
            asset_info: info,
            atr: Some(0.0010),
            atr_multiplier: 2.0,
            win_rate: 0.55,
            avg_win_loss_ratio: 1.5,
            kelly_fraction: 0.25,
            risk_pct: 1.0,
            fixed_units: 0.0,
            fixed_amount: 0.0,
            max_position_pct: None,
            max_units: None,
            max_risk_per_trade_pct: 100.0,
        }
    }

    #[test]
    fn percent_risk_formula() {
        let sizer = PositionSizer;
        let mut req = request(PositionSizingMethod::PercentRisk);
        req.risk_pct = 2.0; // percent form -> 0.02
        let size = sizer.calculate(&req);
        // units = 10000*0.02 / (0.005 * 100000) = 0.4
        assert!((size.units - 0.4).abs() < 1e-9);
        assert!((size.risk_amount - 200.0).abs() < 1e-9);
        assert!((size.risk_percent - 0.02).abs() < 1e-12);
    }

    #[test]
    fn fraction_and_percent_forms_agree() {
        let sizer = PositionSizer;
        let mut as_pct = request(PositionSizingMethod::PercentRisk);
        as_pct.risk_pct = 2.0;
        let mut as_fraction = request(PositionSizingMethod::PercentRisk);
        as_fraction.risk_pct = 0.02;
        assert!(
            (sizer.calculate(&as_pct).units - sizer.calculate(&as_fraction).units).abs() < 1e-12
        );
    }

    #[test]
    fn atr_based_derives_stop_distance() {
        let sizer = PositionSizer;
        let req = request(PositionSizingMethod::AtrBased);
        let size = sizer.calculate(&req);
        // sl distance = 0.0010 * 2 = 0.002; units = 100 / (0.002*100000) = 0.5
        assert!((size.units - 0.5).abs() < 1e-9);
    }

    #[test]
    fn kelly_negative_expectancy_bets_zero() {
        let sizer = PositionSizer;
        let mut req = request(PositionSizingMethod::KellyFractional);
        req.win_rate = 0.2;
        req.avg_win_loss_ratio = 1.0;
        let size = sizer.calculate(&req);
        assert_eq!(size.units, 0.0);
        assert!(size.warnings.contains(&"negative_expectancy_no_bet".to_string()));
    }

    #[test]
    fn kelly_positive_expectancy_sizes_up() {
        let sizer = PositionSizer;
        let req = request(PositionSizingMethod::KellyFractional);
        let size = sizer.calculate(&req);
        // full kelly = (0.55*2.5 - 1)/1.5 = 0.25; effective = 0.0625
        assert!(size.units > 0.0);
        assert!((size.risk_percent - 0.0625).abs() < 1e-9);
    }

    #[test]
    fn risk_cap_scales_proportionally() {
        let sizer = PositionSizer;
        let mut req = request(PositionSizingMethod::PercentRisk);
        req.risk_pct = 5.0;
        req.max_risk_per_trade_pct = 2.0;
        let size = sizer.calculate(&req);
        assert!(size.was_capped);
        assert_eq!(size.cap_reason.as_deref(), Some("max_risk_per_trade_pct"));
        assert!((size.risk_amount - 200.0).abs() < 1e-6);
        // Invariant: risk_amount <= equity * max_risk_per_trade
        assert!(size.risk_amount <= 10_000.0 * 0.02 + 1e-9);
    }

    #[test]
    fn max_units_cap() {
        let sizer = PositionSizer;
        let mut req = request(PositionSizingMethod::PercentRisk);
        req.risk_pct = 2.0;
        req.max_units = Some(0.1);
        let size = sizer.calculate(&req);
        assert_eq!(size.units, 0.1);
        assert_eq!(size.cap_reason.as_deref(), Some("max_units"));
    }

    #[test]
    fn fixed_amount_converts_to_units() {
        let sizer = PositionSizer;
        let mut req = request(PositionSizingMethod::FixedAmount);
        req.fixed_amount = 11_000.0;
        let size = sizer.calculate(&req);
        // units = 11000 / (1.1 * 100000) = 0.1
        assert!((size.units - 0.1).abs() < 1e-9);
        assert_eq!(size.method, PositionSizingMethod::FixedAmount);
    }

    #[test]
    fn normalize_pct_is_idempotent_for_percent_inputs() {
        assert_eq!(PositionSizer::normalize_pct(2.0), 0.02);
        assert_eq!(PositionSizer::normalize_pct(0.02), 0.02);
        assert_eq!(PositionSizer::normalize_pct(-1.0), 0.0);
    }
}
