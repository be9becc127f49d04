use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::core::IdGen;
use crate::data::{meta_f64, meta_str, AssetClass, AssetInfo};
use crate::execution::{Account, Position};
use crate::signals::{Signal, SignalDirection};

use super::drawdown::DrawdownTracker;
use super::exposure::ExposureTracker;
use super::kill_switch::{KillSwitch, SystemMetrics};
use super::sizer::{PositionSizer, SizingRequest};
use super::stops::StopManager;
use super::{OrderSide, RiskCheck, RiskCheckStatus, RiskConfig, RiskReport};

/// Recommended action over an open position.
#[derive(Debug, Clone)]
pub enum PositionAction {
    UpdateTrailing { position_id: String, new_sl: f64 },
    Close { position_id: String, reason: String },
}

struct ManagerState {
    drawdown: DrawdownTracker,
    exposure: ExposureTracker,
    consecutive_losses: usize,
    initial_balance: Option<f64>,
    last_report: Option<RiskReport>,
}

/// Validate and size signals against portfolio and system risk limits.
///
/// Evaluation is deterministic: the same (signal, account, positions,
/// config) inputs produce the same RiskCheck.
pub struct RiskManager {
    config: RiskConfig,
    sizer: PositionSizer,
    stops: StopManager,
    kill_switch: Arc<KillSwitch>,
    ids: Arc<IdGen>,
    run_id: String,
    state: Mutex<ManagerState>,
}

impl RiskManager {
    pub fn new(
        config: RiskConfig,
        kill_switch: Arc<KillSwitch>,
        ids: Arc<IdGen>,
        run_id: &str,
    ) -> Self {
        RiskManager {
            config,
            sizer: PositionSizer,
            stops: StopManager,
            kill_switch,
            ids,
            run_id: run_id.to_string(),
            state: Mutex::new(ManagerState {
                drawdown: DrawdownTracker::new(),
                exposure: ExposureTracker::new(),
                consecutive_losses: 0,
                initial_balance: None,
                last_report: None,
            }),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.kill_switch
    }

    /// Evaluate a signal and return an APPROVED/MODIFIED/REJECTED check.
    pub async fn evaluate(
        &self,
        signal: &Signal,
        account: &Account,
        open_positions: &[Position],
        current_atr: Option<f64>,
        support_resistance: Option<&[f64]>,
    ) -> RiskCheck {
        let ts = signal.ts;
        let mut state = self.state.lock().await;
        state.initial_balance.get_or_insert(account.balance);
        state.drawdown.update(account.equity, ts);

        if self.kill_switch.is_active() {
            return self.rejected(&mut state, signal, vec!["kill_switch_active".into()], account, open_positions);
        }
        if !signal.direction.is_actionable() {
            return self.rejected(
                &mut state,
                signal,
                vec!["non_actionable_signal_direction".into()],
                account,
                open_positions,
            );
        }
        let side = if signal.direction == SignalDirection::Buy {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };

        let drawdown_violations = self.drawdown_violations(&state, account);
        if !drawdown_violations.is_empty() {
            let initial_balance = state.initial_balance.unwrap_or(account.balance);
            let metrics = SystemMetrics {
                daily_drawdown_pct: state.drawdown.daily_drawdown_pct(),
                max_daily_drawdown_pct: self.config.limits.max_daily_drawdown_pct,
                weekly_drawdown_pct: state.drawdown.weekly_drawdown_pct(),
                max_weekly_drawdown_pct: self.config.limits.max_weekly_drawdown_pct,
                equity: account.equity,
                initial_balance,
                min_equity_threshold_pct: self.config.limits.min_equity_threshold_pct,
                consecutive_losses: state.consecutive_losses,
                ..SystemMetrics::default()
            };
            self.kill_switch.check(&metrics, ts).await;
            return self.rejected(&mut state, signal, drawdown_violations, account, open_positions);
        }

        if open_positions.len() >= self.config.limits.max_open_positions {
            return self.rejected(
                &mut state,
                signal,
                vec!["max_open_positions_reached".into()],
                account,
                open_positions,
            );
        }

        let entry_price = resolve_entry_price(signal);
        if entry_price <= 0.0 {
            return self.rejected(
                &mut state,
                signal,
                vec!["invalid_entry_price".into()],
                account,
                open_positions,
            );
        }

        let asset_class = resolve_asset_class(signal);
        let asset_info = AssetInfo::defaults_for(&signal.symbol, &signal.broker, asset_class);
        let atr = current_atr
            .or_else(|| {
                let meta_atr = meta_f64(&signal.metadata, "atr", 0.0);
                (meta_atr > 0.0).then_some(meta_atr)
            })
            .unwrap_or(entry_price * 0.001)
            .max(entry_price * 0.0001);

        let (stop_loss, take_profit, trailing) = self.stops.calculate_stops(
            side,
            entry_price,
            atr,
            &asset_info,
            &self.config.stops,
            support_resistance,
        );
        let rr_ratio = self
            .stops
            .calculate_rr_ratio(entry_price, stop_loss, take_profit, side);
        if rr_ratio + 1e-9 < self.config.min_rr_ratio {
            return self.rejected(
                &mut state,
                signal,
                vec!["min_rr_ratio_not_met".into()],
                account,
                open_positions,
            );
        }

        let request = SizingRequest {
            method: self.config.default_sizing_method,
            side,
            entry_price,
            stop_loss,
            equity: account.equity,
            asset_info: &asset_info,
            atr: Some(atr),
            atr_multiplier: self.config.stops.atr_multiplier_sl,
            win_rate: meta_f64(&signal.metadata, "win_rate", 0.55),
            avg_win_loss_ratio: meta_f64(&signal.metadata, "avg_win_loss_ratio", 1.5),
            kelly_fraction: self.config.kelly_fraction,
            risk_pct: self.config.default_risk_per_trade_pct,
            fixed_units: 0.0,
            fixed_amount: 0.0,
            max_position_pct: Some(self.config.limits.max_exposure_per_symbol_pct),
            max_units: None,
            max_risk_per_trade_pct: self.config.max_risk_per_trade_pct,
        };
        let mut sized = self.sizer.calculate(&request);
        if sized.units <= 0.0 {
            return self.rejected(
                &mut state,
                signal,
                vec!["position_size_is_zero".into()],
                account,
                open_positions,
            );
        }

        sync_exposure(&mut state.exposure, open_positions);
        let limits = self.config.limits.exposure_limits();
        let violations = state.exposure.would_exceed_limits(
            &signal.symbol,
            asset_class,
            sized.notional_value,
            account.equity,
            &limits,
        );

        let mut status = RiskCheckStatus::Approved;
        let mut warnings = sized.warnings.clone();
        if !violations.is_empty() {
            // Halve the size once and re-check before rejecting outright.
            sized.units *= 0.5;
            sized.notional_value *= 0.5;
            sized.risk_amount *= 0.5;
            sized.risk_percent *= 0.5;
            sized.was_capped = true;
            sized.cap_reason = Some("exposure_limit_reduction".to_string());
            let recheck = state.exposure.would_exceed_limits(
                &signal.symbol,
                asset_class,
                sized.notional_value,
                account.equity,
                &limits,
            );
            if !recheck.is_empty() {
                return self.rejected(&mut state, signal, violations, account, open_positions);
            }
            status = RiskCheckStatus::Modified;
            warnings.extend(violations);
        }
        if sized.was_capped && status == RiskCheckStatus::Approved {
            status = RiskCheckStatus::Modified;
        }

        let snapshot = self.record_report(&mut state, account, open_positions).await;
        RiskCheck {
            check_id: self.ids.next("rc"),
            signal_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            broker: signal.broker.clone(),
            ts,
            status,
            approved_size: sized.units,
            approved_side: Some(side),
            suggested_sl: Some(stop_loss),
            suggested_tp: Some(take_profit),
            suggested_trailing: trailing,
            risk_amount: sized.risk_amount,
            risk_percent: sized.risk_percent * 100.0,
            reward_risk_ratio: rr_ratio,
            rejection_reasons: Vec::new(),
            warnings,
            portfolio_snapshot: snapshot,
        }
    }

    /// Update trackers when a position closes.
    pub async fn update_on_close(&self, position: &Position, pnl: f64, ts: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.exposure.remove_position(&position.position_id);
        state.drawdown.register_trade_close(pnl, ts);
        if pnl < 0.0 {
            state.consecutive_losses += 1;
        } else {
            state.consecutive_losses = 0;
        }
    }

    pub async fn consecutive_losses(&self) -> usize {
        self.state.lock().await.consecutive_losses
    }

    /// Trailing-stop updates and time exits over open positions.
    pub async fn monitor_open_positions(
        &self,
        open_positions: &[Position],
        current_prices: &HashMap<String, f64>,
        current_atrs: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Vec<PositionAction> {
        let mut actions = Vec::new();
        for position in open_positions {
            let Some(price) = current_prices.get(&position.symbol) else {
                continue;
            };
            let atr = current_atrs
                .get(&position.symbol)
                .copied()
                .unwrap_or((price * 0.001).max(1e-9));
            if let Some(new_sl) =
                self.stops
                    .should_trail(position, *price, atr, &self.config.trailing)
            {
                actions.push(PositionAction::UpdateTrailing {
                    position_id: position.position_id.clone(),
                    new_sl,
                });
            }
            if let Some(reason) =
                self.stops
                    .should_exit_by_time(position, now, &self.config.time_exit)
            {
                actions.push(PositionAction::Close {
                    position_id: position.position_id.clone(),
                    reason: reason.to_string(),
                });
            }
        }
        actions
    }

    pub async fn risk_report(&self) -> Option<RiskReport> {
        self.state.lock().await.last_report.clone()
    }

    fn drawdown_violations(&self, state: &ManagerState, account: &Account) -> Vec<String> {
        let mut violations = Vec::new();
        if state
            .drawdown
            .is_daily_limit_reached(self.config.limits.max_daily_drawdown_pct)
        {
            violations.push("daily_drawdown_reached".to_string());
        }
        if state
            .drawdown
            .is_weekly_limit_reached(self.config.limits.max_weekly_drawdown_pct)
        {
            violations.push("weekly_drawdown_reached".to_string());
        }
        let initial = state.initial_balance.unwrap_or(account.balance).max(1e-9);
        let equity_pct = account.equity / initial * 100.0;
        if equity_pct < self.config.limits.min_equity_threshold_pct {
            violations.push("min_equity_threshold_reached".to_string());
        }
        violations
    }

    async fn record_report(
        &self,
        state: &mut ManagerState,
        account: &Account,
        open_positions: &[Position],
    ) -> HashMap<String, f64> {
        sync_exposure(&mut state.exposure, open_positions);
        let equity = account.equity;
        let report = RiskReport {
            ts: account.updated_at,
            run_id: self.run_id.clone(),
            equity,
            balance: account.balance,
            unrealized_pnl: account.unrealized_pnl,
            realized_pnl_today: state.drawdown.realized_pnl_today(),
            realized_pnl_week: state.drawdown.realized_pnl_week(),
            daily_drawdown_pct: state.drawdown.daily_drawdown_pct(),
            weekly_drawdown_pct: state.drawdown.weekly_drawdown_pct(),
            max_drawdown_pct: state.drawdown.max_drawdown_pct(),
            current_drawdown_pct: state.drawdown.session_drawdown_pct(),
            open_positions_count: open_positions.len(),
            total_exposure_notional: state.exposure.total_exposure_notional(),
            total_exposure_pct: state.exposure.total_exposure_pct(equity),
            exposure_by_asset: open_positions
                .iter()
                .map(|position| {
                    (
                        position.symbol.clone(),
                        state.exposure.exposure_pct(&position.symbol, equity),
                    )
                })
                .collect(),
            exposure_by_asset_class: state.exposure.exposure_by_asset_class(equity),
            kill_switch_active: self.kill_switch.is_active(),
            kill_switch_reasons: Vec::new(),
        };
        let snapshot = snapshot_from(&report);
        state.last_report = Some(report);
        snapshot
    }

    fn rejected(
        &self,
        state: &mut ManagerState,
        signal: &Signal,
        reasons: Vec<String>,
        account: &Account,
        open_positions: &[Position],
    ) -> RiskCheck {
        sync_exposure(&mut state.exposure, open_positions);
        let snapshot = HashMap::from([
            ("equity".to_string(), account.equity),
            ("balance".to_string(), account.balance),
            ("open_positions".to_string(), open_positions.len() as f64),
            (
                "daily_drawdown_pct".to_string(),
                state.drawdown.daily_drawdown_pct(),
            ),
        ]);
        tracing::info!(
            symbol = %signal.symbol,
            run_id = %self.run_id,
            reasons = ?reasons,
            "risk check rejected"
        );
        RiskCheck {
            check_id: self.ids.next("rc"),
            signal_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            broker: signal.broker.clone(),
            ts: signal.ts,
            status: RiskCheckStatus::Rejected,
            approved_size: 0.0,
            approved_side: None,
            suggested_sl: None,
            suggested_tp: None,
            suggested_trailing: None,
            risk_amount: 0.0,
            risk_percent: 0.0,
            reward_risk_ratio: 0.0,
            rejection_reasons: if reasons.is_empty() {
                vec!["risk_rejected".to_string()]
            } else {
                reasons
            },
            warnings: Vec::new(),
            portfolio_snapshot: snapshot,
        }
    }
}

fn sync_exposure(exposure: &mut ExposureTracker, open_positions: &[Position]) {
    let live_ids: Vec<String> = open_positions
        .iter()
        .map(|position| position.position_id.clone())
        .collect();
    for position in exposure.positions().into_iter().map(|p| p.position_id.clone()).collect::<Vec<_>>() {
        if !live_ids.contains(&position) {
            exposure.remove_position(&position);
        }
    }
    for position in open_positions {
        exposure.add_position(position.clone());
    }
}

fn resolve_entry_price(signal: &Signal) -> f64 {
    if let Some(price) = signal.entry_price {
        if price > 0.0 {
            return price;
        }
    }
    let from_meta = meta_f64(&signal.metadata, "entry_price", 0.0);
    if from_meta > 0.0 {
        return from_meta;
    }
    meta_f64(&signal.metadata, "last_price", 0.0).max(0.0)
}

fn resolve_asset_class(signal: &Signal) -> AssetClass {
    meta_str(&signal.metadata, "asset_class")
        .map_or(AssetClass::Unknown, AssetClass::parse)
}

fn snapshot_from(report: &RiskReport) -> HashMap<String, f64> {
    HashMap::from([
        ("equity".to_string(), report.equity),
        ("balance".to_string(), report.balance),
        (
            "open_positions".to_string(),
            report.open_positions_count as f64,
        ),
        ("total_exposure_pct".to_string(), report.total_exposure_pct),
        ("daily_drawdown_pct".to_string(), report.daily_drawdown_pct),
        (
            "weekly_drawdown_pct".to_string(),
            report.weekly_drawdown_pct,
        ),
    ])
}
