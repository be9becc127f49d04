use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::events::{Event, KillSwitchEvent};
use crate::core::EventBus;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct KillSwitchConfig {
    #[garde(range(min = 1))]
    pub max_consecutive_losses: usize,
    #[garde(range(min = 0.0, max = 100.0))]
    pub max_api_error_rate_pct: f64,
    #[garde(range(min = 0.0))]
    pub max_latency_ms: f64,
    #[garde(range(min = 0.0))]
    pub max_fill_deviation_pct: f64,
    #[garde(range(min = 0.0))]
    pub max_equity_spike_pct: f64,
    #[garde(skip)]
    pub auto_close_positions: bool,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        KillSwitchConfig {
            max_consecutive_losses: 5,
            max_api_error_rate_pct: 10.0,
            max_latency_ms: 2_000.0,
            max_fill_deviation_pct: 1.0,
            max_equity_spike_pct: 20.0,
            auto_close_positions: false,
        }
    }
}

/// Health/risk metrics evaluated by [`KillSwitch::check`].
#[derive(Debug, Clone, Default)]
pub struct SystemMetrics {
    pub daily_drawdown_pct: f64,
    pub max_daily_drawdown_pct: f64,
    pub weekly_drawdown_pct: f64,
    pub max_weekly_drawdown_pct: f64,
    pub equity: f64,
    pub initial_balance: f64,
    pub min_equity_threshold_pct: f64,
    pub consecutive_losses: usize,
    pub api_error_rate_pct: f64,
    pub latency_ms: f64,
    pub fill_deviation_pct: f64,
    pub equity_spike_pct: f64,
    pub unexpected_fills: bool,
}

#[derive(Debug, Default)]
struct SwitchState {
    active: bool,
    reasons: Vec<String>,
    activated_at: Option<DateTime<Utc>>,
    deactivated_at: Option<DateTime<Utc>>,
    deactivated_by: Option<String>,
    deactivation_reason: Option<String>,
}

/// Global block on new orders. Once active it stays active until an
/// operator deactivates it with an explicit reason.
pub struct KillSwitch {
    config: KillSwitchConfig,
    bus: Arc<EventBus>,
    run_id: String,
    state: Mutex<SwitchState>,
    active_flag: std::sync::atomic::AtomicBool,
}

impl KillSwitch {
    pub fn new(config: KillSwitchConfig, bus: Arc<EventBus>, run_id: &str) -> Self {
        KillSwitch {
            config,
            bus,
            run_id: run_id.to_string(),
            state: Mutex::new(SwitchState::default()),
            active_flag: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_flag.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Evaluate all trigger conditions; activates on the first violation.
    pub async fn check(&self, metrics: &SystemMetrics, ts: DateTime<Utc>) -> Vec<String> {
        let mut reasons = Vec::new();

        if metrics.max_daily_drawdown_pct > 0.0
            && metrics.daily_drawdown_pct >= metrics.max_daily_drawdown_pct
        {
            reasons.push("daily_drawdown_limit".to_string());
        }
        if metrics.max_weekly_drawdown_pct > 0.0
            && metrics.weekly_drawdown_pct >= metrics.max_weekly_drawdown_pct
        {
            reasons.push("weekly_drawdown_limit".to_string());
        }
        if metrics.initial_balance > 0.0 && metrics.min_equity_threshold_pct > 0.0 {
            let equity_pct = metrics.equity / metrics.initial_balance * 100.0;
            if equity_pct < metrics.min_equity_threshold_pct {
                reasons.push("equity_threshold_breach".to_string());
            }
        }
        if metrics.consecutive_losses >= self.config.max_consecutive_losses {
            reasons.push("max_consecutive_losses".to_string());
        }
        if metrics.api_error_rate_pct >= self.config.max_api_error_rate_pct {
            reasons.push("api_error_rate".to_string());
        }
        if metrics.latency_ms >= self.config.max_latency_ms {
            reasons.push("latency_spike".to_string());
        }
        if metrics.fill_deviation_pct >= self.config.max_fill_deviation_pct {
            reasons.push("fill_deviation".to_string());
        }
        if metrics.equity_spike_pct >= self.config.max_equity_spike_pct {
            reasons.push("equity_spike".to_string());
        }
        if metrics.unexpected_fills {
            reasons.push("unexpected_fills".to_string());
        }

        if !reasons.is_empty() {
            self.activate(&reasons, ts).await;
        }
        reasons
    }

    /// Activate and publish a KILL_SWITCH event. Idempotent while active.
    pub async fn activate(&self, reasons: &[String], ts: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if state.active {
            return;
        }
        state.active = true;
        let mut deduped: Vec<String> = Vec::new();
        for reason in reasons {
            if !deduped.contains(reason) {
                deduped.push(reason.clone());
            }
        }
        state.reasons = deduped;
        state.activated_at = Some(ts);
        self.active_flag
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let joined = state.reasons.join("; ");
        drop(state);
        tracing::error!(run_id = %self.run_id, reasons = %joined, "kill switch activated");
        self.bus
            .publish(Event::KillSwitch(KillSwitchEvent {
                source: "risk.kill_switch".into(),
                run_id: self.run_id.clone(),
                reason: joined,
                triggered_by: "risk_manager".into(),
                ts,
            }))
            .await;
    }

    /// Deactivation requires an explicit reason and operator identity.
    pub async fn deactivate(&self, reason: &str, operator: &str, ts: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.active = false;
        state.deactivated_at = Some(ts);
        state.deactivated_by = Some(operator.to_string());
        state.deactivation_reason = Some(reason.to_string());
        self.active_flag
            .store(false, std::sync::atomic::Ordering::SeqCst);
        tracing::warn!(%operator, %reason, "kill switch deactivated");
    }

    pub async fn status(&self) -> HashMap<String, serde_json::Value> {
        let state = self.state.lock().await;
        let mut status = HashMap::new();
        status.insert("is_active".into(), serde_json::json!(state.active));
        status.insert("reasons".into(), serde_json::json!(state.reasons));
        status.insert(
            "activated_at".into(),
            serde_json::json!(state.activated_at.map(|ts| ts.to_rfc3339())),
        );
        status.insert(
            "deactivated_by".into(),
            serde_json::json!(state.deactivated_by),
        );
        status.insert(
            "deactivation_reason".into(),
            serde_json::json!(state.deactivation_reason),
        );
        status
    }

    pub async fn reasons(&self) -> Vec<String> {
        self.state.lock().await.reasons.clone()
    }
}
