use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{Metadata, OHLCVBar, Tick, Timeframe};

/// Topic key for event bus subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Tick,
    BarClose,
    Signal,
    OrderSubmit,
    OrderFill,
    OrderCancel,
    KillSwitch,
}

#[derive(Debug, Clone)]
pub enum Event {
    Tick(TickEvent),
    BarClose(BarCloseEvent),
    Signal(SignalEvent),
    OrderSubmit(OrderSubmitEvent),
    OrderFill(OrderFillEvent),
    OrderCancel(OrderCancelEvent),
    KillSwitch(KillSwitchEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Tick(_) => EventKind::Tick,
            Event::BarClose(_) => EventKind::BarClose,
            Event::Signal(_) => EventKind::Signal,
            Event::OrderSubmit(_) => EventKind::OrderSubmit,
            Event::OrderFill(_) => EventKind::OrderFill,
            Event::OrderCancel(_) => EventKind::OrderCancel,
            Event::KillSwitch(_) => EventKind::KillSwitch,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickEvent {
    pub source: String,
    pub run_id: String,
    pub tick: Tick,
}

#[derive(Debug, Clone)]
pub struct BarCloseEvent {
    pub source: String,
    pub run_id: String,
    pub symbol: String,
    pub broker: String,
    pub timeframe: Timeframe,
    pub ts_open: DateTime<Utc>,
    pub ts_close: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub spread: Option<f64>,
}

impl BarCloseEvent {
    pub fn from_bar(bar: &OHLCVBar, source: &str, run_id: &str) -> Self {
        BarCloseEvent {
            source: source.to_string(),
            run_id: run_id.to_string(),
            symbol: bar.symbol.clone(),
            broker: bar.broker.clone(),
            timeframe: bar.timeframe,
            ts_open: bar.ts_open,
            ts_close: bar.ts_close,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            spread: bar.spread,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub source: String,
    pub run_id: String,
    pub symbol: String,
    pub broker: String,
    pub strategy_id: String,
    pub direction: String,
    pub confidence: f64,
    pub timeframe: Timeframe,
    pub horizon: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderSubmitEvent {
    pub source: String,
    pub run_id: String,
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub broker: String,
    pub side: String,
    pub order_type: String,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub status: String,
    pub is_paper: bool,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct OrderFillEvent {
    pub source: String,
    pub run_id: String,
    pub order_id: String,
    pub symbol: String,
    pub broker: String,
    pub side: String,
    pub fill_price: f64,
    pub fill_quantity: f64,
    pub commission: f64,
    pub is_partial: bool,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderCancelEvent {
    pub source: String,
    pub run_id: String,
    pub order_id: String,
    pub symbol: String,
    pub broker: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct KillSwitchEvent {
    pub source: String,
    pub run_id: String,
    pub reason: String,
    pub triggered_by: String,
    pub ts: DateTime<Utc>,
}
