use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::data::AssetClass;
use crate::error::Result;

/// Scheduled macro event loaded from the news calendar file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicEvent {
    pub event_id: String,
    pub title: String,
    pub country: String,
    pub currency: String,
    pub scheduled_at: DateTime<Utc>,
    pub impact: String,
    #[serde(default)]
    pub affected_assets: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CalendarFile {
    #[serde(default)]
    events: Vec<EconomicEvent>,
}

/// No-trade windows around scheduled macro events.
#[derive(Debug, Default, Clone)]
pub struct NewsCalendar {
    events: Vec<EconomicEvent>,
}

impl NewsCalendar {
    pub fn new(events: Vec<EconomicEvent>) -> Self {
        NewsCalendar { events }
    }

    /// Load events from a YAML file with a top-level `events` list. A
    /// missing file yields an empty calendar.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(NewsCalendar::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let parsed: CalendarFile = serde_yaml::from_str(&raw)?;
        Ok(NewsCalendar::new(parsed.events))
    }

    /// Return the blocking event when `now` falls inside a protected window.
    /// Crypto is exempt from macro-news windows.
    pub fn in_news_window(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        now: DateTime<Utc>,
        minutes_before: i64,
        minutes_after: i64,
    ) -> Option<&EconomicEvent> {
        if asset_class == AssetClass::Crypto {
            return None;
        }
        self.events.iter().find(|event| {
            if !event_affects_symbol(event, symbol) {
                return false;
            }
            let start = event.scheduled_at - Duration::minutes(minutes_before);
            let end = event.scheduled_at + Duration::minutes(minutes_after);
            now >= start && now <= end
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn event_affects_symbol(event: &EconomicEvent, symbol: &str) -> bool {
    let symbol_upper = symbol.to_uppercase();
    if event.affected_assets.is_empty() {
        return symbol_upper.contains(&event.currency.to_uppercase());
    }
    event
        .affected_assets
        .iter()
        .any(|asset| symbol_upper.contains(&asset.to_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nfp() -> EconomicEvent {
        EconomicEvent {
            event_id: "nfp-2024-03".into(),
            title: "Non-Farm Payrolls".into(),
            country: "US".into(),
            currency: "USD".into(),
            scheduled_at: Utc.with_ymd_and_hms(2024, 3, 8, 13, 30, 0).unwrap(),
            impact: "high".into(),
            affected_assets: vec![],
        }
    }

    #[test]
    fn window_blocks_matching_currency() {
        let calendar = NewsCalendar::new(vec![nfp()]);
        let just_before = Utc.with_ymd_and_hms(2024, 3, 8, 13, 10, 0).unwrap();
        assert!(calendar
            .in_news_window("EURUSD", AssetClass::Forex, just_before, 30, 15)
            .is_some());
    }

    #[test]
    fn outside_window_passes() {
        let calendar = NewsCalendar::new(vec![nfp()]);
        let much_earlier = Utc.with_ymd_and_hms(2024, 3, 8, 11, 0, 0).unwrap();
        assert!(calendar
            .in_news_window("EURUSD", AssetClass::Forex, much_earlier, 30, 15)
            .is_none());
    }

    #[test]
    fn crypto_is_exempt() {
        let calendar = NewsCalendar::new(vec![nfp()]);
        let during = Utc.with_ymd_and_hms(2024, 3, 8, 13, 30, 0).unwrap();
        assert!(calendar
            .in_news_window("BTCUSD", AssetClass::Crypto, during, 30, 15)
            .is_none());
    }

    #[test]
    fn affected_assets_override_currency_match() {
        let mut event = nfp();
        event.affected_assets = vec!["GBP".into()];
        let calendar = NewsCalendar::new(vec![event]);
        let during = Utc.with_ymd_and_hms(2024, 3, 8, 13, 30, 0).unwrap();
        assert!(calendar
            .in_news_window("EURUSD", AssetClass::Forex, during, 30, 15)
            .is_none());
        assert!(calendar
            .in_news_window("GBPUSD", AssetClass::Forex, during, 30, 15)
            .is_some());
    }
}
