use chrono::{DateTime, Timelike, Utc};

use crate::data::AssetClass;

/// Named market session with UTC open/close hours.
#[derive(Debug, Clone, Copy)]
struct Session {
    name: &'static str,
    open_minute: u32,
    close_minute: u32,
    always_open: bool,
}

const SESSIONS: &[Session] = &[
    Session { name: "sydney", open_minute: 22 * 60, close_minute: 7 * 60, always_open: false },
    Session { name: "tokyo", open_minute: 0, close_minute: 9 * 60, always_open: false },
    Session { name: "london", open_minute: 8 * 60, close_minute: 17 * 60, always_open: false },
    Session { name: "newyork", open_minute: 13 * 60, close_minute: 22 * 60, always_open: false },
    Session { name: "crypto", open_minute: 0, close_minute: 24 * 60, always_open: true },
];

/// Session schedule and quality scoring across asset classes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionManager;

impl SessionManager {
    pub fn new() -> Self {
        SessionManager
    }

    pub fn active_sessions(&self, ts: DateTime<Utc>) -> Vec<&'static str> {
        let minute = ts.hour() * 60 + ts.minute();
        SESSIONS
            .iter()
            .filter(|session| session.always_open || session_active(session, minute))
            .map(|session| session.name)
            .collect()
    }

    /// London/New York overlap is the deepest forex liquidity window.
    pub fn is_overlap(&self, ts: DateTime<Utc>) -> bool {
        let active = self.active_sessions(ts);
        active.contains(&"london") && active.contains(&"newyork")
    }

    /// Session quality in [0, 1] for an asset class at a time.
    pub fn session_quality(&self, asset_class: AssetClass, ts: DateTime<Utc>) -> f64 {
        if asset_class == AssetClass::Crypto {
            return 1.0;
        }
        let active = self.active_sessions(ts);
        match asset_class {
            AssetClass::Forex => {
                if self.is_overlap(ts) {
                    1.0
                } else if active.contains(&"london") || active.contains(&"newyork") {
                    0.8
                } else if active.contains(&"tokyo") {
                    0.5
                } else {
                    0.1
                }
            }
            AssetClass::Stock | AssetClass::Etf | AssetClass::Cedear => {
                if active.contains(&"newyork") {
                    0.9
                } else {
                    0.2
                }
            }
            _ => 0.5,
        }
    }
}

fn session_active(session: &Session, minute: u32) -> bool {
    if session.close_minute <= session.open_minute {
        // Window wraps midnight.
        minute >= session.open_minute || minute <= session.close_minute
    } else {
        minute >= session.open_minute && minute <= session.close_minute
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, hour, 30, 0).unwrap()
    }

    #[test]
    fn london_newyork_overlap_detected() {
        assert!(SessionManager::new().is_overlap(at(14)));
        assert!(!SessionManager::new().is_overlap(at(9)));
    }

    #[test]
    fn crypto_always_full_quality() {
        assert_eq!(SessionManager::new().session_quality(AssetClass::Crypto, at(3)), 1.0);
    }

    #[test]
    fn forex_quality_bands() {
        let mgr = SessionManager::new();
        assert_eq!(mgr.session_quality(AssetClass::Forex, at(14)), 1.0); // overlap
        assert_eq!(mgr.session_quality(AssetClass::Forex, at(9)), 0.8); // london only
        assert_eq!(mgr.session_quality(AssetClass::Forex, at(3)), 0.5); // tokyo
    }

    #[test]
    fn equities_need_newyork() {
        let mgr = SessionManager::new();
        assert_eq!(mgr.session_quality(AssetClass::Stock, at(15)), 0.9);
        assert_eq!(mgr.session_quality(AssetClass::Stock, at(8)), 0.2);
    }

    #[test]
    fn sydney_wraps_midnight() {
        let active = SessionManager::new().active_sessions(at(23));
        assert!(active.contains(&"sydney"));
    }
}
