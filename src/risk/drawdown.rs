use chrono::{DateTime, Datelike, Utc};

/// Track drawdown over session, daily, and weekly windows.
///
/// Daily and weekly peaks roll when the date or ISO week changes between
/// consecutive updates.
#[derive(Debug, Default)]
pub struct DrawdownTracker {
    equity_curve: Vec<(DateTime<Utc>, f64)>,
    peak_session: Option<f64>,
    peak_daily: Option<f64>,
    peak_weekly: Option<f64>,
    max_drawdown_pct: f64,
    last_ts: Option<DateTime<Utc>>,
    realized_pnl_today: f64,
    realized_pnl_week: f64,
}

impl DrawdownTracker {
    pub fn new() -> Self {
        DrawdownTracker::default()
    }

    /// Record an equity snapshot, rolling period peaks as needed.
    pub fn update(&mut self, equity: f64, ts: DateTime<Utc>) {
        self.roll_periods_if_needed(ts, equity);
        self.last_ts = Some(ts);
        self.equity_curve.push((ts, equity));

        self.peak_session = Some(self.peak_session.map_or(equity, |peak| peak.max(equity)));
        self.peak_daily = Some(self.peak_daily.map_or(equity, |peak| peak.max(equity)));
        self.peak_weekly = Some(self.peak_weekly.map_or(equity, |peak| peak.max(equity)));

        let current_dd = pct_drop(self.peak_session, equity);
        self.max_drawdown_pct = self.max_drawdown_pct.max(current_dd);
    }

    /// Record a closed trade's realized PnL into daily/weekly buckets.
    pub fn register_trade_close(&mut self, pnl: f64, ts: DateTime<Utc>) {
        if let Some(last) = self.last_ts {
            if last.date_naive() != ts.date_naive() {
                self.realized_pnl_today = 0.0;
            }
            if iso_week(last) != iso_week(ts) {
                self.realized_pnl_week = 0.0;
            }
        }
        self.realized_pnl_today += pnl;
        self.realized_pnl_week += pnl;
        self.last_ts = Some(ts);
    }

    pub fn daily_drawdown_pct(&self) -> f64 {
        self.window_drawdown(self.peak_daily)
    }

    pub fn weekly_drawdown_pct(&self) -> f64 {
        self.window_drawdown(self.peak_weekly)
    }

    pub fn session_drawdown_pct(&self) -> f64 {
        self.window_drawdown(self.peak_session)
    }

    pub fn max_drawdown_pct(&self) -> f64 {
        self.max_drawdown_pct
    }

    pub fn realized_pnl_today(&self) -> f64 {
        self.realized_pnl_today
    }

    pub fn realized_pnl_week(&self) -> f64 {
        self.realized_pnl_week
    }

    pub fn is_daily_limit_reached(&self, limit_pct: f64) -> bool {
        self.daily_drawdown_pct() >= limit_pct
    }

    pub fn is_weekly_limit_reached(&self, limit_pct: f64) -> bool {
        self.weekly_drawdown_pct() >= limit_pct
    }

    pub fn equity_curve(&self) -> &[(DateTime<Utc>, f64)] {
        &self.equity_curve
    }

    /// Reset the daily peak to the latest equity (manual operator action).
    pub fn reset_daily(&mut self) {
        let latest = self.equity_curve.last().map_or(0.0, |point| point.1);
        self.peak_daily = Some(latest);
        self.realized_pnl_today = 0.0;
    }

    fn window_drawdown(&self, peak: Option<f64>) -> f64 {
        let Some(current) = self.equity_curve.last().map(|point| point.1) else {
            return 0.0;
        };
        pct_drop(peak, current)
    }

    fn roll_periods_if_needed(&mut self, ts: DateTime<Utc>, equity: f64) {
        let Some(last) = self.last_ts else {
            return;
        };
        if ts.date_naive() != last.date_naive() {
            self.peak_daily = Some(equity);
            self.realized_pnl_today = 0.0;
        }
        if iso_week(ts) != iso_week(last) {
            self.peak_weekly = Some(equity);
            self.realized_pnl_week = 0.0;
        }
    }
}

fn pct_drop(peak: Option<f64>, current: f64) -> f64 {
    match peak {
        Some(peak) if peak > 0.0 => ((peak - current) / peak * 100.0).max(0.0),
        _ => 0.0,
    }
}

fn iso_week(ts: DateTime<Utc>) -> (i32, u32) {
    let week = ts.iso_week();
    (week.year(), week.week())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn daily_drawdown_from_peak() {
        let mut tracker = DrawdownTracker::new();
        tracker.update(10_000.0, at(1, 9));
        tracker.update(10_400.0, at(1, 11));
        tracker.update(10_000.0, at(1, 14));
        // (10400 - 10000) / 10400 = 3.846%
        assert!((tracker.daily_drawdown_pct() - 3.8461538461538463).abs() < 1e-9);
        assert!(tracker.is_daily_limit_reached(3.0));
        assert!(!tracker.is_daily_limit_reached(5.0));
    }

    #[test]
    fn date_change_rolls_daily_peak() {
        let mut tracker = DrawdownTracker::new();
        tracker.update(10_000.0, at(1, 9));
        tracker.update(9_000.0, at(1, 20));
        assert!(tracker.daily_drawdown_pct() > 9.0);

        // New day: peak resets to the first equity of the day.
        tracker.update(9_000.0, at(2, 9));
        assert_eq!(tracker.daily_drawdown_pct(), 0.0);
    }

    #[test]
    fn week_change_rolls_weekly_peak() {
        let mut tracker = DrawdownTracker::new();
        // 2024-01-05 is a Friday (ISO week 1), 2024-01-08 a Monday (week 2).
        tracker.update(10_000.0, at(5, 9));
        tracker.update(9_500.0, at(5, 20));
        assert!(tracker.weekly_drawdown_pct() > 0.0);
        tracker.update(9_500.0, at(8, 9));
        assert_eq!(tracker.weekly_drawdown_pct(), 0.0);
    }

    #[test]
    fn max_drawdown_is_monotone() {
        let mut tracker = DrawdownTracker::new();
        tracker.update(10_000.0, at(1, 9));
        tracker.update(9_000.0, at(1, 10));
        tracker.update(10_500.0, at(1, 11));
        assert!((tracker.max_drawdown_pct() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn realized_pnl_buckets_roll() {
        let mut tracker = DrawdownTracker::new();
        tracker.update(10_000.0, at(1, 9));
        tracker.register_trade_close(-120.0, at(1, 10));
        tracker.register_trade_close(40.0, at(1, 12));
        assert_eq!(tracker.realized_pnl_today(), -80.0);

        tracker.register_trade_close(10.0, at(2, 9));
        assert_eq!(tracker.realized_pnl_today(), 10.0);
        assert_eq!(tracker.realized_pnl_week(), -70.0);
    }
}
