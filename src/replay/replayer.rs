use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::core::events::{BarCloseEvent, Event, TickEvent};
use crate::core::EventBus;
use crate::data::{DataRepository, OHLCVBar, Tick, Timeframe};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct ControlState {
    paused: bool,
    step_budget: Option<u64>,
    jump_to: Option<DateTime<Utc>>,
    stopped: bool,
}

/// Pause/resume/step/jump control surface for a running replay.
///
/// `pause` suspends the driving loop until `resume` or `step_forward`;
/// `step_forward(n)` advances exactly n bars then re-pauses; `jump_to`
/// skips bars before the target timestamp.
pub struct ReplayController {
    state: Mutex<ControlState>,
    notify: Notify,
}

impl ReplayController {
    pub fn new() -> Self {
        ReplayController {
            state: Mutex::new(ControlState::default()),
            notify: Notify::new(),
        }
    }

    pub async fn pause(&self) {
        self.state.lock().await.paused = true;
    }

    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        state.paused = false;
        state.step_budget = None;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Advance exactly `n` bars, then re-pause.
    pub async fn step_forward(&self, n: u64) {
        let mut state = self.state.lock().await;
        state.paused = true;
        state.step_budget = Some(n);
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn jump_to(&self, ts: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.jump_to = Some(ts);
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.stopped = true;
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused
    }

    /// Returns false when the replay should stop, true to deliver the bar.
    /// Suspends while paused with no step budget.
    async fn admit(&self, bar_ts: DateTime<Utc>) -> Result<bool> {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.stopped {
                    return Ok(false);
                }
                if let Some(target) = state.jump_to {
                    if bar_ts < target {
                        return Ok(true); // skip silently, handled by caller
                    }
                    state.jump_to = None;
                }
                if !state.paused {
                    return Ok(true);
                }
                if let Some(budget) = state.step_budget {
                    if budget > 0 {
                        state.step_budget = Some(budget - 1);
                        if budget == 1 {
                            // Budget exhausted after this bar; stay paused.
                            state.step_budget = None;
                        }
                        return Ok(true);
                    }
                    state.step_budget = None;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn should_skip(&self, bar_ts: DateTime<Utc>) -> bool {
        let state = self.state.lock().await;
        state.jump_to.is_some_and(|target| bar_ts < target)
    }
}

impl Default for ReplayController {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive the event bus with historical bars at a configurable pace.
///
/// `speed` scales bar duration to wall-clock sleep; `f64::INFINITY`
/// fast-forwards without sleeping.
pub struct MarketReplayer {
    repository: Arc<DataRepository>,
    bus: Arc<EventBus>,
    controller: Arc<ReplayController>,
    run_id: String,
    speed: f64,
}

impl MarketReplayer {
    pub fn new(
        repository: Arc<DataRepository>,
        bus: Arc<EventBus>,
        controller: Arc<ReplayController>,
        run_id: &str,
        speed: f64,
    ) -> Result<Self> {
        if speed <= 0.0 {
            return Err(Error::validation("replay speed must be > 0"));
        }
        Ok(MarketReplayer {
            repository,
            bus,
            controller,
            run_id: run_id.to_string(),
            speed,
        })
    }

    /// Replay bars in `[start, end]`, publishing TICK and BAR_CLOSE per
    /// bar. Returns the number of bars delivered.
    pub async fn run(
        &self,
        symbol: &str,
        broker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let bars = self
            .repository
            .get_ohlcv(symbol, broker, timeframe, start, end, false)
            .await?;
        let mut delivered = 0;

        for bar in &bars {
            if self.controller.should_skip(bar.ts_open).await {
                continue;
            }
            if !self.controller.admit(bar.ts_open).await? {
                break;
            }

            if self.speed.is_finite() {
                let pace = timeframe.seconds() as f64 / self.speed;
                tokio::time::sleep(StdDuration::from_secs_f64(pace.max(0.0))).await;
            }

            self.publish_bar(bar).await;
            delivered += 1;
        }
        Ok(delivered)
    }

    async fn publish_bar(&self, bar: &OHLCVBar) {
        let tick = Tick {
            symbol: bar.symbol.clone(),
            broker: bar.broker.clone(),
            ts: bar.ts_close,
            bid: bar.close,
            ask: bar.close,
            last: Some(bar.close),
            volume: Some(bar.volume),
            spread: Some(bar.spread.unwrap_or(0.0)),
            asset_class: bar.asset_class,
            source: "replay".into(),
        };
        self.bus
            .publish(Event::Tick(TickEvent {
                source: "replay.market_replayer".into(),
                run_id: self.run_id.clone(),
                tick,
            }))
            .await;
        self.bus
            .publish(Event::BarClose(BarCloseEvent::from_bar(
                bar,
                "replay.market_replayer",
                &self.run_id,
            )))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::generate_synthetic_bars;
    use crate::core::EventKind;
    use crate::data::AssetClass;
    use crate::storage::{BarCache, MetadataStore, ParquetStore};
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    async fn fixture(hours: i64) -> (tempfile::TempDir, Arc<DataRepository>, DateTime<Utc>, DateTime<Utc>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = start + Duration::hours(hours);
        let bars = generate_synthetic_bars(
            "EURUSD",
            "paper",
            Timeframe::H1,
            start,
            end,
            42,
            1.1,
            AssetClass::Forex,
        );
        store.save_bars(&bars).await.unwrap();
        let repo = Arc::new(DataRepository::new(
            Arc::new(ParquetStore::new(dir.path())),
            Arc::new(MetadataStore::in_memory().unwrap()),
            Arc::new(BarCache::new(64)),
            HashMap::new(),
            None,
        ));
        (dir, repo, start, end)
    }

    #[tokio::test]
    async fn fast_forward_delivers_all_bars() {
        let (_dir, repo, start, end) = fixture(12).await;
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe(EventKind::BarClose).await;
        let controller = Arc::new(ReplayController::new());
        let replayer =
            MarketReplayer::new(repo, bus.clone(), controller, "replay-test", f64::INFINITY)
                .unwrap();

        let delivered = replayer
            .run("EURUSD", "paper", Timeframe::H1, start, end)
            .await
            .unwrap();
        assert_eq!(delivered, 12);
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 12);
    }

    #[tokio::test]
    async fn step_forward_advances_exactly_n() {
        let (_dir, repo, start, end) = fixture(10).await;
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe(EventKind::BarClose).await;
        let controller = Arc::new(ReplayController::new());
        controller.pause().await;

        let replayer = MarketReplayer::new(
            repo,
            bus.clone(),
            controller.clone(),
            "replay-test",
            f64::INFINITY,
        )
        .unwrap();
        let handle = {
            let controller = controller.clone();
            tokio::spawn(async move {
                let delivered = replayer
                    .run("EURUSD", "paper", Timeframe::H1, start, end)
                    .await
                    .unwrap();
                controller.stop().await;
                delivered
            })
        };

        // Paused: nothing arrives.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        controller.step_forward(3).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 3);
        assert!(controller.is_paused().await);

        controller.resume().await;
        let delivered = handle.await.unwrap();
        assert_eq!(delivered, 10);
    }

    #[tokio::test]
    async fn jump_to_skips_earlier_bars() {
        let (_dir, repo, start, end) = fixture(10).await;
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe(EventKind::BarClose).await;
        let controller = Arc::new(ReplayController::new());
        controller.jump_to(start + Duration::hours(6)).await;

        let replayer =
            MarketReplayer::new(repo, bus.clone(), controller, "replay-test", f64::INFINITY)
                .unwrap();
        let delivered = replayer
            .run("EURUSD", "paper", Timeframe::H1, start, end)
            .await
            .unwrap();
        assert_eq!(delivered, 4);
        match rx.try_recv().unwrap() {
            Event::BarClose(event) => {
                assert_eq!(event.ts_open, start + Duration::hours(6));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_speed_is_rejected() {
        let (_dir, repo, _, _) = fixture(2).await;
        let bus = Arc::new(EventBus::new());
        let controller = Arc::new(ReplayController::new());
        assert!(MarketReplayer::new(repo, bus, controller, "r", 0.0).is_err());
    }
}
