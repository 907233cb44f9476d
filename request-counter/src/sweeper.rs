//! Background eviction of expired timestamps.

use crate::{clock::Clock, window_store::WindowStore};
use chrono::TimeDelta;
use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shortest sweep interval we will schedule.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// The default sweep interval for a given retention: a tenth of it, but not less than
/// [`MIN_SWEEP_INTERVAL`].
pub fn default_sweep_interval(retention: Duration) -> Duration {
    (retention / 10).max(MIN_SWEEP_INTERVAL)
}

/// Periodically removes entries older than the retention from a [`WindowStore`].
///
/// An entry is removed at most one `interval` after it expires (plus time spent
/// waiting on the store's lock), so `count()` can overstate the window by at
/// most the requests that expired within the last interval.
pub struct Sweeper {
    store: Arc<WindowStore>,
    clock: Arc<dyn Clock>,
    retention: TimeDelta,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        store: Arc<WindowStore>,
        clock: Arc<dyn Clock>,
        retention: TimeDelta,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            retention,
            interval: interval.max(MIN_SWEEP_INTERVAL),
        }
    }

    /// Do one eviction pass now, returning the number of entries removed.
    pub fn sweep(&self) -> usize {
        // A window reaching before the earliest representable time keeps everything
        match self.clock.now().checked_sub_signed(self.retention) {
            Some(cutoff) => self.store.evict_older_than(cutoff),
            None => 0,
        }
    }

    /// Sweep every interval until the token is cancelled.
    pub async fn run(self, token: CancellationToken) {
        info!(
            "Sweeper started, interval = {}",
            humantime::format_duration(self.interval)
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!("Evicted {removed} expired timestamps, {} remain", self.store.count());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::DateTime;

    fn at(secs: i64) -> crate::timestamp::Timestamp {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_default_sweep_interval() {
        assert_eq!(
            default_sweep_interval(Duration::from_secs(60)),
            Duration::from_secs(6)
        );
        assert_eq!(
            default_sweep_interval(Duration::from_millis(20)),
            MIN_SWEEP_INTERVAL
        );
    }

    #[test]
    fn test_sweep_uses_clock() {
        let clock = Arc::new(ManualClock::new(at(0)));
        let store = Arc::new(WindowStore::new());
        let sweeper = Sweeper::new(
            store.clone(),
            clock.clone(),
            TimeDelta::seconds(60),
            Duration::from_secs(1),
        );

        store.record(at(0));
        clock.set(at(10));
        store.record(at(10));
        clock.set(at(70));
        store.record(at(70));

        // Nothing has swept yet, so the t=0 entry is still counted
        assert_eq!(store.count(), 3);

        assert_eq!(sweeper.sweep(), 1);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_sweep_with_huge_retention_keeps_everything() {
        let clock = Arc::new(ManualClock::new(at(1_000)));
        let store = Arc::new(WindowStore::from_entries(vec![at(0), at(500)]));
        let sweeper = Sweeper::new(store.clone(), clock, TimeDelta::MAX, Duration::from_secs(1));

        assert_eq!(sweeper.sweep(), 0);
        assert_eq!(store.count(), 2);
    }

    // Scenario: retention 60s, entries at t=0, 10, 70. The t=0 entry must be gone
    // within one sweep interval after t=70.
    #[tokio::test(start_paused = true)]
    async fn test_sweeper_converges_within_one_interval() {
        let interval = Duration::from_secs(1);
        let clock = Arc::new(ManualClock::new(at(0)));
        let store = Arc::new(WindowStore::from_entries(vec![at(0), at(10)]));
        let token = CancellationToken::new();

        let sweeper = Sweeper::new(store.clone(), clock.clone(), TimeDelta::seconds(60), interval);
        let task = tokio::spawn(sweeper.run(token.clone()));

        // Let the first (immediate) tick happen
        tokio::time::sleep(interval / 2).await;
        assert_eq!(store.count(), 2);

        clock.set(at(70));
        store.record(at(70));
        tokio::time::sleep(interval).await;
        assert_eq!(store.count(), 2);

        let mut left = store.snapshot();
        left.sort();
        assert_eq!(left, vec![at(10), at(70)]);

        // With no new records, everything drains once the clock passes the window
        clock.set(at(200));
        tokio::time::sleep(interval).await;
        assert_eq!(store.count(), 0);

        // An empty store does not stop the sweeper
        tokio::time::sleep(interval * 3).await;
        assert!(!task.is_finished());

        token.cancel();
        task.await.unwrap();
    }
}
