use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::time::Instant;

/// A UTC clock anchored to the last successful sync. Before any sync it
/// follows the system clock.
#[derive(Debug, Default)]
pub struct SyncedClock {
    anchor: Mutex<Option<(DateTime<Utc>, Instant)>>,
}

impl SyncedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, utc: DateTime<Utc>) {
        *self.anchor.lock() = Some((utc, Instant::now()));
    }

    pub fn is_synced(&self) -> bool {
        self.anchor.lock().is_some()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.anchor.lock().map(|(utc, _)| utc)
    }

    /// `last_sync + elapsed`, or the system time when never synced.
    pub fn now(&self) -> DateTime<Utc> {
        match *self.anchor.lock() {
            Some((utc, at)) => {
                let elapsed = TimeDelta::from_std(at.elapsed()).unwrap_or(TimeDelta::zero());
                utc + elapsed
            }
            None => Utc::now(),
        }
    }

    /// Synced time minus system time.
    pub fn offset(&self) -> TimeDelta {
        self.now() - Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_unsynced_follows_system_clock() {
        let clock = SyncedClock::new();
        assert!(!clock.is_synced());
        assert!(clock.offset().num_milliseconds().abs() < 1000);
    }

    #[test]
    fn test_advances_from_anchor() {
        let clock = SyncedClock::new();
        let anchor = Utc.with_ymd_and_hms(2020, 5, 1, 8, 0, 0).unwrap();
        clock.set(anchor);
        std::thread::sleep(Duration::from_millis(30));

        let now = clock.now();
        assert!(now >= anchor + TimeDelta::milliseconds(30));
        assert!(now < anchor + TimeDelta::seconds(5));
        assert_eq!(clock.last_sync(), Some(anchor));
        assert!(clock.offset() < TimeDelta::days(-365));
    }
}
