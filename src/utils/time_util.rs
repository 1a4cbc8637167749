use serde::{Deserialize, Serialize};
use std::time::{self, SystemTime};
/// represent current time with seconds and fraction of a second in nanoseconds
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq)]
pub struct TimeDurationStruct {
    /// seconds
    pub sec: u64,
    /// fraction of a second in nanoseconds
    pub nsec: u32,
}

/// calculate what time is it since `1970-1-1 00:00:00`,named as [UNIX_EPOCH](std::time::UNIX_EPOCH)
pub fn now() -> TimeDurationStruct {
    // a clock set before 1970 reads as the epoch itself
    let now = SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .unwrap_or_default();
    TimeDurationStruct {
        sec: now.as_secs(),
        nsec: now.subsec_nanos(),
    }
}

/// wall-clock second counter used to seed generation numbers
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u32;
}

/// [Clock] backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u32 {
        u32::try_from(now().sec).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_splits_seconds_and_nanos() {
        let t = now();
        assert!(t.nsec < 1_000_000_000);
        assert!(t.sec > 0);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_secs() > 1_577_836_800);
    }
}
