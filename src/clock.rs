//! Provides the millisecond wall clock used throughout the crate.
//!
//! Both the cache strategies (logical expiry timestamps) and the id generator (timestamp
//! bits) need to observe the current wall clock time in milliseconds. Routing all reads
//! through [unix_millis](unix_millis) gives us a single place to swap in a mock clock for
//! tests, so that time dependent behaviour (staleness, lease expiry, clock regressions)
//! can be simulated deterministically via `mock_instant::MockClock`.
#[cfg(test)]
use mock_instant::global::MockClock;

#[cfg(not(test))]
use std::time::{SystemTime, UNIX_EPOCH};

/// The base timestamp reported while testing.
///
/// The mock clock starts at zero which would be useless as a wall clock reading (it lies
/// before the id generator epoch). Therefore all test readings are offset by this base,
/// which represents a fixed instant in 2025.
#[cfg(test)]
pub const TEST_CLOCK_BASE: u64 = 1_750_000_000_000;

/// Returns the current wall clock time in milliseconds since the unix epoch.
#[cfg(not(test))]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the mocked wall clock time (see [TEST_CLOCK_BASE](TEST_CLOCK_BASE)).
///
/// Tests steer this reading via `MockClock::advance` and `MockClock::set_time`.
#[cfg(test)]
pub fn unix_millis() -> u64 {
    TEST_CLOCK_BASE + MockClock::time().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn mocked_clock_can_be_advanced() {
        MockClock::set_time(Duration::ZERO);
        let before = unix_millis();
        MockClock::advance(Duration::from_millis(250));
        assert_eq!(unix_millis(), before + 250);
    }
}
