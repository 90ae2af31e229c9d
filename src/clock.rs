//! Time sources for expiry computation.
//!
//! The engine only consults a [`Clock`] to stamp `expires_at` instants and to decide staleness, so tests can drive
//! expiry deterministically by injecting a [`ManualClock`] through [`Config::clock`](crate::Config). Retry and
//! teardown *delays* go through the [`Runtime`](crate::Runtime) instead and are unaffected by the clock.

use std::{
	sync::atomic::{AtomicU64, Ordering},
	time::{SystemTime, UNIX_EPOCH}
};

/// A source of "now", expressed in milliseconds since the Unix epoch.
///
/// `expires_at` instants are absolute so that persisted items remain meaningful across processes.
pub trait Clock: Send + Sync + 'static {
	/// Returns the current time in milliseconds since the Unix epoch.
	fn now(&self) -> u64;
}

/// The default [`Clock`], backed by [`SystemTime`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> u64 {
		// A system clock before the epoch is degenerate enough that treating it as zero is fine.
		SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
	}
}

/// A [`Clock`] that only moves when told to; intended for tests.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
	/// Creates a clock frozen at `now` milliseconds since the epoch.
	pub fn new(now: u64) -> Self {
		ManualClock(AtomicU64::new(now))
	}

	/// Moves the clock forward by `millis`.
	pub fn advance(&self, millis: u64) {
		self.0.fetch_add(millis, Ordering::AcqRel);
	}

	/// Sets the clock to an absolute instant.
	pub fn set(&self, now: u64) {
		self.0.store(now, Ordering::Release);
	}
}

impl Clock for ManualClock {
	fn now(&self) -> u64 {
		self.0.load(Ordering::Acquire)
	}
}

#[cfg(test)]
mod tests {
	use super::{Clock, ManualClock, SystemClock};

	#[test]
	fn manual_clock_advances() {
		let clock = ManualClock::new(1_000);
		assert_eq!(clock.now(), 1_000);
		clock.advance(500);
		assert_eq!(clock.now(), 1_500);
		clock.set(42);
		assert_eq!(clock.now(), 42);
	}

	#[test]
	fn system_clock_is_monotonic_enough() {
		let a = SystemClock.now();
		let b = SystemClock.now();
		assert!(b >= a);
	}
}
