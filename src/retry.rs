//! Fixed-interval retrying of fallible async operations.

use std::{future::Future, num::NonZeroU8, time::Duration};

use crate::runtime::Runtime;

/// Runs `producer` until it succeeds, sleeping `interval` between attempts.
///
/// At most `attempts` attempts are made in total, *including* the first; once the budget is exhausted the last error
/// is returned. The delay is a fixed interval - no backoff progression.
pub async fn retry_with_delay<R, P, Fut, T, E>(runtime: &R, interval: Duration, attempts: NonZeroU8, mut producer: P) -> Result<T, E>
where
	R: Runtime,
	P: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>
{
	let mut remaining = attempts.get();
	loop {
		match producer().await {
			Ok(value) => return Ok(value),
			Err(err) => {
				remaining -= 1;
				if remaining == 0 {
					return Err(err);
				}
				runtime.wait(interval).await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{
		num::NonZeroU8,
		sync::{
			Arc,
			atomic::{AtomicUsize, Ordering}
		},
		time::Duration
	};

	use super::retry_with_delay;
	use crate::runtime::Tokio;

	#[tokio::test(start_paused = true)]
	async fn succeeds_without_retrying() {
		let calls = Arc::new(AtomicUsize::new(0));
		let result: Result<u32, u32> = retry_with_delay(&Tokio, Duration::from_secs(5), NonZeroU8::new(3).unwrap(), || {
			let calls = Arc::clone(&calls);
			async move {
				calls.fetch_add(1, Ordering::AcqRel);
				Ok(42)
			}
		})
		.await;

		assert_eq!(result, Ok(42));
		assert_eq!(calls.load(Ordering::Acquire), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn recovers_after_transient_failures() {
		let calls = Arc::new(AtomicUsize::new(0));
		let result: Result<u32, u32> = retry_with_delay(&Tokio, Duration::from_secs(5), NonZeroU8::new(3).unwrap(), || {
			let calls = Arc::clone(&calls);
			async move {
				if calls.fetch_add(1, Ordering::AcqRel) < 2 { Err(0) } else { Ok(7) }
			}
		})
		.await;

		assert_eq!(result, Ok(7));
		assert_eq!(calls.load(Ordering::Acquire), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn propagates_the_last_error_on_exhaustion() {
		let calls = Arc::new(AtomicUsize::new(0));
		let result: Result<u32, usize> = retry_with_delay(&Tokio, Duration::from_secs(5), NonZeroU8::new(3).unwrap(), || {
			let calls = Arc::clone(&calls);
			async move { Err(calls.fetch_add(1, Ordering::AcqRel)) }
		})
		.await;

		assert_eq!(result, Err(2));
		assert_eq!(calls.load(Ordering::Acquire), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn waits_the_full_interval_between_attempts() {
		let started = tokio::time::Instant::now();
		let _: Result<u32, u32> = retry_with_delay(&Tokio, Duration::from_secs(5), NonZeroU8::new(3).unwrap(), || async { Err(0) }).await;

		// two sleeps between three attempts
		assert_eq!(started.elapsed(), Duration::from_secs(10));
	}
}
