use std::{num::NonZeroU8, sync::Arc, time::Duration};

use crate::{
	cache::CacheItem,
	clock::{Clock, SystemClock},
	events::EventBus,
	store::PersistentStore
};

pub(crate) const TEARDOWN_GRACE: Duration = Duration::from_millis(100);

/// Cache-wide configuration, passed to [`Swr::with_config`](crate::Swr::with_config).
///
/// The three interval/retry fields are defaults; every call taking [`Options`] can override them for that call only.
pub struct Config {
	/// The lifetime granted to a freshly fetched or mutated item, during which further queries reuse it without
	/// refetching. Also determines the teardown grace of idle entries.
	pub deduping_interval: Duration,
	/// The delay between fetch attempts when a fetch fails.
	pub error_retry_interval: Duration,
	/// The total number of fetch attempts (including the first) before a fetch is considered terminally failed.
	pub error_retry_count: NonZeroU8,
	/// The store unexpired items are persisted to, shared with other contexts. `None` disables persistence entirely.
	pub store: Option<Arc<dyn PersistentStore>>,
	/// The time source used for expiry stamps.
	pub clock: Arc<dyn Clock>,
	/// The ambient signal bus to listen on. When `None`, the cache creates its own (reachable via
	/// [`Swr::events`](crate::Swr::events)); pass a shared bus to drive several caches from one set of signals.
	pub events: Option<EventBus>
}

impl Default for Config {
	fn default() -> Self {
		Self {
			deduping_interval: Duration::from_millis(6000),
			error_retry_interval: Duration::from_millis(5000),
			error_retry_count: NonZeroU8::new(3).unwrap(),
			store: None,
			clock: Arc::new(SystemClock),
			events: None
		}
	}
}

/// Seed data for a cache entry that has never been fetched.
pub enum InitialData<T> {
	/// A bare value; it is treated as immediately stale (revalidated by the first query) but still served as the
	/// initial value.
	Value(Arc<T>),
	/// A full item with its own expiry.
	Item(CacheItem<T>)
}

impl<T> InitialData<T> {
	pub(crate) fn into_item(self) -> CacheItem<T> {
		match self {
			InitialData::Value(data) => CacheItem::new(data, 0),
			InitialData::Item(item) => item
		}
	}
}

impl<T> From<Arc<T>> for InitialData<T> {
	fn from(value: Arc<T>) -> Self {
		InitialData::Value(value)
	}
}

impl<T> From<CacheItem<T>> for InitialData<T> {
	fn from(item: CacheItem<T>) -> Self {
		InitialData::Item(item)
	}
}

/// Per-call options for [`Swr::query_with`](crate::Swr::query_with) and friends.
///
/// Every `None` field falls back to the corresponding [`Config`] default. Overrides apply to the call they are passed
/// to - they are not merged into the entry for other callers.
pub struct Options<T> {
	/// Seed data to populate the entry with if it is created by this call and the persistent store has nothing
	/// fresher.
	pub initial_data: Option<InitialData<T>>,
	/// Overrides [`Config::deduping_interval`].
	pub deduping_interval: Option<Duration>,
	/// Overrides [`Config::error_retry_interval`].
	pub error_retry_interval: Option<Duration>,
	/// Overrides [`Config::error_retry_count`].
	pub error_retry_count: Option<NonZeroU8>
}

impl<T> Default for Options<T> {
	fn default() -> Self {
		Self {
			initial_data: None,
			deduping_interval: None,
			error_retry_interval: None,
			error_retry_count: None
		}
	}
}

impl<T> Options<T> {
	/// Shorthand for options carrying only [initial data][Options::initial_data].
	pub fn initial(data: T) -> Self {
		Self {
			initial_data: Some(InitialData::Value(Arc::new(data))),
			..Options::default()
		}
	}
}

/// Options for [`Swr::mutate`](crate::Swr::mutate) and [`Swr::mutate_with`](crate::Swr::mutate_with).
#[derive(Clone, Copy, Debug, Default)]
pub struct MutateOptions {
	/// Whether to revalidate the key after the mutation lands. Since a mutation *provides* the value, this defaults
	/// to `false`; a plain [`Swr::revalidate`](crate::Swr::revalidate) covers the "drop my value and refetch" case.
	pub revalidate: bool
}

impl MutateOptions {
	/// Options that schedule a revalidation after the mutation.
	pub fn and_revalidate() -> Self {
		MutateOptions { revalidate: true }
	}
}

/// The intervals actually in effect for one call, after per-call overrides.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolvedOptions {
	pub deduping_interval: Duration,
	pub error_retry_interval: Duration,
	pub error_retry_count: NonZeroU8
}

impl ResolvedOptions {
	pub fn from_config(config: &Config) -> Self {
		ResolvedOptions {
			deduping_interval: config.deduping_interval,
			error_retry_interval: config.error_retry_interval,
			error_retry_count: config.error_retry_count
		}
	}

	pub fn merge<T>(mut self, options: &Options<T>) -> Self {
		if let Some(deduping_interval) = options.deduping_interval {
			self.deduping_interval = deduping_interval;
		}
		if let Some(error_retry_interval) = options.error_retry_interval {
			self.error_retry_interval = error_retry_interval;
		}
		if let Some(error_retry_count) = options.error_retry_count {
			self.error_retry_count = error_retry_count;
		}
		self
	}

	/// Lifetime stamped onto fresh items, in clock milliseconds.
	pub fn deduping_millis(&self) -> u64 {
		self.deduping_interval.as_millis() as u64
	}

	/// How long an idle entry is held before teardown.
	pub fn teardown_delay(&self) -> Duration {
		self.deduping_interval + TEARDOWN_GRACE
	}
}
