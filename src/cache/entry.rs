use std::sync::{
	Arc,
	atomic::{AtomicBool, AtomicU32, Ordering}
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{fetcher::Fetcher, options::ResolvedOptions, runtime::Runtime, util::TaskSlot};

/// A cached value together with the instant it goes stale.
///
/// Items are immutable once produced; a revalidation or mutation replaces the whole item.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheItem<T> {
	/// The cached value.
	pub data: Arc<T>,
	/// The instant this item goes stale, in milliseconds since the Unix epoch.
	pub expires_at: u64
}

impl<T> CacheItem<T> {
	/// Creates an item expiring at the given instant.
	pub fn new(data: Arc<T>, expires_at: u64) -> Self {
		CacheItem { data, expires_at }
	}

	/// Returns whether this item is stale at `now` (milliseconds since the Unix epoch).
	pub fn is_expired(&self, now: u64) -> bool {
		self.expires_at < now
	}
}

impl<T> Clone for CacheItem<T> {
	fn clone(&self) -> Self {
		CacheItem {
			data: Arc::clone(&self.data),
			expires_at: self.expires_at
		}
	}
}

/// The state of an entry's `source` channel.
pub(crate) enum SourceSlot<T, E> {
	/// No value has ever been produced.
	Empty,
	/// The latest known item, possibly stale.
	Item(CacheItem<T>),
	/// Fetching failed terminally before any value existed; the entry is dead.
	Dead(Arc<E>)
}

impl<T, E> Clone for SourceSlot<T, E> {
	fn clone(&self) -> Self {
		match self {
			SourceSlot::Empty => SourceSlot::Empty,
			SourceSlot::Item(item) => SourceSlot::Item(item.clone()),
			SourceSlot::Dead(err) => SourceSlot::Dead(Arc::clone(err))
		}
	}
}

/// Per-key cache state.
///
/// An entry holds the three latest-value channels consumers observe, the subscriber refcount, and one [`TaskSlot`]
/// per kind of background work. It has no behavior of its own; all transitions are driven by
/// [`Cache`](super::Cache) and the fetch/lifecycle launchers in [`revalidate`](crate::revalidate).
pub(crate) struct CacheEntry<F: Fetcher, R: Runtime> {
	key: String,

	source: watch::Sender<SourceSlot<F::Data, F::Error>>,
	errors: watch::Sender<Option<Arc<F::Error>>>,
	validating: watch::Sender<bool>,

	subscribers: AtomicU32,
	stopped: AtomicBool,
	options: ResolvedOptions,

	pub fetch_task: TaskSlot<R>,
	pub teardown_task: TaskSlot<R>,
	pub focus_task: TaskSlot<R>,
	pub online_task: TaskSlot<R>
}

impl<F: Fetcher, R: Runtime> CacheEntry<F, R> {
	pub fn new(runtime: R, key: String, seed: Option<CacheItem<F::Data>>, options: ResolvedOptions) -> Self {
		let initial = match seed {
			Some(item) => SourceSlot::Item(item),
			None => SourceSlot::Empty
		};
		Self {
			key,

			source: watch::channel(initial).0,
			errors: watch::channel(None).0,
			validating: watch::channel(false).0,

			subscribers: AtomicU32::new(0),
			stopped: AtomicBool::new(false),
			options,

			fetch_task: TaskSlot::new(runtime.clone()),
			teardown_task: TaskSlot::new(runtime.clone()),
			focus_task: TaskSlot::new(runtime.clone()),
			online_task: TaskSlot::new(runtime)
		}
	}

	#[inline]
	pub fn key(&self) -> &str {
		&self.key
	}

	#[inline]
	pub fn options(&self) -> ResolvedOptions {
		self.options
	}

	pub fn item(&self) -> Option<CacheItem<F::Data>> {
		match &*self.source.borrow() {
			SourceSlot::Item(item) => Some(item.clone()),
			_ => None
		}
	}

	/// The current item's expiry, or `0` when there is no item (so any unexpired incoming item compares greater).
	pub fn expires_at(&self) -> u64 {
		match &*self.source.borrow() {
			SourceSlot::Item(item) => item.expires_at,
			_ => 0
		}
	}

	pub fn set_item(&self, item: CacheItem<F::Data>) {
		self.source.send_replace(SourceSlot::Item(item));
	}

	/// Terminates `source` with `error` and marks the entry stopped; the next query for this key starts over with a
	/// fresh entry.
	pub fn kill(&self, error: Arc<F::Error>) {
		self.stopped.store(true, Ordering::Release);
		self.source.send_replace(SourceSlot::Dead(error));
	}

	pub fn set_error(&self, error: Arc<F::Error>) {
		self.errors.send_replace(Some(error));
	}

	pub fn clear_error(&self) {
		self.errors.send_if_modified(|current| current.take().is_some());
	}

	pub fn set_validating(&self, validating: bool) {
		self.validating.send_if_modified(|current| {
			if *current != validating {
				*current = validating;
				true
			} else {
				false
			}
		});
	}

	pub fn is_validating(&self) -> bool {
		*self.validating.borrow()
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped.load(Ordering::Acquire)
	}

	pub fn subscribe_source(&self) -> watch::Receiver<SourceSlot<F::Data, F::Error>> {
		self.source.subscribe()
	}

	pub fn subscribe_errors(&self) -> watch::Receiver<Option<Arc<F::Error>>> {
		self.errors.subscribe()
	}

	pub fn subscribe_validating(&self) -> watch::Receiver<bool> {
		self.validating.subscribe()
	}

	/// Increments the subscriber refcount, returning the previous count.
	pub fn add_subscriber(&self) -> u32 {
		self.subscribers.fetch_add(1, Ordering::AcqRel)
	}

	/// Decrements the subscriber refcount, returning the new count.
	pub fn remove_subscriber(&self) -> u32 {
		self.subscribers.fetch_sub(1, Ordering::AcqRel) - 1
	}

	pub fn subscriber_count(&self) -> u32 {
		self.subscribers.load(Ordering::Acquire)
	}

	pub fn abort_tasks(&mut self) {
		self.fetch_task.abort();
		self.teardown_task.abort();
		self.focus_task.abort();
		self.online_task.abort();
	}
}
