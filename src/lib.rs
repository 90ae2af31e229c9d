//! Reactive stale-while-revalidate data cache.
//!
//! SWR operates on the "stale-while-revalidate" principle: *stale* data is served immediately while it is
//! *revalidated* in the background. Revalidation is triggered by time-based expiry, by ambient
//! [focus/online signals](EventBus), by another context updating the shared [persistent store](store), and by
//! explicit [`revalidate`](Swr::revalidate) calls.
//!
//! To create an [`Swr`] cache you need a **[`Fetcher`]** and optionally a **[`Runtime`]**. The `Fetcher` is
//! responsible for retrieving the data (e.g. from a remote server) when a key needs to be revalidated; the `Runtime`
//! connects the cache to an async runtime like [`tokio`] so it can run fetches in the background.
//!
//! Data is retrieved with a **key** derived from the fetch arguments - anything JSON-expressible, from a URL path to
//! a user-defined struct. [`Swr::query`] returns a [`Query`] handle exposing three latest-value streams: the data
//! itself, the last fetch error, and whether a fetch is currently in flight. All usages of a key share one cache
//! entry; the entry lives for as long as anyone holds a [data subscription](Query::data) on it, plus a grace period
//! so a consumer that quickly resubscribes finds its entry intact.
//!
//! ```no_run
//! # use serde::{Deserialize, Serialize};
//! # #[derive(Debug)] struct ApiError;
//! # impl std::fmt::Display for ApiError {
//! # 	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//! # 		f.write_str("api error")
//! # 	}
//! # }
//! # impl std::error::Error for ApiError {}
//! # #[derive(Serialize, Deserialize)] struct Todo;
//! # struct Api;
//! # impl sswr::Fetcher for Api {
//! # 	type Args = String;
//! # 	type Data = Todo;
//! # 	type Error = ApiError;
//! # 	async fn fetch(&self, _: &String) -> Result<Todo, ApiError> {
//! # 		Ok(Todo)
//! # 	}
//! # }
//! # #[tokio::main]
//! # async fn main() {
//! let swr = sswr::Swr::<Api>::new(Api);
//!
//! let query = swr.query(&"/todos/1".to_string());
//! let mut data = query.data();
//! while let Some(_todo) = data.next().await {
//! 	// first the cached value (if any), then each revalidated value
//! }
//! # }
//! ```
//!
//! Keys can also be **mutated** to immediately override the cached value ([`Swr::mutate`]), or updated from the
//! result of an async task ([`Swr::mutate_with`]), optionally scheduling a revalidation afterwards.
//!
//! With a [`PersistentStore`] configured, unexpired items survive across cache instances, and several caches sharing
//! one store converge through its `storage` change notifications.
//!
//! # Cargo features
//! - **`tokio`** *(default)*: the [`tokio`] runtime via [`runtime::Tokio`].
//! - **`smol`**: the [`smol`] runtime via [`runtime::Smol`].
//! - **`tracing`** *(default)*: logs fetches, teardown and swallowed persistence errors via [`tracing`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rust_2024_compatibility)]
#![allow(clippy::tabs_in_doc_comments)]
#![warn(missing_docs)]

use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;

pub(crate) mod cache;
pub mod clock;
pub mod events;
pub(crate) mod fetcher;
pub mod key;
pub(crate) mod options;
pub(crate) mod query;
pub mod retry;
pub(crate) mod revalidate;
pub mod runtime;
pub mod store;
pub(crate) mod util;

#[cfg(test)]
mod tests;

use self::{
	cache::{Cache, CacheSlot},
	options::ResolvedOptions,
	revalidate::{RevalidateReason, launch_fetch, launch_teardown},
	runtime::{DefaultRuntime, RuntimeDefault},
	store::NAMESPACE
};
pub use self::{
	cache::CacheItem,
	clock::{Clock, ManualClock, SystemClock},
	events::{EventBus, StorageEvent},
	fetcher::Fetcher,
	options::{Config, InitialData, MutateOptions, Options},
	query::{DataStream, ErrorStream, FlagStream, Query},
	runtime::Runtime,
	store::{MemoryStore, PersistentStore, StoreError}
};

pub(crate) struct SwrInner<F: Fetcher, R: Runtime> {
	pub(crate) fetcher: F,
	pub(crate) runtime: R,
	pub(crate) events: EventBus,
	defaults: ResolvedOptions,
	pub(crate) cache: Cache<F, R>,
	storage_task: Mutex<Option<R::Task<()>>>
}

impl<F: Fetcher, R: Runtime> SwrInner<F, R> {
	fn query_key(self: &Arc<Self>, key: String, options: Options<F::Data>) -> Query<F, R> {
		let resolved = self.defaults.merge(&options);
		let seed = options.initial_data.map(InitialData::into_item);

		let (slot, created) = self.cache.get_or_init(&key, seed, resolved);
		if created {
			let mut states = self.cache.states();
			states.mutate(slot, |entry| launch_teardown(entry, self, slot));
		}

		self.revalidate_slot(slot, false, Some(resolved), if created { RevalidateReason::FirstUse } else { RevalidateReason::Stale });

		Query::new(Arc::clone(self), slot)
	}

	/// Revalidation guard: a fetch is dispatched iff forced, the entry has no item, or its item is expired.
	pub(crate) fn revalidate_slot(self: &Arc<Self>, slot: CacheSlot, force: bool, options: Option<ResolvedOptions>, reason: RevalidateReason) {
		let now = self.cache.now();
		let mut states = self.cache.states();
		states.mutate(slot, |entry| {
			if entry.is_stopped() {
				return;
			}
			if force || entry.item().is_none_or(|item| item.is_expired(now)) {
				let options = options.unwrap_or_else(|| entry.options());
				launch_fetch(entry, self, slot, options, reason);
			}
		});
	}

	/// Pushes `data` into the entry behind `slot`, returning whether the push happened.
	pub(crate) fn mutate_slot(self: &Arc<Self>, slot: CacheSlot, data: Arc<F::Data>, options: MutateOptions) -> bool {
		let now = self.cache.now();
		let pushed = {
			let mut states = self.cache.states();
			states
				.mutate(slot, |entry| {
					if entry.is_stopped() {
						return false;
					}
					let item = CacheItem::new(data, now + entry.options().deduping_millis());
					entry.set_item(item.clone());
					self.cache.persist_item(entry.key(), &item);
					true
				})
				.unwrap_or(false)
		};
		if pushed && options.revalidate {
			self.revalidate_slot(slot, true, None, RevalidateReason::Mutate);
		}
		pushed
	}

	pub(crate) fn mutate_with_slot<M, E, Fut>(self: &Arc<Self>, slot: CacheSlot, options: MutateOptions, mutator: M) -> R::Task<Result<Arc<F::Data>, E>>
	where
		M: FnOnce(Option<Arc<F::Data>>, &F) -> Fut + Send + 'static,
		E: Send + 'static,
		Fut: Future<Output = Result<F::Data, E>> + Send
	{
		let inner = Arc::clone(self);
		self.runtime.spawn(async move {
			let current = {
				let states = inner.cache.states();
				states.get(slot).and_then(|entry| {
					entry.set_validating(true);
					entry.item().map(|item| item.data)
				})
			};

			let result = mutator(current, &inner.fetcher).await;

			match result {
				Ok(data) => {
					let data = Arc::new(data);
					let now = inner.cache.now();
					{
						let mut states = inner.cache.states();
						states.mutate(slot, |entry| {
							if !entry.is_stopped() {
								let item = CacheItem::new(Arc::clone(&data), now + entry.options().deduping_millis());
								entry.set_item(item.clone());
								inner.cache.persist_item(entry.key(), &item);
							}
							entry.set_validating(false);
							if entry.subscriber_count() == 0 {
								launch_teardown(entry, &inner, slot);
							}
						});
					}
					if options.revalidate {
						inner.revalidate_slot(slot, true, None, RevalidateReason::Mutate);
					}
					Ok(data)
				}
				Err(err) => {
					let mut states = inner.cache.states();
					states.mutate(slot, |entry| {
						entry.set_validating(false);
						if entry.subscriber_count() == 0 {
							launch_teardown(entry, &inner, slot);
						}
					});
					Err(err)
				}
			}
		})
	}

	/// Creates the entry for `key` with default options if it is missing or stopped.
	fn ensure_entry(self: &Arc<Self>, key: &str) -> CacheSlot {
		let (slot, created) = self.cache.get_or_init(key, None, self.defaults);
		if created {
			let mut states = self.cache.states();
			states.mutate(slot, |entry| launch_teardown(entry, self, slot));
		}
		slot
	}
}

/// A stale-while-revalidate cache.
///
/// See [the crate-level documentation][crate] for an overview.
///
/// # Cloning
/// `Swr` is internally reference counted via [`Arc`], so it can be cheaply cloned.
pub struct Swr<F: Fetcher, R: Runtime = DefaultRuntime> {
	inner: Arc<SwrInner<F, R>>
}

impl<F: Fetcher, R: Runtime> Clone for Swr<F, R> {
	fn clone(&self) -> Self {
		Swr { inner: Arc::clone(&self.inner) }
	}
}

impl<F: Fetcher, R: Runtime> Swr<F, R> {
	/// Creates a cache with the default [`Config`].
	///
	/// To use this constructor, the [`Runtime`] (`R`) must implement [`Default`], which is the case when using the
	/// [default runtime][crate#cargo-features] (i.e. not specifying `R`).
	#[inline]
	pub fn new(fetcher: F) -> Self
	where
		R: RuntimeDefault
	{
		Self::new_in(fetcher, R::default(), Config::default())
	}

	/// Creates a cache with the given [`Config`].
	#[inline]
	pub fn with_config(fetcher: F, config: Config) -> Self
	where
		R: RuntimeDefault
	{
		Self::new_in(fetcher, R::default(), config)
	}

	/// Creates a cache using a non-default [`Runtime`].
	pub fn new_in(fetcher: F, runtime: R, config: Config) -> Self {
		let defaults = ResolvedOptions::from_config(&config);
		let Config { store, clock, events, .. } = config;

		let cache = Cache::new(runtime.clone(), clock, store.clone());
		let inner = Arc::new(SwrInner {
			fetcher,
			runtime,
			events: events.unwrap_or_default(),
			defaults,
			cache,
			storage_task: Mutex::new(None)
		});

		if let Some(store) = &store {
			store.subscribe(inner.events.storage_sender());
		}

		// Reconcile whenever another context rewrites our namespace key.
		let storage_task = {
			let weak = Arc::downgrade(&inner);
			let mut storage = inner.events.storage_listener();
			inner.runtime.spawn(async move {
				loop {
					match storage.recv().await {
						Ok(event) => {
							let Some(inner) = weak.upgrade() else {
								break;
							};
							if event.key == NAMESPACE && event.new_value != event.old_value {
								inner.cache.sync_with_storage();
							}
						}
						Err(RecvError::Lagged(_)) => {
							let Some(inner) = weak.upgrade() else {
								break;
							};
							inner.cache.sync_with_storage();
						}
						Err(RecvError::Closed) => break
					}
				}
			})
		};
		*inner.storage_task.lock() = Some(storage_task);

		Self { inner }
	}

	/// Declares interest in the resource described by `args`, using the default [`Options`].
	///
	/// The entry is created if missing (seeded from the persistent store when possible), and a revalidation is kicked
	/// off iff the entry has no value or its value is expired.
	pub fn query(&self, args: &F::Args) -> Query<F, R> {
		self.query_with(args, Options::default())
	}

	/// Declares interest in the resource described by `args`.
	///
	/// See [`Options`] for the per-call overrides.
	pub fn query_with(&self, args: &F::Args, options: Options<F::Data>) -> Query<F, R> {
		match key::encode(args) {
			Ok(key) => self.inner.query_key(key, options),
			Err(_err) => {
				#[cfg(feature = "tracing")]
				{
					tracing::warn!("cannot encode fetch arguments into a key: {_err}");
				}
				Query::inert()
			}
		}
	}

	/// Declares interest in a resource whose arguments may not be computable yet.
	///
	/// This is the mechanism for conditional and dependent fetches: return `None` from `factory` while the key's
	/// inputs are unavailable (e.g. they depend on another query that has not resolved), and the returned [`Query`]
	/// is inert - no entry is created, its streams complete without emitting, and its mutate/revalidate do nothing.
	pub fn try_query<G>(&self, factory: G, options: Options<F::Data>) -> Query<F, R>
	where
		G: FnOnce() -> Option<F::Args>
	{
		match factory() {
			Some(args) => self.query_with(&args, options),
			None => Query::inert()
		}
	}

	/// Forces a revalidation of the key described by `args`, if it exists in the cache.
	///
	/// This is also the idiom for "mutate without a value": drop nothing, refetch now.
	pub fn revalidate(&self, args: &F::Args) {
		let Ok(key) = key::encode(args) else {
			return;
		};
		if let Some(slot) = self.inner.cache.get(&key) {
			self.inner.revalidate_slot(slot, true, None, RevalidateReason::Manual);
		}
	}

	/// Replaces the key's value with `data`, creating the entry if it doesn't exist.
	///
	/// The value becomes a fresh item expiring `deduping_interval` from now, and is persisted like a fetched one.
	/// By default no revalidation follows; see [`MutateOptions::revalidate`]. Returns the value that was pushed.
	pub fn mutate(&self, args: &F::Args, data: F::Data, options: MutateOptions) -> Arc<F::Data> {
		let data = Arc::new(data);
		let Ok(key) = key::encode(args) else {
			return data;
		};
		let slot = self.inner.ensure_entry(&key);
		self.inner.mutate_slot(slot, Arc::clone(&data), options);
		data
	}

	/// Asynchronously mutates the key's value, creating the entry if it doesn't exist.
	///
	/// The `mutator` receives the entry's current value (if any) and a reference to this cache's [`Fetcher`], and
	/// returns a future whose result populates the cache. The entry is marked validating for the duration. The result
	/// is also returned through the spawned [task][Runtime::Task], which may be awaited on (depending on the exact
	/// choice of [`Runtime`]). A mutator error leaves the cached value untouched.
	pub fn mutate_with<M, E, Fut>(&self, args: &F::Args, options: MutateOptions, mutator: M) -> R::Task<Result<Arc<F::Data>, E>>
	where
		M: FnOnce(Option<Arc<F::Data>>, &F) -> Fut + Send + 'static,
		E: Send + 'static,
		Fut: Future<Output = Result<F::Data, E>> + Send
	{
		let slot = match key::encode(args) {
			Ok(key) => self.inner.ensure_entry(&key),
			// An unencodable key cannot have an entry; run the mutator against nothing so its result still reaches
			// the caller.
			Err(_) => CacheSlot::default()
		};
		self.inner.mutate_with_slot(slot, options, mutator)
	}

	/// Returns the ambient signal bus this cache listens on.
	///
	/// Emit [`focus`](EventBus::emit_focus) and [`online`](EventBus::emit_online) events into it to trigger
	/// revalidation of subscribed entries.
	pub fn events(&self) -> &EventBus {
		&self.inner.events
	}

	#[cfg(test)]
	pub(crate) fn cache(&self) -> &Cache<F, R> {
		&self.inner.cache
	}
}

/// Creates a new SWR cache with the default [`Config`], using the *default runtime*.
#[inline(always)]
pub fn new<F: Fetcher, R: Runtime + RuntimeDefault>(fetcher: F) -> Swr<F, R> {
	Swr::new(fetcher)
}

/// Creates a new SWR cache using a non-default [`Runtime`].
#[inline(always)]
pub fn new_in<F: Fetcher, R: Runtime>(fetcher: F, runtime: R, config: Config) -> Swr<F, R> {
	Swr::new_in(fetcher, runtime, config)
}
