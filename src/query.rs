use std::{future::Future, sync::Arc};

use tokio::sync::watch;

use crate::{
	SwrInner,
	cache::{CacheSlot, SourceSlot},
	fetcher::Fetcher,
	options::MutateOptions,
	revalidate::{RevalidateReason, launch_signal_listeners, launch_teardown},
	runtime::{DefaultRuntime, Runtime}
};

fn closed_channel<T>(initial: T) -> watch::Receiver<T> {
	let (tx, rx) = watch::channel(initial);
	drop(tx);
	rx
}

/// A handle to one key's entry in the [cache][crate::Swr], returned by [`Swr::query`](crate::Swr::query).
///
/// The handle itself is passive; it does not keep the entry alive or receive anything. Streams are obtained from it:
/// [`Query::data`] subscribes to the entry (contributing to its lifecycle), while [`Query::error`] and
/// [`Query::is_validating`] are plain observers.
///
/// A `Query` obtained through [`Swr::try_query`](crate::Swr::try_query) with an unready key is *inert*: its streams
/// complete without ever emitting and its mutate/revalidate are no-ops.
pub struct Query<F: Fetcher, R: Runtime = DefaultRuntime> {
	slot: CacheSlot,
	inner: Option<Arc<SwrInner<F, R>>>
}

impl<F: Fetcher, R: Runtime> Query<F, R> {
	pub(crate) fn new(inner: Arc<SwrInner<F, R>>, slot: CacheSlot) -> Self {
		Query { slot, inner: Some(inner) }
	}

	pub(crate) fn inert() -> Self {
		Query {
			slot: CacheSlot::default(),
			inner: None
		}
	}

	/// Returns `true` if this query was created with an unready key and will never produce anything.
	pub fn is_inert(&self) -> bool {
		self.inner.is_none()
	}

	/// Subscribes to the entry's data.
	///
	/// The subscription counts towards the entry's lifecycle: while at least one [`DataStream`] for a key exists, the
	/// entry is kept alive and focus/online signals trigger revalidation of it. When the last stream is dropped, the
	/// entry is retained for a grace period of `deduping_interval + 100ms` and then discarded.
	pub fn data(&self) -> DataStream<F, R> {
		let Some(inner) = &self.inner else {
			return DataStream::inert();
		};

		let mut states = inner.cache.states();
		let Some((rx, first)) = states.get(self.slot).map(|entry| {
			let previous = entry.add_subscriber();
			(entry.subscribe_source(), previous == 0)
		}) else {
			return DataStream::inert();
		};

		if first {
			states.mutate(self.slot, |entry| {
				// Invariant: a subscribed entry never has a pending teardown.
				entry.teardown_task.abort();
				launch_signal_listeners(entry, inner, self.slot);
			});
		}

		let mut rx = rx;
		rx.mark_changed();
		DataStream {
			rx,
			slot: self.slot,
			inner: Some(Arc::clone(inner)),
			done: false
		}
	}

	/// Returns the stream of the entry's last fetch error.
	///
	/// The stream holds `None` initially, the error after every failed fetch attempt, and `None` again once a fetch
	/// succeeds.
	pub fn error(&self) -> ErrorStream<F> {
		let Some(inner) = &self.inner else {
			return ErrorStream::inert();
		};
		let states = inner.cache.states();
		match states.get(self.slot) {
			Some(entry) => ErrorStream::new(entry.subscribe_errors()),
			None => ErrorStream::inert()
		}
	}

	/// Returns the stream of the entry's validating flag; `true` whenever a fetch (or an async mutation) is
	/// outstanding.
	pub fn is_validating(&self) -> FlagStream {
		let Some(inner) = &self.inner else {
			return FlagStream::inert();
		};
		let states = inner.cache.states();
		match states.get(self.slot) {
			Some(entry) => FlagStream::new(entry.subscribe_validating()),
			None => FlagStream::inert()
		}
	}

	/// Forces a revalidation of this key.
	pub fn revalidate(&self) {
		if let Some(inner) = &self.inner {
			inner.revalidate_slot(self.slot, true, None, RevalidateReason::Manual);
		}
	}

	/// Replaces this key's value, exactly like [`Swr::mutate`](crate::Swr::mutate).
	///
	/// Returns `None` if the query is inert or the entry no longer exists.
	pub fn mutate(&self, data: F::Data, options: MutateOptions) -> Option<Arc<F::Data>> {
		let inner = self.inner.as_ref()?;
		let data = Arc::new(data);
		inner.mutate_slot(self.slot, Arc::clone(&data), options).then_some(data)
	}

	/// Asynchronously mutates this key's value, exactly like [`Swr::mutate_with`](crate::Swr::mutate_with).
	///
	/// Returns `None` if the query is inert.
	pub fn mutate_with<M, E, Fut>(&self, options: MutateOptions, mutator: M) -> Option<R::Task<Result<Arc<F::Data>, E>>>
	where
		M: FnOnce(Option<Arc<F::Data>>, &F) -> Fut + Send + 'static,
		E: Send + 'static,
		Fut: Future<Output = Result<F::Data, E>> + Send
	{
		let inner = self.inner.as_ref()?;
		Some(inner.mutate_with_slot(self.slot, options, mutator))
	}
}

impl<F: Fetcher, R: Runtime> Clone for Query<F, R> {
	fn clone(&self) -> Self {
		Query {
			slot: self.slot,
			inner: self.inner.clone()
		}
	}
}

/// A subscription to a cache entry's data, obtained via [`Query::data`].
///
/// The stream emits the latest known value immediately, then every subsequent value, skipping over the entry's empty
/// state. If the entry dies (a fetch fails terminally before any value existed), the terminal error is yielded once
/// and the stream ends.
pub struct DataStream<F: Fetcher, R: Runtime = DefaultRuntime> {
	rx: watch::Receiver<SourceSlot<F::Data, F::Error>>,
	slot: CacheSlot,
	inner: Option<Arc<SwrInner<F, R>>>,
	done: bool
}

impl<F: Fetcher, R: Runtime> DataStream<F, R> {
	fn inert() -> Self {
		DataStream {
			rx: closed_channel(SourceSlot::Empty),
			slot: CacheSlot::default(),
			inner: None,
			done: false
		}
	}

	/// Returns the latest value without waiting, if the entry currently has one.
	pub fn get(&self) -> Option<Arc<F::Data>> {
		match &*self.rx.borrow() {
			SourceSlot::Item(item) => Some(Arc::clone(&item.data)),
			_ => None
		}
	}

	/// Waits for the next value.
	///
	/// Returns `None` once the stream is finished - after yielding a terminal error, or when the entry was torn down.
	/// This is a latest-value stream: values superseded while the caller was not waiting are skipped, not queued.
	pub async fn next(&mut self) -> Option<Result<Arc<F::Data>, Arc<F::Error>>> {
		while !self.done {
			if self.rx.changed().await.is_err() {
				self.done = true;
				return None;
			}
			let current = self.rx.borrow_and_update().clone();
			match current {
				SourceSlot::Empty => continue,
				SourceSlot::Item(item) => return Some(Ok(item.data)),
				SourceSlot::Dead(err) => {
					self.done = true;
					return Some(Err(err));
				}
			}
		}
		None
	}
}

impl<F: Fetcher, R: Runtime> Drop for DataStream<F, R> {
	fn drop(&mut self) {
		let Some(inner) = self.inner.take() else {
			return;
		};
		let mut states = inner.cache.states();
		let Some(remaining) = states.get(self.slot).map(|entry| entry.remove_subscriber()) else {
			return;
		};
		if remaining == 0 {
			states.mutate(self.slot, |entry| {
				entry.focus_task.abort();
				entry.online_task.abort();
				launch_teardown(entry, &inner, self.slot);
			});
		}
	}
}

/// A latest-value stream of a cache entry's last fetch error, obtained via [`Query::error`].
pub struct ErrorStream<F: Fetcher> {
	rx: watch::Receiver<Option<Arc<F::Error>>>
}

impl<F: Fetcher> ErrorStream<F> {
	fn new(mut rx: watch::Receiver<Option<Arc<F::Error>>>) -> Self {
		rx.mark_changed();
		ErrorStream { rx }
	}

	fn inert() -> Self {
		ErrorStream { rx: closed_channel(None) }
	}

	/// Returns the last fetch error, if the entry is currently in an error state.
	pub fn get(&self) -> Option<Arc<F::Error>> {
		self.rx.borrow().clone()
	}

	/// Waits for the next change of the error state; `Some(None)` means the error was cleared by a successful fetch.
	/// Returns `None` once the entry is gone.
	pub async fn next(&mut self) -> Option<Option<Arc<F::Error>>> {
		if self.rx.changed().await.is_err() {
			return None;
		}
		Some(self.rx.borrow_and_update().clone())
	}
}

/// A latest-value stream of a cache entry's validating flag, obtained via [`Query::is_validating`].
pub struct FlagStream {
	rx: watch::Receiver<bool>
}

impl FlagStream {
	fn new(mut rx: watch::Receiver<bool>) -> Self {
		rx.mark_changed();
		FlagStream { rx }
	}

	fn inert() -> Self {
		FlagStream { rx: closed_channel(false) }
	}

	/// Returns the current value of the flag.
	pub fn get(&self) -> bool {
		*self.rx.borrow()
	}

	/// Waits for the next value of the flag. Returns `None` once the entry is gone.
	pub async fn next(&mut self) -> Option<bool> {
		if self.rx.changed().await.is_err() {
			return None;
		}
		Some(*self.rx.borrow_and_update())
	}
}
