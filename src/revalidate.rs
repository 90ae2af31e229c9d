use std::sync::{Arc, Weak};

use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
	SwrInner,
	cache::{CacheEntry, CacheItem, CacheSlot},
	fetcher::Fetcher,
	key,
	options::ResolvedOptions,
	retry::retry_with_delay,
	runtime::Runtime,
	util::TaskStartMode
};

/// Why a fetch was kicked off; purely informational.
#[derive(Clone, Copy, Debug)]
pub(crate) enum RevalidateReason {
	FirstUse,
	Stale,
	Focus,
	Online,
	Manual,
	Mutate
}

#[cfg(feature = "tracing")]
impl RevalidateReason {
	pub fn describe(self) -> &'static str {
		match self {
			RevalidateReason::FirstUse => "first usage of key",
			RevalidateReason::Stale => "stale data",
			RevalidateReason::Focus => "application focus",
			RevalidateReason::Online => "connectivity restored",
			RevalidateReason::Manual => "manual trigger",
			RevalidateReason::Mutate => "mutation"
		}
	}
}

/// Starts the fetch pipeline for `entry` unless one is already in flight.
///
/// The pipeline marks the entry validating, runs the fetcher through [`retry_with_delay`] (emitting every failed
/// attempt on `errors`), and finalizes according to the outcome: success pushes a fresh item (stamped
/// `now + deduping_interval`) and clears the error channel; terminal failure keeps a stale item if one exists, and
/// otherwise kills the entry so the next query starts over. A subscriber-less entry has its teardown re-armed at
/// finalization, since a teardown firing while the fetch was in flight leaves it alive.
#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
pub(crate) fn launch_fetch<F, R>(entry: &mut CacheEntry<F, R>, inner: &Arc<SwrInner<F, R>>, slot: CacheSlot, options: ResolvedOptions, reason: RevalidateReason)
where
	F: Fetcher,
	R: Runtime
{
	let args = match key::decode::<F::Args>(entry.key()) {
		Ok(args) => args,
		Err(_err) => {
			#[cfg(feature = "tracing")]
			{
				tracing::warn!(key = %entry.key(), "cannot decode key, skipping fetch: {_err}");
			}
			return;
		}
	};

	#[cfg(feature = "tracing")]
	let key = entry.key().to_owned();

	let inner = Arc::clone(inner);
	let did_launch = entry.fetch_task.insert(TaskStartMode::Soft, async move {
		#[cfg(feature = "tracing")]
		{
			tracing::debug!(key = %key, "fetch triggered due to: {}", reason.describe());
		}
		#[cfg(feature = "tracing")]
		let before = std::time::Instant::now();

		let inner_ref = &inner;
		let result = retry_with_delay(&inner.runtime, options.error_retry_interval, options.error_retry_count, || {
			let args = args.clone();
			async move {
				match inner_ref.fetcher.fetch(&args).await {
					Ok(data) => Ok(data),
					Err(err) => {
						let err = Arc::new(err);
						let mut states = inner_ref.cache.states();
						states.mutate(slot, |entry| entry.set_error(Arc::clone(&err)));
						Err(err)
					}
				}
			}
		})
		.await;

		let now = inner.cache.now();
		let mut states = inner.cache.states();
		states.mutate(slot, |entry| {
			match result {
				Ok(data) => {
					#[cfg(feature = "tracing")]
					{
						tracing::info!(key = %key, "OK {}ms", before.elapsed().as_millis());
					}

					let item = CacheItem::new(Arc::new(data), now + options.deduping_millis());
					entry.set_item(item.clone());
					entry.clear_error();
					inner.cache.persist_item(entry.key(), &item);
				}
				Err(err) => {
					#[cfg(feature = "tracing")]
					{
						tracing::info!(key = %key, "ERR {}ms: {err}", before.elapsed().as_millis());
					}

					// The last error is already on the error channel. Without a stale item to keep serving, the
					// entry is unsalvageable.
					if entry.item().is_none() {
						entry.kill(err);
					}
				}
			}
			entry.set_validating(false);
			// A teardown that fired mid-fetch spared this entry; re-arm it so it is still reclaimed.
			if entry.subscriber_count() == 0 {
				launch_teardown(entry, &inner, slot);
			}
		});
	});
	if did_launch {
		entry.set_validating(true);
	}
}

/// Arms the idle-teardown timer: after `deduping_interval + 100ms`, the entry is destroyed if it still has no
/// subscribers and no fetch in flight.
pub(crate) fn launch_teardown<F, R>(entry: &mut CacheEntry<F, R>, inner: &Arc<SwrInner<F, R>>, slot: CacheSlot)
where
	F: Fetcher,
	R: Runtime
{
	let delay = entry.options().teardown_delay();
	let weak = Arc::downgrade(inner);
	let runtime = inner.runtime.clone();
	entry.teardown_task.insert(TaskStartMode::Abort, async move {
		runtime.wait(delay).await;
		if let Some(inner) = weak.upgrade() {
			inner.cache.destroy_if_idle(slot);
		}
	});
}

/// Connects the focus/online channels to revalidation for as long as the entry has subscribers.
pub(crate) fn launch_signal_listeners<F, R>(entry: &mut CacheEntry<F, R>, inner: &Arc<SwrInner<F, R>>, slot: CacheSlot)
where
	F: Fetcher,
	R: Runtime
{
	entry
		.focus_task
		.insert(TaskStartMode::Abort, signal_listener(inner.events.focus_listener(), Arc::downgrade(inner), slot, RevalidateReason::Focus));
	entry
		.online_task
		.insert(TaskStartMode::Abort, signal_listener(inner.events.online_listener(), Arc::downgrade(inner), slot, RevalidateReason::Online));
}

async fn signal_listener<F, R>(mut signal: broadcast::Receiver<()>, swr: Weak<SwrInner<F, R>>, slot: CacheSlot, reason: RevalidateReason)
where
	F: Fetcher,
	R: Runtime
{
	loop {
		match signal.recv().await {
			Ok(()) | Err(RecvError::Lagged(_)) => {
				let Some(inner) = swr.upgrade() else {
					break;
				};
				inner.revalidate_slot(slot, false, None, reason);
			}
			Err(RecvError::Closed) => break
		}
	}
}
