use std::{convert::Infallible, sync::Arc, time::Duration};

use tokio::{task::yield_now, time::advance};

use crate::{
	Config, InitialData, MemoryStore, MutateOptions, Options, Swr,
	cache::{CacheEntry, CacheItem},
	clock::{Clock, ManualClock},
	fetcher::mock::{Args, Fetcher},
	key,
	runtime::Tokio,
	store::{NAMESPACE, PersistentStore}
};

const T0: u64 = 1_700_000_000_000;

fn swr_with(fetcher: Fetcher, clock: Arc<ManualClock>, store: Option<Arc<dyn PersistentStore>>) -> Swr<Fetcher, Tokio> {
	let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
	let clock: Arc<dyn Clock> = clock;
	Swr::new_in(fetcher, Tokio, Config {
		clock,
		store,
		..Config::default()
	})
}

#[must_use]
fn inspect_entry<T, I: FnOnce(&CacheEntry<Fetcher, Tokio>) -> T>(swr: &Swr<Fetcher, Tokio>, args: Args, f: I) -> Option<T> {
	let key = key::encode(&args).unwrap();
	let cache = swr.cache();
	let slot = cache.get(&key)?;
	let states = cache.states();
	let entry = states.get(slot)?;
	Some(f(entry))
}

/// Lets woken background tasks (fetch finalizers, storage listeners) run to quiescence without moving time.
async fn settle() {
	for _ in 0..5 {
		yield_now().await;
	}
}

#[tokio::test(start_paused = true)]
async fn cold_fetch() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), Arc::clone(&clock), None);

	let query = swr.query(&Args::DelayedMillis(10));
	let mut validating = query.is_validating();
	let mut data = query.data();

	// the fetch is dispatched synchronously by `query`
	assert_eq!(validating.next().await, Some(true));

	clock.advance(10);
	assert_eq!(*data.next().await.unwrap().unwrap(), 42);
	assert_eq!(validating.next().await, Some(false));
	assert_eq!(fetcher.fetch_count(), 1);

	inspect_entry(&swr, Args::DelayedMillis(10), |entry| {
		assert_eq!(entry.item().unwrap().expires_at, T0 + 10 + 6000);
	})
	.unwrap();
}

#[tokio::test(start_paused = true)]
async fn fresh_item_dedupes_refetch() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let query = swr.query(&Args::Basic);
	let mut data = query.data();
	assert_eq!(*data.next().await.unwrap().unwrap(), 42);
	assert_eq!(fetcher.fetch_count(), 1);

	let second = swr.query(&Args::Basic);
	let mut second_data = second.data();
	assert_eq!(*second_data.next().await.unwrap().unwrap(), 42);
	settle().await;

	assert_eq!(fetcher.fetch_count(), 1);
	assert_eq!(swr.cache().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_value_is_served_then_revalidated() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), Arc::clone(&clock), None);

	swr.mutate(&Args::Counter, 10, MutateOptions::default());
	clock.advance(6001);

	let query = swr.query(&Args::Counter);
	let mut data = query.data();

	assert_eq!(*data.next().await.unwrap().unwrap(), 10);
	assert_eq!(*data.next().await.unwrap().unwrap(), 1);
	assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_keeps_stale_data() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	swr.mutate(&Args::AlwaysError, 7, MutateOptions::default());

	let query = swr.query(&Args::AlwaysError);
	let mut data = query.data();
	let mut errors = query.error();
	assert_eq!(*data.next().await.unwrap().unwrap(), 7);
	assert_eq!(errors.next().await, Some(None));
	assert_eq!(fetcher.fetch_count(), 0);

	query.revalidate();
	for _ in 0..3 {
		assert!(errors.next().await.unwrap().is_some());
	}
	settle().await;

	assert_eq!(fetcher.fetch_count(), 3);
	assert_eq!(data.get().as_deref(), Some(&7));
	assert!(errors.get().is_some());
	assert!(!query.is_validating().get());
	inspect_entry(&swr, Args::AlwaysError, |entry| assert!(!entry.is_stopped())).unwrap();
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_without_data_kills_the_entry() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let query = swr.query(&Args::AlwaysError);
	let mut data = query.data();

	assert!(data.next().await.unwrap().is_err());
	assert!(data.next().await.is_none());
	assert_eq!(fetcher.fetch_count(), 3);
	inspect_entry(&swr, Args::AlwaysError, |entry| assert!(entry.is_stopped())).unwrap();

	// a later query starts over with a fresh entry
	let retry = swr.query(&Args::AlwaysError);
	let mut retry_data = retry.data();
	assert!(retry_data.next().await.unwrap().is_err());
	assert_eq!(fetcher.fetch_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_cleared_by_success() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let query = swr.query(&Args::ErrorNTimes(1));
	let mut data = query.data();
	let mut errors = query.error();

	assert_eq!(errors.next().await, Some(None));
	assert!(errors.next().await.unwrap().is_some());
	assert_eq!(*data.next().await.unwrap().unwrap(), 42);
	assert_eq!(errors.next().await, Some(None));
	assert_eq!(fetcher.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn optimistic_mutate_then_explicit_revalidate() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	swr.mutate(&Args::Basic, 1, MutateOptions::default());
	let query = swr.query(&Args::Basic);
	let mut data = query.data();
	assert_eq!(*data.next().await.unwrap().unwrap(), 1);
	assert_eq!(fetcher.fetch_count(), 0);

	let task = swr.mutate_with(&Args::Basic, MutateOptions::default(), |current, _| async move {
		Ok::<_, Infallible>(current.map_or(0, |n| *n + 1))
	});
	let pushed = task.await.unwrap().unwrap();
	assert_eq!(*pushed, 2);
	assert_eq!(*data.next().await.unwrap().unwrap(), 2);
	// a value was provided, so no revalidation follows by default
	settle().await;
	assert_eq!(fetcher.fetch_count(), 0);

	// the no-value arm: force a refetch
	swr.revalidate(&Args::Basic);
	assert_eq!(*data.next().await.unwrap().unwrap(), 42);
	assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn falsy_value_still_counts_as_provided() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let pushed = swr.mutate(&Args::Basic, 0, MutateOptions::default());
	assert_eq!(*pushed, 0);
	settle().await;

	assert_eq!(fetcher.fetch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn mutate_can_schedule_revalidation() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	swr.mutate(&Args::Counter, 5, MutateOptions::and_revalidate());
	let query = swr.query(&Args::Counter);
	let mut data = query.data();

	// the optimistic value is ordered strictly before the revalidation result
	assert_eq!(*data.next().await.unwrap().unwrap(), 5);
	assert_eq!(*data.next().await.unwrap().unwrap(), 1);
	assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn mutate_with_identity_is_idempotent() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	swr.mutate(&Args::Basic, 4, MutateOptions::default());
	for _ in 0..2 {
		let task = swr.mutate_with(&Args::Basic, MutateOptions::default(), |current, _| async move {
			Ok::<_, Infallible>(current.map_or(4, |n| *n))
		});
		assert_eq!(*task.await.unwrap().unwrap(), 4);
	}

	let query = swr.query(&Args::Basic);
	assert_eq!(query.data().get().as_deref(), Some(&4));
	assert_eq!(fetcher.fetch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn mutate_with_raises_validating_for_its_duration() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	swr.mutate(&Args::Basic, 1, MutateOptions::default());
	let query = swr.query(&Args::Basic);
	let mut validating = query.is_validating();
	assert_eq!(validating.next().await, Some(false));

	let task = swr.mutate_with(&Args::Basic, MutateOptions::default(), |_, _| async move {
		tokio::time::sleep(Duration::from_millis(50)).await;
		Ok::<_, Infallible>(5)
	});

	assert_eq!(validating.next().await, Some(true));
	assert_eq!(validating.next().await, Some(false));
	assert_eq!(*task.await.unwrap().unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn mutator_errors_leave_the_cache_untouched() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	swr.mutate(&Args::Basic, 3, MutateOptions::default());
	let task = swr.mutate_with(&Args::Basic, MutateOptions::default(), |_, _| async move { Err::<u32, &str>("nope") });
	assert_eq!(task.await.unwrap().unwrap_err(), "nope");

	let query = swr.query(&Args::Basic);
	assert_eq!(query.data().get().as_deref(), Some(&3));
	assert!(!query.is_validating().get());
}

#[tokio::test(start_paused = true)]
async fn initial_data_is_served_stale() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let query = swr.query_with(&Args::Basic, Options::initial(33));
	let mut data = query.data();

	assert_eq!(*data.next().await.unwrap().unwrap(), 33);
	assert_eq!(*data.next().await.unwrap().unwrap(), 42);
	assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unexpired_initial_item_suppresses_the_fetch() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let query = swr.query_with(&Args::Basic, Options {
		initial_data: Some(InitialData::Item(CacheItem::new(Arc::new(7), T0 + 60_000))),
		..Options::default()
	});
	let mut data = query.data();

	assert_eq!(*data.next().await.unwrap().unwrap(), 7);
	settle().await;
	assert_eq!(fetcher.fetch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unready_keys_yield_inert_queries() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let query = swr.try_query(|| None, Options::default());
	assert!(query.is_inert());

	let mut data = query.data();
	assert!(data.next().await.is_none());
	assert_eq!(query.error().get(), None);
	assert!(!query.is_validating().get());
	assert!(query.mutate(1, MutateOptions::default()).is_none());
	query.revalidate();
	settle().await;

	assert_eq!(swr.cache().len(), 0);
	assert_eq!(fetcher.fetch_count(), 0);

	let ready = swr.try_query(|| Some(Args::Basic), Options::default());
	assert!(!ready.is_inert());
	assert_eq!(*ready.data().next().await.unwrap().unwrap(), 42);
}

#[tokio::test(start_paused = true)]
async fn subscriptions_share_one_entry_and_refcount() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let first = swr.query(&Args::Basic);
	let second = swr.query(&Args::Basic);
	assert_eq!(swr.cache().len(), 1);

	let data_a = first.data();
	let data_b = second.data();
	inspect_entry(&swr, Args::Basic, |entry| assert_eq!(entry.subscriber_count(), 2)).unwrap();

	drop(data_a);
	inspect_entry(&swr, Args::Basic, |entry| assert_eq!(entry.subscriber_count(), 1)).unwrap();
	drop(data_b);
	inspect_entry(&swr, Args::Basic, |entry| assert_eq!(entry.subscriber_count(), 0)).unwrap();
}

#[tokio::test(start_paused = true)]
async fn idle_entries_are_torn_down_after_the_grace_period() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let query = swr.query(&Args::Basic);
	{
		let mut data = query.data();
		assert_eq!(*data.next().await.unwrap().unwrap(), 42);
	}

	// strictly later than deduping_interval + 100ms
	advance(Duration::from_millis(6000)).await;
	settle().await;
	assert!(inspect_entry(&swr, Args::Basic, |_| ()).is_some());

	advance(Duration::from_millis(101)).await;
	settle().await;
	assert!(inspect_entry(&swr, Args::Basic, |_| ()).is_none());

	// and the key starts over afterwards
	let fresh = swr.query(&Args::Basic);
	let mut data = fresh.data();
	assert_eq!(*data.next().await.unwrap().unwrap(), 42);
	assert_eq!(fetcher.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn resubscribing_cancels_the_teardown() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let query = swr.query(&Args::Basic);
	{
		let mut data = query.data();
		assert_eq!(*data.next().await.unwrap().unwrap(), 42);
	}

	advance(Duration::from_millis(3000)).await;
	let _data = query.data();
	advance(Duration::from_millis(10_000)).await;
	settle().await;

	assert!(inspect_entry(&swr, Args::Basic, |_| ()).is_some());
}

#[tokio::test(start_paused = true)]
async fn never_subscribed_entries_are_reclaimed() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let _query = swr.query(&Args::Basic);
	settle().await;

	advance(Duration::from_millis(6101)).await;
	settle().await;
	assert!(inspect_entry(&swr, Args::Basic, |_| ()).is_none());
}

#[tokio::test(start_paused = true)]
async fn teardown_spares_a_validating_entry() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, None);

	let _query = swr.query(&Args::DelayedMillis(20_000));
	settle().await;

	advance(Duration::from_millis(6200)).await;
	settle().await;
	inspect_entry(&swr, Args::DelayedMillis(20_000), |entry| assert!(entry.is_validating())).unwrap();

	// once the fetch completes, the teardown is re-armed and the idle entry is eventually reclaimed
	advance(Duration::from_millis(14_000)).await;
	settle().await;
	inspect_entry(&swr, Args::DelayedMillis(20_000), |entry| assert!(!entry.is_validating())).unwrap();

	advance(Duration::from_millis(6101)).await;
	settle().await;
	assert!(inspect_entry(&swr, Args::DelayedMillis(20_000), |_| ()).is_none());
}

#[tokio::test(start_paused = true)]
async fn focus_and_online_revalidate_only_stale_entries() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), Arc::clone(&clock), None);

	swr.mutate(&Args::Counter, 9, MutateOptions::default());
	let query = swr.query(&Args::Counter);
	let mut data = query.data();
	assert_eq!(*data.next().await.unwrap().unwrap(), 9);
	assert_eq!(fetcher.fetch_count(), 0);

	// still fresh: the guard swallows the signal
	swr.events().emit_focus();
	settle().await;
	assert_eq!(fetcher.fetch_count(), 0);

	clock.advance(6001);
	swr.events().emit_focus();
	settle().await;
	assert_eq!(fetcher.fetch_count(), 1);
	assert_eq!(*data.next().await.unwrap().unwrap(), 1);

	clock.advance(6001);
	swr.events().emit_online();
	settle().await;
	assert_eq!(fetcher.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn signals_are_ignored_without_subscribers() {
	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), Arc::clone(&clock), None);

	let query = swr.query(&Args::Basic);
	{
		let mut data = query.data();
		assert_eq!(*data.next().await.unwrap().unwrap(), 42);
	}

	clock.advance(10_000);
	swr.events().emit_focus();
	swr.events().emit_online();
	settle().await;

	assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn persisted_items_seed_a_fresh_cache() {
	let store = Arc::new(MemoryStore::new());
	let clock = Arc::new(ManualClock::new(T0));

	{
		let swr = swr_with(Fetcher::new(), Arc::clone(&clock), Some(Arc::clone(&store) as _));
		swr.mutate(&Args::Basic, 9, MutateOptions::default());
	}

	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), Arc::clone(&clock), Some(Arc::clone(&store) as _));
	let query = swr.query(&Args::Basic);
	let mut data = query.data();

	assert_eq!(*data.next().await.unwrap().unwrap(), 9);
	inspect_entry(&swr, Args::Basic, |entry| assert_eq!(entry.item().unwrap().expires_at, T0 + 6000)).unwrap();
	settle().await;
	assert_eq!(fetcher.fetch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn expired_persisted_items_are_ignored() {
	let store = Arc::new(MemoryStore::new());
	let clock = Arc::new(ManualClock::new(T0));

	{
		let swr = swr_with(Fetcher::new(), Arc::clone(&clock), Some(Arc::clone(&store) as _));
		swr.mutate(&Args::Basic, 9, MutateOptions::default());
	}

	clock.advance(7000);

	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), Arc::clone(&clock), Some(Arc::clone(&store) as _));
	let query = swr.query(&Args::Basic);
	let mut data = query.data();

	// nothing usable persisted, so the first emission is the fetched value
	assert_eq!(*data.next().await.unwrap().unwrap(), 42);
	assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn storage_sync_adopts_only_strictly_newer_items() {
	let store = Arc::new(MemoryStore::new());
	let clock = Arc::new(ManualClock::new(T0));

	let swr_a = swr_with(Fetcher::new(), Arc::clone(&clock), Some(Arc::clone(&store) as _));
	let swr_b = swr_with(Fetcher::new(), Arc::clone(&clock), Some(Arc::clone(&store) as _));

	swr_b.mutate(&Args::Basic, 1, MutateOptions::default());
	let query = swr_b.query(&Args::Basic);
	let mut data = query.data();
	assert_eq!(*data.next().await.unwrap().unwrap(), 1);

	// another context produces a strictly fresher item
	clock.advance(1000);
	swr_a.mutate(&Args::Basic, 2, MutateOptions::default());
	assert_eq!(*data.next().await.unwrap().unwrap(), 2);
	inspect_entry(&swr_b, Args::Basic, |entry| assert_eq!(entry.item().unwrap().expires_at, T0 + 1000 + 6000)).unwrap();

	// an equal expiry never overrides
	let key = key::encode(&Args::Basic).unwrap();
	let equal = serde_json::to_string(&vec![(key.clone(), CacheItem::new(Arc::new(3u32), T0 + 1000 + 6000))]).unwrap();
	store.set(NAMESPACE, &equal).unwrap();
	settle().await;
	assert_eq!(data.get().as_deref(), Some(&2));

	// a strictly greater expiry always does
	let newer = serde_json::to_string(&vec![(key, CacheItem::new(Arc::new(4u32), T0 + 1000 + 6001))]).unwrap();
	store.set(NAMESPACE, &newer).unwrap();
	assert_eq!(*data.next().await.unwrap().unwrap(), 4);
}

#[tokio::test(start_paused = true)]
async fn store_failures_are_swallowed() {
	struct BrokenStore;

	impl PersistentStore for BrokenStore {
		fn entries(&self) -> Result<Vec<(String, String)>, crate::StoreError> {
			Err(crate::StoreError::new("broken"))
		}

		fn get(&self, _key: &str) -> Result<Option<String>, crate::StoreError> {
			Err(crate::StoreError::new("broken"))
		}

		fn set(&self, _key: &str, _value: &str) -> Result<(), crate::StoreError> {
			Err(crate::StoreError::new("broken"))
		}

		fn remove(&self, _key: &str) -> Result<(), crate::StoreError> {
			Err(crate::StoreError::new("broken"))
		}
	}

	let clock = Arc::new(ManualClock::new(T0));
	let fetcher = Fetcher::new();
	let swr = swr_with(fetcher.clone(), clock, Some(Arc::new(BrokenStore)));

	let query = swr.query(&Args::Basic);
	let mut data = query.data();
	assert_eq!(*data.next().await.unwrap().unwrap(), 42);

	swr.mutate(&Args::Basic, 1, MutateOptions::default());
	assert_eq!(*data.next().await.unwrap().unwrap(), 1);
}
