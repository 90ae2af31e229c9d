use std::{collections::HashMap, sync::Arc};

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use slotmap::SlotMap;

mod entry;
pub use self::entry::CacheItem;
pub(crate) use self::entry::{CacheEntry, SourceSlot};
use crate::{
	clock::Clock,
	fetcher::Fetcher,
	options::ResolvedOptions,
	runtime::Runtime,
	store::{NAMESPACE, PersistentStore}
};

slotmap::new_key_type! {
	/// A generational handle to a cache entry. A handle to a destroyed entry simply resolves to nothing, so work
	/// completing against a torn-down or replaced entry is discarded without further bookkeeping.
	pub(crate) struct CacheSlot;
}

type PersistedMap<F> = Vec<(String, CacheItem<<F as Fetcher>::Data>)>;

/// Owns every cache entry and reconciles the in-memory map with the persistent store.
pub(crate) struct Cache<F: Fetcher, R: Runtime> {
	runtime: R,
	clock: Arc<dyn Clock>,
	store: Option<Arc<dyn PersistentStore>>,
	key_to_slot: RwLock<HashMap<String, CacheSlot>>,
	states: RwLock<SlotMap<CacheSlot, CacheEntry<F, R>>>
}

impl<F: Fetcher, R: Runtime> Cache<F, R> {
	pub fn new(runtime: R, clock: Arc<dyn Clock>, store: Option<Arc<dyn PersistentStore>>) -> Self {
		Self {
			runtime,
			clock,
			store,
			key_to_slot: RwLock::new(HashMap::new()),
			states: RwLock::new(SlotMap::with_key())
		}
	}

	pub fn now(&self) -> u64 {
		self.clock.now()
	}

	pub fn get(&self, key: &str) -> Option<CacheSlot> {
		self.key_to_slot.read().get(key).copied()
	}

	/// Returns the live entry for `key`, creating one if the key is unknown or its previous entry was stopped.
	///
	/// A created entry is seeded from an unexpired persisted item when one exists, else from `seed` (the caller's
	/// initial data). The `bool` is `true` when a new entry was created.
	pub fn get_or_init(&self, key: &str, seed: Option<CacheItem<F::Data>>, options: ResolvedOptions) -> (CacheSlot, bool) {
		let key_to_slot = self.key_to_slot.upgradable_read();
		if let Some(slot) = key_to_slot.get(key) {
			let slot = *slot;
			let stopped = self.states.read().get(slot).is_none_or(|entry| entry.is_stopped());
			if !stopped {
				return (slot, false);
			}
		}

		let mut key_to_slot = RwLockUpgradableReadGuard::upgrade(key_to_slot);
		let mut states = self.states.write();

		// A stopped predecessor is evicted so the key starts over.
		if let Some(old) = key_to_slot.remove(key) {
			if let Some(mut old_entry) = states.remove(old) {
				old_entry.abort_tasks();
			}
		}

		let seed = self.load_persisted_item(key).or(seed);
		let slot = states.insert(CacheEntry::new(self.runtime.clone(), key.to_owned(), seed, options));
		key_to_slot.insert(key.to_owned(), slot);
		(slot, true)
	}

	pub fn states(&self) -> StateAccessor<'_, F, R> {
		StateAccessor { inner: self.states.upgradable_read() }
	}

	/// Destroys the entry behind `slot` if it still has no subscribers and no fetch in flight.
	///
	/// Dropping the entry completes its `source`, `errors` and `validating` channels. The persisted copy is removed
	/// only when the entry's current item is expired (or it never had one); an unexpired item stays in the store to
	/// seed a future entry.
	pub fn destroy_if_idle(&self, slot: CacheSlot) {
		let mut key_to_slot = self.key_to_slot.write();
		let mut states = self.states.write();

		let Some(entry) = states.get(slot) else {
			return;
		};
		if entry.subscriber_count() > 0 || entry.is_validating() {
			return;
		}

		let key = entry.key().to_owned();
		let expired = entry.item().is_none_or(|item| item.is_expired(self.clock.now()));

		if let Some(mut entry) = states.remove(slot) {
			entry.abort_tasks();
		}
		key_to_slot.remove(&key);

		if expired {
			self.remove_persisted_item(&key);
		}

		#[cfg(feature = "tracing")]
		{
			tracing::info!(key = %key, "destroying idle cache entry");
		}
	}

	/// Reconciles the in-memory map with the persistent store.
	///
	/// Expired persisted items are dropped; an unexpired item whose `expires_at` is *strictly* greater than the
	/// in-memory entry's is pushed into that entry. The pruned map is written back only when pruning removed
	/// something, so the resulting `storage` echo converges instead of ping-ponging between contexts.
	pub fn sync_with_storage(&self) {
		let Some((map, pruned)) = self.load_persisted_map() else {
			return;
		};

		{
			let key_to_slot = self.key_to_slot.read();
			let mut states = self.states();
			for (key, item) in &map {
				let Some(slot) = key_to_slot.get(key) else {
					continue;
				};
				states.mutate(*slot, |entry| {
					if !entry.is_stopped() && item.expires_at > entry.expires_at() {
						entry.set_item(item.clone());
					}
				});
			}
		}

		if pruned > 0 {
			self.save_persisted_map(&map);
		}
	}

	/// Upserts `item` into the persisted map.
	pub fn persist_item(&self, key: &str, item: &CacheItem<F::Data>) {
		if self.store.is_none() {
			return;
		}
		let mut map = self.load_persisted_map().map(|(map, _)| map).unwrap_or_default();
		map.retain(|(k, _)| k != key);
		map.push((key.to_owned(), item.clone()));
		self.save_persisted_map(&map);
	}

	fn remove_persisted_item(&self, key: &str) {
		let Some((mut map, _)) = self.load_persisted_map() else {
			return;
		};
		let len = map.len();
		map.retain(|(k, _)| k != key);
		if map.len() != len {
			self.save_persisted_map(&map);
		}
	}

	fn load_persisted_item(&self, key: &str) -> Option<CacheItem<F::Data>> {
		let (map, _) = self.load_persisted_map()?;
		map.into_iter().find(|(k, _)| k == key).map(|(_, item)| item)
	}

	/// Reads and deserializes the persisted map, dropping expired items. Returns the map and how many items were
	/// dropped, or `None` if there is no store, nothing persisted, or the read failed.
	fn load_persisted_map(&self) -> Option<(PersistedMap<F>, usize)> {
		let store = self.store.as_ref()?;
		let raw = match store.get(NAMESPACE) {
			Ok(raw) => raw?,
			Err(_err) => {
				#[cfg(feature = "tracing")]
				{
					tracing::warn!("failed to read persisted cache: {_err}");
				}
				return None;
			}
		};
		let mut map: PersistedMap<F> = match serde_json::from_str(&raw) {
			Ok(map) => map,
			Err(_err) => {
				#[cfg(feature = "tracing")]
				{
					tracing::warn!("discarding unreadable persisted cache: {_err}");
				}
				return None;
			}
		};

		let now = self.clock.now();
		let len = map.len();
		map.retain(|(_, item)| !item.is_expired(now));
		let removed = len - map.len();
		Some((map, removed))
	}

	fn save_persisted_map(&self, map: &PersistedMap<F>) {
		let Some(store) = self.store.as_ref() else {
			return;
		};
		let raw = match serde_json::to_string(map) {
			Ok(raw) => raw,
			Err(_err) => {
				#[cfg(feature = "tracing")]
				{
					tracing::warn!("failed to serialize cache for persistence: {_err}");
				}
				return;
			}
		};
		if let Err(_err) = store.set(NAMESPACE, &raw) {
			#[cfg(feature = "tracing")]
			{
				tracing::warn!("failed to persist cache: {_err}");
			}
		}
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.key_to_slot.read().len()
	}
}

pub(crate) struct StateAccessor<'c, F: Fetcher, R: Runtime> {
	inner: RwLockUpgradableReadGuard<'c, SlotMap<CacheSlot, CacheEntry<F, R>>>
}

impl<F: Fetcher, R: Runtime> StateAccessor<'_, F, R> {
	pub fn get(&self, slot: CacheSlot) -> Option<&CacheEntry<F, R>> {
		self.inner.get(slot)
	}

	pub fn mutate<M, T>(&mut self, slot: CacheSlot, mutator: M) -> Option<T>
	where
		M: FnOnce(&mut CacheEntry<F, R>) -> T
	{
		self.inner.with_upgraded(|states| states.get_mut(slot).map(mutator))
	}
}
