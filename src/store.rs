//! Pluggable key/value persistence.
//!
//! The cache persists unexpired items under a single namespace key ([`NAMESPACE`]) so that a fresh process can pick
//! up where the previous one left off, and so that concurrently running contexts sharing one store converge via
//! `storage` events. Persistence is strictly best-effort: every I/O failure is swallowed by the engine (logged when
//! the `tracing` feature is enabled) and in-memory behavior is unaffected. Running without a store at all is valid;
//! see [`Config::store`](crate::Config).

use std::{collections::HashMap, fmt};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::events::StorageEvent;

/// The root key under which the cache keeps its serialized entry map.
pub const NAMESPACE: &str = "sswr";

/// An error reported by a [`PersistentStore`] operation.
///
/// The engine never propagates these; they exist so store implementations can describe what went wrong for logging.
#[derive(Debug)]
pub struct StoreError {
	message: String
}

impl StoreError {
	/// Creates a new error with the given description.
	pub fn new(message: impl Into<String>) -> Self {
		StoreError { message: message.into() }
	}
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("store error: ")?;
		f.write_str(&self.message)
	}
}

impl std::error::Error for StoreError {}

/// A process-local string key/value store shared between contexts.
///
/// Implementations are expected to be cheap and synchronous (the engine calls them from within short critical
/// sections). A store that is shared between multiple contexts should emit a [`StorageEvent`] through every sender
/// registered via [`PersistentStore::subscribe`] whenever a key changes, so the other contexts can reconcile.
pub trait PersistentStore: Send + Sync + 'static {
	/// Returns every `(key, value)` pair currently in the store.
	fn entries(&self) -> Result<Vec<(String, String)>, StoreError>;

	/// Returns the value stored under `key`, if any.
	fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

	/// Stores `value` under `key`, replacing any previous value.
	fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

	/// Removes `key` from the store.
	fn remove(&self, key: &str) -> Result<(), StoreError>;

	/// Registers a channel on which this store will announce changes.
	///
	/// The default implementation ignores the channel, which is correct for stores that are never written to by
	/// another context.
	fn subscribe(&self, events: broadcast::Sender<StorageEvent>) {
		let _ = events;
	}
}

#[derive(Default)]
struct MemoryStoreInner {
	values: HashMap<String, String>,
	listeners: Vec<broadcast::Sender<StorageEvent>>
}

/// An in-memory [`PersistentStore`].
///
/// Sharing one `MemoryStore` (behind an [`Arc`](std::sync::Arc)) between several caches models several browser tabs
/// sharing `localStorage`: every write is announced to every subscribed bus, including the writer's own. The engine's
/// reconciliation is monotonic, so the self-echo is a no-op.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryStoreInner>
}

impl MemoryStore {
	/// Creates an empty store.
	pub fn new() -> Self {
		MemoryStore::default()
	}

	fn announce(inner: &MemoryStoreInner, event: StorageEvent) {
		for listener in &inner.listeners {
			let _ = listener.send(event.clone());
		}
	}
}

impl PersistentStore for MemoryStore {
	fn entries(&self) -> Result<Vec<(String, String)>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
	}

	fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner.values.get(key).cloned())
	}

	fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		let old_value = inner.values.insert(key.to_owned(), value.to_owned());
		Self::announce(&inner, StorageEvent {
			key: key.to_owned(),
			new_value: Some(value.to_owned()),
			old_value
		});
		Ok(())
	}

	fn remove(&self, key: &str) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		let old_value = inner.values.remove(key);
		if old_value.is_some() {
			Self::announce(&inner, StorageEvent {
				key: key.to_owned(),
				new_value: None,
				old_value
			});
		}
		Ok(())
	}

	fn subscribe(&self, events: broadcast::Sender<StorageEvent>) {
		self.inner.lock().listeners.push(events);
	}
}

#[cfg(test)]
mod tests {
	use super::{MemoryStore, PersistentStore};
	use crate::events::EventBus;

	#[test]
	fn set_get_remove() {
		let store = MemoryStore::new();
		assert_eq!(store.get("a").unwrap(), None);

		store.set("a", "1").unwrap();
		assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
		assert_eq!(store.entries().unwrap(), vec![("a".to_string(), "1".to_string())]);

		store.remove("a").unwrap();
		assert_eq!(store.get("a").unwrap(), None);
	}

	#[tokio::test]
	async fn writes_announce_old_and_new_values() {
		let store = MemoryStore::new();
		let bus = EventBus::new();
		store.subscribe(bus.storage_sender());
		let mut rx = bus.storage_listener();

		store.set("k", "1").unwrap();
		store.set("k", "2").unwrap();
		store.remove("k").unwrap();

		let first = rx.recv().await.unwrap();
		assert_eq!((first.old_value.as_deref(), first.new_value.as_deref()), (None, Some("1")));
		let second = rx.recv().await.unwrap();
		assert_eq!((second.old_value.as_deref(), second.new_value.as_deref()), (Some("1"), Some("2")));
		let third = rx.recv().await.unwrap();
		assert_eq!((third.old_value.as_deref(), third.new_value.as_deref()), (Some("2"), None));
	}

	#[test]
	fn removing_an_absent_key_stays_silent() {
		let store = MemoryStore::new();
		let bus = EventBus::new();
		store.subscribe(bus.storage_sender());
		let mut rx = bus.storage_listener();

		store.remove("missing").unwrap();
		assert!(rx.try_recv().is_err());
	}
}
