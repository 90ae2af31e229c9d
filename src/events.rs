//! Ambient signals that drive background revalidation.
//!
//! An [`EventBus`] carries three broadcast channels:
//! - `focus` - the application regained focus,
//! - `online` - network connectivity returned,
//! - `storage` - another context mutated the [persistent store](crate::store).
//!
//! The engine only ever *listens*; emitting is the embedder's job (and a [`PersistentStore`](crate::PersistentStore)
//! emits `storage` events through the sender handed to it via `subscribe`). In an environment without one of these
//! signals the corresponding channel simply stays silent - no error is raised, nothing is fetched on its account.

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 16;

/// A change to the shared persistent store, as observed by some context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
	/// The store key that changed.
	pub key: String,
	/// The value after the change, or `None` if the key was removed.
	pub new_value: Option<String>,
	/// The value before the change, or `None` if the key was absent.
	pub old_value: Option<String>
}

/// The bundle of ambient signal channels an [`Swr`](crate::Swr) cache listens on.
///
/// Cloning an `EventBus` yields a handle to the same underlying channels, so an application can keep a clone around
/// and emit into it from window/network callbacks. A bus can be shared between several caches via
/// [`Config::events`](crate::Config).
#[derive(Clone)]
pub struct EventBus {
	focus: broadcast::Sender<()>,
	online: broadcast::Sender<()>,
	storage: broadcast::Sender<StorageEvent>
}

impl EventBus {
	/// Creates a new, silent bus.
	pub fn new() -> Self {
		EventBus {
			focus: broadcast::channel(CHANNEL_CAPACITY).0,
			online: broadcast::channel(CHANNEL_CAPACITY).0,
			storage: broadcast::channel(CHANNEL_CAPACITY).0
		}
	}

	/// Signals that the application regained focus.
	pub fn emit_focus(&self) {
		let _ = self.focus.send(());
	}

	/// Signals that network connectivity returned.
	pub fn emit_online(&self) {
		let _ = self.online.send(());
	}

	/// Signals a change to the persistent store made by another context.
	pub fn emit_storage(&self, event: StorageEvent) {
		let _ = self.storage.send(event);
	}

	/// Returns the sender side of the `storage` channel, for a [`PersistentStore`](crate::PersistentStore) to notify
	/// through.
	pub fn storage_sender(&self) -> broadcast::Sender<StorageEvent> {
		self.storage.clone()
	}

	pub(crate) fn focus_listener(&self) -> broadcast::Receiver<()> {
		self.focus.subscribe()
	}

	pub(crate) fn online_listener(&self) -> broadcast::Receiver<()> {
		self.online.subscribe()
	}

	pub(crate) fn storage_listener(&self) -> broadcast::Receiver<StorageEvent> {
		self.storage.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		EventBus::new()
	}
}
