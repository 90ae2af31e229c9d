//! Provides the [`Runtime`] trait and implementations of it for various async runtimes.
//!
//! `Runtime` is how the cache spawns its background work - fetch pipelines, retry/teardown delays, and the listener
//! tasks that react to [`EventBus`](crate::EventBus) signals.
//!
//! Implementations are provided for:
//! - **[`tokio`]** - [`Tokio`] (available with the `tokio` Cargo feature **and enabled by default**)
//! - **[`smol`]** - [`Smol`] (available with the `smol` Cargo feature)
//! - *write your own by implementing [`Runtime`]!*
//!
//! If exactly one runtime Cargo feature is enabled, that runtime is the `DefaultRuntime` and constructors like
//! [`Swr::new`](crate::Swr::new) work without further ceremony. With zero or multiple runtime features enabled, the
//! runtime must be passed explicitly via [`Swr::new_in`](crate::Swr::new_in).

use std::{future::Future, time::Duration};

cfg_if::cfg_if! {
	if #[cfg(all(feature = "tokio", not(feature = "smol")))] {
		#[doc(hidden)]
		pub type DefaultRuntime = Tokio;
	} else if #[cfg(all(feature = "smol", not(feature = "tokio")))] {
		#[doc(hidden)]
		pub type DefaultRuntime = Smol;
	} else {
		#[doc(hidden)]
		pub type DefaultRuntime = NullRuntime;
	}
}

/// An asynchronous runtime, used to spawn background tasks and to sleep between retries.
pub trait Runtime: Clone + Send + Sync + 'static {
	/// A handle to an asynchronous task spawned by [`Runtime::spawn`].
	type Task<T: Send + 'static>: Task<T>;

	/// Spawns a new asynchronous background task, returning a [handle][`Runtime::Task`] to it.
	fn spawn<F>(&self, future: F) -> Self::Task<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static;

	/// Returns a future that, when awaited, causes the task to sleep for the specified `duration`.
	fn wait(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// A handle to an asynchronous task spawned by a [`Runtime`].
///
/// The cache aborts tasks when an entry is destroyed, and needs `is_finished` to guarantee at most one fetch pipeline
/// per key. Execution of the task must continue even if this handle is dropped; the engine holds handles for exactly
/// as long as the associated cache entry lives.
pub trait Task<T>: Send + Sync + 'static {
	/// Flag this task for cancellation.
	fn abort(self);

	/// Returns `true` if the task is no longer running, either due to normal completion or abortion via
	/// [`Task::abort`].
	fn is_finished(&self) -> bool;
}

/// Trait automatically implemented for `Runtime`s that also impl `Default` with improved diagnostics that warn about
/// runtime Cargo features.
#[diagnostic::on_unimplemented(
	message = "`{Self}` cannot be used automatically because it does not impl `Default`",
	note = "you may need to create the runtime yourself and pass it to `Swr::new_in` instead",
	note = "if this is `NullRuntime`, that means you need to provide your own runtime or enable *exactly one* of `sswr`'s runtime features, like `tokio` or `smol`"
)]
#[doc(hidden)]
pub trait RuntimeDefault: Runtime + Default {}
impl<T: Runtime + Default> RuntimeDefault for T {}

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
mod tokio_rt {
	use std::{future::Future, time::Duration};

	use tokio::task::JoinHandle;

	/// An asynchronous runtime using [`tokio`] via the global runtime context.
	#[derive(Clone, Default)]
	pub struct Tokio;

	impl super::Runtime for Tokio {
		type Task<T: Send + 'static> = JoinHandle<T>;

		fn spawn<F>(&self, future: F) -> Self::Task<F::Output>
		where
			F: Future + Send + 'static,
			F::Output: Send + 'static
		{
			tokio::spawn(future)
		}

		fn wait(&self, duration: Duration) -> impl Future<Output = ()> {
			tokio::time::sleep(duration)
		}
	}

	impl<T: Send + 'static> super::Task<T> for JoinHandle<T> {
		fn abort(self) {
			JoinHandle::<T>::abort(&self);
		}

		fn is_finished(&self) -> bool {
			JoinHandle::<T>::is_finished(self)
		}
	}
}
#[cfg(feature = "tokio")]
pub use self::tokio_rt::Tokio;

#[cfg(feature = "smol")]
#[cfg_attr(docsrs, doc(cfg(feature = "smol")))]
mod smol_rt {
	use std::{future::Future, time::Duration};

	/// An asynchronous runtime using [`smol`]'s global executor.
	#[derive(Clone, Default)]
	pub struct Smol;

	impl super::Runtime for Smol {
		type Task<T: Send + 'static> = smol::Task<T>;

		fn spawn<F>(&self, future: F) -> Self::Task<F::Output>
		where
			F: Future + Send + 'static,
			F::Output: Send + 'static
		{
			smol::spawn(future)
		}

		async fn wait(&self, duration: Duration) {
			smol::Timer::after(duration).await;
		}
	}

	impl<T: Send + 'static> super::Task<T> for smol::Task<T> {
		fn abort(self) {
			drop(smol::Task::<T>::cancel(self));
		}

		fn is_finished(&self) -> bool {
			smol::Task::<T>::is_finished(self)
		}
	}
}
#[cfg(feature = "smol")]
pub use self::smol_rt::Smol;

mod null {
	use std::{convert::Infallible, future::Future, marker::PhantomData, time::Duration};

	/// A runtime that intentionally cannot be constructed. This forces users to specify their own runtime if either
	/// zero or more than one runtime features are enabled.
	#[derive(Clone)]
	pub enum NullRuntime {}

	impl super::Runtime for NullRuntime {
		type Task<T: Send + 'static> = NullHandle<T>;

		fn spawn<F>(&self, _future: F) -> Self::Task<F::Output>
		where
			F: Future + Send + 'static,
			F::Output: Send + 'static
		{
			match *self {}
		}

		async fn wait(&self, _duration: Duration) {
			match *self {}
		}
	}

	/// Only a `NullRuntime` could produce one of these, so the handle is just as uninhabited.
	pub struct NullHandle<T>(Infallible, PhantomData<fn() -> T>);

	impl<T: Send + 'static> super::Task<T> for NullHandle<T> {
		fn abort(self) {
			match self.0 {}
		}

		fn is_finished(&self) -> bool {
			match self.0 {}
		}
	}
}
#[doc(hidden)]
pub use self::null::NullRuntime;
