use std::future::Future;

use crate::runtime::{Runtime, Task};

/// A slot holding at most one background task.
///
/// Each cache entry owns one slot per kind of background work (fetch, teardown, signal listeners); inserting into an
/// occupied slot either yields to the running task or replaces it, depending on the [`TaskStartMode`].
pub struct TaskSlot<R: Runtime> {
	runtime: R,
	task: Option<R::Task<()>>
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TaskStartMode {
	/// Do not spawn the task if a task is currently running.
	Soft,
	/// If a task is currently running, abort it and replace it with the new task.
	Abort
}

impl<R: Runtime> TaskSlot<R> {
	pub fn new(runtime: R) -> Self {
		Self { runtime, task: None }
	}

	/// Spawns `fut` into this slot, returning whether it was actually spawned.
	pub fn insert<F>(&mut self, mode: TaskStartMode, fut: F) -> bool
	where
		F: Future<Output = ()> + Send + 'static
	{
		match mode {
			TaskStartMode::Soft => {
				if let Some(handle) = &self.task {
					if !handle.is_finished() {
						return false;
					}
				}
			}
			TaskStartMode::Abort => {
				if let Some(handle) = self.task.take() {
					handle.abort();
				}
			}
		}

		self.task.replace(self.runtime.spawn(fut));
		true
	}

	pub fn abort(&mut self) {
		if let Some(handle) = self.task.take() {
			handle.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Arc,
		atomic::{AtomicBool, Ordering}
	};

	use tokio::task::yield_now;

	use super::{TaskSlot, TaskStartMode};
	use crate::runtime::Tokio;

	#[tokio::test]
	async fn soft_start_yields_to_a_running_task() {
		let finished = Arc::new(AtomicBool::new(false));

		let mut slot = TaskSlot::new(Tokio);
		slot.insert(TaskStartMode::Soft, {
			let finished = Arc::clone(&finished);
			async move {
				finished.store(true, Ordering::Release);
			}
		});

		assert!(!slot.insert(TaskStartMode::Soft, async {}));

		yield_now().await;
		assert!(finished.load(Ordering::Acquire));
	}

	#[tokio::test]
	async fn abort_start_cancels_the_running_task() {
		let finished = Arc::new(AtomicBool::new(false));

		let mut slot = TaskSlot::new(Tokio);
		slot.insert(TaskStartMode::Soft, {
			let finished = Arc::clone(&finished);
			async move {
				finished.store(true, Ordering::Release);
			}
		});

		assert!(slot.insert(TaskStartMode::Abort, async {}));

		yield_now().await;
		assert!(!finished.load(Ordering::Acquire));
	}

	#[tokio::test]
	async fn soft_start_reuses_a_finished_slot() {
		let mut slot = TaskSlot::new(Tokio);
		slot.insert(TaskStartMode::Soft, async {});
		yield_now().await;

		assert!(slot.insert(TaskStartMode::Soft, async {}));
	}
}
