//! Background compaction workers.
//!
//! Work is spawned as `async_task` tasks whose runnables travel over a
//! `flume` queue to a fixed set of threads. The caller gets a [`Task`] back
//! and may block on it, detach it, or drop it to cancel work not yet started;
//! a cancelled compaction is released with `Error::Abort`.
//!
//! ```ignore
//! let pool = CompactionPool::new(versions)?;
//! if let Some(task) = pool.schedule_compaction()? {
//!     let stats = futures_lite::future::block_on(task)?;
//! }
//! ```

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_task::{Runnable, Task};

use super::compactor::{CompactionStats, Compactor};
use super::{new_picker, Compaction, CompactionPicker};
use crate::error::{Error, Result};
use crate::levels::VersionSet;

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A fixed set of worker threads running compactions picked from one
/// version set.
pub struct CompactionPool {
	queue: Option<flume::Sender<Runnable>>,
	workers: Vec<thread::JoinHandle<()>>,
	shutdown: Arc<AtomicBool>,
	versions: Arc<VersionSet>,
	picker: Arc<dyn CompactionPicker>,
	compactor: Arc<Compactor>,
}

impl CompactionPool {
	/// Starts `compaction_threads` workers picking with the configured style.
	pub fn new(versions: Arc<VersionSet>) -> Result<Self> {
		let picker = new_picker(Arc::clone(versions.options()));
		Self::with_picker(versions, picker)
	}

	pub fn with_picker(
		versions: Arc<VersionSet>,
		picker: Arc<dyn CompactionPicker>,
	) -> Result<Self> {
		let threads = versions.options().compaction_threads.max(1);
		let (tx, rx) = flume::unbounded::<Runnable>();
		let shutdown = Arc::new(AtomicBool::new(false));

		let mut workers = Vec::with_capacity(threads);
		for i in 0..threads {
			let receiver = rx.clone();
			let stop = Arc::clone(&shutdown);
			let handle = thread::Builder::new()
				.name(format!("compaction-{i}"))
				.spawn(move || worker_loop(receiver, stop))?;
			workers.push(handle);
		}
		log::debug!("Started {} compaction workers", threads);

		let compactor =
			Arc::new(Compactor::new(Arc::clone(&versions)).with_shutdown(Arc::clone(&shutdown)));
		Ok(Self {
			queue: Some(tx),
			workers,
			shutdown,
			versions,
			picker,
			compactor,
		})
	}

	/// Runs `future` on a worker thread and returns a handle to its output.
	pub fn spawn<F, T>(&self, future: F) -> Result<Task<T>>
	where
		F: Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		let Some(queue) = self.queue.clone() else {
			return Err(Error::Abort);
		};
		let schedule = move |runnable| {
			if let Err(e) = queue.send(runnable) {
				log::error!("Compaction queue closed: {}", e);
			}
		};
		let (runnable, task) = async_task::spawn(future, schedule);
		runnable.schedule();
		Ok(task)
	}

	/// Picks the most urgent compaction and runs it on a worker. `None` when
	/// nothing needs compacting.
	pub fn schedule_compaction(&self) -> Result<Option<Task<Result<CompactionStats>>>> {
		self.ensure_open()?;
		match self.versions.pick_compaction(self.picker.as_ref())? {
			Some(compaction) => self.submit(compaction).map(Some),
			None => Ok(None),
		}
	}

	/// Builds a manual compaction of `[begin, end]` and runs it on a worker.
	/// `None` when the range is empty or already being compacted.
	pub fn schedule_range(
		&self,
		input_level: usize,
		output_level: usize,
		begin: Option<&[u8]>,
		end: Option<&[u8]>,
	) -> Result<Option<Task<Result<CompactionStats>>>> {
		self.ensure_open()?;
		let picker = self.picker.as_ref();
		match self.versions.compact_range(picker, input_level, output_level, begin, end)? {
			Some(compaction) => self.submit(compaction).map(Some),
			None => Ok(None),
		}
	}

	fn submit(&self, compaction: Compaction) -> Result<Task<Result<CompactionStats>>> {
		log::debug!("Scheduling compaction #{}", compaction.id());
		let compactor = Arc::clone(&self.compactor);
		let mut pending = PendingCompaction {
			versions: Arc::clone(&self.versions),
			compaction: Some(compaction),
		};
		self.spawn(async move {
			match pending.compaction.take() {
				Some(compaction) => compactor.run(compaction),
				None => Err(Error::Abort),
			}
		})
	}

	fn ensure_open(&self) -> Result<()> {
		if self.shutdown.load(Ordering::Acquire) {
			return Err(Error::Abort);
		}
		Ok(())
	}

	/// Stops accepting work, makes running merges abort, and waits for the
	/// workers to drain the queue.
	pub fn shutdown(&mut self) {
		self.shutdown.store(true, Ordering::Release);
		self.queue = None;
		for worker in self.workers.drain(..) {
			if worker.join().is_err() {
				log::error!("Compaction worker exited with a panic");
			}
		}
	}
}

// Tasks keep a sender alive through their schedule function, so workers
// also watch the shutdown flag once the queue runs dry.
fn worker_loop(receiver: flume::Receiver<Runnable>, stop: Arc<AtomicBool>) {
	loop {
		match receiver.recv_timeout(WORKER_POLL_INTERVAL) {
			Ok(runnable) => {
				if catch_unwind(AssertUnwindSafe(|| runnable.run())).is_err() {
					log::error!("Compaction worker task panicked");
				}
			}
			Err(flume::RecvTimeoutError::Timeout) if stop.load(Ordering::Acquire) => break,
			Err(flume::RecvTimeoutError::Timeout) => continue,
			Err(flume::RecvTimeoutError::Disconnected) => break,
		}
	}
}

/// Owns a compaction until a worker starts it, releasing it if the task is
/// dropped first.
struct PendingCompaction {
	versions: Arc<VersionSet>,
	compaction: Option<Compaction>,
}

impl Drop for PendingCompaction {
	fn drop(&mut self) {
		if let Some(compaction) = self.compaction.take() {
			log::warn!("Compaction #{} cancelled before it ran", compaction.id());
			if let Err(e) = self.versions.release_compaction(compaction, Err(Error::Abort)) {
				log::error!("Release of cancelled compaction failed: {}", e);
			}
		}
	}
}

impl Drop for CompactionPool {
	fn drop(&mut self) {
		self.shutdown();
	}
}
