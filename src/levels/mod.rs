use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::comparator::InternalKeyComparator;
use crate::compaction::{Compaction, CompactionPicker};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::sstable::meta::FileMetaData;

mod edit;
mod level;
mod version;

pub use edit::VersionEdit;
pub(crate) use level::Level;
pub use version::Version;

/// What the version set remembers about a compaction between construction
/// and release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningCompaction {
	pub id: u64,
	pub base_level: usize,
	pub output_level: usize,
	pub files: Vec<u64>,
}

/// Everything guarded by the version set's lock.
///
/// File selection and the exclusion flags it sets happen under this lock, so
/// a `&mut LevelState` is proof that no other compaction is selecting files.
pub struct LevelState {
	pub(crate) opts: Arc<Options>,
	pub(crate) current: Arc<Version>,
	next_file_number: u64,
	next_version_number: u64,
	next_compaction_id: u64,
	running: BTreeMap<u64, RunningCompaction>,
	/// A file whose seek budget ran out, with its level, waiting for a picker.
	seek_candidate: Option<(usize, Arc<FileMetaData>)>,
}

impl LevelState {
	pub fn current(&self) -> &Arc<Version> {
		&self.current
	}

	pub fn options(&self) -> &Arc<Options> {
		&self.opts
	}

	pub(crate) fn register_compaction(&mut self, running: RunningCompaction) {
		self.running.insert(running.id, running);
	}

	pub(crate) fn unregister_compaction(&mut self, id: u64) -> Option<RunningCompaction> {
		self.running.remove(&id)
	}

	pub(crate) fn allocate_compaction_id(&mut self) -> u64 {
		self.next_compaction_id += 1;
		self.next_compaction_id
	}

	pub fn running_compactions(&self) -> impl Iterator<Item = &RunningCompaction> {
		self.running.values()
	}

	pub(crate) fn take_seek_candidate(&mut self) -> Option<(usize, Arc<FileMetaData>)> {
		self.seek_candidate.take()
	}

	/// Puts back a candidate a picker could not use yet. A newer one wins.
	pub(crate) fn restore_seek_candidate(&mut self, level: usize, file: Arc<FileMetaData>) {
		self.seek_candidate.get_or_insert((level, file));
	}

	/// Whether a compaction reading from `level` is in flight.
	pub fn level_compaction_running(&self, level: usize) -> bool {
		self.running.values().any(|c| c.base_level == level)
	}

	fn install(&mut self, edit: &VersionEdit) -> Result<Arc<Version>> {
		let number = self.next_version_number + 1;
		let version = Arc::new(self.current.apply(number, edit)?);
		self.next_version_number = number;
		self.current = Arc::clone(&version);
		Ok(version)
	}
}

/// Owns the current version and serialises every change to it.
pub struct VersionSet {
	opts: Arc<Options>,
	icmp: InternalKeyComparator,
	state: Mutex<LevelState>,
}

impl VersionSet {
	pub fn new(opts: Arc<Options>) -> Result<Self> {
		opts.validate()?;
		let icmp = opts.internal_comparator();
		let current = Arc::new(Version::empty(icmp.clone(), opts.num_levels));
		Ok(Self {
			state: Mutex::new(LevelState {
				opts: Arc::clone(&opts),
				current,
				next_file_number: 0,
				next_version_number: 0,
				next_compaction_id: 0,
				running: BTreeMap::new(),
				seek_candidate: None,
			}),
			opts,
			icmp,
		})
	}

	pub fn options(&self) -> &Arc<Options> {
		&self.opts
	}

	pub fn icmp(&self) -> &InternalKeyComparator {
		&self.icmp
	}

	pub fn current(&self) -> Arc<Version> {
		Arc::clone(&self.state.lock().current)
	}

	pub fn new_file_number(&self) -> u64 {
		let mut state = self.state.lock();
		state.next_file_number += 1;
		state.next_file_number
	}

	/// Applies an edit that is not tied to a compaction, such as a flush.
	pub fn apply(&self, edit: VersionEdit) -> Result<Arc<Version>> {
		let mut state = self.state.lock();
		let max_number = edit.new_files().iter().map(|(_, f)| f.number).max().unwrap_or(0);
		let version = state.install(&edit)?;
		// Keep externally numbered files from colliding with future outputs
		state.next_file_number = state.next_file_number.max(max_number);
		log::debug!("Installed version {} from {:?}", version.number(), edit);
		Ok(version)
	}

	pub fn pick_compaction(&self, picker: &dyn CompactionPicker) -> Result<Option<Compaction>> {
		let mut state = self.state.lock();
		picker.pick_compaction(&mut state)
	}

	/// Builds a manual compaction of `[begin, end]` from `input_level` into
	/// `output_level`. Returns `None` when nothing overlaps the range or
	/// when a file in it is already being compacted.
	pub fn compact_range(
		&self,
		picker: &dyn CompactionPicker,
		input_level: usize,
		output_level: usize,
		begin: Option<&[u8]>,
		end: Option<&[u8]>,
	) -> Result<Option<Compaction>> {
		let mut state = self.state.lock();
		picker.compact_range(&mut state, input_level, output_level, begin, end)
	}

	/// Commits a finished compaction: applies its edit to build a new current
	/// version, then releases the compaction. The compaction is released on
	/// failure too, with the failure as its status.
	pub fn log_and_apply(&self, mut compaction: Compaction) -> Result<Arc<Version>> {
		let mut state = self.state.lock();
		if compaction.is_released() {
			return Err(Error::CompactionReleased(compaction.id()));
		}

		match state.install(compaction.edit()) {
			Ok(version) => {
				log::info!(
					"Compaction #{} committed as version {}: {:?}",
					compaction.id(),
					version.number(),
					compaction.edit()
				);
				compaction.release_compaction_files(&mut state, &Ok(()))?;
				Ok(version)
			}
			Err(e) => {
				log::error!("Compaction #{} failed to apply: {}", compaction.id(), e);
				let status = Err(e.clone());
				if let Err(release_err) = compaction.release_compaction_files(&mut state, &status) {
					log::error!(
						"Release of compaction #{} failed: {}",
						compaction.id(),
						release_err
					);
				}
				Err(e)
			}
		}
	}

	/// Releases a compaction that will not be committed. `status` is the
	/// reason; an error resets the size-pick cursor of the base level so the
	/// same files are considered again.
	pub fn release_compaction(&self, mut compaction: Compaction, status: Result<()>) -> Result<()> {
		let mut state = self.state.lock();
		compaction.release_compaction_files(&mut state, &status)
	}

	/// Charges a read that had to look at file `number` in `level` without
	/// finding its key there. Once the file's seek budget runs out it becomes
	/// the next seek compaction candidate. Returns whether this read did that.
	pub fn record_seek_miss(&self, level: usize, number: u64) -> bool {
		let mut state = self.state.lock();
		let Some(file) = state.current.find_file(level, number).cloned() else {
			return false;
		};
		if !file.charge_seek() || state.seek_candidate.is_some() {
			return false;
		}
		log::debug!("File #{} in level {} ran out of allowed seeks", number, level);
		state.seek_candidate = Some((level, file));
		true
	}

	pub fn running_compactions(&self) -> Vec<RunningCompaction> {
		self.state.lock().running.values().cloned().collect()
	}

	/// Numbers of the files in the current version that carry the
	/// being-compacted mark.
	pub fn being_compacted_files(&self) -> Vec<u64> {
		let current = self.current();
		let mut numbers: Vec<u64> =
			current.iter().filter(|(_, f)| f.is_being_compacted()).map(|(_, f)| f.number).collect();
		numbers.sort_unstable();
		numbers
	}

	/// Runs `f` with the level lock held.
	pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut LevelState) -> T) -> T {
		let mut state = self.state.lock();
		f(&mut state)
	}
}
