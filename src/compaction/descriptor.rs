//! The compaction descriptor.
//!
//! A [`Compaction`] is built by a picker while the level lock is held. It
//! names its input files per level, marks them as being compacted, and pins
//! the version they were chosen from. The immutable part lives in
//! [`CompactionPlan`]; the cursors consulted per key while merging live in an
//! [`ExecutionState`] borrowed from the descriptor.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::compression::CompressionType;
use crate::error::{Error, Result};
use crate::levels::{LevelState, RunningCompaction, Version, VersionEdit};
use crate::options::CompactionStyle;
use crate::sstable::meta::FileMetaData;
use crate::sstable::InternalKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
	/// Input files are marked and the input version is pinned.
	Running,
	/// Marks are cleared and the version is unpinned. Terminal.
	Released,
}

/// Construction parameters for a [`Compaction`]. Only pickers build one.
pub(crate) struct CompactionBuilder {
	base_level: usize,
	output_level: usize,
	inputs: Vec<Vec<Arc<FileMetaData>>>,
	grandparents: Vec<Arc<FileMetaData>>,
	max_output_file_size: u64,
	max_grandparent_overlap_bytes: u64,
	output_path_id: u32,
	output_compression: CompressionType,
	seek_compaction: bool,
	deletion_compaction: bool,
	manual_compaction: bool,
	score: f64,
	advanced_cursor: bool,
}

impl CompactionBuilder {
	pub(crate) fn new(base_level: usize, output_level: usize) -> Self {
		let input_levels = output_level.saturating_sub(base_level) + 1;
		Self {
			base_level,
			output_level,
			inputs: vec![Vec::new(); input_levels],
			grandparents: Vec::new(),
			max_output_file_size: u64::MAX,
			max_grandparent_overlap_bytes: u64::MAX,
			output_path_id: 0,
			output_compression: CompressionType::None,
			seek_compaction: false,
			deletion_compaction: false,
			manual_compaction: false,
			score: 0.0,
			advanced_cursor: false,
		}
	}

	/// Sets the files taken from level `base_level + which`.
	pub(crate) fn inputs(mut self, which: usize, files: Vec<Arc<FileMetaData>>) -> Self {
		if which >= self.inputs.len() {
			self.inputs.resize(which + 1, Vec::new());
		}
		self.inputs[which] = files;
		self
	}

	pub(crate) fn grandparents(mut self, files: Vec<Arc<FileMetaData>>) -> Self {
		self.grandparents = files;
		self
	}

	pub(crate) fn max_output_file_size(mut self, size: u64) -> Self {
		self.max_output_file_size = size;
		self
	}

	pub(crate) fn max_grandparent_overlap_bytes(mut self, bytes: u64) -> Self {
		self.max_grandparent_overlap_bytes = bytes;
		self
	}

	pub(crate) fn output_path_id(mut self, path_id: u32) -> Self {
		self.output_path_id = path_id;
		self
	}

	pub(crate) fn compression(mut self, compression: CompressionType) -> Self {
		self.output_compression = compression;
		self
	}

	pub(crate) fn seek_compaction(mut self, seek: bool) -> Self {
		self.seek_compaction = seek;
		self
	}

	pub(crate) fn deletion_compaction(mut self, deletion: bool) -> Self {
		self.deletion_compaction = deletion;
		self
	}

	pub(crate) fn manual_compaction(mut self, manual: bool) -> Self {
		self.manual_compaction = manual;
		self
	}

	pub(crate) fn score(mut self, score: f64) -> Self {
		self.score = score;
		self
	}

	/// Records that the picker moved the base level's size-pick cursor.
	pub(crate) fn advanced_cursor(mut self, advanced: bool) -> Self {
		self.advanced_cursor = advanced;
		self
	}

	pub(crate) fn build(self, state: &mut LevelState) -> Result<Compaction> {
		Compaction::new(state, self)
	}
}

/// The fixed part of a compaction: what it reads, where it writes and how it
/// was classified.
#[derive(Debug)]
pub struct CompactionPlan {
	id: u64,
	version_number: u64,
	style: CompactionStyle,
	base_level: usize,
	output_level: usize,
	number_levels: usize,
	inputs: Vec<Vec<Arc<FileMetaData>>>,
	/// Smallest and largest key of each input level, `None` when it is empty.
	input_ranges: Vec<Option<(InternalKey, InternalKey)>>,
	grandparents: Vec<Arc<FileMetaData>>,
	max_output_file_size: u64,
	max_grandparent_overlap_bytes: u64,
	output_path_id: u32,
	output_compression: CompressionType,
	seek_compaction: bool,
	deletion_compaction: bool,
	manual_compaction: bool,
	full_compaction: bool,
	bottommost_level: bool,
	trivial_move: bool,
	score: f64,
}

impl CompactionPlan {
	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn style(&self) -> CompactionStyle {
		self.style
	}

	pub fn level(&self) -> usize {
		self.base_level
	}

	pub fn output_level(&self) -> usize {
		self.output_level
	}

	pub fn number_levels(&self) -> usize {
		self.number_levels
	}

	pub fn num_input_levels(&self) -> usize {
		self.inputs.len()
	}

	/// Files read from level `level() + which`.
	pub fn inputs(&self, which: usize) -> &[Arc<FileMetaData>] {
		self.inputs.get(which).map_or(&[], Vec::as_slice)
	}

	pub fn num_input_files(&self, which: usize) -> usize {
		self.inputs(which).len()
	}

	pub fn input(&self, which: usize, i: usize) -> Option<&Arc<FileMetaData>> {
		self.inputs(which).get(i)
	}

	/// Smallest and largest key across input level `which`.
	pub fn input_range(&self, which: usize) -> Option<(&InternalKey, &InternalKey)> {
		self.input_ranges.get(which)?.as_ref().map(|(lo, hi)| (lo, hi))
	}

	/// Every input file with the level it is read from.
	pub fn all_inputs(&self) -> impl Iterator<Item = (usize, &Arc<FileMetaData>)> + '_ {
		self.inputs
			.iter()
			.enumerate()
			.flat_map(move |(which, files)| files.iter().map(move |f| (self.base_level + which, f)))
	}

	pub fn grandparents(&self) -> &[Arc<FileMetaData>] {
		&self.grandparents
	}

	pub fn max_output_file_size(&self) -> u64 {
		self.max_output_file_size
	}

	pub fn max_grandparent_overlap_bytes(&self) -> u64 {
		self.max_grandparent_overlap_bytes
	}

	pub fn output_path_id(&self) -> u32 {
		self.output_path_id
	}

	pub fn output_compression(&self) -> CompressionType {
		self.output_compression
	}

	pub fn score(&self) -> f64 {
		self.score
	}

	pub fn is_seek_compaction(&self) -> bool {
		self.seek_compaction
	}

	pub fn is_deletion_compaction(&self) -> bool {
		self.deletion_compaction
	}

	pub fn is_manual_compaction(&self) -> bool {
		self.manual_compaction
	}

	pub fn is_full_compaction(&self) -> bool {
		self.full_compaction
	}

	pub fn bottommost_level(&self) -> bool {
		self.bottommost_level
	}

	/// Whether the single base input can be moved to the output level without
	/// rewriting it. Decided once at construction.
	pub fn is_trivial_move(&self) -> bool {
		self.trivial_move
	}

	pub fn total_input_size(&self) -> u64 {
		self.all_inputs().map(|(_, f)| f.file_size).sum()
	}

	/// Bytes to reserve for each output file.
	pub fn output_file_preallocation_size(&self) -> u64 {
		match self.style {
			CompactionStyle::Level => self.max_output_file_size,
			CompactionStyle::Universal | CompactionStyle::Fifo => self.total_input_size(),
		}
	}

	/// One-line description for logs, cut to at most `max_len` bytes.
	pub fn summary(&self, max_len: usize) -> String {
		let mut out = format!(
			"Base version {} Base level {}, seek compaction:{}, inputs: [",
			self.version_number, self.base_level, self.seek_compaction as u8
		);
		for (which, files) in self.inputs.iter().enumerate() {
			if which > 0 {
				out.push_str("], [");
			}
			let _ = write!(out, "{} files", files.len());
			if let Some((lo, hi)) = self.input_range(which) {
				let _ = write!(
					out,
					" {}..{}",
					String::from_utf8_lossy(lo.user_key()),
					String::from_utf8_lossy(hi.user_key())
				);
			}
			out.push(':');
			for f in files {
				let _ = write!(out, " {}({})", f.number, f.file_size);
			}
		}
		out.push(']');

		if out.len() > max_len {
			let mut cut = max_len;
			while !out.is_char_boundary(cut) {
				cut -= 1;
			}
			out.truncate(cut);
		}
		out
	}
}

/// A compaction from construction until release.
///
/// Release is mandatory: commit it with `VersionSet::log_and_apply` or give it
/// back with `VersionSet::release_compaction`. Dropping a running compaction
/// leaves its input files marked, and nothing will pick them again.
pub struct Compaction {
	plan: CompactionPlan,
	input_version: Option<Arc<Version>>,
	edit: VersionEdit,
	lifecycle: Lifecycle,
	advanced_cursor: bool,
}

impl std::ops::Deref for Compaction {
	type Target = CompactionPlan;

	fn deref(&self) -> &Self::Target {
		&self.plan
	}
}

impl Compaction {
	/// Validates the inputs against the current version and marks them. On
	/// error no file is marked and nothing is registered.
	pub(crate) fn new(state: &mut LevelState, b: CompactionBuilder) -> Result<Self> {
		let version = Arc::clone(&state.current);
		let style = state.opts.compaction_style;
		let number_levels = version.num_levels();

		if b.base_level > b.output_level || b.output_level >= number_levels {
			return Err(Error::InvalidArgument(format!(
				"cannot compact level {} into level {} of a {}-level tree",
				b.base_level, b.output_level, number_levels
			)));
		}
		if b.inputs.len() != b.output_level - b.base_level + 1 {
			return Err(Error::InvalidArgument(format!(
				"{} input levels for a compaction spanning levels {}..={}",
				b.inputs.len(),
				b.base_level,
				b.output_level
			)));
		}

		let mut numbers = BTreeSet::new();
		for (which, files) in b.inputs.iter().enumerate() {
			let level = b.base_level + which;
			for f in files {
				if version.find_file(level, f.number).is_none() {
					return Err(Error::FileNotFound(f.number));
				}
				if !numbers.insert(f.number) {
					return Err(Error::InvalidArgument(format!(
						"file #{} named twice in one compaction",
						f.number
					)));
				}
				if f.is_being_compacted() {
					return Err(Error::FileAlreadyBeingCompacted(f.number));
				}
			}
		}

		let bottommost_level = match style {
			CompactionStyle::Universal => {
				b.manual_compaction
					|| version
						.files(0)
						.last()
						.is_some_and(|oldest| numbers.contains(&oldest.number))
			}
			CompactionStyle::Level | CompactionStyle::Fifo => {
				(b.output_level + 1..number_levels).all(|l| version.num_level_files(l) == 0)
			}
		};
		let full_compaction = numbers.len() == version.iter().count();
		let input_ranges = b.inputs.iter().map(|files| version.key_range(files)).collect();
		let trivial_move = Self::trivial_move(style, &version, &b);

		let id = state.allocate_compaction_id();
		for f in b.inputs.iter().flatten() {
			let was_marked = f.set_being_compacted(true);
			debug_assert!(!was_marked, "file #{} marked twice", f.number);
		}
		state.register_compaction(RunningCompaction {
			id,
			base_level: b.base_level,
			output_level: b.output_level,
			files: numbers.into_iter().collect(),
		});

		let compaction = Self {
			plan: CompactionPlan {
				id,
				version_number: version.number(),
				style,
				base_level: b.base_level,
				output_level: b.output_level,
				number_levels,
				inputs: b.inputs,
				input_ranges,
				grandparents: b.grandparents,
				max_output_file_size: b.max_output_file_size,
				max_grandparent_overlap_bytes: b.max_grandparent_overlap_bytes,
				output_path_id: b.output_path_id,
				output_compression: b.output_compression,
				seek_compaction: b.seek_compaction,
				deletion_compaction: b.deletion_compaction,
				manual_compaction: b.manual_compaction,
				full_compaction,
				bottommost_level,
				trivial_move,
				score: b.score,
			},
			input_version: Some(version),
			edit: VersionEdit::new(),
			lifecycle: Lifecycle::Running,
			advanced_cursor: b.advanced_cursor,
		};
		log::debug!("Compaction #{} created: {}", id, compaction.summary(256));
		Ok(compaction)
	}

	/// One base file, nothing at the output level in its range, and no more
	/// grandparent data than one output file may overlap. Never for deletion
	/// or manual compactions, and only for leveled trees.
	fn trivial_move(style: CompactionStyle, version: &Version, b: &CompactionBuilder) -> bool {
		if style != CompactionStyle::Level
			|| b.deletion_compaction
			|| b.manual_compaction
			|| b.base_level == b.output_level
			|| b.inputs.len() != 2
			|| b.inputs[0].len() != 1
			|| !b.inputs[1].is_empty()
		{
			return false;
		}
		let file = &b.inputs[0][0];
		if version.overlaps_level(b.output_level, &file.smallest, &file.largest) {
			return false;
		}
		let grandparent_bytes: u64 = b.grandparents.iter().map(|f| f.file_size).sum();
		grandparent_bytes <= b.max_grandparent_overlap_bytes
	}

	pub fn plan(&self) -> &CompactionPlan {
		&self.plan
	}

	pub fn lifecycle(&self) -> Lifecycle {
		self.lifecycle
	}

	pub fn is_released(&self) -> bool {
		self.lifecycle == Lifecycle::Released
	}

	fn ensure_running(&self) -> Result<()> {
		match self.lifecycle {
			Lifecycle::Running => Ok(()),
			Lifecycle::Released => Err(Error::CompactionReleased(self.plan.id)),
		}
	}

	/// The version the inputs were chosen from.
	pub fn input_version(&self) -> Result<&Arc<Version>> {
		self.ensure_running()?;
		self.input_version.as_ref().ok_or(Error::CompactionReleased(self.plan.id))
	}

	/// Starts the per-key state for merging this compaction's inputs. The
	/// state borrows the compaction, so it cannot outlive a release.
	pub fn begin_execution(&self) -> Result<ExecutionState<'_>> {
		let version = self.input_version()?;
		Ok(ExecutionState {
			plan: &self.plan,
			version: version.as_ref(),
			grandparent_index: 0,
			grandparent_entered: false,
			seen_key: false,
			overlapped_bytes: 0,
			level_ptrs: vec![0; self.plan.number_levels],
		})
	}

	pub fn edit(&self) -> &VersionEdit {
		&self.edit
	}

	pub fn edit_mut(&mut self) -> Result<&mut VersionEdit> {
		self.ensure_running()?;
		Ok(&mut self.edit)
	}

	/// Records the removal of every input file in the edit.
	pub fn add_input_deletions(&mut self) -> Result<()> {
		self.ensure_running()?;
		for (which, files) in self.plan.inputs.iter().enumerate() {
			for f in files {
				self.edit.delete_file(self.plan.base_level + which, f.number);
			}
		}
		Ok(())
	}

	/// Clears the being-compacted mark on every input, unregisters the
	/// compaction and unpins its version. When `status` is an error and the
	/// picker had moved the size-pick cursor, the cursor is rewound on both
	/// the input and the current version.
	///
	/// A mark that was already clear is reported as `FileNotBeingCompacted`,
	/// after the remaining marks are cleared.
	pub(crate) fn release_compaction_files(
		&mut self,
		state: &mut LevelState,
		status: &Result<()>,
	) -> Result<()> {
		self.ensure_running()?;

		let mut result = Ok(());
		for (_, f) in self.plan.all_inputs() {
			if !f.set_being_compacted(false) {
				log::error!(
					"Compaction #{}: file #{} was not marked as being compacted",
					self.plan.id,
					f.number
				);
				if result.is_ok() {
					result = Err(Error::FileNotBeingCompacted(f.number));
				}
			}
		}
		state.unregister_compaction(self.plan.id);

		match status {
			Ok(()) => log::debug!("Compaction #{} released", self.plan.id),
			Err(e) => {
				if self.advanced_cursor {
					if let Some(version) = &self.input_version {
						version.reset_next_compaction_index(self.plan.base_level);
					}
					state.current.reset_next_compaction_index(self.plan.base_level);
				}
				log::warn!("Compaction #{} released after failure: {}", self.plan.id, e);
			}
		}

		self.release_inputs();
		result
	}

	/// Unpins the input version. Safe to call more than once.
	fn release_inputs(&mut self) {
		self.input_version = None;
		self.lifecycle = Lifecycle::Released;
	}
}

impl Drop for Compaction {
	fn drop(&mut self) {
		if self.lifecycle == Lifecycle::Running {
			log::error!(
				"Compaction #{} dropped without release; {} input files stay marked as being compacted",
				self.plan.id,
				self.plan.all_inputs().count()
			);
		}
	}
}

impl std::fmt::Debug for Compaction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Compaction")
			.field("id", &self.plan.id)
			.field("lifecycle", &self.lifecycle)
			.field("summary", &self.plan.summary(256))
			.finish()
	}
}

/// Cursors a worker advances while it merges one compaction. Keys must be
/// presented in strictly increasing internal-key order; both predicates only
/// ever move forward.
pub struct ExecutionState<'a> {
	plan: &'a CompactionPlan,
	version: &'a Version,
	grandparent_index: usize,
	/// Whether the output range already reaches into
	/// `grandparents[grandparent_index]`.
	grandparent_entered: bool,
	seen_key: bool,
	overlapped_bytes: u64,
	level_ptrs: Vec<usize>,
}

impl ExecutionState<'_> {
	pub fn plan(&self) -> &CompactionPlan {
		self.plan
	}

	pub fn grandparent_index(&self) -> usize {
		self.grandparent_index
	}

	pub fn overlapped_bytes(&self) -> u64 {
		self.overlapped_bytes
	}

	pub fn level_ptr(&self, level: usize) -> usize {
		self.level_ptrs.get(level).copied().unwrap_or(0)
	}

	/// Whether the output file being written should be closed before `key`.
	///
	/// Tracks the grandparent bytes the current output overlaps: a grandparent
	/// file counts once the output range reaches into it, and a file skipped
	/// over entirely counts if the output already holds a key. Fires when that
	/// total exceeds the ceiling and the output is not empty. The next output
	/// starts at `key`, so its count starts with the grandparent `key` sits in.
	pub fn should_stop_before(&mut self, key: &InternalKey) -> bool {
		let icmp = self.version.icmp();
		let grandparents = &self.plan.grandparents;

		while let Some(f) = grandparents.get(self.grandparent_index) {
			if icmp.compare_keys(key, &f.largest) != Ordering::Greater {
				break;
			}
			if self.seen_key && !self.grandparent_entered {
				self.overlapped_bytes += f.file_size;
			}
			self.grandparent_index += 1;
			self.grandparent_entered = false;
		}

		if let Some(f) = grandparents.get(self.grandparent_index) {
			if !self.grandparent_entered && icmp.compare_keys(key, &f.smallest) != Ordering::Less {
				self.overlapped_bytes += f.file_size;
				self.grandparent_entered = true;
			}
		}

		let stop = self.seen_key && self.overlapped_bytes > self.plan.max_grandparent_overlap_bytes;
		self.seen_key = true;
		if stop {
			log::debug!(
				"Compaction #{}: cutting output before {:?}, {} grandparent bytes overlapped",
				self.plan.id,
				String::from_utf8_lossy(key.user_key()),
				self.overlapped_bytes
			);
			self.overlapped_bytes = match grandparents.get(self.grandparent_index) {
				Some(f) if self.grandparent_entered => f.file_size,
				_ => 0,
			};
		}
		stop
	}

	/// Tells the state the current output was closed for a reason of the
	/// caller's own, such as reaching the target file size. The next key is
	/// the first of a new output.
	pub fn output_file_finished(&mut self) {
		self.seen_key = false;
		self.grandparent_entered = false;
		self.overlapped_bytes = 0;
	}

	/// Whether `user_key` is absent from every level below the output level,
	/// which lets a tombstone for it be dropped. Size-tiered trees answer
	/// with `bottommost_level`.
	pub fn key_not_exists_beyond_output_level(&mut self, user_key: &[u8]) -> bool {
		if self.plan.style != CompactionStyle::Level {
			return self.plan.bottommost_level;
		}
		let icmp = self.version.icmp();
		for level in self.plan.output_level + 1..self.plan.number_levels {
			let files = self.version.files(level);
			while let Some(f) = files.get(self.level_ptrs[level]) {
				if icmp.compare_user_keys(user_key, f.largest.user_key()) != Ordering::Greater {
					if icmp.compare_user_keys(user_key, f.smallest.user_key()) != Ordering::Less {
						return false;
					}
					break;
				}
				self.level_ptrs[level] += 1;
			}
		}
		true
	}
}
