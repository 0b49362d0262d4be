use std::sync::Arc;

use super::descriptor::CompactionBuilder;
use super::{Compaction, CompactionPicker};
use crate::error::{Error, Result};
use crate::levels::{LevelState, Version};
use crate::options::Options;
use crate::sstable::meta::FileMetaData;

/// What made the picker choose a compaction.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Trigger {
	Size,
	Seek,
	Manual,
}

/// Leveled picking: the level furthest over its budget compacts first, and
/// within a level the largest file (weighted by tombstones) goes first.
/// When no level is over budget, a file that ran out of allowed seeks is
/// pushed one level down.
///
/// Each level keeps a cursor into its size order so consecutive picks walk
/// through the level instead of hammering the same range.
pub struct LevelCompactionPicker {
	opts: Arc<Options>,
}

impl LevelCompactionPicker {
	pub fn new(opts: Arc<Options>) -> Self {
		Self {
			opts,
		}
	}

	/// Compaction score of every level that has a level below it, highest
	/// first. Files already being compacted do not count.
	pub fn level_scores(&self, version: &Version) -> Vec<(usize, f64)> {
		let last = version.num_levels().saturating_sub(1);
		let mut scores: Vec<(usize, f64)> = (0..last)
			.map(|level| {
				let idle = version.files(level).iter().filter(|f| !f.is_being_compacted());
				let score = if level == 0 {
					idle.count() as f64 / self.opts.level0_file_num_compaction_trigger as f64
				} else {
					let bytes: u64 = idle.map(|f| f.file_size).sum();
					bytes as f64 / self.opts.max_bytes_for_level(level) as f64
				};
				(level, score)
			})
			.collect();
		scores.sort_by(|a, b| b.1.total_cmp(&a.1));
		scores
	}

	/// Walks the level's size order from its cursor and returns the first
	/// file whose compaction would not touch a file already being compacted,
	/// expanded into base and output-level inputs. The cursor is left at the
	/// first file that was not being compacted.
	fn pick_by_size(
		&self,
		version: &Version,
		level: usize,
	) -> Option<(Vec<Arc<FileMetaData>>, Vec<Arc<FileMetaData>>)> {
		let files = version.files(level);
		let order = version.files_by_size(level);
		let start = version.next_compaction_index(level);

		let mut next_index = None;
		let mut chosen = None;
		for (pos, &idx) in order.iter().enumerate().skip(start) {
			let seed = &files[idx];
			if seed.is_being_compacted() {
				continue;
			}
			next_index.get_or_insert(pos);

			let Some(inputs) = self.expand_inputs(version, level, level + 1, seed) else {
				continue;
			};
			chosen = Some(inputs);
			break;
		}
		version.set_next_compaction_index(level, next_index.unwrap_or(order.len()));
		chosen
	}

	/// Grows a seed file into the full set of base inputs (all overlapping
	/// L0 files, or neighbours sharing a boundary key deeper down) plus the
	/// output-level files they overlap. `None` if any of them is busy.
	fn expand_inputs(
		&self,
		version: &Version,
		level: usize,
		output_level: usize,
		seed: &Arc<FileMetaData>,
	) -> Option<(Vec<Arc<FileMetaData>>, Vec<Arc<FileMetaData>>)> {
		let base = Self::expand_while_overlapping(version, level, vec![Arc::clone(seed)]);
		if base.iter().any(|f| f.is_being_compacted()) {
			return None;
		}
		let outputs = if output_level > level {
			let (lo, hi) = version.key_range(&base)?;
			version.overlapping_inputs(output_level, Some(lo.user_key()), Some(hi.user_key()))
		} else {
			Vec::new()
		};
		if outputs.iter().any(|f| f.is_being_compacted()) {
			return None;
		}
		Some((base, outputs))
	}

	fn expand_while_overlapping(
		version: &Version,
		level: usize,
		mut files: Vec<Arc<FileMetaData>>,
	) -> Vec<Arc<FileMetaData>> {
		loop {
			let Some((lo, hi)) = version.key_range(&files) else {
				return files;
			};
			let expanded =
				version.overlapping_inputs(level, Some(lo.user_key()), Some(hi.user_key()));
			if expanded.len() <= files.len() {
				return files;
			}
			files = expanded;
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn build(
		&self,
		state: &mut LevelState,
		version: &Version,
		level: usize,
		output_level: usize,
		(base, outputs): (Vec<Arc<FileMetaData>>, Vec<Arc<FileMetaData>>),
		score: f64,
		trigger: Trigger,
	) -> Result<Compaction> {
		let grandparent_level = output_level + 1;
		let grandparents = match version.key_range(base.iter().chain(outputs.iter())) {
			Some((lo, hi)) if grandparent_level < version.num_levels() => version
				.overlapping_inputs(grandparent_level, Some(lo.user_key()), Some(hi.user_key())),
			_ => Vec::new(),
		};

		let mut builder = CompactionBuilder::new(level, output_level).inputs(0, base);
		if output_level > level {
			builder = builder.inputs(1, outputs);
		}
		builder
			.grandparents(grandparents)
			.max_output_file_size(self.opts.max_file_size_for_level(output_level))
			.max_grandparent_overlap_bytes(self.opts.max_grandparent_overlap_bytes(level))
			.output_path_id(self.opts.output_path_id(output_level))
			.compression(self.opts.compression_for_level(output_level))
			.manual_compaction(trigger == Trigger::Manual)
			.seek_compaction(trigger == Trigger::Seek)
			.score(score)
			.advanced_cursor(trigger == Trigger::Size)
			.build(state)
	}

	/// Builds a compaction for the file whose seek budget ran out, if it can
	/// run now. A candidate blocked by a running compaction is kept for a
	/// later pick; one that no longer exists is dropped.
	fn pick_by_seek(
		&self,
		state: &mut LevelState,
		version: &Version,
	) -> Result<Option<Compaction>> {
		let Some((level, seed)) = state.take_seek_candidate() else {
			return Ok(None);
		};
		if level + 1 >= version.num_levels() || version.find_file(level, seed.number).is_none() {
			return Ok(None);
		}
		if seed.is_being_compacted() || (level == 0 && state.level_compaction_running(0)) {
			state.restore_seek_candidate(level, seed);
			return Ok(None);
		}
		let Some(inputs) = self.expand_inputs(version, level, level + 1, &seed) else {
			state.restore_seek_candidate(level, seed);
			return Ok(None);
		};
		log::debug!("Picked file #{} in level {} for seek compaction", seed.number, level);
		self.build(state, version, level, level + 1, inputs, 0.0, Trigger::Seek).map(Some)
	}
}

impl CompactionPicker for LevelCompactionPicker {
	fn pick_compaction(&self, state: &mut LevelState) -> Result<Option<Compaction>> {
		let version = Arc::clone(state.current());

		for (level, score) in self.level_scores(&version) {
			if score < 1.0 {
				break;
			}
			// L0 files overlap each other, so only one L0 compaction at a time
			if level == 0 && state.level_compaction_running(0) {
				continue;
			}
			if let Some(inputs) = self.pick_by_size(&version, level) {
				log::debug!("Picked level {} (score {:.2}) for compaction", level, score);
				return self
					.build(state, &version, level, level + 1, inputs, score, Trigger::Size)
					.map(Some);
			}
		}
		self.pick_by_seek(state, &version)
	}

	fn compact_range(
		&self,
		state: &mut LevelState,
		input_level: usize,
		output_level: usize,
		begin: Option<&[u8]>,
		end: Option<&[u8]>,
	) -> Result<Option<Compaction>> {
		let version = Arc::clone(state.current());
		let last = version.num_levels().saturating_sub(1);
		let valid = output_level < version.num_levels()
			&& (output_level == input_level + 1 || (input_level == last && output_level == last));
		if !valid {
			return Err(Error::InvalidArgument(format!(
				"manual compaction from level {input_level} into level {output_level}"
			)));
		}

		let mut base = version.overlapping_inputs(input_level, begin, end);
		if base.is_empty() {
			return Ok(None);
		}
		if input_level > 0 {
			base = Self::expand_while_overlapping(&version, input_level, base);
		}
		if base.iter().any(|f| f.is_being_compacted()) {
			log::info!(
				"Manual compaction of level {} conflicts with a running compaction",
				input_level
			);
			return Ok(None);
		}

		let outputs = match version.key_range(&base) {
			Some((lo, hi)) if output_level > input_level => {
				version.overlapping_inputs(output_level, Some(lo.user_key()), Some(hi.user_key()))
			}
			_ => Vec::new(),
		};
		if outputs.iter().any(|f| f.is_being_compacted()) {
			log::info!(
				"Manual compaction into level {} conflicts with a running compaction",
				output_level
			);
			return Ok(None);
		}

		let inputs = (base, outputs);
		self.build(state, &version, input_level, output_level, inputs, 0.0, Trigger::Manual)
			.map(Some)
	}
}
