use std::sync::Arc;

use super::descriptor::CompactionBuilder;
use super::{Compaction, CompactionPicker};
use crate::error::{Error, Result};
use crate::levels::{LevelState, Version};
use crate::options::Options;
use crate::sstable::meta::FileMetaData;

/// Size-tiered picking. Every table lives in L0, newest first, and each
/// compaction merges a run of neighbouring tables of similar size into one.
pub struct UniversalCompactionPicker {
	opts: Arc<Options>,
}

impl UniversalCompactionPicker {
	pub fn new(opts: Arc<Options>) -> Self {
		Self {
			opts,
		}
	}

	/// Finds the first run, scanning from the newest table, in which each
	/// next table is at most `size_ratio` percent larger than everything
	/// accumulated so far. Runs stop at a busy table.
	fn pick_by_size_ratio(&self, files: &[Arc<FileMetaData>]) -> Option<Vec<Arc<FileMetaData>>> {
		let universal = &self.opts.universal;
		let ratio = u64::from(universal.size_ratio);

		for start in 0..files.len() {
			if files[start].is_being_compacted() {
				continue;
			}
			let mut run_size = files[start].compensated_file_size();
			let mut end = start + 1;
			while end < files.len() && end - start < universal.max_merge_width {
				let next = &files[end];
				if next.is_being_compacted() {
					break;
				}
				if run_size.saturating_mul(100 + ratio) / 100 < next.file_size {
					break;
				}
				run_size = run_size.saturating_add(next.file_size);
				end += 1;
			}
			if end - start >= universal.min_merge_width {
				return Some(files[start..end].to_vec());
			}
		}
		None
	}

	fn build(
		&self,
		state: &mut LevelState,
		inputs: Vec<Arc<FileMetaData>>,
		score: f64,
		manual: bool,
	) -> Result<Compaction> {
		let total: u64 = inputs.iter().map(|f| f.file_size).sum();
		CompactionBuilder::new(0, 0)
			.inputs(0, inputs)
			.max_output_file_size(u64::MAX)
			.max_grandparent_overlap_bytes(u64::MAX)
			.output_path_id(self.opts.universal_output_path_id(total))
			.compression(self.opts.compression_for_level(0))
			.manual_compaction(manual)
			.score(score)
			.build(state)
	}

	fn score(&self, version: &Version) -> f64 {
		let idle = version.files(0).iter().filter(|f| !f.is_being_compacted()).count();
		idle as f64 / self.opts.level0_file_num_compaction_trigger as f64
	}
}

impl CompactionPicker for UniversalCompactionPicker {
	fn pick_compaction(&self, state: &mut LevelState) -> Result<Option<Compaction>> {
		let version = Arc::clone(state.current());
		let score = self.score(&version);
		if score < 1.0 {
			return Ok(None);
		}
		let files = version.files(0);

		let inputs = match self.pick_by_size_ratio(files) {
			Some(run) => run,
			// Too many tables and no similar-size run: merge everything
			None if files.iter().all(|f| !f.is_being_compacted()) => files.to_vec(),
			None => return Ok(None),
		};
		log::debug!("Picked {} of {} tables for size-tiered compaction", inputs.len(), files.len());
		self.build(state, inputs, score, false).map(Some)
	}

	fn compact_range(
		&self,
		state: &mut LevelState,
		input_level: usize,
		output_level: usize,
		_begin: Option<&[u8]>,
		_end: Option<&[u8]>,
	) -> Result<Option<Compaction>> {
		if input_level != 0 || output_level != 0 {
			return Err(Error::InvalidArgument(
				"size-tiered trees only compact level 0 into itself".into(),
			));
		}
		// Tables overlap arbitrarily, so any range means all of them
		let version = Arc::clone(state.current());
		let files = version.files(0);
		if files.is_empty() {
			return Ok(None);
		}
		if files.iter().any(|f| f.is_being_compacted()) {
			log::info!("Manual size-tiered compaction conflicts with a running compaction");
			return Ok(None);
		}
		self.build(state, files.to_vec(), 0.0, true).map(Some)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::levels::{VersionEdit, VersionSet};
	use crate::options::CompactionStyle;
	use crate::sstable::{InternalKey, InternalKeyKind};

	fn file(number: u64, size: u64) -> FileMetaData {
		FileMetaData::new(
			number,
			0,
			size,
			InternalKey::new(b"a".to_vec(), number, InternalKeyKind::Set),
			InternalKey::new(b"z".to_vec(), number, InternalKeyKind::Set),
		)
	}

	fn setup(sizes: &[u64]) -> (UniversalCompactionPicker, VersionSet) {
		let opts = Arc::new(
			Options::default().with_compaction_style(CompactionStyle::Universal).with_num_levels(1),
		);
		let vs = VersionSet::new(Arc::clone(&opts)).unwrap();
		let mut edit = VersionEdit::new();
		for (i, size) in sizes.iter().enumerate() {
			edit.add_file(0, file(i as u64 + 1, *size));
		}
		vs.apply(edit).unwrap();
		(UniversalCompactionPicker::new(opts), vs)
	}

	#[test]
	fn similar_newest_tables_merge_first() {
		// Newest first: 4, 3, 2, 1
		let (picker, vs) = setup(&[1000, 100, 10, 10]);
		let c = vs.pick_compaction(&picker).unwrap().unwrap();

		let numbers: Vec<u64> = c.inputs(0).iter().map(|f| f.number).collect();
		assert_eq!(numbers, vec![4, 3]);
		assert!(!c.bottommost_level());
		assert!(!c.is_full_compaction());
		assert_eq!(c.max_output_file_size(), u64::MAX);
		assert_eq!(c.output_file_preallocation_size(), 20);
		vs.release_compaction(c, Ok(())).unwrap();
	}

	#[test]
	fn falls_back_to_all_tables() {
		let (picker, vs) = setup(&[10_000, 1000, 100, 10]);
		let c = vs.pick_compaction(&picker).unwrap().unwrap();

		assert_eq!(c.num_input_files(0), 4);
		assert!(c.bottommost_level());
		assert!(c.is_full_compaction());
		assert_eq!(c.output_file_preallocation_size(), 11_110);
		vs.release_compaction(c, Ok(())).unwrap();
	}

	#[test]
	fn below_trigger_picks_nothing() {
		let (picker, vs) = setup(&[10, 10, 10]);
		assert!(vs.pick_compaction(&picker).unwrap().is_none());
		let manual = vs.compact_range(&picker, 0, 0, None, None).unwrap().unwrap();
		assert!(manual.bottommost_level());
		vs.release_compaction(manual, Ok(())).unwrap();
	}
}
