use std::sync::Arc;

use super::descriptor::CompactionBuilder;
use super::{Compaction, CompactionPicker};
use crate::error::Result;
use crate::levels::LevelState;
use crate::options::Options;

/// Drops the oldest tables once the tree outgrows its byte budget. Never
/// merges; every compaction it builds is a deletion compaction.
pub struct FifoCompactionPicker {
	opts: Arc<Options>,
}

impl FifoCompactionPicker {
	pub fn new(opts: Arc<Options>) -> Self {
		Self {
			opts,
		}
	}
}

impl CompactionPicker for FifoCompactionPicker {
	fn pick_compaction(&self, state: &mut LevelState) -> Result<Option<Compaction>> {
		let version = Arc::clone(state.current());
		let budget = self.opts.fifo.max_table_files_size;
		let total = version.num_level_bytes(0);
		if total <= budget {
			return Ok(None);
		}
		if state.level_compaction_running(0) {
			log::debug!("FIFO compaction already running; skipping");
			return Ok(None);
		}

		// Oldest tables sit at the end of L0
		let mut remaining = total;
		let mut inputs = Vec::new();
		for f in version.files(0).iter().rev() {
			if remaining <= budget {
				break;
			}
			if f.is_being_compacted() {
				return Ok(None);
			}
			remaining -= f.file_size;
			inputs.push(Arc::clone(f));
		}
		log::info!(
			"FIFO compaction: dropping {} tables, {} bytes over a {} byte budget",
			inputs.len(),
			total - budget,
			budget
		);

		CompactionBuilder::new(0, 0)
			.inputs(0, inputs)
			.deletion_compaction(true)
			.compression(self.opts.compression_for_level(0))
			.score(total as f64 / budget.max(1) as f64)
			.build(state)
			.map(Some)
	}

	/// Tables are only ever dropped by age, never rewritten on request.
	fn compact_range(
		&self,
		_state: &mut LevelState,
		_input_level: usize,
		_output_level: usize,
		_begin: Option<&[u8]>,
		_end: Option<&[u8]>,
	) -> Result<Option<Compaction>> {
		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::levels::{VersionEdit, VersionSet};
	use crate::options::{CompactionStyle, FifoOptions};
	use crate::sstable::meta::FileMetaData;
	use crate::sstable::{InternalKey, InternalKeyKind};

	#[test]
	fn drops_oldest_tables_over_budget() {
		let opts = Arc::new(
			Options::default()
				.with_compaction_style(CompactionStyle::Fifo)
				.with_num_levels(1)
				.with_fifo(FifoOptions {
					max_table_files_size: 250,
				}),
		);
		let vs = VersionSet::new(Arc::clone(&opts)).unwrap();
		let mut edit = VersionEdit::new();
		for number in 1..=4u64 {
			edit.add_file(
				0,
				FileMetaData::new(
					number,
					0,
					100,
					InternalKey::new(b"a".to_vec(), number, InternalKeyKind::Set),
					InternalKey::new(b"b".to_vec(), number, InternalKeyKind::Set),
				),
			);
		}
		vs.apply(edit).unwrap();

		let picker = FifoCompactionPicker::new(opts);
		let c = vs.pick_compaction(&picker).unwrap().unwrap();
		assert!(c.is_deletion_compaction());
		assert!(!c.is_trivial_move());
		let numbers: Vec<u64> = c.inputs(0).iter().map(|f| f.number).collect();
		assert_eq!(numbers, vec![1, 2]);

		assert!(vs.pick_compaction(&picker).unwrap().is_none());
		assert!(vs.compact_range(&picker, 0, 0, None, None).unwrap().is_none());
		vs.release_compaction(c, Ok(())).unwrap();
	}
}
