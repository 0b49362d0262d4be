//! Compaction planning and execution.

pub mod compactor;
pub mod descriptor;
pub mod fifo;
pub mod leveled;
pub mod pool;
pub mod universal;

use std::sync::Arc;

use crate::error::Result;
use crate::levels::LevelState;
use crate::options::{CompactionStyle, Options};

pub use descriptor::{Compaction, CompactionPlan, ExecutionState, Lifecycle};

/// Chooses compaction inputs. Both methods run with the level lock held, so
/// checking the being-compacted marks and setting them on the chosen files is
/// one atomic step.
pub trait CompactionPicker: Send + Sync {
	/// Picks the most urgent compaction, if any level needs one.
	fn pick_compaction(&self, state: &mut LevelState) -> Result<Option<Compaction>>;

	/// Builds a client-requested compaction of the user-key range
	/// `[begin, end]`; a missing bound is open. Returns `None` when nothing
	/// overlaps the range or part of it is already being compacted.
	fn compact_range(
		&self,
		state: &mut LevelState,
		input_level: usize,
		output_level: usize,
		begin: Option<&[u8]>,
		end: Option<&[u8]>,
	) -> Result<Option<Compaction>>;
}

/// The picker matching `opts.compaction_style`.
pub fn new_picker(opts: Arc<Options>) -> Arc<dyn CompactionPicker> {
	match opts.compaction_style {
		CompactionStyle::Level => Arc::new(leveled::LevelCompactionPicker::new(opts)),
		CompactionStyle::Universal => Arc::new(universal::UniversalCompactionPicker::new(opts)),
		CompactionStyle::Fifo => Arc::new(fifo::FifoCompactionPicker::new(opts)),
	}
}
