//! Compaction core of a log-structured merge tree.
//!
//! A [`VersionSet`] owns the current set of tables per level. A
//! [`CompactionPicker`] chooses input tables under the version set's lock and
//! returns a [`Compaction`] that keeps them marked as being compacted until it
//! is committed with [`VersionSet::log_and_apply`] or handed back with
//! [`VersionSet::release_compaction`]. The [`Compactor`] merges the inputs and
//! commits the result; a [`CompactionPool`] runs compactions on background
//! threads.

pub mod compaction;
pub mod comparator;
pub mod compression;
pub mod error;
pub mod levels;
pub mod options;
pub mod sstable;
pub mod vfs;

#[cfg(test)]
mod test;

pub use compaction::compactor::{CompactionStats, Compactor};
pub use compaction::pool::CompactionPool;
pub use compaction::{
	new_picker, Compaction, CompactionPicker, CompactionPlan, ExecutionState, Lifecycle,
};
pub use comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
pub use compression::{CompressionSelector, CompressionType};
pub use error::{Error, Result};
pub use levels::{RunningCompaction, Version, VersionEdit, VersionSet};
pub use options::{CompactionStyle, DbPath, FifoOptions, Options, UniversalOptions};
pub use sstable::meta::{FileMetaData, TableProperties};
pub use sstable::table::TableFormat;
pub use sstable::{InternalKey, InternalKeyKind};
