use std::path::PathBuf;
use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
use crate::compression::{CompressionSelector, CompressionType};
use crate::error::{Error, Result};
use crate::sstable::table::{AdaptiveTableFactory, TableFactory, TableFormat};

/// Default number of levels in the tree.
const DEFAULT_NUM_LEVELS: usize = 7;

/// Default size of an output table at L0/L1 (2MB).
const DEFAULT_TARGET_FILE_SIZE_BASE: u64 = 2 * 1024 * 1024;

/// Default byte budget of L1 (10MB).
const DEFAULT_MAX_BYTES_FOR_LEVEL_BASE: u64 = 10 * 1024 * 1024;

/// Default size of a data block before it is cut (4KB).
const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// How files are organised across levels and how compactions are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStyle {
	/// Leveled: each level is a sorted run, L(n) merges into L(n+1).
	Level,
	/// Size-tiered: every file lives in L0 and similar-size runs merge together.
	Universal,
	/// Oldest files are dropped once the tree exceeds a byte budget.
	Fifo,
}

/// A directory that output tables can be placed in, with the number of bytes
/// it is expected to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbPath {
	pub path: PathBuf,
	pub target_size: u64,
}

impl DbPath {
	pub fn new(path: impl Into<PathBuf>, target_size: u64) -> Self {
		Self {
			path: path.into(),
			target_size,
		}
	}
}

/// Tuning for size-tiered compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniversalOptions {
	/// Percentage flexibility when comparing file sizes for a merge run.
	pub size_ratio: u32,
	/// Minimum number of files in a single merge run.
	pub min_merge_width: usize,
	/// Maximum number of files in a single merge run.
	pub max_merge_width: usize,
}

impl Default for UniversalOptions {
	fn default() -> Self {
		Self {
			size_ratio: 1,
			min_merge_width: 2,
			max_merge_width: usize::MAX,
		}
	}
}

/// Tuning for FIFO compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoOptions {
	/// Once the total size of all tables exceeds this, the oldest are deleted.
	pub max_table_files_size: u64,
}

impl Default for FifoOptions {
	fn default() -> Self {
		Self {
			max_table_files_size: 1024 * 1024 * 1024,
		}
	}
}

/// Per-column-family configuration consumed by the pickers and the compactor.
#[derive(Clone)]
pub struct Options {
	pub num_levels: usize,
	pub compaction_style: CompactionStyle,

	/// Number of L0 files that triggers an L0 compaction.
	pub level0_file_num_compaction_trigger: usize,

	pub target_file_size_base: u64,
	pub target_file_size_multiplier: u64,
	pub max_bytes_for_level_base: u64,
	pub max_bytes_for_level_multiplier: u64,

	/// An output file stops growing once it overlaps this many target file
	/// sizes worth of grandparent data.
	pub max_grandparent_overlap_factor: u64,

	pub compression: CompressionSelector,
	pub db_paths: Vec<DbPath>,
	pub comparator: Arc<dyn Comparator>,
	pub table_format: TableFormat,
	pub block_size: usize,

	pub universal: UniversalOptions,
	pub fifo: FifoOptions,

	/// Number of worker threads in the compaction pool.
	pub compaction_threads: usize,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			num_levels: DEFAULT_NUM_LEVELS,
			compaction_style: CompactionStyle::Level,
			level0_file_num_compaction_trigger: 4,
			target_file_size_base: DEFAULT_TARGET_FILE_SIZE_BASE,
			target_file_size_multiplier: 1,
			max_bytes_for_level_base: DEFAULT_MAX_BYTES_FOR_LEVEL_BASE,
			max_bytes_for_level_multiplier: 10,
			max_grandparent_overlap_factor: 10,
			compression: CompressionSelector::default(),
			db_paths: vec![DbPath::new("", u64::MAX)],
			comparator: Arc::new(BytewiseComparator::default()),
			table_format: TableFormat::BlockBased,
			block_size: DEFAULT_BLOCK_SIZE,
			universal: UniversalOptions::default(),
			fifo: FifoOptions::default(),
			compaction_threads: 1,
		}
	}
}

impl Options {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn validate(&self) -> Result<()> {
		if self.num_levels == 0 {
			return Err(Error::InvalidArgument("num_levels must be at least 1".into()));
		}
		if self.compaction_style == CompactionStyle::Level && self.num_levels < 2 {
			return Err(Error::InvalidArgument(
				"leveled compaction needs at least 2 levels".into(),
			));
		}
		if self.db_paths.is_empty() {
			return Err(Error::InvalidArgument("at least one db path is required".into()));
		}
		if self.target_file_size_base == 0 || self.target_file_size_multiplier == 0 {
			return Err(Error::InvalidArgument("target file size must be positive".into()));
		}
		if self.max_bytes_for_level_base == 0 || self.max_bytes_for_level_multiplier == 0 {
			return Err(Error::InvalidArgument("level byte budget must be positive".into()));
		}
		if self.level0_file_num_compaction_trigger == 0 {
			return Err(Error::InvalidArgument(
				"level0_file_num_compaction_trigger must be positive".into(),
			));
		}
		if self.universal.min_merge_width < 2
			|| self.universal.max_merge_width < self.universal.min_merge_width
		{
			return Err(Error::InvalidArgument("invalid universal merge width".into()));
		}
		if self.compaction_threads == 0 {
			return Err(Error::InvalidArgument("compaction_threads must be positive".into()));
		}
		Ok(())
	}

	/// Places every table in a single directory with no size target.
	pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.db_paths = vec![DbPath::new(path, u64::MAX)];
		self
	}

	pub fn with_db_paths(mut self, paths: Vec<DbPath>) -> Self {
		self.db_paths = paths;
		self
	}

	pub fn with_num_levels(mut self, levels: usize) -> Self {
		self.num_levels = levels;
		self
	}

	pub fn with_compaction_style(mut self, style: CompactionStyle) -> Self {
		self.compaction_style = style;
		self
	}

	pub fn with_level0_file_num_compaction_trigger(mut self, trigger: usize) -> Self {
		self.level0_file_num_compaction_trigger = trigger;
		self
	}

	pub fn with_target_file_size_base(mut self, size: u64) -> Self {
		self.target_file_size_base = size;
		self
	}

	pub fn with_target_file_size_multiplier(mut self, multiplier: u64) -> Self {
		self.target_file_size_multiplier = multiplier;
		self
	}

	pub fn with_max_bytes_for_level_base(mut self, size: u64) -> Self {
		self.max_bytes_for_level_base = size;
		self
	}

	pub fn with_max_bytes_for_level_multiplier(mut self, multiplier: u64) -> Self {
		self.max_bytes_for_level_multiplier = multiplier;
		self
	}

	pub fn with_max_grandparent_overlap_factor(mut self, factor: u64) -> Self {
		self.max_grandparent_overlap_factor = factor;
		self
	}

	pub fn with_compression(mut self, compression: CompressionSelector) -> Self {
		self.compression = compression;
		self
	}

	pub fn with_comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
		self.comparator = comparator;
		self
	}

	pub fn with_table_format(mut self, format: TableFormat) -> Self {
		self.table_format = format;
		self
	}

	pub fn with_block_size(mut self, size: usize) -> Self {
		self.block_size = size;
		self
	}

	pub fn with_universal(mut self, universal: UniversalOptions) -> Self {
		self.universal = universal;
		self
	}

	pub fn with_fifo(mut self, fifo: FifoOptions) -> Self {
		self.fifo = fifo;
		self
	}

	pub fn with_compaction_threads(mut self, threads: usize) -> Self {
		self.compaction_threads = threads;
		self
	}

	pub fn internal_comparator(&self) -> InternalKeyComparator {
		InternalKeyComparator::new(Arc::clone(&self.comparator))
	}

	/// Factory that writes `table_format` and reads any supported format.
	pub fn table_factory(&self) -> Arc<dyn TableFactory> {
		Arc::new(AdaptiveTableFactory::new(self.table_format))
	}

	/// Target size of a table written to `level`.
	pub fn max_file_size_for_level(&self, level: usize) -> u64 {
		if level == 0 {
			return self.target_file_size_base;
		}
		let mut size = self.target_file_size_base;
		for _ in 1..level {
			size = size.saturating_mul(self.target_file_size_multiplier);
		}
		size
	}

	/// Byte budget of `level` before it scores for compaction.
	pub fn max_bytes_for_level(&self, level: usize) -> u64 {
		let mut size = self.max_bytes_for_level_base;
		for _ in 1..level.max(1) {
			size = size.saturating_mul(self.max_bytes_for_level_multiplier);
		}
		size
	}

	/// Ceiling on the grandparent bytes a single output of a compaction
	/// starting at `level` may overlap.
	pub fn max_grandparent_overlap_bytes(&self, level: usize) -> u64 {
		self.max_file_size_for_level(level).saturating_mul(self.max_grandparent_overlap_factor)
	}

	pub fn compression_for_level(&self, level: usize) -> CompressionType {
		self.compression.select_compression(level)
	}

	/// Picks the db path for a leveled output: walk the levels from L0,
	/// filling each path with whole level budgets until `level` fits. The
	/// last path takes whatever is left.
	pub fn output_path_id(&self, level: usize) -> u32 {
		let last = self.db_paths.len().saturating_sub(1);
		let mut p = 0;
		let mut current_path_size = self.db_paths.first().map_or(0, |p| p.target_size);
		let mut level_size = self.max_bytes_for_level_base;
		let mut cur_level = 0;

		while p < last {
			if level_size <= current_path_size {
				if cur_level == level {
					return p as u32;
				}
				current_path_size -= level_size;
				level_size = level_size.saturating_mul(self.max_bytes_for_level_multiplier);
				cur_level += 1;
				continue;
			}
			p += 1;
			current_path_size = self.db_paths[p].target_size;
		}
		p as u32
	}

	/// Picks the db path for a size-tiered output of `file_size` bytes: the
	/// path must hold the file and, together with the paths before it, the
	/// files that will accumulate before this one is merged again.
	pub fn universal_output_path_id(&self, file_size: u64) -> u32 {
		let last = self.db_paths.len().saturating_sub(1);
		let future_size =
			file_size / 100 * 100u64.saturating_sub(self.universal.size_ratio as u64);
		let mut accumulated_size: u64 = 0;

		for (p, db_path) in self.db_paths.iter().enumerate().take(last) {
			let target_size = db_path.target_size;
			if target_size > file_size
				&& accumulated_size.saturating_add(target_size - file_size) > future_size
			{
				return p as u32;
			}
			accumulated_size = accumulated_size.saturating_add(target_size);
		}
		last as u32
	}

	/// Location of table `number` written under db path `path_id`.
	pub fn table_file_path(&self, path_id: u32, number: u64) -> PathBuf {
		let dir = self
			.db_paths
			.get(path_id as usize)
			.or_else(|| self.db_paths.last())
			.map(|p| p.path.clone())
			.unwrap_or_default();
		dir.join(format!("{number:020}.sst"))
	}
}
