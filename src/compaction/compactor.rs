use std::cmp::Ordering;
use std::fs::{self, File as SysFile};
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use super::{Compaction, ExecutionState};
use crate::comparator::InternalKeyComparator;
use crate::compression::CompressionType;
use crate::error::{Error, Result};
use crate::levels::VersionSet;
use crate::sstable::meta::FileMetaData;
use crate::sstable::table::{TableBuilder, TableBuilderOptions, TableIter, TableReader};
use crate::sstable::InternalKey;
use crate::vfs::File;

// Cap on the write buffer sized from the preallocation hint
const MAX_WRITE_BUFFER: u64 = 4 * 1024 * 1024;

/// What one compaction read, wrote and threw away.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactionStats {
	pub input_files: usize,
	pub input_bytes: u64,
	pub output_files: usize,
	pub output_bytes: u64,
	pub entries_read: u64,
	pub entries_written: u64,
	/// Older versions hidden by a newer entry for the same user key.
	pub shadowed_dropped: u64,
	pub tombstones_dropped: u64,
	pub trivial_move: bool,
}

/// Runs compactions to completion against a version set.
pub struct Compactor {
	versions: Arc<VersionSet>,
	shutdown: Arc<AtomicBool>,
}

impl Compactor {
	pub fn new(versions: Arc<VersionSet>) -> Self {
		Self {
			versions,
			shutdown: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Shares a shutdown flag; a merge in progress stops with `Error::Abort`
	/// once it is set.
	pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
		self.shutdown = shutdown;
		self
	}

	/// Executes `compaction` and commits its edit. The compaction is always
	/// released: committed on success, handed back with the error otherwise.
	pub fn run(&self, mut compaction: Compaction) -> Result<CompactionStats> {
		let mut stats = CompactionStats {
			input_files: compaction.all_inputs().count(),
			input_bytes: compaction.total_input_size(),
			..CompactionStats::default()
		};

		let mut outputs = Vec::new();
		if let Err(e) = self.execute(&mut compaction, &mut stats, &mut outputs) {
			log::error!("Compaction #{} failed: {}", compaction.id(), e);
			Self::remove_outputs(&outputs);
			if let Err(release_err) = self.versions.release_compaction(compaction, Err(e.clone())) {
				log::error!("Release after failed compaction also failed: {}", release_err);
			}
			return Err(e);
		}

		let id = compaction.id();
		match self.versions.log_and_apply(compaction) {
			Ok(version) => {
				log::info!(
					"Compaction #{} done: {} files ({} bytes) in, {} files ({} bytes) out, version {}",
					id,
					stats.input_files,
					stats.input_bytes,
					stats.output_files,
					stats.output_bytes,
					version.number()
				);
				Ok(stats)
			}
			Err(e) => {
				Self::remove_outputs(&outputs);
				Err(e)
			}
		}
	}

	fn execute(
		&self,
		c: &mut Compaction,
		stats: &mut CompactionStats,
		outputs: &mut Vec<PathBuf>,
	) -> Result<()> {
		if c.is_deletion_compaction() {
			log::info!("Compaction #{}: dropping {} files", c.id(), stats.input_files);
			return c.add_input_deletions();
		}

		if c.is_trivial_move() {
			let (level, output_level) = (c.level(), c.output_level());
			let moved: Vec<FileMetaData> = c.inputs(0).iter().map(|f| f.moved()).collect();
			let edit = c.edit_mut()?;
			for f in moved {
				log::info!(
					"Moving file #{} from level {} to level {}",
					f.number,
					level,
					output_level
				);
				edit.delete_file(level, f.number);
				edit.add_file(output_level, f);
			}
			stats.trivial_move = true;
			return Ok(());
		}

		let written = self.merge(c, stats, outputs)?;
		let output_level = c.output_level();
		let edit = c.edit_mut()?;
		for meta in written {
			stats.output_bytes += meta.file_size;
			edit.add_file(output_level, meta);
		}
		stats.output_files = outputs.len();
		c.add_input_deletions()
	}

	/// Merges every input into new tables at the output level. Paths of the
	/// files created are pushed to `outputs` as soon as they exist, so the
	/// caller can remove them if anything fails.
	fn merge(
		&self,
		c: &Compaction,
		stats: &mut CompactionStats,
		outputs: &mut Vec<PathBuf>,
	) -> Result<Vec<FileMetaData>> {
		let version = Arc::clone(c.input_version()?);
		let opts = Arc::clone(self.versions.options());
		let icmp = version.icmp().clone();
		let factory = opts.table_factory();

		let mut readers: Vec<Box<dyn TableReader>> = Vec::with_capacity(stats.input_files);
		for (_, f) in c.all_inputs() {
			let path = opts.table_file_path(f.path_id, f.number);
			let file: Arc<dyn File> = Arc::new(SysFile::open(&path)?);
			readers.push(factory.new_reader(&icmp, file, f.file_size)?);
		}
		let sources = readers.iter().map(|r| r.iter()).collect();
		let mut merged = MergingIterator::new(icmp.clone(), sources)?;

		let mut exec = c.begin_execution()?;
		let mut writer = OutputWriter {
			compactor: self,
			icmp: icmp.clone(),
			path_id: c.output_path_id(),
			compression: c.output_compression(),
			buffer_size: c.output_file_preallocation_size().clamp(4096, MAX_WRITE_BUFFER) as usize,
			current: None,
			finished: Vec::new(),
		};
		if let Some(dir) = opts.table_file_path(c.output_path_id(), 0).parent() {
			fs::create_dir_all(dir)?;
		}

		let result = self.merge_entries(c, &mut exec, &mut merged, &mut writer, stats, outputs);
		match result {
			Ok(()) => {
				writer.finish_current(outputs)?;
				Ok(writer.finished)
			}
			Err(e) => {
				writer.abandon_current();
				Err(e)
			}
		}
	}

	fn merge_entries(
		&self,
		c: &Compaction,
		exec: &mut ExecutionState<'_>,
		merged: &mut MergingIterator<'_>,
		writer: &mut OutputWriter<'_>,
		stats: &mut CompactionStats,
		outputs: &mut Vec<PathBuf>,
	) -> Result<()> {
		let icmp = writer.icmp.clone();
		let mut last_user_key: Option<Vec<u8>> = None;

		while let Some((key, value)) = merged.next_entry()? {
			stats.entries_read += 1;
			if self.shutdown.load(AtomicOrdering::Acquire) {
				return Err(Error::Abort);
			}

			// Only the newest version of each user key survives
			let shadowed = last_user_key.as_deref().is_some_and(|prev| {
				icmp.compare_user_keys(prev, key.user_key()) == Ordering::Equal
			});
			if shadowed {
				stats.shadowed_dropped += 1;
				continue;
			}
			last_user_key = Some(key.user_key().to_vec());

			if key.is_tombstone() && exec.key_not_exists_beyond_output_level(key.user_key()) {
				stats.tombstones_dropped += 1;
				continue;
			}

			if exec.should_stop_before(&key) && writer.current.is_some() {
				writer.finish_current(outputs)?;
			}
			if writer.current.is_none() {
				writer.open(outputs)?;
			}
			let Some(out) = writer.current.as_mut() else {
				continue;
			};
			out.builder.add(&key, &value)?;
			stats.entries_written += 1;

			if out.builder.file_size() >= c.max_output_file_size() {
				writer.finish_current(outputs)?;
				exec.output_file_finished();
			}
		}
		Ok(())
	}

	fn remove_outputs(outputs: &[PathBuf]) {
		for path in outputs {
			if let Err(e) = fs::remove_file(path) {
				log::warn!("Failed to remove partial compaction output {}: {}", path.display(), e);
			}
		}
	}
}

struct OutputFile {
	number: u64,
	path: PathBuf,
	builder: Box<dyn TableBuilder>,
}

/// The table currently being written plus the ones already closed.
struct OutputWriter<'a> {
	compactor: &'a Compactor,
	icmp: InternalKeyComparator,
	path_id: u32,
	compression: CompressionType,
	buffer_size: usize,
	current: Option<OutputFile>,
	finished: Vec<FileMetaData>,
}

impl OutputWriter<'_> {
	fn open(&mut self, outputs: &mut Vec<PathBuf>) -> Result<()> {
		let versions = &self.compactor.versions;
		let opts = versions.options();
		let number = versions.new_file_number();
		let path = opts.table_file_path(self.path_id, number);

		let file = SysFile::create(&path)?;
		outputs.push(path.clone());
		let builder = opts.table_factory().new_builder(
			TableBuilderOptions {
				compression: self.compression,
				block_size: opts.block_size,
				comparator: self.icmp.clone(),
			},
			Box::new(BufWriter::with_capacity(self.buffer_size, file)),
		);
		log::debug!("Opened compaction output #{} under db path {}", number, self.path_id);
		self.current = Some(OutputFile {
			number,
			path,
			builder,
		});
		Ok(())
	}

	fn finish_current(&mut self, outputs: &mut Vec<PathBuf>) -> Result<()> {
		let Some(out) = self.current.take() else {
			return Ok(());
		};
		if out.builder.num_entries() == 0 {
			out.builder.abandon();
			fs::remove_file(&out.path)?;
			outputs.retain(|p| p != &out.path);
			return Ok(());
		}
		let props = out.builder.finish()?;
		SysFile::open(&out.path)?.sync_all()?;
		let meta = FileMetaData::from_properties(out.number, self.path_id, &props)?;
		log::debug!(
			"Finished compaction output #{}: {} entries, {} bytes",
			meta.number,
			meta.num_entries,
			meta.file_size
		);
		self.finished.push(meta);
		Ok(())
	}

	fn abandon_current(&mut self) {
		if let Some(out) = self.current.take() {
			out.builder.abandon();
		}
	}
}

/// Merges sorted table iterators into one stream in internal-key order.
struct MergingIterator<'a> {
	icmp: InternalKeyComparator,
	sources: Vec<TableIter<'a>>,
	heads: Vec<Option<(InternalKey, Vec<u8>)>>,
}

impl<'a> MergingIterator<'a> {
	fn new(icmp: InternalKeyComparator, mut sources: Vec<TableIter<'a>>) -> Result<Self> {
		let mut heads = Vec::with_capacity(sources.len());
		for source in sources.iter_mut() {
			heads.push(source.next().transpose()?);
		}
		Ok(Self {
			icmp,
			sources,
			heads,
		})
	}

	fn next_entry(&mut self) -> Result<Option<(InternalKey, Vec<u8>)>> {
		let mut smallest: Option<usize> = None;
		for (i, head) in self.heads.iter().enumerate() {
			let Some((key, _)) = head else {
				continue;
			};
			let smaller = match smallest.and_then(|s| self.heads[s].as_ref()) {
				Some((best, _)) => self.icmp.compare_keys(key, best) == Ordering::Less,
				None => true,
			};
			if smaller {
				smallest = Some(i);
			}
		}
		let Some(i) = smallest else {
			return Ok(None);
		};
		let next = self.sources[i].next().transpose()?;
		Ok(std::mem::replace(&mut self.heads[i], next))
	}
}
