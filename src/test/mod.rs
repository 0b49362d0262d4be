//! Scenario tests for compaction planning and execution.
//!
//! Unit tests live next to the code; the tests here drive the version set,
//! the pickers and the compactor together, on real tables where it matters.

#[cfg(test)]
pub mod concurrency_tests;
#[cfg(test)]
pub mod table_tests;

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tempdir::TempDir;

use crate::error::Result;
use crate::levels::{VersionEdit, VersionSet};
use crate::options::Options;
use crate::sstable::meta::FileMetaData;
use crate::sstable::table::TableBuilderOptions;
use crate::sstable::{InternalKey, InternalKeyKind};
use crate::vfs::File;

pub(crate) const MB: u64 = 1024 * 1024;

/// An in-memory sink that stays readable after a builder consumes a clone.
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
	pub(crate) fn contents(&self) -> Vec<u8> {
		self.0.lock().clone()
	}
}

impl Write for SharedBuffer {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.0.lock().extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

pub(crate) fn ikey(user_key: &str, seq: u64) -> InternalKey {
	InternalKey::new(user_key.as_bytes().to_vec(), seq, InternalKeyKind::Set)
}

pub(crate) fn tombstone(user_key: &str, seq: u64) -> InternalKey {
	InternalKey::new(user_key.as_bytes().to_vec(), seq, InternalKeyKind::Delete)
}

/// Metadata for a table that exists only in the version, never on disk.
pub(crate) fn file_meta(number: u64, size: u64, lo: &str, hi: &str) -> FileMetaData {
	FileMetaData::new(number, 0, size, ikey(lo, number), ikey(hi, number))
}

/// Builds a version set and installs `files` as its first version.
pub(crate) fn version_set(opts: Options, files: Vec<(usize, FileMetaData)>) -> Arc<VersionSet> {
	let vs = Arc::new(VersionSet::new(Arc::new(opts)).unwrap());
	let mut edit = VersionEdit::new();
	for (level, f) in files {
		edit.add_file(level, f);
	}
	vs.apply(edit).unwrap();
	vs
}

/// A version set whose tables live in a temporary directory.
pub(crate) struct TestEnv {
	#[allow(unused)]
	dir: TempDir,
	pub(crate) vs: Arc<VersionSet>,
}

impl TestEnv {
	pub(crate) fn new(opts: Options) -> Self {
		let dir = TempDir::new("compaction").unwrap();
		let opts = opts.with_path(dir.path());
		let vs = Arc::new(VersionSet::new(Arc::new(opts)).unwrap());
		Self {
			dir,
			vs,
		}
	}

	/// Writes `entries` (already in internal-key order) as a table and returns
	/// its metadata.
	pub(crate) fn write_table(&self, entries: &[(InternalKey, Vec<u8>)]) -> Result<FileMetaData> {
		let opts = self.vs.options();
		let number = self.vs.new_file_number();
		let path = opts.table_file_path(0, number);
		let file = std::fs::File::create(&path)?;

		let mut builder = opts.table_factory().new_builder(
			TableBuilderOptions {
				compression: opts.compression_for_level(0),
				block_size: opts.block_size,
				comparator: opts.internal_comparator(),
			},
			Box::new(io::BufWriter::new(file)),
		);
		for (key, value) in entries {
			builder.add(key, value)?;
		}
		let props = builder.finish()?;
		FileMetaData::from_properties(number, 0, &props)
	}

	/// Writes one table per `(level, entries)` and installs them all.
	pub(crate) fn install(&self, tables: Vec<(usize, Vec<(InternalKey, Vec<u8>)>)>) -> Result<()> {
		let mut edit = VersionEdit::new();
		for (level, entries) in tables {
			edit.add_file(level, self.write_table(&entries)?);
		}
		self.vs.apply(edit)?;
		Ok(())
	}

	/// Every entry of the table behind `meta`, in order.
	pub(crate) fn read_table(&self, meta: &FileMetaData) -> Result<Vec<(InternalKey, Vec<u8>)>> {
		let opts = self.vs.options();
		let path = opts.table_file_path(meta.path_id, meta.number);
		let file: Arc<dyn File> = Arc::new(std::fs::File::open(path)?);
		let reader = opts.table_factory().new_reader(self.vs.icmp(), file, meta.file_size)?;
		let entries: Result<Vec<_>> = reader.iter().collect();
		entries
	}

	/// Every entry in `level` of the current version, in key order.
	pub(crate) fn read_level(&self, level: usize) -> Result<Vec<(InternalKey, Vec<u8>)>> {
		let current = self.vs.current();
		let mut entries = Vec::new();
		for f in current.files(level) {
			entries.extend(self.read_table(f)?);
		}
		Ok(entries)
	}
}
