use std::collections::BTreeSet;
use std::sync::Arc;

use crate::sstable::meta::FileMetaData;

/// Changes to apply atomically to a version: tables to drop and tables to add,
/// per level. A compaction fills one in; the version set applies it.
#[derive(Default)]
pub struct VersionEdit {
	/// (level, file number)
	pub(crate) deleted_files: BTreeSet<(usize, u64)>,
	/// (level, file)
	pub(crate) new_files: Vec<(usize, Arc<FileMetaData>)>,
}

impl VersionEdit {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_file(&mut self, level: usize, file: FileMetaData) {
		self.new_files.push((level, Arc::new(file)));
	}

	pub fn delete_file(&mut self, level: usize, number: u64) {
		self.deleted_files.insert((level, number));
	}

	pub fn deleted_files(&self) -> &BTreeSet<(usize, u64)> {
		&self.deleted_files
	}

	pub fn new_files(&self) -> &[(usize, Arc<FileMetaData>)] {
		&self.new_files
	}

	pub fn is_empty(&self) -> bool {
		self.deleted_files.is_empty() && self.new_files.is_empty()
	}
}

impl std::fmt::Debug for VersionEdit {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let added: Vec<(usize, u64)> =
			self.new_files.iter().map(|(level, file)| (*level, file.number)).collect();
		f.debug_struct("VersionEdit")
			.field("deleted_files", &self.deleted_files)
			.field("new_files", &added)
			.finish()
	}
}
