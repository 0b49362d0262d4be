use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::InternalKeyComparator;
use crate::sstable::meta::FileMetaData;

/// Represents a single level in the LSM tree.
///
/// L0 files may overlap and are kept newest first (by largest sequence
/// number). Files in deeper levels are disjoint and sorted by smallest key.
#[derive(Clone, Default)]
pub struct Level {
	pub(crate) files: Vec<Arc<FileMetaData>>,
}

impl std::ops::Deref for Level {
	type Target = Vec<Arc<FileMetaData>>;

	fn deref(&self) -> &Self::Target {
		&self.files
	}
}

impl Level {
	pub(crate) fn new(files: Vec<Arc<FileMetaData>>) -> Self {
		Self {
			files,
		}
	}

	/// Restores the level's ordering after files were added.
	pub(crate) fn sort(&mut self, level: usize, icmp: &InternalKeyComparator) {
		if level == 0 {
			self.files.sort_by(|a, b| {
				b.largest_seqno.cmp(&a.largest_seqno).then_with(|| b.number.cmp(&a.number))
			});
		} else {
			self.files.sort_by(|a, b| icmp.compare_keys(&a.smallest, &b.smallest));
		}
	}

	/// Returns the number of the first file that overlaps the one after it.
	pub(crate) fn first_overlap(&self, icmp: &InternalKeyComparator) -> Option<u64> {
		self.files
			.windows(2)
			.find(|pair| icmp.compare_keys(&pair[0].largest, &pair[1].smallest) != Ordering::Less)
			.map(|pair| pair[0].number)
	}

	/// Returns an iterator over files whose user-key range touches `[begin, end]`.
	pub(crate) fn overlapping_files<'a>(
		&'a self,
		icmp: &'a InternalKeyComparator,
		begin: Option<&'a [u8]>,
		end: Option<&'a [u8]>,
	) -> impl Iterator<Item = &'a Arc<FileMetaData>> + 'a {
		self.files.iter().filter(move |f| f.overlaps_user_range(icmp, begin, end))
	}

	pub fn total_size(&self) -> u64 {
		self.files.iter().map(|f| f.file_size).sum()
	}

	pub fn find(&self, number: u64) -> Option<&Arc<FileMetaData>> {
		self.files.iter().find(|f| f.number == number)
	}
}
