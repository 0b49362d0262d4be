use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::comparator::InternalKeyComparator;
use crate::error::{Error, Result};
use crate::levels::{Level, VersionEdit};
use crate::sstable::meta::FileMetaData;
use crate::sstable::InternalKey;

/// An immutable snapshot of the files in every level.
///
/// Compactions hold an `Arc<Version>` for as long as they run, which keeps the
/// files they read alive even after newer versions replace this one.
pub struct Version {
	number: u64,
	icmp: InternalKeyComparator,
	levels: Vec<Level>,
	/// Per level, file indices ordered by compensated size, largest first.
	files_by_size: Vec<Vec<usize>>,
	/// Per level, where the next size-based pick starts scanning
	/// `files_by_size`. Only moved while the level lock is held.
	next_compaction_index: Vec<AtomicUsize>,
}

impl Version {
	pub(crate) fn new(number: u64, icmp: InternalKeyComparator, mut levels: Vec<Level>) -> Self {
		for (idx, level) in levels.iter_mut().enumerate() {
			level.sort(idx, &icmp);
		}
		let files_by_size = levels.iter().map(Self::order_by_size).collect();
		let next_compaction_index = levels.iter().map(|_| AtomicUsize::new(0)).collect();
		Self {
			number,
			icmp,
			levels,
			files_by_size,
			next_compaction_index,
		}
	}

	pub(crate) fn empty(icmp: InternalKeyComparator, num_levels: usize) -> Self {
		Self::new(0, icmp, vec![Level::default(); num_levels])
	}

	fn order_by_size(level: &Level) -> Vec<usize> {
		let mut order: Vec<usize> = (0..level.len()).collect();
		order.sort_by(|&a, &b| {
			let (fa, fb) = (&level[a], &level[b]);
			fb.compensated_file_size()
				.cmp(&fa.compensated_file_size())
				.then_with(|| fa.number.cmp(&fb.number))
		});
		order
	}

	/// Builds the version that results from applying `edit` on top of this one.
	///
	/// Every deleted file must exist at the named level, and levels past L0
	/// must stay free of overlaps.
	pub(crate) fn apply(&self, number: u64, edit: &VersionEdit) -> Result<Version> {
		for (level, file_number) in edit.deleted_files() {
			let found = self.levels.get(*level).and_then(|l| l.find(*file_number));
			if found.is_none() {
				return Err(Error::FileNotFound(*file_number));
			}
		}
		if let Some((level, file)) = edit.new_files().iter().find(|(l, _)| *l >= self.levels.len())
		{
			return Err(Error::InvalidArgument(format!(
				"file #{} added to level {} of a {}-level tree",
				file.number,
				level,
				self.levels.len()
			)));
		}

		let mut levels: Vec<Level> = self
			.levels
			.iter()
			.enumerate()
			.map(|(idx, level)| {
				Level::new(
					level
						.iter()
						.filter(|f| !edit.deleted_files().contains(&(idx, f.number)))
						.cloned()
						.collect(),
				)
			})
			.collect();
		for (level, file) in edit.new_files() {
			levels[*level].files.push(Arc::clone(file));
		}

		let mut seen = BTreeSet::new();
		for level in &levels {
			for file in level.iter() {
				if !seen.insert(file.number) {
					return Err(Error::InvalidArgument(format!(
						"file #{} appears twice in the new version",
						file.number
					)));
				}
			}
		}

		let version = Version::new(number, self.icmp.clone(), levels);
		for (idx, level) in version.levels.iter().enumerate().skip(1) {
			if let Some(number) = level.first_overlap(&self.icmp) {
				return Err(Error::InvalidArgument(format!(
					"file #{number} overlaps its successor in level {idx}"
				)));
			}
		}
		Ok(version)
	}

	pub fn number(&self) -> u64 {
		self.number
	}

	pub fn icmp(&self) -> &InternalKeyComparator {
		&self.icmp
	}

	pub fn num_levels(&self) -> usize {
		self.levels.len()
	}

	pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
		self.levels.get(level).map_or(&[], |l| l.files.as_slice())
	}

	pub fn num_level_files(&self, level: usize) -> usize {
		self.files(level).len()
	}

	pub fn num_level_bytes(&self, level: usize) -> u64 {
		self.levels.get(level).map_or(0, Level::total_size)
	}

	pub fn find_file(&self, level: usize, number: u64) -> Option<&Arc<FileMetaData>> {
		self.levels.get(level).and_then(|l| l.find(number))
	}

	pub(crate) fn files_by_size(&self, level: usize) -> &[usize] {
		self.files_by_size.get(level).map_or(&[], Vec::as_slice)
	}

	pub fn next_compaction_index(&self, level: usize) -> usize {
		self.next_compaction_index.get(level).map_or(0, |c| c.load(AtomicOrdering::Acquire))
	}

	pub(crate) fn set_next_compaction_index(&self, level: usize, index: usize) {
		if let Some(cursor) = self.next_compaction_index.get(level) {
			cursor.store(index, AtomicOrdering::Release);
		}
	}

	pub(crate) fn reset_next_compaction_index(&self, level: usize) {
		self.set_next_compaction_index(level, 0);
	}

	/// Files at `level` whose user-key range touches `[begin, end]`. For L0
	/// the range grows to cover every file it picks up, so the result is
	/// closed under overlap.
	pub fn overlapping_inputs(
		&self,
		level: usize,
		begin: Option<&[u8]>,
		end: Option<&[u8]>,
	) -> Vec<Arc<FileMetaData>> {
		let Some(files) = self.levels.get(level) else {
			return Vec::new();
		};
		let mut begin = begin.map(<[u8]>::to_vec);
		let mut end = end.map(<[u8]>::to_vec);

		'restart: loop {
			let mut inputs = Vec::new();
			for f in files.iter() {
				if !f.overlaps_user_range(&self.icmp, begin.as_deref(), end.as_deref()) {
					continue;
				}
				if level == 0 {
					let (smallest, largest) = (f.smallest.user_key(), f.largest.user_key());
					if let Some(b) = begin.as_deref() {
						if self.icmp.compare_user_keys(smallest, b) == Ordering::Less {
							begin = Some(smallest.to_vec());
							continue 'restart;
						}
					}
					if let Some(e) = end.as_deref() {
						if self.icmp.compare_user_keys(largest, e) == Ordering::Greater {
							end = Some(largest.to_vec());
							continue 'restart;
						}
					}
				}
				inputs.push(Arc::clone(f));
			}
			return inputs;
		}
	}

	/// Whether any file at `level` touches the user-key range of
	/// `[smallest, largest]`.
	pub fn overlaps_level(
		&self,
		level: usize,
		smallest: &InternalKey,
		largest: &InternalKey,
	) -> bool {
		self.levels.get(level).is_some_and(|l| {
			l.overlapping_files(&self.icmp, Some(smallest.user_key()), Some(largest.user_key()))
				.next()
				.is_some()
		})
	}

	/// Smallest and largest key over `files`.
	pub fn key_range<'a>(
		&self,
		files: impl IntoIterator<Item = &'a Arc<FileMetaData>>,
	) -> Option<(InternalKey, InternalKey)> {
		let mut range: Option<(InternalKey, InternalKey)> = None;
		for f in files {
			range = Some(match range {
				None => (f.smallest.clone(), f.largest.clone()),
				Some((lo, hi)) => (
					if self.icmp.compare_keys(&f.smallest, &lo) == Ordering::Less {
						f.smallest.clone()
					} else {
						lo
					},
					if self.icmp.compare_keys(&f.largest, &hi) == Ordering::Greater {
						f.largest.clone()
					} else {
						hi
					},
				),
			});
		}
		range
	}

	/// Iterates every file in every level with its level index.
	pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<FileMetaData>)> + '_ {
		self.levels.iter().enumerate().flat_map(|(idx, level)| level.iter().map(move |f| (idx, f)))
	}
}

impl std::fmt::Debug for Version {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let levels: Vec<Vec<u64>> =
			self.levels.iter().map(|l| l.iter().map(|f| f.number).collect()).collect();
		f.debug_struct("Version").field("number", &self.number).field("levels", &levels).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::comparator::BytewiseComparator;
	use crate::sstable::InternalKeyKind;

	fn icmp() -> InternalKeyComparator {
		InternalKeyComparator::new(Arc::new(BytewiseComparator::default()))
	}

	fn file(number: u64, size: u64, lo: &str, hi: &str, seq: u64) -> FileMetaData {
		FileMetaData::new(
			number,
			0,
			size,
			InternalKey::new(lo.as_bytes().to_vec(), seq, InternalKeyKind::Set),
			InternalKey::new(hi.as_bytes().to_vec(), seq, InternalKeyKind::Set),
		)
	}

	fn version_with(files: Vec<(usize, FileMetaData)>) -> Version {
		let mut edit = VersionEdit::new();
		for (level, f) in files {
			edit.add_file(level, f);
		}
		Version::empty(icmp(), 4).apply(1, &edit).unwrap()
	}

	#[test]
	fn level_zero_overlap_expands_range() {
		let v = version_with(vec![
			(0, file(1, 10, "a", "c", 1)),
			(0, file(2, 10, "b", "f", 2)),
			(0, file(3, 10, "e", "h", 3)),
			(0, file(4, 10, "x", "z", 4)),
		]);

		let numbers: Vec<u64> =
			v.overlapping_inputs(0, Some(b"a"), Some(b"a")).iter().map(|f| f.number).collect();
		assert_eq!(numbers, vec![3, 2, 1]);
	}

	#[test]
	fn deeper_levels_sorted_and_disjoint() {
		let v = version_with(vec![(1, file(5, 10, "m", "p", 1)), (1, file(6, 10, "a", "c", 1))]);
		let numbers: Vec<u64> = v.files(1).iter().map(|f| f.number).collect();
		assert_eq!(numbers, vec![6, 5]);

		let mut edit = VersionEdit::new();
		edit.add_file(1, file(7, 10, "b", "d", 2));
		assert!(matches!(v.apply(2, &edit), Err(Error::InvalidArgument(_))));
	}

	#[test]
	fn apply_rejects_missing_delete() {
		let v = version_with(vec![(1, file(5, 10, "m", "p", 1))]);
		let mut edit = VersionEdit::new();
		edit.delete_file(2, 5);
		assert!(matches!(v.apply(2, &edit), Err(Error::FileNotFound(5))));
	}

	#[test]
	fn files_by_size_prefers_large_then_old() {
		let v = version_with(vec![
			(1, file(10, 100, "a", "b", 1)),
			(1, file(11, 300, "c", "d", 1)),
			(1, file(9, 100, "e", "f", 1)),
		]);
		let order: Vec<u64> = v.files_by_size(1).iter().map(|&i| v.files(1)[i].number).collect();
		assert_eq!(order, vec![11, 9, 10]);
	}
}
