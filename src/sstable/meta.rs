use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering as AtomicOrdering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::comparator::InternalKeyComparator;
use crate::compression::CompressionType;
use crate::error::{Error, Result};
use crate::sstable::table::TableFormat;
use crate::sstable::InternalKey;

/// Reads a file may waste on a miss before it is worth compacting: one seek
/// costs about as much as compacting this many bytes.
const BYTES_PER_SEEK: u64 = 16 * 1024;

/// Seek budget floor, so small files are not compacted for a few misses.
const MIN_ALLOWED_SEEKS: u64 = 100;

fn initial_allowed_seeks(file_size: u64) -> AtomicI64 {
	AtomicI64::new((file_size / BYTES_PER_SEEK).max(MIN_ALLOWED_SEEKS) as i64)
}

/// One on-disk sorted table as the level structure sees it.
///
/// Everything except `being_compacted` and the seek budget is fixed once the
/// file is written. The flag is only flipped while the version set's level
/// lock is held, which is what keeps two compactions from selecting the same
/// file.
#[derive(Debug)]
pub struct FileMetaData {
	pub number: u64,
	pub path_id: u32,
	pub file_size: u64,
	pub smallest: InternalKey,
	pub largest: InternalKey,
	pub smallest_seqno: u64,
	pub largest_seqno: u64,
	pub num_entries: u64,
	pub num_deletions: u64,
	being_compacted: AtomicBool,
	allowed_seeks: AtomicI64,
}

impl FileMetaData {
	pub fn new(
		number: u64,
		path_id: u32,
		file_size: u64,
		smallest: InternalKey,
		largest: InternalKey,
	) -> Self {
		let smallest_seqno = smallest.seq_num().min(largest.seq_num());
		let largest_seqno = smallest.seq_num().max(largest.seq_num());
		Self {
			number,
			path_id,
			file_size,
			smallest,
			largest,
			smallest_seqno,
			largest_seqno,
			num_entries: 0,
			num_deletions: 0,
			being_compacted: AtomicBool::new(false),
			allowed_seeks: initial_allowed_seeks(file_size),
		}
	}

	/// Builds the descriptor of a freshly written table from its properties.
	pub fn from_properties(number: u64, path_id: u32, props: &TableProperties) -> Result<Self> {
		let (Some(smallest), Some(largest)) = (&props.smallest, &props.largest) else {
			return Err(Error::InvalidArgument(format!("table #{number} has no entries")));
		};
		Ok(Self {
			number,
			path_id,
			file_size: props.file_size,
			smallest: smallest.clone(),
			largest: largest.clone(),
			smallest_seqno: props.smallest_seqno,
			largest_seqno: props.largest_seqno,
			num_entries: props.num_entries,
			num_deletions: props.num_deletions,
			being_compacted: AtomicBool::new(false),
			allowed_seeks: initial_allowed_seeks(props.file_size),
		})
	}

	pub fn with_seqno_range(mut self, smallest_seqno: u64, largest_seqno: u64) -> Self {
		self.smallest_seqno = smallest_seqno;
		self.largest_seqno = largest_seqno;
		self
	}

	pub fn with_entries(mut self, num_entries: u64, num_deletions: u64) -> Self {
		self.num_entries = num_entries;
		self.num_deletions = num_deletions;
		self
	}

	/// A copy of this descriptor for the same physical file with a clear
	/// exclusion flag, used when a file is moved to another level.
	pub(crate) fn moved(&self) -> Self {
		Self {
			number: self.number,
			path_id: self.path_id,
			file_size: self.file_size,
			smallest: self.smallest.clone(),
			largest: self.largest.clone(),
			smallest_seqno: self.smallest_seqno,
			largest_seqno: self.largest_seqno,
			num_entries: self.num_entries,
			num_deletions: self.num_deletions,
			being_compacted: AtomicBool::new(false),
			allowed_seeks: initial_allowed_seeks(self.file_size),
		}
	}

	pub fn is_being_compacted(&self) -> bool {
		self.being_compacted.load(AtomicOrdering::Acquire)
	}

	/// Sets the exclusion flag and returns its previous value. Callers hold the
	/// level lock.
	pub(crate) fn set_being_compacted(&self, mark: bool) -> bool {
		self.being_compacted.swap(mark, AtomicOrdering::AcqRel)
	}

	/// Misses this file may still absorb before a seek compaction is due.
	pub fn allowed_seeks(&self) -> i64 {
		self.allowed_seeks.load(AtomicOrdering::Acquire)
	}

	/// Charges one wasted read. True exactly once: for the read that spends
	/// the last of the budget.
	pub(crate) fn charge_seek(&self) -> bool {
		self.allowed_seeks.fetch_sub(1, AtomicOrdering::AcqRel) == 1
	}

	/// File size inflated by its share of tombstones, so delete-heavy files
	/// are picked sooner.
	pub fn compensated_file_size(&self) -> u64 {
		if self.num_entries == 0 || self.num_deletions == 0 {
			return self.file_size;
		}
		let delete_ratio = self.num_deletions as f64 / self.num_entries as f64;
		(self.file_size as f64 * (1.0 + delete_ratio * 0.5)) as u64
	}

	/// Whether this file's user-key range intersects `[begin, end]`. A
	/// missing bound is unbounded on that side.
	pub fn overlaps_user_range(
		&self,
		icmp: &InternalKeyComparator,
		begin: Option<&[u8]>,
		end: Option<&[u8]>,
	) -> bool {
		if let Some(begin) = begin {
			if icmp.compare_user_keys(self.largest.user_key(), begin) == Ordering::Less {
				return false;
			}
		}
		if let Some(end) = end {
			if icmp.compare_user_keys(self.smallest.user_key(), end) == Ordering::Greater {
				return false;
			}
		}
		true
	}
}

/// Statistics a table builder records and a reader reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableProperties {
	pub format: TableFormat,
	pub compression: CompressionType,
	pub num_entries: u64,
	pub num_deletions: u64,
	pub data_size: u64,
	pub num_data_blocks: u64,
	pub smallest_seqno: u64,
	pub largest_seqno: u64,
	pub smallest: Option<InternalKey>,
	pub largest: Option<InternalKey>,
	/// Size of the whole table on disk. Not part of the encoded block; the
	/// builder sets it on finish and the reader from the file length.
	pub file_size: u64,
}

impl TableProperties {
	pub fn new(format: TableFormat, compression: CompressionType) -> Self {
		Self {
			format,
			compression,
			num_entries: 0,
			num_deletions: 0,
			data_size: 0,
			num_data_blocks: 0,
			smallest_seqno: 0,
			largest_seqno: 0,
			smallest: None,
			largest: None,
			file_size: 0,
		}
	}

	/// Accounts for one entry appended in key order.
	pub(crate) fn record(&mut self, key: &InternalKey, value: &[u8]) {
		let seq_num = key.seq_num();
		if self.num_entries == 0 {
			self.smallest_seqno = seq_num;
			self.largest_seqno = seq_num;
			self.smallest = Some(key.clone());
		} else {
			self.smallest_seqno = self.smallest_seqno.min(seq_num);
			self.largest_seqno = self.largest_seqno.max(seq_num);
		}
		self.largest = Some(key.clone());
		self.num_entries += 1;
		if key.is_tombstone() {
			self.num_deletions += 1;
		}
		self.data_size += (key.user_key().len() + value.len()) as u64;
	}

	pub fn encode(&self) -> Bytes {
		let mut buf = BytesMut::with_capacity(128);
		buf.put_u8(self.format as u8);
		buf.put_u8(self.compression as u8);
		buf.put_u64(self.num_entries);
		buf.put_u64(self.num_deletions);
		buf.put_u64(self.data_size);
		buf.put_u64(self.num_data_blocks);
		buf.put_u64(self.smallest_seqno);
		buf.put_u64(self.largest_seqno);
		for key in [&self.smallest, &self.largest] {
			match key {
				None => buf.put_u8(0),
				Some(key) => {
					buf.put_u8(1);
					let encoded = key.encode();
					buf.put_u32(encoded.len() as u32);
					buf.extend_from_slice(&encoded);
				}
			}
		}
		buf.freeze()
	}

	pub fn decode(mut buf: Bytes) -> Result<Self> {
		const FIXED_LEN: usize = 2 + 6 * 8;
		if buf.remaining() < FIXED_LEN {
			return Err(Error::Corruption("table properties block too short".into()));
		}
		let format = TableFormat::from_u8(buf.get_u8())?;
		let compression = CompressionType::from_u8(buf.get_u8())?;
		let num_entries = buf.get_u64();
		let num_deletions = buf.get_u64();
		let data_size = buf.get_u64();
		let num_data_blocks = buf.get_u64();
		let smallest_seqno = buf.get_u64();
		let largest_seqno = buf.get_u64();
		let smallest = decode_optional_key(&mut buf)?;
		let largest = decode_optional_key(&mut buf)?;

		Ok(Self {
			format,
			compression,
			num_entries,
			num_deletions,
			data_size,
			num_data_blocks,
			smallest_seqno,
			largest_seqno,
			smallest,
			largest,
			file_size: 0,
		})
	}
}

fn decode_optional_key(buf: &mut Bytes) -> Result<Option<InternalKey>> {
	if !buf.has_remaining() {
		return Err(Error::Corruption("table properties truncated".into()));
	}
	if buf.get_u8() == 0 {
		return Ok(None);
	}
	if buf.remaining() < 4 {
		return Err(Error::Corruption("table properties truncated".into()));
	}
	let len = buf.get_u32() as usize;
	if buf.remaining() < len {
		return Err(Error::Corruption("table properties key truncated".into()));
	}
	let key = buf.copy_to_bytes(len);
	InternalKey::decode(&key).map(Some)
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::comparator::BytewiseComparator;
	use crate::sstable::InternalKeyKind;

	fn key(user_key: &str, seq: u64) -> InternalKey {
		InternalKey::new(user_key.as_bytes().to_vec(), seq, InternalKeyKind::Set)
	}

	#[test]
	fn test_compensated_size_weights_deletions() {
		let meta = FileMetaData::new(1, 0, 1000, key("a", 1), key("z", 2));
		assert_eq!(meta.compensated_file_size(), 1000);

		let meta = meta.with_entries(100, 50);
		assert_eq!(meta.compensated_file_size(), 1250);
	}

	#[test]
	fn test_exclusion_flag_swap() {
		let meta = FileMetaData::new(7, 0, 10, key("a", 1), key("b", 1));
		assert!(!meta.set_being_compacted(true));
		assert!(meta.is_being_compacted());
		assert!(meta.set_being_compacted(false));

		meta.set_being_compacted(true);
		let moved = meta.moved();
		assert_eq!(moved.number, 7);
		assert!(!moved.is_being_compacted());
	}

	#[test]
	fn test_seek_budget_runs_out_once() {
		let small = FileMetaData::new(1, 0, 10, key("a", 1), key("b", 1));
		assert_eq!(small.allowed_seeks(), 100);
		let large = FileMetaData::new(2, 0, 64 * 1024 * 1024, key("a", 1), key("b", 1));
		assert_eq!(large.allowed_seeks(), 4096);

		let exhausted: Vec<bool> = (0..101).map(|_| small.charge_seek()).collect();
		assert_eq!(exhausted.iter().filter(|&&e| e).count(), 1);
		assert!(exhausted[99]);
		assert_eq!(small.moved().allowed_seeks(), 100);
	}

	#[test]
	fn test_overlaps_user_range() {
		let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator::default()));
		let meta = FileMetaData::new(1, 0, 10, key("c", 1), key("f", 1));

		assert!(meta.overlaps_user_range(&icmp, None, None));
		assert!(meta.overlaps_user_range(&icmp, Some(b"f"), Some(b"z")));
		assert!(meta.overlaps_user_range(&icmp, Some(b"a"), Some(b"c")));
		assert!(!meta.overlaps_user_range(&icmp, Some(b"g"), None));
		assert!(!meta.overlaps_user_range(&icmp, None, Some(b"b")));
	}

	#[test]
	fn test_properties_encode_decode() {
		let mut props = TableProperties::new(TableFormat::BlockBased, CompressionType::Lz4);
		props.record(&key("a", 9), b"v1");
		props.record(&InternalKey::new(b"b".to_vec(), 3, InternalKeyKind::Delete), b"");
		props.num_data_blocks = 1;

		let decoded = TableProperties::decode(props.encode()).unwrap();
		assert_eq!(decoded, props);
		assert_eq!(decoded.num_deletions, 1);
		assert_eq!((decoded.smallest_seqno, decoded.largest_seqno), (3, 9));

		let truncated = props.encode().slice(..20);
		assert!(matches!(TableProperties::decode(truncated), Err(Error::Corruption(_))));
	}
}
