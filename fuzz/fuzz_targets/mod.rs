// Shared helper module for fuzz targets

use lsm_compaction::{FileMetaData, InternalKey, InternalKeyKind};

/// Maps an arbitrary byte onto the kinds a table may hold.
pub fn to_internal_key_kind(kind: u8) -> InternalKeyKind {
	match kind % 3 {
		0 => InternalKeyKind::Delete,
		1 => InternalKeyKind::Merge,
		_ => InternalKeyKind::Set,
	}
}

/// Sorts entries into internal-key order and keeps one entry per user key
/// and sequence number.
pub fn sort_and_deduplicate(entries: &mut Vec<(InternalKey, Vec<u8>)>) {
	entries.sort_by(|a, b| a.0.cmp(&b.0));
	entries.dedup_by(|a, b| a.0.user_key() == b.0.user_key() && a.0.seq_num() == b.0.seq_num());
}

/// Sorted, distinct user keys.
pub fn distinct_keys(mut keys: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
	keys.sort();
	keys.dedup();
	keys
}

/// Pairs consecutive boundaries into disjoint `[lo, hi]` files of one level,
/// numbered from `first_number`.
pub fn disjoint_files(boundaries: Vec<Vec<u8>>, first_number: u64, size: u64) -> Vec<FileMetaData> {
	let boundaries = distinct_keys(boundaries);
	boundaries
		.chunks_exact(2)
		.enumerate()
		.map(|(i, pair)| {
			let number = first_number + i as u64;
			FileMetaData::new(
				number,
				0,
				size,
				InternalKey::new(pair[0].clone(), number, InternalKeyKind::Set),
				InternalKey::new(pair[1].clone(), number, InternalKeyKind::Set),
			)
		})
		.collect()
}
