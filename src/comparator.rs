//! Comparator implementations for key ordering.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::sstable::{InternalKey, InternalKeyKind, INTERNAL_KEY_SEQ_NUM_MAX};

/// A trait for comparing keys in a key-value store.
///
/// This trait defines methods for comparing keys, generating separator keys,
/// generating successor keys, and retrieving the name of the comparator.
pub trait Comparator: Send + Sync {
	/// Compares two keys `a` and `b`.
	fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

	/// Generates a separator key between two keys `from` and `to`.
	///
	/// This method should return a key that is greater than or equal to `from`
	/// and less than `to`. Table builders use it to shorten index entries.
	fn separator(&self, from: &[u8], to: &[u8]) -> Vec<u8>;

	/// Generates a short key that is greater than or equal to `key`.
	fn successor(&self, key: &[u8]) -> Vec<u8>;

	/// Retrieves the name of the comparator.
	fn name(&self) -> &str;
}

/// A bytewise comparator that compares keys lexicographically.
#[derive(Default, Clone, Copy)]
pub struct BytewiseComparator {}

impl Comparator for BytewiseComparator {
	#[inline]
	fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
		a.cmp(b)
	}

	#[inline]
	fn name(&self) -> &'static str {
		"leveldb.BytewiseComparator"
	}

	/// 1. Find the common prefix
	/// 2. If one string is a prefix of the other, return unchanged
	/// 3. At first differing byte, try to increment and truncate
	fn separator(&self, a: &[u8], b: &[u8]) -> Vec<u8> {
		let min_length = std::cmp::min(a.len(), b.len());
		let mut diff_index = 0;

		while diff_index < min_length && a[diff_index] == b[diff_index] {
			diff_index += 1;
		}

		if diff_index >= min_length {
			return a.to_vec();
		}

		let start_byte = a[diff_index];
		if start_byte < 0xff && start_byte + 1 < b[diff_index] {
			let mut result = Vec::from(&a[..=diff_index]);
			result[diff_index] += 1;
			debug_assert!(self.compare(&result, b) == Ordering::Less);
			return result;
		}

		a.to_vec()
	}

	/// Find the first non-0xFF byte, increment it, and truncate.
	/// If all bytes are 0xFF, leave it unchanged.
	fn successor(&self, key: &[u8]) -> Vec<u8> {
		let mut result = key.to_vec();
		for i in 0..key.len() {
			if key[i] != 0xff {
				result[i] += 1;
				result.truncate(i + 1);
				return result;
			}
		}
		result
	}
}

/// Orders internal keys: user key ascending (through the user comparator),
/// then sequence number descending, then kind descending.
#[derive(Clone)]
pub struct InternalKeyComparator {
	user_comparator: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
	pub fn new(user_comparator: Arc<dyn Comparator>) -> Self {
		Self {
			user_comparator,
		}
	}

	pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
		&self.user_comparator
	}

	#[inline]
	pub fn compare_user_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
		self.user_comparator.compare(a, b)
	}

	/// Compares decoded internal keys without re-encoding them.
	pub fn compare_keys(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
		match self.user_comparator.compare(a.user_key(), b.user_key()) {
			// Higher trailer (newer sequence, larger kind) sorts first
			Ordering::Equal => b.trailer.cmp(&a.trailer),
			ord => ord,
		}
	}

	fn shortened(&self, original: &[u8], candidate: Vec<u8>) -> Vec<u8> {
		let user_key = InternalKey::user_key_from_encoded(original);
		// Only use the shortened form when it is no longer and logically larger
		if candidate.len() <= user_key.len()
			&& self.user_comparator.compare(user_key, &candidate) == Ordering::Less
		{
			return InternalKey::new(candidate, INTERNAL_KEY_SEQ_NUM_MAX, InternalKeyKind::Separator)
				.encode();
		}
		original.to_vec()
	}
}

impl Comparator for InternalKeyComparator {
	fn name(&self) -> &'static str {
		"lsm.InternalKeyComparator"
	}

	fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
		let user_key_a = InternalKey::user_key_from_encoded(a);
		let user_key_b = InternalKey::user_key_from_encoded(b);

		match self.user_comparator.compare(user_key_a, user_key_b) {
			Ordering::Equal => {
				let trailer_a = InternalKey::trailer_from_encoded(a);
				let trailer_b = InternalKey::trailer_from_encoded(b);
				trailer_b.cmp(&trailer_a)
			}
			ord => ord,
		}
	}

	fn separator(&self, a: &[u8], b: &[u8]) -> Vec<u8> {
		let user_a = InternalKey::user_key_from_encoded(a);
		let user_b = InternalKey::user_key_from_encoded(b);
		if self.user_comparator.compare(user_a, user_b) == Ordering::Equal {
			return a.to_vec();
		}
		let sep = self.user_comparator.separator(user_a, user_b);
		self.shortened(a, sep)
	}

	fn successor(&self, key: &[u8]) -> Vec<u8> {
		let succ = self.user_comparator.successor(InternalKey::user_key_from_encoded(key));
		self.shortened(key, succ)
	}
}
