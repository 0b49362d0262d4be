pub mod block_based;
pub mod meta;
pub mod plain;
pub mod table;

use std::cmp::{Ordering, Reverse};
use std::sync::Arc;

use crate::error::{Error, Result};

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InternalKeyKind {
	Delete = 0,
	SoftDelete = 1,
	Set = 2,
	Merge = 3,
	LogData = 4,
	RangeDelete = 5,
	Separator = 6,
	Max = 7,
	Invalid = 8,
}

impl From<u8> for InternalKeyKind {
	fn from(value: u8) -> Self {
		match value {
			0 => InternalKeyKind::Delete,
			1 => InternalKeyKind::SoftDelete,
			2 => InternalKeyKind::Set,
			3 => InternalKeyKind::Merge,
			4 => InternalKeyKind::LogData,
			5 => InternalKeyKind::RangeDelete,
			6 => InternalKeyKind::Separator,
			7 => InternalKeyKind::Max,
			_ => InternalKeyKind::Invalid,
		}
	}
}

// This is the maximum valid sequence number that can be stored in the upper 56 bits of a 64-bit integer.
pub const INTERNAL_KEY_SEQ_NUM_MAX: u64 = (1 << 56) - 1;

/// Size of the trailer appended to every encoded internal key.
pub(crate) const INTERNAL_KEY_TRAILER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
// InternalKey is a key used for on-disk representation of a key.
//
// <user-key>.<kind>.<seq-num>
//
// It consists of the user key followed by 8-bytes of metadata:
//   - 1 byte for the type of internal key: delete or set,
//   - 7 bytes for a uint56 sequence number, in big-endian format.
pub struct InternalKey {
	pub(crate) user_key: Arc<[u8]>,
	pub(crate) trailer: u64,
}

impl InternalKey {
	pub fn new(user_key: Vec<u8>, seq_num: u64, kind: InternalKeyKind) -> Self {
		Self {
			user_key: Arc::from(user_key.into_boxed_slice()),
			trailer: (seq_num.min(INTERNAL_KEY_SEQ_NUM_MAX) << 8) | kind as u64,
		}
	}

	/// Smallest internal key for `user_key`: sorts before every real entry of it.
	pub fn seek_key(user_key: &[u8]) -> Self {
		Self::new(user_key.to_vec(), INTERNAL_KEY_SEQ_NUM_MAX, InternalKeyKind::Max)
	}

	#[inline]
	pub fn decode(encoded_key: &[u8]) -> Result<Self> {
		if encoded_key.len() < INTERNAL_KEY_TRAILER_SIZE {
			return Err(Error::Corruption(format!(
				"internal key too short: {} bytes",
				encoded_key.len()
			)));
		}
		let n = encoded_key.len() - INTERNAL_KEY_TRAILER_SIZE;
		let mut trailer = [0u8; INTERNAL_KEY_TRAILER_SIZE];
		trailer.copy_from_slice(&encoded_key[n..]);
		Ok(Self {
			user_key: Arc::<[u8]>::from(&encoded_key[..n]),
			trailer: u64::from_be_bytes(trailer),
		})
	}

	#[inline]
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(self.user_key.len() + INTERNAL_KEY_TRAILER_SIZE);
		buf.extend_from_slice(&self.user_key);
		buf.extend_from_slice(&self.trailer.to_be_bytes());
		buf
	}

	#[inline]
	pub fn user_key(&self) -> &[u8] {
		&self.user_key
	}

	// Returns the sequence number component of the key.
	pub fn seq_num(&self) -> u64 {
		self.trailer >> 8
	}

	pub fn kind(&self) -> InternalKeyKind {
		InternalKeyKind::from(self.trailer as u8)
	}

	pub fn is_tombstone(&self) -> bool {
		matches!(
			self.kind(),
			InternalKeyKind::Delete | InternalKeyKind::SoftDelete | InternalKeyKind::RangeDelete
		)
	}

	/// Extracts the user key from an encoded internal key without allocating.
	pub(crate) fn user_key_from_encoded(encoded: &[u8]) -> &[u8] {
		&encoded[..encoded.len().saturating_sub(INTERNAL_KEY_TRAILER_SIZE)]
	}

	pub(crate) fn trailer_from_encoded(encoded: &[u8]) -> u64 {
		if encoded.len() < INTERNAL_KEY_TRAILER_SIZE {
			return 0;
		}
		let mut trailer = [0u8; INTERNAL_KEY_TRAILER_SIZE];
		trailer.copy_from_slice(&encoded[encoded.len() - INTERNAL_KEY_TRAILER_SIZE..]);
		u64::from_be_bytes(trailer)
	}
}

// Compares two internal keys. For equal user keys, internal keys compare in
// descending sequence number order. For equal user keys and sequence numbers,
// internal keys compare in descending kind order.
impl Ord for InternalKey {
	fn cmp(&self, other: &Self) -> Ordering {
		(&self.user_key, Reverse(self.seq_num()), Reverse(self.kind() as u8)).cmp(&(
			&other.user_key,
			Reverse(other.seq_num()),
			Reverse(other.kind() as u8),
		))
	}
}

impl PartialOrd for InternalKey {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}
