use crate::error::{Error, Result};

/// Compression applied to the data blocks of an output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
	/// No compression.
	None = 0,

	/// LZ4 compression using lz4_flex.
	Lz4 = 1,
}

impl CompressionType {
	/// Converts a u8 value to a CompressionType.
	pub fn from_u8(value: u8) -> Result<Self> {
		match value {
			0 => Ok(CompressionType::None),
			1 => Ok(CompressionType::Lz4),
			_ => Err(Error::Corruption(format!("invalid compression type {value}"))),
		}
	}

	pub(crate) fn compress(&self, data: &[u8]) -> Vec<u8> {
		match self {
			CompressionType::None => data.to_vec(),
			CompressionType::Lz4 => lz4_flex::compress_prepend_size(data),
		}
	}

	pub(crate) fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
		match self {
			CompressionType::None => Ok(data.to_vec()),
			CompressionType::Lz4 => lz4_flex::decompress_size_prepended(data)
				.map_err(|e| Error::Corruption(format!("lz4 block: {e}"))),
		}
	}
}

/// CompressionSelector handles level-aware compression type selection.
#[derive(Debug, Clone)]
pub struct CompressionSelector {
	per_level_compression: Vec<CompressionType>,
}

impl CompressionSelector {
	pub fn new(per_level: Vec<CompressionType>) -> Self {
		Self {
			per_level_compression: per_level,
		}
	}

	/// Same compression for every level.
	pub fn uniform(compression: CompressionType) -> Self {
		Self::new(vec![compression])
	}

	/// Select compression type for a given output level. Levels past the end
	/// of the configured list reuse the last entry.
	pub fn select_compression(&self, level: usize) -> CompressionType {
		match self.per_level_compression.get(level) {
			Some(compression) => *compression,
			None => *self.per_level_compression.last().unwrap_or(&CompressionType::None),
		}
	}
}

impl Default for CompressionSelector {
	fn default() -> Self {
		// Shallow levels are rewritten often; keep them uncompressed
		Self::new(vec![CompressionType::None, CompressionType::None, CompressionType::Lz4])
	}
}
