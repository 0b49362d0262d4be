//! The boundary between compaction and the on-disk table encoding.
//!
//! A compaction only needs to iterate its inputs in key order and to append
//! sorted entries to new outputs. Formats plug in behind [`TableFactory`].

use std::io::Write;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32;

use crate::comparator::InternalKeyComparator;
use crate::compression::CompressionType;
use crate::error::{Error, Result};
use crate::sstable::block_based::BlockBasedTableFactory;
use crate::sstable::meta::TableProperties;
use crate::sstable::plain::PlainTableFactory;
use crate::sstable::InternalKey;
use crate::vfs::File;

pub(crate) const BLOCK_BASED_TABLE_MAGIC: u64 = 0x88e2_41b7_85f4_cff7;
pub(crate) const PLAIN_TABLE_MAGIC: u64 = 0x8242_2296_63bf_9564;

/// Compression byte plus crc32 after every block.
pub(crate) const BLOCK_TRAILER_SIZE: usize = 1 + 4;

/// Two block handles, data checksum, format byte and magic.
pub(crate) const FOOTER_SIZE: usize = 4 * 8 + 4 + 1 + 8;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
	/// Checksummed, optionally compressed data blocks located through an
	/// index block. Suited to tables read from disk.
	BlockBased = 1,
	/// One flat run of records. Suited to tables that are mapped or read
	/// into memory whole.
	Plain = 2,
}

impl TableFormat {
	pub fn from_u8(value: u8) -> Result<Self> {
		match value {
			1 => Ok(TableFormat::BlockBased),
			2 => Ok(TableFormat::Plain),
			_ => Err(Error::InvalidTableFormat),
		}
	}

	pub(crate) fn magic(&self) -> u64 {
		match self {
			TableFormat::BlockBased => BLOCK_BASED_TABLE_MAGIC,
			TableFormat::Plain => PLAIN_TABLE_MAGIC,
		}
	}

	pub(crate) fn from_magic(magic: u64) -> Result<Self> {
		match magic {
			BLOCK_BASED_TABLE_MAGIC => Ok(TableFormat::BlockBased),
			PLAIN_TABLE_MAGIC => Ok(TableFormat::Plain),
			_ => Err(Error::InvalidTableFormat),
		}
	}
}

/// Settings the compaction hands to the builder of each output file.
#[derive(Clone)]
pub struct TableBuilderOptions {
	pub compression: CompressionType,
	pub block_size: usize,
	pub comparator: InternalKeyComparator,
}

/// Entries of a table in internal-key order.
pub type TableIter<'a> = Box<dyn Iterator<Item = Result<(InternalKey, Vec<u8>)>> + Send + 'a>;

pub trait TableReader: Send + Sync {
	fn properties(&self) -> &TableProperties;

	/// Iterates every entry, validating checksums as blocks are loaded.
	fn iter(&self) -> TableIter<'_>;
}

pub trait TableBuilder: Send {
	/// Appends an entry. Keys must arrive in strictly increasing order.
	fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()>;

	fn num_entries(&self) -> u64;

	/// Bytes the table would occupy if finished now.
	fn file_size(&self) -> u64;

	/// Writes the remaining blocks and footer, flushes the writer and returns
	/// the final properties, including the file size.
	fn finish(self: Box<Self>) -> Result<TableProperties>;

	/// Stops building. The caller owns removal of whatever was written.
	fn abandon(self: Box<Self>);
}

pub trait TableFactory: Send + Sync {
	fn name(&self) -> &'static str;

	fn new_reader(
		&self,
		icmp: &InternalKeyComparator,
		file: Arc<dyn File>,
		file_size: u64,
	) -> Result<Box<dyn TableReader>>;

	fn new_builder(
		&self,
		opts: TableBuilderOptions,
		writer: Box<dyn Write + Send>,
	) -> Box<dyn TableBuilder>;
}

/// Writes with one format and reads every format, telling them apart by the
/// footer magic.
pub struct AdaptiveTableFactory {
	write_format: TableFormat,
	block_based: BlockBasedTableFactory,
	plain: PlainTableFactory,
}

impl AdaptiveTableFactory {
	pub fn new(write_format: TableFormat) -> Self {
		Self {
			write_format,
			block_based: BlockBasedTableFactory,
			plain: PlainTableFactory,
		}
	}
}

impl TableFactory for AdaptiveTableFactory {
	fn name(&self) -> &'static str {
		"AdaptiveTableFactory"
	}

	fn new_reader(
		&self,
		icmp: &InternalKeyComparator,
		file: Arc<dyn File>,
		file_size: u64,
	) -> Result<Box<dyn TableReader>> {
		let footer = Footer::read_from(file.as_ref(), file_size)?;
		match footer.format {
			TableFormat::BlockBased => self.block_based.new_reader(icmp, file, file_size),
			TableFormat::Plain => self.plain.new_reader(icmp, file, file_size),
		}
	}

	fn new_builder(
		&self,
		opts: TableBuilderOptions,
		writer: Box<dyn Write + Send>,
	) -> Box<dyn TableBuilder> {
		match self.write_format {
			TableFormat::BlockBased => self.block_based.new_builder(opts, writer),
			TableFormat::Plain => self.plain.new_builder(opts, writer),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct BlockHandle {
	pub(crate) offset: u64,
	pub(crate) size: u64,
}

impl BlockHandle {
	pub(crate) fn new(offset: u64, size: u64) -> Self {
		Self {
			offset,
			size,
		}
	}

	pub(crate) fn encode_to(&self, buf: &mut BytesMut) {
		buf.put_u64(self.offset);
		buf.put_u64(self.size);
	}

	pub(crate) fn decode_from(buf: &mut Bytes) -> Result<Self> {
		if buf.remaining() < 16 {
			return Err(Error::Corruption("block handle truncated".into()));
		}
		Ok(Self::new(buf.get_u64(), buf.get_u64()))
	}

	/// Fails unless `offset + size + extra` fits within `limit`.
	pub(crate) fn check_within(&self, extra: u64, limit: u64) -> Result<()> {
		match self.offset.checked_add(self.size).and_then(|end| end.checked_add(extra)) {
			Some(end) if end <= limit => Ok(()),
			_ => Err(Error::Corruption(format!(
				"block handle {}+{} runs past {} bytes",
				self.offset, self.size, limit
			))),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Footer {
	pub(crate) properties: BlockHandle,
	pub(crate) index: BlockHandle,
	pub(crate) data_checksum: u32,
	pub(crate) format: TableFormat,
}

impl Footer {
	pub(crate) fn encode(&self) -> Bytes {
		let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
		self.properties.encode_to(&mut buf);
		self.index.encode_to(&mut buf);
		buf.put_u32(self.data_checksum);
		buf.put_u8(self.format as u8);
		buf.put_u64(self.format.magic());
		buf.freeze()
	}

	pub(crate) fn decode(mut buf: Bytes) -> Result<Self> {
		if buf.len() != FOOTER_SIZE {
			return Err(Error::Corruption(format!("footer is {} bytes", buf.len())));
		}
		let properties = BlockHandle::decode_from(&mut buf)?;
		let index = BlockHandle::decode_from(&mut buf)?;
		let data_checksum = buf.get_u32();
		let format = TableFormat::from_u8(buf.get_u8())?;
		if TableFormat::from_magic(buf.get_u64())? != format {
			return Err(Error::InvalidTableFormat);
		}
		Ok(Self {
			properties,
			index,
			data_checksum,
			format,
		})
	}

	pub(crate) fn read_from(file: &dyn File, file_size: u64) -> Result<Self> {
		if file_size < FOOTER_SIZE as u64 {
			return Err(Error::Corruption(format!("file too short for a table: {file_size} bytes")));
		}
		let mut buf = vec![0u8; FOOTER_SIZE];
		let footer_offset = file_size - FOOTER_SIZE as u64;
		file.read_exact_at(footer_offset, &mut buf)?;
		let footer = Self::decode(Bytes::from(buf))?;
		footer.properties.check_within(BLOCK_TRAILER_SIZE as u64, footer_offset)?;
		footer.index.check_within(0, footer.properties.offset)?;
		Ok(footer)
	}
}

/// Counts bytes passing through to the wrapped writer.
pub(crate) struct OffsetWriter {
	inner: Box<dyn Write + Send>,
	pub(crate) offset: u64,
}

impl OffsetWriter {
	pub(crate) fn new(inner: Box<dyn Write + Send>) -> Self {
		Self {
			inner,
			offset: 0,
		}
	}

	pub(crate) fn write_all(&mut self, buf: &[u8]) -> Result<()> {
		self.inner.write_all(buf)?;
		self.offset += buf.len() as u64;
		Ok(())
	}

	pub(crate) fn flush(&mut self) -> Result<()> {
		self.inner.flush()?;
		Ok(())
	}
}

fn block_checksum(block: &[u8], compression: CompressionType) -> u32 {
	let mut cksum = Crc32::new();
	cksum.update(block);
	cksum.update(&[compression as u8]);
	cksum.finalize()
}

/// Compresses and writes a block followed by its trailer.
pub(crate) fn write_block(
	writer: &mut OffsetWriter,
	raw_block: &[u8],
	compression: CompressionType,
) -> Result<BlockHandle> {
	let block = compression.compress(raw_block);
	let handle = BlockHandle::new(writer.offset, block.len() as u64);
	writer.write_all(&block)?;
	writer.write_all(&[compression as u8])?;
	writer.write_all(&block_checksum(&block, compression).to_be_bytes())?;
	Ok(handle)
}

/// Reads a block and its trailer, verifies the checksum and decompresses.
pub(crate) fn read_block(file: &dyn File, handle: &BlockHandle) -> Result<Vec<u8>> {
	handle.check_within(BLOCK_TRAILER_SIZE as u64, file.size()?)?;
	let mut buf = vec![0u8; handle.size as usize + BLOCK_TRAILER_SIZE];
	file.read_exact_at(handle.offset, &mut buf)?;

	let n = handle.size as usize;
	let compression_byte = buf[n];
	let mut stored = [0u8; 4];
	stored.copy_from_slice(&buf[n + 1..]);
	let compression = CompressionType::from_u8(compression_byte)?;
	if block_checksum(&buf[..n], compression) != u32::from_be_bytes(stored) {
		return Err(Error::Corruption(format!(
			"block checksum mismatch at offset {}",
			handle.offset
		)));
	}
	compression.decompress(&buf[..n])
}

/// Appends `key_len | key | value_len | value`.
pub(crate) fn put_entry(buf: &mut BytesMut, key: &[u8], value: &[u8]) {
	buf.put_u32(key.len() as u32);
	buf.extend_from_slice(key);
	buf.put_u32(value.len() as u32);
	buf.extend_from_slice(value);
}

/// Reads one entry written by [`put_entry`].
pub(crate) fn get_entry(buf: &mut Bytes) -> Result<(Bytes, Bytes)> {
	let mut field = || -> Result<Bytes> {
		if buf.remaining() < 4 {
			return Err(Error::Corruption("entry length truncated".into()));
		}
		let len = buf.get_u32() as usize;
		if buf.remaining() < len {
			return Err(Error::Corruption("entry truncated".into()));
		}
		Ok(buf.copy_to_bytes(len))
	};
	let key = field()?;
	let value = field()?;
	Ok((key, value))
}

/// Rejects a key that does not sort strictly after the previous one.
pub(crate) fn check_key_order(
	icmp: &InternalKeyComparator,
	last: Option<&InternalKey>,
	key: &InternalKey,
) -> Result<()> {
	if let Some(last) = last {
		if icmp.compare_keys(last, key) != std::cmp::Ordering::Less {
			return Err(Error::KeyNotInOrder);
		}
	}
	Ok(())
}

/// Decodes the properties block named by the footer.
pub(crate) fn read_properties(
	file: &dyn File,
	footer: &Footer,
	file_size: u64,
) -> Result<TableProperties> {
	let raw = read_block(file, &footer.properties)?;
	let mut props = TableProperties::decode(Bytes::from(raw))?;
	if props.format != footer.format {
		return Err(Error::InvalidTableFormat);
	}
	props.file_size = file_size;
	Ok(props)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn footer_encode_decode() {
		let footer = Footer {
			properties: BlockHandle::new(100, 40),
			index: BlockHandle::new(60, 35),
			data_checksum: 0xdead_beef,
			format: TableFormat::Plain,
		};
		let encoded = footer.encode();
		assert_eq!(encoded.len(), FOOTER_SIZE);
		assert_eq!(Footer::decode(encoded).unwrap(), footer);
	}

	#[test]
	fn footer_rejects_foreign_magic() {
		let mut raw = BytesMut::from(&Footer {
			properties: BlockHandle::default(),
			index: BlockHandle::default(),
			data_checksum: 0,
			format: TableFormat::BlockBased,
		}
		.encode()[..]);
		let n = raw.len();
		raw[n - 1] ^= 0xff;
		assert!(matches!(Footer::decode(raw.freeze()), Err(Error::InvalidTableFormat)));
	}

	#[test]
	fn handle_bounds_reject_overflow() {
		assert!(BlockHandle::new(10, 85).check_within(5, 100).is_ok());
		assert!(BlockHandle::new(10, 86).check_within(5, 100).is_err());
		assert!(BlockHandle::new(10, u64::MAX).check_within(5, 100).is_err());
		assert!(BlockHandle::new(u64::MAX, 0).check_within(0, u64::MAX).is_ok());
		assert!(BlockHandle::new(u64::MAX, 1).check_within(0, u64::MAX).is_err());
	}

	#[test]
	fn block_checksum_detects_flipped_byte() {
		let mut writer = OffsetWriter::new(Box::new(Vec::new()));
		let handle =
			write_block(&mut writer, b"some block payload", CompressionType::None).unwrap();
		assert_eq!(writer.offset, handle.size + BLOCK_TRAILER_SIZE as u64);

		let mut file: Vec<u8> = Vec::new();
		let mut buf = BytesMut::new();
		buf.extend_from_slice(b"some block payload");
		buf.put_u8(CompressionType::None as u8);
		buf.put_u32(block_checksum(b"some block payload", CompressionType::None));
		file.extend_from_slice(&buf);
		assert_eq!(read_block(&file, &handle).unwrap(), b"some block payload");

		file[3] ^= 0x01;
		assert!(matches!(read_block(&file, &handle), Err(Error::Corruption(_))));
	}
}
