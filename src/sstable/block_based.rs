//! Block-based tables.
//!
//! ```text
//! [data block 1] ... [data block N] [index block] [properties block] [footer]
//! ```
//!
//! Each block is followed by a compression byte and a crc32 of the stored
//! bytes. Index entries map a separator key (>= every key of the block and <
//! every key of the next block) to the block's handle.

use std::cmp::Ordering;
use std::io::Write;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::compression::CompressionType;
use crate::error::{Error, Result};
use crate::sstable::meta::TableProperties;
use crate::sstable::table::{
	check_key_order, get_entry, put_entry, read_block, read_properties, write_block, BlockHandle,
	Footer, OffsetWriter, TableBuilder, TableBuilderOptions, TableFactory, TableFormat, TableIter,
	TableReader,
};
use crate::sstable::InternalKey;
use crate::vfs::File;

#[derive(Debug, Default, Clone, Copy)]
pub struct BlockBasedTableFactory;

impl TableFactory for BlockBasedTableFactory {
	fn name(&self) -> &'static str {
		"BlockBasedTable"
	}

	fn new_reader(
		&self,
		icmp: &InternalKeyComparator,
		file: Arc<dyn File>,
		file_size: u64,
	) -> Result<Box<dyn TableReader>> {
		Ok(Box::new(BlockBasedTableReader::open(icmp.clone(), file, file_size)?))
	}

	fn new_builder(
		&self,
		opts: TableBuilderOptions,
		writer: Box<dyn Write + Send>,
	) -> Box<dyn TableBuilder> {
		Box::new(BlockBasedTableBuilder::new(opts, writer))
	}
}

pub(crate) struct BlockBasedTableBuilder {
	opts: TableBuilderOptions,
	writer: OffsetWriter,
	data_block: BytesMut,
	index_block: BytesMut,
	/// Last key of a flushed block whose index entry waits for the next key,
	/// so the separator can be shortened.
	pending_index: Option<(Vec<u8>, BlockHandle)>,
	last_key: Option<InternalKey>,
	props: TableProperties,
}

impl BlockBasedTableBuilder {
	pub(crate) fn new(opts: TableBuilderOptions, writer: Box<dyn Write + Send>) -> Self {
		let props = TableProperties::new(TableFormat::BlockBased, opts.compression);
		Self {
			opts,
			writer: OffsetWriter::new(writer),
			data_block: BytesMut::new(),
			index_block: BytesMut::new(),
			pending_index: None,
			last_key: None,
			props,
		}
	}

	fn flush_data_block(&mut self) -> Result<()> {
		if self.data_block.is_empty() {
			return Ok(());
		}
		let handle = write_block(&mut self.writer, &self.data_block, self.opts.compression)?;
		self.data_block.clear();
		self.props.num_data_blocks += 1;

		let last = self.last_key.as_ref().map(InternalKey::encode).unwrap_or_default();
		self.pending_index = Some((last, handle));
		Ok(())
	}

	fn add_pending_index(&mut self, next_key: Option<&[u8]>) {
		if let Some((last, handle)) = self.pending_index.take() {
			let separator = match next_key {
				Some(next) => self.opts.comparator.separator(&last, next),
				None => self.opts.comparator.successor(&last),
			};
			let mut value = BytesMut::with_capacity(16);
			handle.encode_to(&mut value);
			put_entry(&mut self.index_block, &separator, &value);
		}
	}
}

impl TableBuilder for BlockBasedTableBuilder {
	fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
		check_key_order(&self.opts.comparator, self.last_key.as_ref(), key)?;

		let encoded = key.encode();
		if self.pending_index.is_some() {
			self.add_pending_index(Some(&encoded));
		}

		put_entry(&mut self.data_block, &encoded, value);
		self.props.record(key, value);
		self.last_key = Some(key.clone());

		if self.data_block.len() >= self.opts.block_size {
			self.flush_data_block()?;
		}
		Ok(())
	}

	fn num_entries(&self) -> u64 {
		self.props.num_entries
	}

	fn file_size(&self) -> u64 {
		self.writer.offset + self.data_block.len() as u64
	}

	fn finish(mut self: Box<Self>) -> Result<TableProperties> {
		self.flush_data_block()?;
		self.add_pending_index(None);

		let index_block = std::mem::take(&mut self.index_block);
		let index = write_block(&mut self.writer, &index_block, CompressionType::None)?;
		let properties =
			write_block(&mut self.writer, &self.props.encode(), CompressionType::None)?;

		let footer = Footer {
			properties,
			index,
			data_checksum: 0,
			format: TableFormat::BlockBased,
		};
		self.writer.write_all(&footer.encode())?;
		self.writer.flush()?;

		let mut props = self.props;
		props.file_size = self.writer.offset;
		Ok(props)
	}

	fn abandon(self: Box<Self>) {}
}

pub(crate) struct BlockBasedTableReader {
	icmp: InternalKeyComparator,
	file: Arc<dyn File>,
	index: Vec<(Vec<u8>, BlockHandle)>,
	props: TableProperties,
}

impl BlockBasedTableReader {
	pub(crate) fn open(
		icmp: InternalKeyComparator,
		file: Arc<dyn File>,
		file_size: u64,
	) -> Result<Self> {
		let footer = Footer::read_from(file.as_ref(), file_size)?;
		if footer.format != TableFormat::BlockBased {
			return Err(Error::InvalidTableFormat);
		}
		let props = read_properties(file.as_ref(), &footer, file_size)?;

		let mut raw = Bytes::from(read_block(file.as_ref(), &footer.index)?);
		let mut index = Vec::new();
		while !raw.is_empty() {
			let (key, value) = get_entry(&mut raw)?;
			let mut value = value;
			let handle = BlockHandle::decode_from(&mut value)?;
			if handle.offset.saturating_add(handle.size) > footer.index.offset {
				return Err(Error::Corruption(format!(
					"data block handle {}+{} past index block",
					handle.offset, handle.size
				)));
			}
			index.push((key.to_vec(), handle));
		}
		if index.len() as u64 != props.num_data_blocks {
			return Err(Error::Corruption(format!(
				"index lists {} blocks, properties {}",
				index.len(),
				props.num_data_blocks
			)));
		}

		Ok(Self {
			icmp,
			file,
			index,
			props,
		})
	}
}

impl TableReader for BlockBasedTableReader {
	fn properties(&self) -> &TableProperties {
		&self.props
	}

	fn iter(&self) -> TableIter<'_> {
		Box::new(BlockBasedIter {
			reader: self,
			block_idx: 0,
			block: Bytes::new(),
			last_in_block: None,
			failed: false,
		})
	}
}

struct BlockBasedIter<'a> {
	reader: &'a BlockBasedTableReader,
	block_idx: usize,
	block: Bytes,
	last_in_block: Option<Vec<u8>>,
	failed: bool,
}

impl BlockBasedIter<'_> {
	fn next_entry(&mut self) -> Result<Option<(InternalKey, Vec<u8>)>> {
		while self.block.is_empty() {
			if self.block_idx > 0 {
				self.check_block_bound(self.block_idx - 1)?;
			}
			let Some((_, handle)) = self.reader.index.get(self.block_idx) else {
				return Ok(None);
			};
			self.block = Bytes::from(read_block(self.reader.file.as_ref(), handle)?);
			self.block_idx += 1;
			self.last_in_block = None;
		}

		let (key, value) = get_entry(&mut self.block)?;
		let internal_key = InternalKey::decode(&key)?;
		self.last_in_block = Some(key.to_vec());
		Ok(Some((internal_key, value.to_vec())))
	}

	/// Every key of a block must sort at or before its index separator.
	fn check_block_bound(&self, idx: usize) -> Result<()> {
		if let (Some(last), Some((separator, _))) =
			(self.last_in_block.as_ref(), self.reader.index.get(idx))
		{
			if self.reader.icmp.compare(last, separator) == Ordering::Greater {
				return Err(Error::Corruption(format!("block {idx} extends past its index key")));
			}
		}
		Ok(())
	}
}

impl Iterator for BlockBasedIter<'_> {
	type Item = Result<(InternalKey, Vec<u8>)>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed {
			return None;
		}
		match self.next_entry() {
			Ok(entry) => entry.map(Ok),
			Err(e) => {
				self.failed = true;
				Some(Err(e))
			}
		}
	}
}
