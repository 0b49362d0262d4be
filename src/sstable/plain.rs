//! Plain tables: one flat run of length-prefixed records, a properties block
//! and the footer. The footer carries a crc32 over the whole record run. No
//! index and no compression; the reader loads the records in one read.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use bytes::BytesMut;
use crc32fast::Hasher as Crc32;

use crate::comparator::InternalKeyComparator;
use crate::compression::CompressionType;
use crate::error::{Error, Result};
use crate::sstable::meta::TableProperties;
use crate::sstable::table::{
	check_key_order, get_entry, put_entry, read_properties, write_block, BlockHandle, Footer,
	OffsetWriter, TableBuilder, TableBuilderOptions, TableFactory, TableFormat, TableIter,
	TableReader,
};
use crate::sstable::InternalKey;
use crate::vfs::File;

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTableFactory;

impl TableFactory for PlainTableFactory {
	fn name(&self) -> &'static str {
		"PlainTable"
	}

	fn new_reader(
		&self,
		icmp: &InternalKeyComparator,
		file: Arc<dyn File>,
		file_size: u64,
	) -> Result<Box<dyn TableReader>> {
		Ok(Box::new(PlainTableReader::open(icmp, file.as_ref(), file_size)?))
	}

	fn new_builder(
		&self,
		opts: TableBuilderOptions,
		writer: Box<dyn Write + Send>,
	) -> Box<dyn TableBuilder> {
		Box::new(PlainTableBuilder::new(opts, writer))
	}
}

pub(crate) struct PlainTableBuilder {
	comparator: InternalKeyComparator,
	writer: OffsetWriter,
	checksum: Crc32,
	last_key: Option<InternalKey>,
	props: TableProperties,
	scratch: BytesMut,
}

impl PlainTableBuilder {
	pub(crate) fn new(opts: TableBuilderOptions, writer: Box<dyn Write + Send>) -> Self {
		Self {
			comparator: opts.comparator,
			writer: OffsetWriter::new(writer),
			checksum: Crc32::new(),
			last_key: None,
			// Records are stored as-is whatever compression the compaction asks for
			props: TableProperties::new(TableFormat::Plain, CompressionType::None),
			scratch: BytesMut::new(),
		}
	}
}

impl TableBuilder for PlainTableBuilder {
	fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
		check_key_order(&self.comparator, self.last_key.as_ref(), key)?;

		self.scratch.clear();
		put_entry(&mut self.scratch, &key.encode(), value);
		self.writer.write_all(&self.scratch)?;
		self.checksum.update(&self.scratch);

		self.props.record(key, value);
		self.last_key = Some(key.clone());
		Ok(())
	}

	fn num_entries(&self) -> u64 {
		self.props.num_entries
	}

	fn file_size(&self) -> u64 {
		self.writer.offset
	}

	fn finish(mut self: Box<Self>) -> Result<TableProperties> {
		let data_end = self.writer.offset;
		self.props.num_data_blocks = u64::from(data_end > 0);
		let properties =
			write_block(&mut self.writer, &self.props.encode(), CompressionType::None)?;

		let footer = Footer {
			properties,
			// The single data region stands in for the index
			index: BlockHandle::new(0, data_end),
			data_checksum: self.checksum.clone().finalize(),
			format: TableFormat::Plain,
		};
		self.writer.write_all(&footer.encode())?;
		self.writer.flush()?;

		let mut props = self.props;
		props.file_size = self.writer.offset;
		Ok(props)
	}

	fn abandon(self: Box<Self>) {}
}

pub(crate) struct PlainTableReader {
	data: Bytes,
	props: TableProperties,
}

impl PlainTableReader {
	pub(crate) fn open(
		icmp: &InternalKeyComparator,
		file: &dyn File,
		file_size: u64,
	) -> Result<Self> {
		let footer = Footer::read_from(file, file_size)?;
		if footer.format != TableFormat::Plain {
			return Err(Error::InvalidTableFormat);
		}
		let props = read_properties(file, &footer, file_size)?;

		let region = footer.index;
		if region.offset != 0 || region.size > footer.properties.offset {
			return Err(Error::Corruption(format!(
				"plain table data region {}+{} overlaps metadata",
				region.offset, region.size
			)));
		}
		let mut data = vec![0u8; region.size as usize];
		file.read_exact_at(0, &mut data)?;

		let mut checksum = Crc32::new();
		checksum.update(&data);
		if checksum.finalize() != footer.data_checksum {
			return Err(Error::Corruption("plain table data checksum mismatch".into()));
		}

		let reader = Self {
			data: Bytes::from(data),
			props,
		};
		reader.validate_order(icmp)?;
		Ok(reader)
	}

	/// Records are checksummed as a whole, so a structural check is all that
	/// is left: every key decodes and the run is sorted.
	fn validate_order(&self, icmp: &InternalKeyComparator) -> Result<()> {
		let mut last: Option<InternalKey> = None;
		let mut count = 0u64;
		for entry in self.iter() {
			let (key, _) = entry?;
			check_key_order(icmp, last.as_ref(), &key)
				.map_err(|_| Error::Corruption("plain table keys out of order".into()))?;
			last = Some(key);
			count += 1;
		}
		if count != self.props.num_entries {
			return Err(Error::Corruption(format!(
				"plain table holds {count} entries, properties say {}",
				self.props.num_entries
			)));
		}
		Ok(())
	}
}

impl TableReader for PlainTableReader {
	fn properties(&self) -> &TableProperties {
		&self.props
	}

	fn iter(&self) -> TableIter<'_> {
		let mut data = self.data.clone();
		let mut failed = false;
		Box::new(std::iter::from_fn(move || {
			if failed || data.is_empty() {
				return None;
			}
			let entry = get_entry(&mut data)
				.and_then(|(key, value)| Ok((InternalKey::decode(&key)?, value.to_vec())));
			failed = entry.is_err();
			Some(entry)
		}))
	}
}
