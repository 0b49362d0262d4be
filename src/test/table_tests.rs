use std::sync::Arc;

use futures_lite::future::block_on;
use test_log::test;

use super::{ikey, tombstone, SharedBuffer, TestEnv};
use crate::compaction::compactor::Compactor;
use crate::compaction::leveled::LevelCompactionPicker;
use crate::compaction::pool::CompactionPool;
use crate::comparator::{BytewiseComparator, InternalKeyComparator};
use crate::compression::CompressionType;
use crate::error::Error;
use crate::options::Options;
use crate::sstable::meta::TableProperties;
use crate::sstable::table::{
	AdaptiveTableFactory, TableBuilderOptions, TableFactory, TableFormat, TableReader, FOOTER_SIZE,
};
use crate::sstable::InternalKey;
use crate::vfs::File;

fn icmp() -> InternalKeyComparator {
	InternalKeyComparator::new(Arc::new(BytewiseComparator::default()))
}

fn sample_entries() -> Vec<(InternalKey, Vec<u8>)> {
	let mut entries = Vec::new();
	for i in 0..200u64 {
		let key = format!("row-{i:05}");
		if i % 7 == 0 {
			entries.push((tombstone(&key, 1000 + i), Vec::new()));
		} else {
			entries.push((ikey(&key, 1000 + i), format!("payload {i}").repeat(3).into_bytes()));
		}
	}
	entries
}

fn write_table(
	format: TableFormat,
	compression: CompressionType,
	entries: &[(InternalKey, Vec<u8>)],
) -> (Vec<u8>, TableProperties) {
	let buf = SharedBuffer::default();
	let mut builder = AdaptiveTableFactory::new(format).new_builder(
		TableBuilderOptions {
			compression,
			block_size: 256,
			comparator: icmp(),
		},
		Box::new(buf.clone()),
	);
	for (key, value) in entries {
		builder.add(key, value).unwrap();
	}
	let props = builder.finish().unwrap();
	(buf.contents(), props)
}

/// One version of each key `{prefix}00..`, sequence numbers from `first_seq`.
fn versions(prefix: &str, n: u64, first_seq: u64, value: &[u8]) -> Vec<(InternalKey, Vec<u8>)> {
	(0..n).map(|i| (ikey(&format!("{prefix}{i:02}"), first_seq + i), value.to_vec())).collect()
}

fn open(bytes: Vec<u8>) -> crate::error::Result<Box<dyn TableReader>> {
	let size = bytes.len() as u64;
	let file: Arc<dyn File> = Arc::new(bytes);
	// Reads never depend on the format the factory writes
	AdaptiveTableFactory::new(TableFormat::BlockBased).new_reader(&icmp(), file, size)
}

#[test]
fn both_formats_read_back_through_one_factory() {
	let entries = sample_entries();
	for (format, compression) in [
		(TableFormat::BlockBased, CompressionType::None),
		(TableFormat::BlockBased, CompressionType::Lz4),
		(TableFormat::Plain, CompressionType::Lz4),
	] {
		let (bytes, props) = write_table(format, compression, &entries);
		assert_eq!(props.file_size, bytes.len() as u64);

		let reader = open(bytes).unwrap();
		let read: Vec<_> = reader.iter().collect::<crate::error::Result<_>>().unwrap();
		assert_eq!(read, entries, "{format:?} {compression:?}");

		let stored = reader.properties();
		assert_eq!(stored.format, format);
		assert_eq!(stored.num_entries, 200);
		assert_eq!(stored.num_deletions, 29);
		assert_eq!(stored.smallest_seqno, 1000);
		assert_eq!(stored.largest_seqno, 1199);
		assert_eq!(stored.smallest.as_ref(), Some(&entries[0].0));
		assert_eq!(stored.largest.as_ref(), Some(&entries[199].0));
	}
}

#[test]
fn plain_tables_ignore_requested_compression() {
	let (_, props) = write_table(TableFormat::Plain, CompressionType::Lz4, &sample_entries());
	assert_eq!(props.compression, CompressionType::None);
	assert_eq!(props.num_data_blocks, 1);
}

#[test]
fn builders_reject_keys_out_of_order() {
	for format in [TableFormat::BlockBased, TableFormat::Plain] {
		let mut builder = AdaptiveTableFactory::new(format).new_builder(
			TableBuilderOptions {
				compression: CompressionType::None,
				block_size: 256,
				comparator: icmp(),
			},
			Box::new(SharedBuffer::default()),
		);
		builder.add(&ikey("b", 5), b"v").unwrap();
		assert!(matches!(builder.add(&ikey("a", 9), b"v"), Err(Error::KeyNotInOrder)));
		// Same user key with a higher sequence number sorts first
		assert!(matches!(builder.add(&ikey("b", 6), b"v"), Err(Error::KeyNotInOrder)));
		builder.add(&ikey("b", 4), b"v").unwrap();
		assert_eq!(builder.num_entries(), 2);
		builder.abandon();
	}
}

#[test]
fn damaged_tables_are_reported_as_corruption() {
	let entries = sample_entries();

	let (mut plain, _) = write_table(TableFormat::Plain, CompressionType::None, &entries);
	plain[40] ^= 0x01;
	assert!(matches!(open(plain), Err(Error::Corruption(_))));

	let (block_based, _) = write_table(TableFormat::BlockBased, CompressionType::Lz4, &entries);
	let mut damaged = block_based.clone();
	damaged[10] ^= 0x80;
	let reader = open(damaged).unwrap();
	let first_block = reader.iter().find_map(|entry| entry.err());
	assert!(matches!(first_block, Some(Error::Corruption(_))));

	let truncated = block_based[..20].to_vec();
	assert!(matches!(open(truncated), Err(Error::Corruption(_))));
}

#[test]
fn compaction_writes_the_configured_format() {
	let opts = Options::default().with_num_levels(3).with_table_format(TableFormat::Plain);
	let env = TestEnv::new(opts);
	env.install(vec![(1, versions("p", 30, 50, b"b")), (2, versions("p", 30, 1, b"a"))]).unwrap();

	let picker = LevelCompactionPicker::new(Arc::clone(env.vs.options()));
	let c = env.vs.compact_range(&picker, 1, 2, None, None).unwrap().unwrap();
	let stats = Compactor::new(Arc::clone(&env.vs)).run(c).unwrap();
	assert_eq!(stats.entries_written, 30);

	let current = env.vs.current();
	let output = &current.files(2)[0];
	assert_eq!(output.num_entries, 30);
	assert_eq!(output.smallest_seqno, 50);
	assert_eq!(output.largest_seqno, 79);

	let path = env.vs.options().table_file_path(output.path_id, output.number);
	let bytes = std::fs::read(path).unwrap();
	let reader = open(bytes).unwrap();
	assert_eq!(reader.properties().format, TableFormat::Plain);
	assert!(reader.iter().all(|e| e.unwrap().1 == b"b"));
}

/// Overwrites the size of the properties handle stored in the footer.
fn set_properties_size(bytes: &mut [u8], size: u64) {
	let at = bytes.len() - FOOTER_SIZE + 8;
	bytes[at..at + 8].copy_from_slice(&size.to_be_bytes());
}

#[test]
fn footer_handles_past_the_file_are_corruption() {
	let entries = sample_entries();
	for format in [TableFormat::BlockBased, TableFormat::Plain] {
		let (bytes, _) = write_table(format, CompressionType::None, &entries);
		for size in [u64::MAX, u64::MAX - 4, bytes.len() as u64, 1 << 40] {
			let mut damaged = bytes.clone();
			set_properties_size(&mut damaged, size);
			assert!(matches!(open(damaged), Err(Error::Corruption(_))), "{format:?} size {size}");
		}
	}
}

#[test]
fn pooled_compaction_with_a_damaged_footer_releases_its_files() {
	let env = TestEnv::new(Options::default().with_num_levels(3).with_compaction_threads(1));
	env.install(vec![(1, versions("f", 20, 50, b"b")), (2, versions("f", 20, 1, b"a"))]).unwrap();

	let victim = Arc::clone(&env.vs.current().files(2)[0]);
	let path = env.vs.options().table_file_path(victim.path_id, victim.number);
	let mut bytes = std::fs::read(&path).unwrap();
	set_properties_size(&mut bytes, u64::MAX);
	std::fs::write(&path, bytes).unwrap();

	let pool = CompactionPool::new(Arc::clone(&env.vs)).unwrap();
	let task = pool.schedule_range(1, 2, None, None).unwrap().unwrap();
	let result = block_on(task);
	assert!(matches!(result, Err(Error::Corruption(_))), "{result:?}");

	assert!(env.vs.being_compacted_files().is_empty());
	assert!(env.vs.running_compactions().is_empty());
	assert_eq!(env.vs.current().num_level_files(2), 1);
}
