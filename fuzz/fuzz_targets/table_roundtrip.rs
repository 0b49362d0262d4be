#![no_main]
use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use lsm_compaction::comparator::{BytewiseComparator, InternalKeyComparator};
use lsm_compaction::sstable::table::{AdaptiveTableFactory, TableBuilderOptions, TableFactory};
use lsm_compaction::vfs::File;
use lsm_compaction::{CompressionType, InternalKey, TableFormat};

#[path = "mod.rs"]
mod helpers;
use helpers::{sort_and_deduplicate, to_internal_key_kind};

#[derive(Arbitrary, Debug)]
struct FuzzTableInput {
	entries: Vec<FuzzEntryRaw>,
	block_size: u16,
	plain: bool,
	use_compression: bool,
}

#[derive(Arbitrary, Debug)]
struct FuzzEntryRaw {
	user_key: Vec<u8>,
	value: Vec<u8>,
	seq_num: u32,
	kind: u8,
}

struct Sink(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for Sink {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.0.lock().unwrap().extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

fuzz_target!(|data: FuzzTableInput| {
	if data.entries.len() > 500 {
		return;
	}

	let mut entries: Vec<(InternalKey, Vec<u8>)> = data
		.entries
		.iter()
		.map(|e| {
			let kind = to_internal_key_kind(e.kind);
			let key = InternalKey::new(e.user_key.clone(), u64::from(e.seq_num), kind);
			(key, e.value.clone())
		})
		.collect();
	sort_and_deduplicate(&mut entries);

	let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator::default()));
	let format = if data.plain {
		TableFormat::Plain
	} else {
		TableFormat::BlockBased
	};
	let compression = if data.use_compression {
		CompressionType::Lz4
	} else {
		CompressionType::None
	};
	let factory = AdaptiveTableFactory::new(format);

	let buf = Arc::new(std::sync::Mutex::new(Vec::new()));
	let mut builder = factory.new_builder(
		TableBuilderOptions {
			compression,
			block_size: usize::from(data.block_size.max(64)),
			comparator: icmp.clone(),
		},
		Box::new(Sink(Arc::clone(&buf))),
	);
	for (key, value) in &entries {
		builder.add(key, value).expect("sorted entries must be accepted");
	}
	let props = builder.finish().expect("finish");

	let bytes = buf.lock().unwrap().clone();
	assert_eq!(props.file_size, bytes.len() as u64);
	let file: Arc<dyn File> = Arc::new(bytes);
	let reader = factory.new_reader(&icmp, file, props.file_size).expect("open");
	assert_eq!(reader.properties().num_entries, entries.len() as u64);

	let read: Vec<_> = reader.iter().collect::<Result<_, _>>().expect("iterate");
	assert_eq!(read, entries);
});
