#![no_main]
use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use lsm_compaction::compaction::leveled::LevelCompactionPicker;
use lsm_compaction::{FileMetaData, InternalKey, InternalKeyKind, Options, VersionEdit, VersionSet};

#[path = "mod.rs"]
mod helpers;
use helpers::{disjoint_files, distinct_keys};

const LEVELS: usize = 5;

#[derive(Arbitrary, Debug)]
struct FuzzInput {
	/// Keys the merge emits, one entry per user key.
	keys: Vec<Vec<u8>>,
	/// Outputs the caller closes early, by key position.
	early_finishes: Vec<bool>,
	level2: Vec<Vec<u8>>,
	level3: Vec<Vec<u8>>,
	level4: Vec<Vec<u8>>,
	grandparent_size: u16,
	target_file_size: u16,
}

fuzz_target!(|data: FuzzInput| {
	if data.keys.len() > 300 || data.level2.len() + data.level3.len() + data.level4.len() > 300 {
		return;
	}
	let keys = distinct_keys(data.keys);
	let (Some(first), Some(last)) = (keys.first(), keys.last()) else {
		return;
	};

	let opts = Options::default()
		.with_num_levels(LEVELS)
		.with_target_file_size_base(u64::from(data.target_file_size).max(1))
		.with_max_grandparent_overlap_factor(1);
	let vs = Arc::new(VersionSet::new(Arc::new(opts)).expect("valid options"));

	let size = u64::from(data.grandparent_size).max(1);
	let mut edit = VersionEdit::new();
	edit.add_file(
		1,
		FileMetaData::new(
			1,
			0,
			size,
			InternalKey::new(first.clone(), 1, InternalKeyKind::Set),
			InternalKey::new(last.clone(), 1, InternalKeyKind::Set),
		),
	);
	for (level, boundaries, first_number) in
		[(2, data.level2, 1_000), (3, data.level3, 2_000), (4, data.level4, 3_000)]
	{
		for f in disjoint_files(boundaries, first_number, size) {
			edit.add_file(level, f);
		}
	}
	vs.apply(edit).expect("disjoint levels install");

	let picker = LevelCompactionPicker::new(Arc::clone(vs.options()));
	let compaction =
		vs.compact_range(&picker, 1, 2, None, None).expect("valid range").expect("level 1 is idle");
	let version = Arc::clone(compaction.input_version().expect("live compaction"));
	let mut state = compaction.begin_execution().expect("live compaction");

	let mut first_of_output = true;
	for (i, user_key) in keys.iter().enumerate() {
		let key = InternalKey::new(user_key.clone(), 10, InternalKeyKind::Set);
		let stop = state.should_stop_before(&key);
		assert!(!(stop && first_of_output), "cut requested before the first key of an output");
		first_of_output = false;

		let beyond = (3..LEVELS).any(|level| {
			version.files(level).iter().any(|f| {
				let key = user_key.as_slice();
				f.smallest.user_key() <= key && key <= f.largest.user_key()
			})
		});
		assert_eq!(state.key_not_exists_beyond_output_level(user_key), !beyond);

		if data.early_finishes.get(i).copied().unwrap_or(false) {
			state.output_file_finished();
			first_of_output = true;
		}
	}

	drop(state);
	vs.release_compaction(compaction, Ok(())).expect("release");
});
