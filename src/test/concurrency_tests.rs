use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use futures_lite::future::block_on;
use test_log::test;

use super::{file_meta, ikey, version_set, TestEnv, MB};
use crate::compaction::compactor::CompactionStats;
use crate::compaction::leveled::LevelCompactionPicker;
use crate::compaction::pool::CompactionPool;
use crate::compaction::Compaction;
use crate::compression::{CompressionSelector, CompressionType};
use crate::error::{Error, Result};
use crate::levels::VersionSet;
use crate::options::Options;
use crate::sstable::meta::FileMetaData;

/// Twenty disjoint 2 MB files in level 1: four times its budget.
fn crowded_level_one(opts: Options) -> Arc<VersionSet> {
	let files: Vec<(usize, FileMetaData)> = (0..20u64)
		.map(|i| {
			let lo = format!("k{:03}", i * 10);
			let hi = format!("k{:03}", i * 10 + 9);
			(1, file_meta(i + 1, 2 * MB, &lo, &hi))
		})
		.collect();
	version_set(opts, files)
}

#[test]
fn concurrent_picks_never_share_a_file() {
	let vs = crowded_level_one(Options::default());
	let picker = Arc::new(LevelCompactionPicker::new(Arc::clone(vs.options())));

	let picked: Vec<Compaction> = thread::scope(|s| {
		let handles: Vec<_> = (0..8)
			.map(|_| {
				let vs = &vs;
				let picker = Arc::clone(&picker);
				s.spawn(move || {
					let mut mine = Vec::new();
					while let Some(c) = vs.pick_compaction(picker.as_ref()).unwrap() {
						mine.push(c);
					}
					mine
				})
			})
			.collect();
		handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
	});

	// Picking stops once the idle bytes fit the 10 MB budget
	assert_eq!(picked.len(), 16);
	let mut seen = BTreeSet::new();
	for c in &picked {
		for (_, f) in c.all_inputs() {
			assert!(seen.insert(f.number), "file #{} picked twice", f.number);
			assert!(f.is_being_compacted());
		}
	}
	assert_eq!(vs.running_compactions().len(), 16);
	assert_eq!(vs.being_compacted_files(), seen.iter().copied().collect::<Vec<_>>());

	for c in picked {
		vs.release_compaction(c, Ok(())).unwrap();
	}
	assert!(vs.being_compacted_files().is_empty());
	assert!(vs.running_compactions().is_empty());
}

#[test]
fn racing_manual_ranges_exclude_each_other() {
	let vs = crowded_level_one(Options::default());
	let picker = Arc::new(LevelCompactionPicker::new(Arc::clone(vs.options())));

	// Every thread asks for the same range; exactly one may win it
	let results: Vec<Option<Compaction>> = thread::scope(|s| {
		let handles: Vec<_> = (0..8)
			.map(|_| {
				let vs = &vs;
				let picker = Arc::clone(&picker);
				s.spawn(move || {
					vs.compact_range(picker.as_ref(), 1, 2, Some(b"k000"), Some(b"k055")).unwrap()
				})
			})
			.collect();
		handles.into_iter().map(|h| h.join().unwrap()).collect()
	});

	let winners: Vec<Compaction> = results.into_iter().flatten().collect();
	assert_eq!(winners.len(), 1);
	assert_eq!(winners[0].num_input_files(0), 6);
	for c in winners {
		vs.release_compaction(c, Ok(())).unwrap();
	}
	assert!(vs.being_compacted_files().is_empty());
}

#[test]
fn pool_drains_an_overfull_level() {
	let vs = crowded_level_one(Options::default().with_compaction_threads(4));
	let pool = CompactionPool::new(Arc::clone(&vs)).unwrap();

	loop {
		let mut tasks = Vec::new();
		while let Some(task) = pool.schedule_compaction().unwrap() {
			tasks.push(task);
		}
		if tasks.is_empty() {
			break;
		}
		for task in tasks {
			let stats: CompactionStats = block_on(task).unwrap();
			assert!(stats.trivial_move);
		}
	}

	let current = vs.current();
	assert_eq!(current.num_level_files(1), 4);
	assert_eq!(current.num_level_files(2), 16);
	assert!(vs.being_compacted_files().is_empty());
	assert!(vs.running_compactions().is_empty());
}

#[test]
fn pool_runs_a_manual_merge() {
	let env = TestEnv::new(
		Options::default()
			.with_num_levels(3)
			.with_compaction_threads(2)
			.with_compression(CompressionSelector::uniform(CompressionType::Lz4)),
	);
	let newer = (0..50).map(|i| (ikey(&format!("u{i:03}"), 100 + i), b"newer".to_vec())).collect();
	let older = (0..50).map(|i| (ikey(&format!("u{i:03}"), 1 + i), b"older".to_vec())).collect();
	env.install(vec![(1, newer), (2, older)]).unwrap();

	let pool = CompactionPool::new(Arc::clone(&env.vs)).unwrap();
	let task = pool.schedule_range(1, 2, None, None).unwrap().unwrap();
	let stats = block_on(task).unwrap();
	assert_eq!(stats.entries_written, 50);
	assert_eq!(stats.shadowed_dropped, 50);
	assert_eq!(stats.output_files, 1);

	let entries = env.read_level(2).unwrap();
	assert_eq!(entries.len(), 50);
	assert!(entries.iter().all(|(_, v)| v == b"newer"));
	assert!(pool.schedule_range(1, 2, None, None).unwrap().is_none());
}

#[test]
fn spawned_work_runs_on_the_pool() -> Result<()> {
	let vs = crowded_level_one(Options::default().with_compaction_threads(2));
	let pool = CompactionPool::new(vs)?;

	let tasks: Vec<_> =
		(0..16u64).map(|i| pool.spawn(async move { i * 2 })).collect::<Result<_>>()?;
	let total: u64 = tasks.into_iter().map(block_on).sum();
	assert_eq!(total, (0..16u64).map(|i| i * 2).sum());
	Ok(())
}

#[test]
fn shut_down_pool_rejects_work() {
	let vs = crowded_level_one(Options::default());
	let mut pool = CompactionPool::new(Arc::clone(&vs)).unwrap();
	pool.shutdown();

	assert!(matches!(pool.schedule_compaction(), Err(Error::Abort)));
	assert!(matches!(pool.spawn(async {}), Err(Error::Abort)));
	assert!(vs.being_compacted_files().is_empty());
}
