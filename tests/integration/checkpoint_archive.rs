#![allow(missing_docs)]

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use tessera::primitives::wal::{parse_log_file_name, LOG_DIR};
use tessera::{BeginFlags, Result, Store, StoreOptions};

fn small_log_options() -> StoreOptions {
    StoreOptions {
        log_rollover_size: 64 << 10,
        ..StoreOptions::default()
    }
}

fn fill(store: &Store, batch: u32) -> Result<()> {
    let payload = vec![b'x'; 900];
    for round in 0..8 {
        let txn = store.begin(BeginFlags::empty())?;
        for n in 0..20u32 {
            let key = format!("{batch:02}-{round:02}-{n:03}");
            txn.put(key.as_bytes(), &payload)?;
        }
        txn.commit()?;
    }
    Ok(())
}

fn log_file_count(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir.join(LOG_DIR))? {
        if entry?.file_name().to_str().and_then(parse_log_file_name).is_some() {
            count += 1;
        }
    }
    Ok(count)
}

#[test]
fn archive_waits_for_two_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_log_options())?;
    fill(&store, 0)?;
    assert!(store.archive(false)?.files.is_empty());

    store.checkpoint()?;
    let report = store.archive(false)?;
    assert!(report.files.is_empty(), "{report:?}");
    store.close()
}

#[test]
fn archive_removes_files_below_the_recovery_start() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_log_options())?;
    fill(&store, 0)?;
    store.checkpoint()?;
    fill(&store, 1)?;
    let second = store.checkpoint()?;
    fill(&store, 2)?;
    store.checkpoint()?;

    let files_before = log_file_count(dir.path())?;
    assert!(files_before > 2, "expected rollover, found {files_before} files");

    let preview = store.archive(true)?;
    assert!(!preview.removed);
    assert!(!preview.files.is_empty());
    assert_eq!(log_file_count(dir.path())?, files_before);

    let report = store.archive(false)?;
    assert!(report.removed);
    assert_eq!(report.files, preview.files);
    assert!(report.cutoff >= second.begin);
    assert!(report.files.iter().all(|path| !path.exists()));
    assert_eq!(log_file_count(dir.path())?, files_before - report.files.len());

    let stats = store.stats();
    assert_eq!(stats.checkpoints, 3);
    assert!(stats.wal.first_lsn.file() > 1);
    drop(store);

    let store = Store::open(dir.path(), small_log_options())?;
    let txn = store.begin(BeginFlags::READ_ONLY)?;
    let rows = txn.cursor()?.count();
    assert_eq!(rows, 3 * 8 * 20);
    txn.commit()?;
    store.close()
}

#[test]
fn archive_keeps_records_of_open_transactions() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_log_options())?;
    let long_running = store.begin(BeginFlags::empty())?;
    long_running.put(b"early", b"1")?;
    fill(&store, 0)?;
    store.checkpoint()?;
    fill(&store, 1)?;
    store.checkpoint()?;

    let report = store.archive(false)?;
    let active = store.active_transactions();
    assert_eq!(active.len(), 1);
    assert!(report.cutoff <= active[0].first_lsn);
    long_running.abort()?;
    store.close()
}

#[test]
fn checkpoint_writes_back_dirty_pages() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    fill(&store, 0)?;
    let first = store.checkpoint()?;
    assert!(first.pages_written > 0);
    assert_eq!(first.active, 0);
    let idle = store.checkpoint()?;
    assert_eq!(idle.pages_written, 0);
    assert_eq!(idle.prev_end, first.end);
    for (name, check) in store.verify() {
        assert!(check.problems.is_empty(), "{name}: {:?}", check.problems);
        assert!(check.records > 0 || name != "main");
    }
    store.close()
}

#[test]
fn background_checkpointer_runs_on_interval() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(
        dir.path(),
        StoreOptions {
            checkpoint_interval: 1,
            ..StoreOptions::default()
        },
    )?;
    fill(&store, 0)?;
    let deadline = Instant::now() + Duration::from_secs(10);
    while store.stats().checkpoints == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert!(store.stats().checkpoints >= 1);
    assert!(store.stats().last_checkpoint.is_some());
    store.close()
}
