#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::tempdir;
use tessera::primitives::io::{FaultInjector, FaultyIoProvider};
use tessera::{BeginFlags, CommitFlags, Result, Store, StoreOptions};

fn open_counted(dir: &std::path::Path, options: StoreOptions) -> Result<(Store, Arc<FaultInjector>)> {
    let faults = FaultInjector::new();
    let store = Store::open_with_io(
        dir,
        options,
        Arc::new(FaultyIoProvider::new(Arc::clone(&faults))),
    )?;
    Ok((store, faults))
}

#[test]
fn concurrent_commits_share_fsyncs() -> Result<()> {
    const WRITERS: usize = 100;
    let dir = tempdir()?;
    let (store, faults) = open_counted(
        dir.path(),
        StoreOptions {
            group_commit_max_wait_ms: 2,
            ..StoreOptions::default()
        },
    )?;
    let start = Barrier::new(WRITERS);
    let before = faults.sync_count();

    thread::scope(|scope| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let store = &store;
                let start = &start;
                scope.spawn(move || -> Result<()> {
                    let txn = store.begin(BeginFlags::empty())?;
                    txn.put(format!("writer-{w:03}").as_bytes(), b"done")?;
                    start.wait();
                    txn.commit()
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread")?;
        }
        Ok::<_, tessera::TesseraError>(())
    })?;

    let syncs = faults.sync_count() - before;
    assert!(syncs >= 1);
    assert!(syncs < WRITERS as u64, "{syncs} fsyncs for {WRITERS} commits");

    let reader = store.begin(BeginFlags::READ_ONLY)?;
    assert_eq!(reader.cursor()?.count(), WRITERS);
    reader.commit()?;
    let stats = store.stats();
    assert!(stats.wal.durable_lsn <= stats.wal.next_lsn);
    assert!(stats.wal.fsyncs >= syncs);
    store.close()
}

#[test]
fn synced_commit_forces_an_fsync() -> Result<()> {
    let dir = tempdir()?;
    let (store, faults) = open_counted(dir.path(), StoreOptions::default())?;
    let before = faults.sync_count();
    let txn = store.begin(BeginFlags::empty())?;
    txn.put(b"k", b"v")?;
    txn.commit()?;
    assert!(faults.sync_count() > before);
    assert!(store.stats().wal.durable_lsn > tessera::Lsn::ZERO);
    store.close()
}

#[test]
fn commit_without_writes_is_still_durable() -> Result<()> {
    let dir = tempdir()?;
    let (store, faults) = open_counted(dir.path(), StoreOptions::default())?;
    let before = faults.sync_count();
    let txn = store.begin(BeginFlags::empty())?;
    txn.commit()?;
    assert!(faults.sync_count() > before);
    let wal = store.stats().wal;
    assert_eq!(wal.durable_lsn, wal.next_lsn);
    store.close()
}

#[test]
fn unsynced_commits_skip_the_fsync() -> Result<()> {
    let dir = tempdir()?;
    let (store, faults) = open_counted(dir.path(), StoreOptions::default())?;
    let before = faults.sync_count();
    let txn = store.begin(BeginFlags::empty())?;
    txn.put(b"k", b"v")?;
    txn.commit_with(CommitFlags::NO_SYNC)?;

    let reader = store.begin(BeginFlags::READ_ONLY)?;
    assert_eq!(reader.get(b"k")?, b"v");
    reader.commit()?;
    assert_eq!(faults.sync_count(), before);
    drop(store);

    let (store, faults) = open_counted(
        dir.path(),
        StoreOptions {
            sync_on_commit: false,
            ..StoreOptions::default()
        },
    )?;
    let before = faults.sync_count();
    for n in 0..10u8 {
        let txn = store.begin(BeginFlags::empty())?;
        txn.put(&[n], b"v")?;
        txn.commit()?;
    }
    assert_eq!(faults.sync_count(), before);
    store.close()
}

#[test]
fn read_only_commits_touch_nothing() -> Result<()> {
    let dir = tempdir()?;
    let (store, faults) = open_counted(dir.path(), StoreOptions::default())?;
    let writes = faults.write_count();
    let syncs = faults.sync_count();
    let before = store.stats().wal.next_lsn;
    let txn = store.begin(BeginFlags::READ_ONLY)?;
    assert!(txn.get(b"absent").is_err());
    txn.commit()?;
    assert_eq!(store.stats().wal.next_lsn, before);
    assert_eq!(faults.write_count(), writes);
    assert_eq!(faults.sync_count(), syncs);
    store.close()
}
