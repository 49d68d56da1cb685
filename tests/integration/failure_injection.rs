#![allow(missing_docs)]

use std::sync::Arc;

use tempfile::tempdir;
use tessera::primitives::io::{FaultInjector, FaultyIoProvider};
use tessera::types::ErrorKind;
use tessera::{BeginFlags, Result, Store, StoreOptions, TxnState};

fn open_faulty(dir: &std::path::Path) -> Result<(Store, Arc<FaultInjector>)> {
    let faults = FaultInjector::new();
    let store = Store::open_with_io(
        dir,
        StoreOptions::default(),
        Arc::new(FaultyIoProvider::new(Arc::clone(&faults))),
    )?;
    Ok((store, faults))
}

#[test]
fn failed_log_write_panics_the_store() -> Result<()> {
    let dir = tempdir()?;
    {
        let (store, faults) = open_faulty(dir.path())?;
        let txn = store.begin(BeginFlags::empty())?;
        txn.put(b"before", b"1")?;
        txn.commit()?;

        faults.fail_writes(true);
        let txn = store.begin(BeginFlags::empty())?;
        txn.put(b"lost", b"1")?;
        let err = txn.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Panicked);
        assert!(store.is_panicked());
        assert!(store.stats().panicked);

        faults.fail_writes(false);
        for err in [
            store.begin(BeginFlags::empty()).unwrap_err(),
            store.begin(BeginFlags::READ_ONLY).unwrap_err(),
            store.checkpoint().unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::Panicked);
        }
    }

    let store = Store::open(dir.path(), StoreOptions::default())?;
    assert!(!store.is_panicked());
    let txn = store.begin(BeginFlags::READ_ONLY)?;
    assert_eq!(txn.get(b"before")?, b"1");
    assert_eq!(txn.get(b"lost").unwrap_err().kind(), ErrorKind::NotFound);
    txn.commit()?;
    store.close()
}

#[test]
fn failed_fsync_is_sticky() -> Result<()> {
    let dir = tempdir()?;
    let (store, faults) = open_faulty(dir.path())?;
    let open = store.begin(BeginFlags::empty())?;
    open.put(b"pending", b"1")?;

    faults.fail_syncs(true);
    let txn = store.begin(BeginFlags::empty())?;
    txn.put(b"k", b"v")?;
    assert_eq!(txn.commit().unwrap_err().kind(), ErrorKind::Panicked);

    faults.fail_syncs(false);
    assert_eq!(open.get(b"pending").unwrap_err().kind(), ErrorKind::Panicked);
    assert_eq!(open.put(b"other", b"1").unwrap_err().kind(), ErrorKind::Panicked);
    assert_eq!(open.state(), TxnState::Active);
    drop(open);
    assert!(store.is_panicked());
    Ok(())
}

#[test]
fn failed_page_write_during_checkpoint_panics() -> Result<()> {
    let dir = tempdir()?;
    {
        let (store, faults) = open_faulty(dir.path())?;
        let txn = store.begin(BeginFlags::empty())?;
        for n in 0..50u32 {
            txn.put(&n.to_be_bytes(), b"committed before the failure")?;
        }
        txn.commit()?;

        faults.fail_writes(true);
        assert_eq!(store.checkpoint().unwrap_err().kind(), ErrorKind::Panicked);
        assert!(store.is_panicked());
    }

    let store = Store::open(dir.path(), StoreOptions::default())?;
    let txn = store.begin(BeginFlags::READ_ONLY)?;
    assert_eq!(txn.cursor()?.count(), 50);
    txn.commit()?;
    store.close()
}

#[test]
fn second_open_of_a_locked_directory_fails() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let err = Store::open(dir.path(), StoreOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadArgument);
    store.close()?;
    Store::open(dir.path(), StoreOptions::default())?.close()
}
