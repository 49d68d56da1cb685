#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{abort, Command};

use tempfile::tempdir;
use tessera::primitives::wal::{parse_log_file_name, LOG_DIR};
use tessera::types::ErrorKind;
use tessera::{BeginFlags, CommitFlags, Result, Store, StoreOptions};

const CRASH_DIR_ENV: &str = "TESSERA_CRASH_DIR";

fn key(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

fn insert_range(store: &Store, range: std::ops::Range<u32>) -> Result<()> {
    let txn = store.begin(BeginFlags::empty())?;
    for n in range {
        txn.put(&key(n), format!("value-{n}").as_bytes())?;
    }
    txn.commit()
}

fn contents(store: &Store) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let txn = store.begin(BeginFlags::READ_ONLY)?;
    let rows = txn.cursor()?.collect::<Result<_>>()?;
    txn.commit()?;
    Ok(rows)
}

#[test]
fn recovery_starts_at_the_earlier_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let (first, second, before_crash) = {
        let store = Store::open(dir.path(), StoreOptions::default())?;
        insert_range(&store, 0..100)?;
        let first = store.checkpoint()?;
        insert_range(&store, 100..150)?;
        let second = store.checkpoint()?;
        assert_eq!(second.prev_end, first.end);
        insert_range(&store, 150..160)?;
        let txn = store.begin(BeginFlags::empty())?;
        txn.del(&key(3))?;
        txn.put(&key(7), b"rewritten")?;
        txn.commit()?;
        let rows = contents(&store)?;
        drop(store);
        (first, second, rows)
    };

    let store = Store::open(dir.path(), StoreOptions::default())?;
    let report = store.recovery_report();
    assert_eq!(report.last_checkpoint, Some(second.end));
    assert_eq!(report.scan_start, first.begin);
    assert!(report.committed >= 3);
    assert_eq!(report.unfinished, 0);
    assert_eq!(contents(&store)?, before_crash);
    store.close()
}

fn overwrite_table_bytes(dir: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(dir.join("main.tbl"))?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn checkpointed_store(dir: &Path) -> Result<u64> {
    let store = Store::open(dir, StoreOptions::default())?;
    insert_range(&store, 0..10)?;
    store.checkpoint()?;
    store.checkpoint()?;
    let pages = store.data_pages(store.table_id("main")?)?;
    assert!(pages.contains(&2), "{pages:?}");
    store.close()?;
    Ok(StoreOptions::default().page_size as u64)
}

#[test]
fn zeroed_data_page_is_reported_not_recreated() -> Result<()> {
    let dir = tempdir()?;
    let page_size = checkpointed_store(dir.path())?;
    overwrite_table_bytes(dir.path(), 2 * page_size, &vec![0u8; page_size as usize])?;

    let err = Store::open(dir.path(), StoreOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    assert!(err.to_string().contains("page 2"), "{err}");
    Ok(())
}

#[test]
fn truncated_table_file_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let page_size = checkpointed_store(dir.path())?;
    let file = OpenOptions::new().write(true).open(dir.path().join("main.tbl"))?;
    file.set_len(2 * page_size + page_size / 2)?;
    drop(file);

    let err = Store::open(dir.path(), StoreOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    Ok(())
}

#[test]
fn unsynced_commits_reach_the_log_on_drop() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = Store::open(dir.path(), StoreOptions::default())?;
        let txn = store.begin(BeginFlags::empty())?;
        txn.put(b"lazy", b"1")?;
        txn.commit_with(CommitFlags::NO_SYNC)?;
    }
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let txn = store.begin(BeginFlags::READ_ONLY)?;
    assert_eq!(txn.get(b"lazy")?, b"1");
    txn.commit()?;
    store.close()
}

#[test]
fn transaction_ids_keep_increasing_across_restarts() -> Result<()> {
    let dir = tempdir()?;
    let last = {
        let store = Store::open(dir.path(), StoreOptions::default())?;
        insert_range(&store, 0..3)?;
        let txn = store.begin(BeginFlags::empty())?;
        let id = txn.id();
        txn.put(b"x", b"y")?;
        txn.commit()?;
        id
    };
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let txn = store.begin(BeginFlags::empty())?;
    assert!(txn.id() > last, "{} should follow {}", txn.id(), last);
    txn.abort()?;
    store.close()
}

#[test]
fn resetting_broadcast_replay_needs_the_callback() -> Result<()> {
    fn double_key(key: &[u8], _old: Option<&[u8]>, _extra: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(Some([key, key].concat()))
    }
    let dir = tempdir()?;
    {
        let store = Store::open(
            dir.path(),
            StoreOptions::default().with_update_callback(double_key),
        )?;
        insert_range(&store, 0..20)?;
        let txn = store.begin(BeginFlags::empty())?;
        txn.update_broadcast(b"", true)?;
        txn.commit()?;
    }

    let err = Store::open(dir.path(), StoreOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadArgument);

    let store = Store::open(
        dir.path(),
        StoreOptions::default().with_update_callback(double_key),
    )?;
    let rows = contents(&store)?;
    assert_eq!(rows.len(), 20);
    for (k, v) in rows {
        assert_eq!(v, [k.as_slice(), k.as_slice()].concat());
    }
    store.close()
}

#[test]
fn read_only_open_sees_recovered_state_without_writing() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = Store::open(dir.path(), StoreOptions::default())?;
        insert_range(&store, 0..10)?;
    }
    let before: Vec<_> = log_files(dir.path())?;
    let store = Store::open(dir.path(), StoreOptions::default().read_only())?;
    assert_eq!(contents(&store)?.len(), 10);
    assert_eq!(
        store.checkpoint().unwrap_err().kind(),
        ErrorKind::ReadOnlyViolation
    );
    store.close()?;
    assert_eq!(log_files(dir.path())?, before);
    Ok(())
}

fn log_files(dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir.join(LOG_DIR))? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_str().and_then(parse_log_file_name).is_some() {
            files.push((entry.path(), entry.metadata()?.len()));
        }
    }
    files.sort();
    Ok(files)
}

#[test]
fn killed_process_recovers_committed_work_only() -> Result<()> {
    let dir = tempdir()?;
    let status = Command::new(std::env::current_exe()?)
        .env(CRASH_DIR_ENV, dir.path())
        .args(["--ignored", "--exact", "crash_child_abort_mid_transaction"])
        .status()?;
    assert!(!status.success(), "child should abort");

    let store = Store::open(dir.path(), StoreOptions::default())?;
    let report = store.recovery_report();
    assert_eq!(report.unfinished, 1);
    assert!(report.committed >= 2);
    let txn = store.begin(BeginFlags::READ_ONLY)?;
    assert_eq!(txn.get(b"committed")?, b"yes");
    assert_eq!(txn.get(b"shared")?, b"committed");
    assert_eq!(txn.get(b"open").unwrap_err().kind(), ErrorKind::NotFound);
    txn.commit()?;
    drop(store);

    // The rollback was logged, so a second recovery has nothing left to undo.
    let store = Store::open(dir.path(), StoreOptions::default())?;
    assert_eq!(store.recovery_report().unfinished, 0);
    store.close()
}

#[test]
#[ignore]
fn crash_child_abort_mid_transaction() -> Result<()> {
    let Some(dir) = std::env::var_os(CRASH_DIR_ENV) else {
        return Ok(());
    };
    let store = Store::open(PathBuf::from(dir), StoreOptions::default())?;
    let seed = store.begin(BeginFlags::empty())?;
    seed.put(b"shared", b"committed")?;
    seed.commit()?;

    let open = store.begin(BeginFlags::empty())?;
    open.put(b"open", b"never committed")?;

    let done = store.begin(BeginFlags::empty())?;
    done.put(b"committed", b"yes")?;
    // The synced commit drains the open transaction's records too.
    done.commit()?;
    abort();
}
