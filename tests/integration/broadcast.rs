#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::tempdir;
use tessera::types::ErrorKind;
use tessera::{BeginFlags, Result, Store, StoreOptions, TesseraError, UpdateCallback};

const ROWS: u32 = 100;

fn key(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

fn decode(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    i64::from_be_bytes(raw)
}

fn key_index(key: &[u8]) -> i64 {
    <[u8; 4]>::try_from(key).map_or(0, |raw| i64::from(u32::from_be_bytes(raw)))
}

/// `v -> v * v * (i + 4)`, failing on the key named by `extra` when present.
fn square_scale(key: &[u8], old: Option<&[u8]>, extra: &[u8]) -> Result<Option<Vec<u8>>> {
    if !extra.is_empty() && extra == key {
        return Err(TesseraError::BadArgument("refusing this row".into()));
    }
    let v = old.map(decode).unwrap_or_default();
    let i = key_index(key);
    Ok(Some((v * v * (i + 4)).to_be_bytes().to_vec()))
}

type Callback = fn(&[u8], Option<&[u8]>, &[u8]) -> Result<Option<Vec<u8>>>;

fn seeded(dir: &std::path::Path, f: Callback) -> Result<Store> {
    let store = Store::open(dir, StoreOptions::default().with_update_callback(f))?;
    let txn = store.begin(BeginFlags::empty())?;
    for i in 0..ROWS {
        txn.put(&key(i), &(10 - i as i64).to_be_bytes())?;
    }
    txn.commit()?;
    Ok(store)
}

fn snapshot_values(store: &Store) -> Result<Vec<i64>> {
    let txn = store.begin(BeginFlags::READ_ONLY)?;
    let values = txn
        .cursor()?
        .map(|row| row.map(|(_, v)| decode(&v)))
        .collect::<Result<Vec<_>>>()?;
    txn.commit()?;
    Ok(values)
}

fn originals() -> Vec<i64> {
    (0..ROWS).map(|i| 10 - i as i64).collect()
}

#[test]
fn aborted_broadcast_preserves_originals() -> Result<()> {
    let dir = tempdir()?;
    let store = seeded(dir.path(), square_scale)?;

    let txn = store.begin(BeginFlags::empty())?;
    let summary = txn.update_broadcast(b"", false)?;
    assert_eq!(summary.visited, ROWS as usize);
    assert_eq!(summary.deleted, 0);
    for i in 0..ROWS {
        let v = 10 - i as i64;
        assert_eq!(decode(&txn.get(&key(i))?), v * v * (i as i64 + 4));
    }
    assert_eq!(snapshot_values(&store)?, originals());
    txn.abort()?;

    assert_eq!(snapshot_values(&store)?, originals());
    store.close()
}

#[test]
fn committed_broadcast_is_visible_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let expected: Vec<i64> = (0..ROWS)
        .map(|i| {
            let v = 10 - i as i64;
            v * v * (i as i64 + 4)
        })
        .collect();
    {
        let store = seeded(dir.path(), square_scale)?;
        let txn = store.begin(BeginFlags::empty())?;
        txn.update_broadcast(b"", false)?;
        txn.commit()?;
        assert_eq!(snapshot_values(&store)?, expected);
        store.close()?;
    }
    let store = Store::open(
        dir.path(),
        StoreOptions::default().with_update_callback(square_scale),
    )?;
    assert_eq!(snapshot_values(&store)?, expected);
    store.close()
}

#[test]
fn resetting_broadcast_is_idempotent() -> Result<()> {
    fn reset(key: &[u8], _old: Option<&[u8]>, extra: &[u8]) -> Result<Option<Vec<u8>>> {
        let scale = i64::from(extra[0]);
        Ok(Some((key_index(key) * scale).to_be_bytes().to_vec()))
    }
    let dir = tempdir()?;
    let store = seeded(dir.path(), reset)?;

    let once = store.begin(BeginFlags::empty())?;
    once.update_broadcast(&[3], true)?;
    once.commit()?;
    let after_once = snapshot_values(&store)?;

    let twice = store.begin(BeginFlags::empty())?;
    twice.update_broadcast(&[3], true)?;
    twice.commit()?;
    assert_eq!(snapshot_values(&store)?, after_once);
    assert_eq!(after_once, (0..ROWS).map(|i| i as i64 * 3).collect::<Vec<_>>());
    store.close()
}

#[test]
fn failing_callback_rolls_back_only_the_broadcast() -> Result<()> {
    let dir = tempdir()?;
    let store = seeded(dir.path(), square_scale)?;

    let txn = store.begin(BeginFlags::empty())?;
    txn.put(b"marker", &7i64.to_be_bytes())?;
    let err = txn.update_broadcast(&key(57), false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadArgument);
    assert_eq!(decode(&txn.get(&key(3))?), 7);
    assert_eq!(decode(&txn.get(b"marker")?), 7);
    txn.commit()?;

    let reader = store.begin(BeginFlags::empty())?;
    assert_eq!(decode(&reader.get(b"marker")?), 7);
    assert_eq!(decode(&reader.get(&key(57))?), 10 - 57);
    reader.commit()?;
    store.close()
}

#[test]
fn cancelled_broadcast_changes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let store = seeded(dir.path(), square_scale)?;
    let txn = store.begin(BeginFlags::empty())?;
    txn.cancel();
    assert!(txn.is_cancelled());
    assert_eq!(
        txn.update_broadcast(b"", false).unwrap_err().kind(),
        ErrorKind::Cancelled
    );
    txn.abort()?;
    assert_eq!(snapshot_values(&store)?, originals());
    store.close()
}

#[test]
fn callback_may_delete_rows() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let dir = tempdir()?;
    let store = seeded(dir.path(), square_scale)?;
    store.set_update_callback(UpdateCallback::new(move |key, old, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(old.filter(|_| key_index(key) % 2 == 0).map(<[u8]>::to_vec))
    }));

    let txn = store.begin(BeginFlags::empty())?;
    let summary = txn.update_broadcast(b"", false)?;
    assert_eq!(summary.deleted, ROWS as usize / 2);
    txn.commit()?;
    assert_eq!(calls.load(Ordering::SeqCst), ROWS as usize);
    assert_eq!(snapshot_values(&store)?.len(), ROWS as usize / 2);
    store.close()
}

#[test]
fn single_row_update_uses_callback() -> Result<()> {
    let dir = tempdir()?;
    let store = seeded(dir.path(), square_scale)?;
    let txn = store.begin(BeginFlags::empty())?;
    txn.update(&key(2), b"")?;
    assert_eq!(decode(&txn.get(&key(2))?), 8 * 8 * 6);
    txn.update(b"missing", b"")?;
    assert_eq!(decode(&txn.get(b"missing")?), 0);
    txn.commit()?;
    store.close()
}

#[test]
fn update_without_callback_is_bad_argument() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let txn = store.begin(BeginFlags::empty())?;
    assert_eq!(txn.update(b"k", b"").unwrap_err().kind(), ErrorKind::BadArgument);
    assert_eq!(
        txn.update_broadcast(b"", true).unwrap_err().kind(),
        ErrorKind::BadArgument
    );
    txn.abort()?;
    store.close()
}
