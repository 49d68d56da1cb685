#![allow(missing_docs)]

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use tempfile::tempdir;
use tessera::types::ErrorKind;
use tessera::{BeginFlags, PutFlags, Result, Store, StoreOptions, TableId, TxnState};

fn key(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

fn value(n: i64) -> [u8; 8] {
    n.to_be_bytes()
}

#[test]
fn put_get_del_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = Store::open(dir.path(), StoreOptions::default())?;
        let txn = store.begin(BeginFlags::empty())?;
        txn.put(&key(4), &value(10))?;
        txn.put(&key(1), &value(11))?;
        txn.put(&key(2), &value(12))?;
        assert_eq!(txn.get(&key(2))?, value(12));
        txn.del(&key(1))?;
        assert_eq!(txn.get(&key(1)).unwrap_err().kind(), ErrorKind::NotFound);
        txn.commit()?;
        store.close()?;
    }

    let store = Store::open(dir.path(), StoreOptions::default())?;
    let reader = store.begin(BeginFlags::READ_ONLY)?;
    assert_eq!(reader.get(&key(2))?, value(12));
    assert_eq!(reader.get(&key(4))?, value(10));
    assert_eq!(reader.get(&key(1)).unwrap_err().kind(), ErrorKind::NotFound);
    reader.commit()?;
    store.close()
}

#[test]
fn abort_restores_prior_state() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let seed = store.begin(BeginFlags::empty())?;
    seed.put(b"kept", b"before")?;
    seed.put(b"gone", b"before")?;
    seed.commit()?;

    let txn = store.begin(BeginFlags::empty())?;
    txn.put(b"kept", b"after")?;
    txn.del(b"gone")?;
    txn.put(b"fresh", b"after")?;
    assert_eq!(txn.state(), TxnState::Active);
    txn.abort()?;

    let reader = store.begin(BeginFlags::empty())?;
    assert_eq!(reader.get(b"kept")?, b"before");
    assert_eq!(reader.get(b"gone")?, b"before");
    assert_eq!(reader.get(b"fresh").unwrap_err().kind(), ErrorKind::NotFound);
    reader.commit()?;
    store.close()
}

#[test]
fn dropped_handle_aborts() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    {
        let txn = store.begin(BeginFlags::empty())?;
        txn.put(b"k", b"v")?;
    }
    assert!(store.active_transactions().is_empty());
    let reader = store.begin(BeginFlags::empty())?;
    assert_eq!(reader.get(b"k").unwrap_err().kind(), ErrorKind::NotFound);
    reader.commit()?;
    store.close()
}

#[test]
fn no_overwrite_and_missing_deletes() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let txn = store.begin(BeginFlags::empty())?;
    txn.put_with(TableId::MAIN, b"k", b"1", PutFlags::NO_OVERWRITE)?;
    let err = txn
        .put_with(TableId::MAIN, b"k", b"2", PutFlags::NO_OVERWRITE)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(txn.del(b"absent").unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(txn.get(b"k")?, b"1");
    txn.commit()?;
    store.close()
}

#[test]
fn read_only_transactions_reject_writes() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let txn = store.begin(BeginFlags::READ_ONLY)?;
    assert_eq!(txn.put(b"k", b"v").unwrap_err().kind(), ErrorKind::ReadOnlyViolation);
    assert_eq!(txn.del(b"k").unwrap_err().kind(), ErrorKind::ReadOnlyViolation);
    txn.commit()?;
    store.close()?;

    let store = Store::open(dir.path(), StoreOptions::default().read_only())?;
    let txn = store.begin(BeginFlags::empty())?;
    assert_eq!(txn.put(b"k", b"v").unwrap_err().kind(), ErrorKind::ReadOnlyViolation);
    drop(txn);
    store.close()
}

#[test]
fn tables_are_independent() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let orders = store.create_table("orders")?;
    assert_eq!(
        store.create_table("orders").unwrap_err().kind(),
        ErrorKind::AlreadyExists
    );
    let txn = store.begin(BeginFlags::empty())?;
    txn.put_in(orders, b"k", b"order")?;
    txn.put(b"k", b"main")?;
    txn.commit()?;
    store.close()?;

    let store = Store::open(dir.path(), StoreOptions::default())?;
    let orders = store.table_id("orders")?;
    let txn = store.begin(BeginFlags::empty())?;
    assert_eq!(txn.get_in(orders, b"k")?, b"order");
    assert_eq!(txn.get(b"k")?, b"main");
    assert_eq!(
        txn.get_in(TableId(99), b"k").unwrap_err().kind(),
        ErrorKind::BadArgument
    );
    txn.commit()?;
    store.close()
}

#[test]
fn cursor_merges_own_writes_in_key_order() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let seed = store.begin(BeginFlags::empty())?;
    for n in [1u32, 3, 5] {
        seed.put(&key(n), &value(n as i64))?;
    }
    seed.commit()?;

    let txn = store.begin(BeginFlags::empty())?;
    txn.put(&key(2), &value(2))?;
    txn.del(&key(3))?;
    txn.put(&key(5), &value(50))?;
    let rows = txn.cursor()?.collect::<Result<Vec<_>>>()?;
    let expected: Vec<(Vec<u8>, Vec<u8>)> = [(1u32, 1i64), (2, 2), (5, 50)]
        .iter()
        .map(|(k, v)| (key(*k).to_vec(), value(*v).to_vec()))
        .collect();
    assert_eq!(rows, expected);
    txn.commit()?;
    store.close()
}

#[test]
fn oversized_rows_are_bad_arguments() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let txn = store.begin(BeginFlags::empty())?;
    let huge = vec![0u8; 64 * 1024];
    assert_eq!(txn.put(b"k", &huge).unwrap_err().kind(), ErrorKind::BadArgument);
    txn.abort()?;
    store.close()
}

#[test]
fn random_workload_matches_model_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x7e55_e7a);
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    {
        let store = Store::open(dir.path(), StoreOptions::default())?;
        for _ in 0..40 {
            let txn = store.begin(BeginFlags::empty())?;
            let mut pending = model.clone();
            for _ in 0..rng.gen_range(1..20) {
                let k = key(rng.gen_range(0..64)).to_vec();
                if rng.gen_bool(0.25) {
                    if pending.remove(&k).is_some() {
                        txn.del(&k)?;
                    }
                } else {
                    let len = rng.gen_range(0..200);
                    let v: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    txn.put(&k, &v)?;
                    pending.insert(k, v);
                }
            }
            if rng.gen_bool(0.8) {
                txn.commit()?;
                model = pending;
            } else {
                txn.abort()?;
            }
        }
        store.close()?;
    }

    let store = Store::open(dir.path(), StoreOptions::default())?;
    let txn = store.begin(BeginFlags::READ_ONLY)?;
    let rows: BTreeMap<Vec<u8>, Vec<u8>> = txn.cursor()?.collect::<Result<_>>()?;
    assert_eq!(rows, model);
    txn.commit()?;
    for (name, check) in store.verify() {
        assert!(check.problems.is_empty(), "{name}: {:?}", check.problems);
    }
    store.close()
}
