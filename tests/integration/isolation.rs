#![allow(missing_docs)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use tessera::primitives::concurrency::FairRwLock;
use tessera::types::ErrorKind;
use tessera::{BeginFlags, Result, Store, StoreOptions};

fn seeded_store(dir: &std::path::Path) -> Result<Store> {
    let store = Store::open(dir, StoreOptions::default())?;
    let txn = store.begin(BeginFlags::empty())?;
    txn.put(b"a", b"1")?;
    txn.put(b"b", b"1")?;
    txn.commit()?;
    Ok(store)
}

#[test]
fn snapshot_ignores_later_commits() -> Result<()> {
    let dir = tempdir()?;
    let store = seeded_store(dir.path())?;
    let snap = store.begin(BeginFlags::SNAPSHOT | BeginFlags::READ_ONLY)?;
    let current = store.begin(BeginFlags::READ_ONLY)?;

    let writer = store.begin(BeginFlags::empty())?;
    writer.put(b"a", b"2")?;
    writer.del(b"b")?;
    writer.put(b"c", b"2")?;
    writer.commit()?;

    assert_eq!(snap.get(b"a")?, b"1");
    assert_eq!(snap.get(b"b")?, b"1");
    assert_eq!(snap.get(b"c").unwrap_err().kind(), ErrorKind::NotFound);
    let snap_rows = snap.cursor()?.collect::<Result<Vec<_>>>()?;
    assert_eq!(
        snap_rows,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"1".to_vec())
        ]
    );

    assert_eq!(current.get(b"a")?, b"2");
    assert_eq!(current.get(b"b").unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(current.get(b"c")?, b"2");

    snap.commit()?;
    current.commit()?;
    store.close()
}

#[test]
fn uncommitted_writes_stay_private() -> Result<()> {
    let dir = tempdir()?;
    let store = seeded_store(dir.path())?;
    let writer = store.begin(BeginFlags::empty())?;
    writer.put(b"c", b"pending")?;

    let reader = store.begin(BeginFlags::READ_ONLY)?;
    assert_eq!(reader.get(b"c").unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(writer.get(b"c")?, b"pending");
    writer.commit()?;
    assert_eq!(reader.get(b"c")?, b"pending");
    reader.commit()?;
    store.close()
}

#[test]
fn cursor_is_stable_while_others_commit() -> Result<()> {
    let dir = tempdir()?;
    let store = seeded_store(dir.path())?;
    let reader = store.begin(BeginFlags::READ_ONLY)?;
    let mut cursor = reader.cursor()?;
    let first = cursor.next().transpose()?;
    assert_eq!(first, Some((b"a".to_vec(), b"1".to_vec())));

    let writer = store.begin(BeginFlags::empty())?;
    writer.put(b"b", b"changed")?;
    writer.put(b"bb", b"new")?;
    writer.commit()?;

    let rest = cursor.collect::<Result<Vec<_>>>()?;
    assert_eq!(rest, vec![(b"b".to_vec(), b"1".to_vec())]);
    reader.commit()?;
    store.close()
}

#[test]
fn conflicting_writer_times_out() -> Result<()> {
    let dir = tempdir()?;
    let store = seeded_store(dir.path())?;
    let holder = store.begin(BeginFlags::empty())?;
    holder.put(b"a", b"held")?;

    let waiter = store.begin(BeginFlags::empty())?;
    waiter.set_lock_timeout(Duration::from_millis(50));
    assert_eq!(
        waiter.put(b"a", b"blocked").unwrap_err().kind(),
        ErrorKind::LockTimeout
    );
    waiter.put(b"b", b"free")?;
    waiter.commit()?;
    holder.commit()?;

    let reader = store.begin(BeginFlags::empty())?;
    assert_eq!(reader.get(b"a")?, b"held");
    assert_eq!(reader.get(b"b")?, b"free");
    reader.commit()?;
    store.close()
}

#[test]
fn blocked_writer_proceeds_after_commit() -> Result<()> {
    let dir = tempdir()?;
    let store = seeded_store(dir.path())?;
    let holder = store.begin(BeginFlags::empty())?;
    holder.put(b"a", b"first")?;

    thread::scope(|scope| -> Result<()> {
        let waiter = scope.spawn(|| -> Result<()> {
            let txn = store.begin(BeginFlags::empty())?;
            txn.put(b"a", b"second")?;
            txn.commit()
        });
        thread::sleep(Duration::from_millis(50));
        holder.commit()?;
        waiter.join().expect("waiter thread")
    })?;

    let reader = store.begin(BeginFlags::empty())?;
    assert_eq!(reader.get(b"a")?, b"second");
    reader.commit()?;
    store.close()
}

#[test]
fn readers_queue_behind_waiting_writer() {
    let lock = Arc::new(FairRwLock::new(()));
    let order = Arc::new(Mutex::new(Vec::new()));
    let held = lock.write();

    let spawn = |name: &'static str, write: bool, lock: &Arc<FairRwLock<()>>| {
        let lock = Arc::clone(lock);
        let order = Arc::clone(&order);
        thread::spawn(move || {
            if write {
                let _guard = lock.write();
                order.lock().unwrap().push(name);
                thread::sleep(Duration::from_millis(20));
            } else {
                let _guard = lock.read();
                order.lock().unwrap().push(name);
            }
        })
    };
    let wait_queued = |n: usize| {
        while lock.queued() < n {
            thread::sleep(Duration::from_millis(1));
        }
    };

    let b = spawn("B", false, &lock);
    wait_queued(1);
    let c = spawn("C", true, &lock);
    wait_queued(2);
    let d = spawn("D", false, &lock);
    wait_queued(3);
    drop(held);

    for handle in [b, c, d] {
        handle.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["B", "C", "D"]);
}
