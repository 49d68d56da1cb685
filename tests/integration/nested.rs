#![allow(missing_docs)]

use tempfile::tempdir;
use tessera::types::ErrorKind;
use tessera::{BeginFlags, Result, Store, StoreOptions, TxnState};

#[test]
fn child_abort_restores_parent_view() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;

    let t0 = store.begin(BeginFlags::empty())?;
    t0.put(b"5", b"50")?;
    let t1 = store.begin_nested(Some(&t0), BeginFlags::empty())?;
    assert_eq!(t1.parent(), Some(t0.id()));
    t1.del(b"5")?;
    assert_eq!(t1.get(b"5").unwrap_err().kind(), ErrorKind::NotFound);
    t1.abort()?;
    assert_eq!(t0.get(b"5")?, b"50");
    t0.commit()?;

    let reader = store.begin(BeginFlags::empty())?;
    assert_eq!(reader.get(b"5")?, b"50");
    reader.commit()?;
    store.close()
}

#[test]
fn committed_child_is_undone_by_parent_abort() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let seed = store.begin(BeginFlags::empty())?;
    seed.put(b"k", b"orig")?;
    seed.commit()?;

    let parent = store.begin(BeginFlags::empty())?;
    let child = parent.begin_child(BeginFlags::empty())?;
    child.put(b"k", b"child")?;
    child.put(b"extra", b"child")?;
    child.commit()?;
    assert_eq!(parent.get(b"k")?, b"child");

    let other = store.begin(BeginFlags::empty())?;
    assert_eq!(other.get(b"k")?, b"orig");
    other.commit()?;

    parent.abort()?;
    let reader = store.begin(BeginFlags::empty())?;
    assert_eq!(reader.get(b"k")?, b"orig");
    assert_eq!(reader.get(b"extra").unwrap_err().kind(), ErrorKind::NotFound);
    reader.commit()?;
    store.close()
}

#[test]
fn child_effects_commit_with_parent_and_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = Store::open(dir.path(), StoreOptions::default())?;
        let parent = store.begin(BeginFlags::empty())?;
        parent.put(b"p", b"1")?;
        let child = parent.begin_child(BeginFlags::empty())?;
        child.put(b"c", b"2")?;
        let grandchild = child.begin_child(BeginFlags::empty())?;
        grandchild.put(b"g", b"3")?;
        grandchild.commit()?;
        child.commit()?;
        parent.commit()?;
        store.close()?;
    }
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let reader = store.begin(BeginFlags::empty())?;
    assert_eq!(reader.get(b"p")?, b"1");
    assert_eq!(reader.get(b"c")?, b"2");
    assert_eq!(reader.get(b"g")?, b"3");
    reader.commit()?;
    store.close()
}

#[test]
fn parent_is_blocked_while_child_is_active() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let parent = store.begin(BeginFlags::empty())?;
    let child = parent.begin_child(BeginFlags::empty())?;

    assert_eq!(parent.put(b"k", b"v").unwrap_err().kind(), ErrorKind::BadArgument);
    assert_eq!(
        parent.begin_child(BeginFlags::empty()).unwrap_err().kind(),
        ErrorKind::BadArgument
    );
    child.put(b"k", b"v")?;
    child.commit()?;
    parent.put(b"k2", b"v2")?;
    parent.commit()?;
    store.close()
}

#[test]
fn parent_abort_aborts_active_child() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let parent = store.begin(BeginFlags::empty())?;
    let child = parent.begin_child(BeginFlags::empty())?;
    child.put(b"k", b"v")?;
    parent.abort()?;
    assert_eq!(child.state(), TxnState::Aborted);
    assert_eq!(child.put(b"k", b"again").unwrap_err().kind(), ErrorKind::BadArgument);
    drop(child);

    let reader = store.begin(BeginFlags::empty())?;
    assert_eq!(reader.get(b"k").unwrap_err().kind(), ErrorKind::NotFound);
    reader.commit()?;
    assert!(store.active_transactions().is_empty());
    store.close()
}

#[test]
fn child_inherits_snapshot_and_read_only() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    let seed = store.begin(BeginFlags::empty())?;
    seed.put(b"k", b"old")?;
    seed.commit()?;

    let parent = store.begin(BeginFlags::SNAPSHOT)?;
    let writer = store.begin(BeginFlags::empty())?;
    writer.put(b"k", b"new")?;
    writer.commit()?;

    let child = parent.begin_child(BeginFlags::empty())?;
    assert_eq!(child.snapshot(), parent.snapshot());
    assert_eq!(child.get(b"k")?, b"old");
    child.commit()?;
    parent.commit()?;

    let reader = store.begin(BeginFlags::READ_ONLY)?;
    let child = reader.begin_child(BeginFlags::empty())?;
    assert!(child.flags().contains(BeginFlags::READ_ONLY));
    assert_eq!(child.put(b"k", b"x").unwrap_err().kind(), ErrorKind::ReadOnlyViolation);
    child.abort()?;
    reader.commit()?;
    store.close()
}
