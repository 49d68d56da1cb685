#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;
use tessera::{BeginFlags, Store, StoreOptions};

fn setup_store() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("store");
    seed_demo(&path).expect("seed demo data");
    (dir, path)
}

fn seed_demo(path: &Path) -> tessera::Result<()> {
    let store = Store::open(path, StoreOptions::default())?;
    let people = store.create_table("people")?;
    let txn = store.begin(BeginFlags::empty())?;
    txn.put(b"alice", b"engineer")?;
    txn.put(b"bob", b"designer")?;
    txn.put_in(people, b"carol", b"manager")?;
    txn.commit()?;
    let txn = store.begin(BeginFlags::empty())?;
    txn.del(b"bob")?;
    txn.commit()?;
    store.close()
}

fn json_output(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("tessera")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn open_creates_a_store() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("fresh");
    let report = json_output(&["open"], &path);
    assert_eq!(report["tables"][0][1], "main");
    assert!(path.join("main.tbl").is_file());

    let output = cargo_bin_cmd!("tessera")
        .arg("open")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("table 0: main"));
}

fn failure_stderr(args: &[&str], path: &Path) -> String {
    let output = cargo_bin_cmd!("tessera")
        .args(args)
        .arg(path)
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stderr
        .clone();
    String::from_utf8_lossy(&output).into_owned()
}

#[test]
fn stats_reports_tables_and_log() {
    let (_tmp, path) = setup_store();
    let report = json_output(&["stats"], &path);
    let tables = report["store"]["tables"].as_array().expect("tables");
    let names: Vec<&str> = tables.iter().filter_map(|t| t["name"].as_str()).collect();
    assert_eq!(names, ["main", "people"]);
    assert!(report["filesystem"]["log_bytes"].as_u64().unwrap() > 0);
    assert!(report["filesystem"]["table_bytes"].as_u64().unwrap() > 0);
    assert_eq!(report["store"]["panicked"], false);
}

#[test]
fn verify_and_checkpoint_succeed_on_a_healthy_store() {
    let (_tmp, path) = setup_store();
    let report = json_output(&["verify", "--level", "full"], &path);
    assert_eq!(report["success"], true);
    assert_eq!(report["counts"]["tables"], 2);
    assert_eq!(report["counts"]["records"], 2);
    assert!(report["counts"]["log_records"].as_u64().unwrap() > 0);

    let report = json_output(&["checkpoint"], &path);
    let begin = report["checkpoint"]["begin"].as_str().expect("begin lsn");
    assert!(begin.contains('/'));

    let report = json_output(&["recover"], &path);
    assert_eq!(report["unfinished"], 0);
    assert!(report["last_checkpoint"].is_string());
}

#[test]
fn dump_log_and_pages() {
    let (_tmp, path) = setup_store();
    let report = json_output(&["dump", "log", "--limit", "5"], &path);
    let records = report["records"].as_array().expect("records");
    assert_eq!(records.len(), 5);
    assert_eq!(report["truncated"], true);
    assert_eq!(records[0]["kind"], "BEGIN");

    let report = json_output(&["dump", "log"], &path);
    let kinds: Vec<&str> = report["records"]
        .as_array()
        .expect("records")
        .iter()
        .filter_map(|r| r["kind"].as_str())
        .collect();
    assert!(kinds.contains(&"PUT"));
    assert!(kinds.contains(&"DELETE"));
    assert!(kinds.contains(&"CHECKPOINT_END"));

    let report = json_output(&["dump", "pages", "--table", "people"], &path);
    assert_eq!(report["table"], "people");
    let rows = report["pages"][0]["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][2], hex::encode("carol"));
    assert_eq!(rows[0][3], hex::encode("manager"));
}

#[test]
fn archive_dry_run_lists_nothing_for_a_young_store() {
    let (_tmp, path) = setup_store();
    let report = json_output(&["archive", "--dry-run"], &path);
    assert_eq!(report["removed"], false);
    assert!(report["files"].as_array().expect("files").is_empty());
}

#[test]
fn missing_store_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let stderr = failure_stderr(&["stats"], &dir.path().join("nowhere"));
    assert!(stderr.contains("error: not_found: store not found"), "{stderr}");
}

#[test]
fn bad_arguments_are_reported() {
    let (_tmp, path) = setup_store();
    let stderr = failure_stderr(&["dump", "log", "--from", "nonsense"], &path);
    assert!(stderr.contains("error: bad_argument:"), "{stderr}");
    let stderr = failure_stderr(&["dump", "pages", "--table", "absent"], &path);
    assert!(stderr.contains("error: bad_argument: no table named"), "{stderr}");
}

#[test]
fn corrupted_page_fails_verification() {
    let (_tmp, path) = setup_store();
    let page_size = StoreOptions::default().page_size as u64;
    let mut file = OpenOptions::new()
        .write(true)
        .open(path.join("main.tbl"))
        .expect("open table file");
    file.seek(SeekFrom::Start(2 * page_size + 200)).expect("seek");
    file.write_all(&[0xA5; 64]).expect("scribble");
    drop(file);

    let stderr = failure_stderr(&["verify", "--level", "fast"], &path);
    assert!(stderr.contains("error: corrupt:"), "{stderr}");
}

#[test]
fn zeroed_page_fails_verification() {
    let (_tmp, path) = setup_store();
    let page_size = StoreOptions::default().page_size as usize;
    let mut file = OpenOptions::new()
        .write(true)
        .open(path.join("main.tbl"))
        .expect("open table file");
    file.seek(SeekFrom::Start(2 * page_size as u64)).expect("seek");
    file.write_all(&vec![0u8; page_size]).expect("zero page");
    drop(file);

    let stderr = failure_stderr(&["verify", "--level", "fast"], &path);
    assert!(stderr.contains("error: corrupt:"), "{stderr}");
    assert!(stderr.contains("page 2"), "{stderr}");
}
