#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use tessera::primitives::concurrency::PanicState;
use tessera::primitives::io::StdIoProvider;
use tessera::primitives::wal::{LogRecord, RecordBody, Wal, WalOptions};
use tessera::types::{Lsn, TableId, TxnId};
use tessera::{BeginFlags, Store, StoreOptions};

const RECORDS_PER_BATCH: usize = 64;

fn micro_wal(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/wal");
    group.sample_size(25);

    let harness = WalHarness::new();
    group.throughput(Throughput::Elements(RECORDS_PER_BATCH as u64));
    group.bench_function("append", |b| {
        b.iter(|| harness.append_batch(RECORDS_PER_BATCH, false));
    });
    group.bench_function("append_fsync", |b| {
        b.iter(|| harness.append_batch(RECORDS_PER_BATCH, true));
    });

    for writers in [1usize, 4, 16] {
        let tmpdir = tempfile::tempdir().expect("tmpdir");
        let store = Arc::new(Store::open(tmpdir.path(), StoreOptions::default()).expect("store"));
        group.throughput(Throughput::Elements(writers as u64));
        group.bench_with_input(BenchmarkId::new("group_commit", writers), &writers, |b, &writers| {
            b.iter(|| commit_concurrently(&store, writers));
        });
    }
    group.finish();
}

struct WalHarness {
    _tmpdir: TempDir,
    wal: Wal,
    payload: Vec<u8>,
}

impl WalHarness {
    fn new() -> Self {
        let tmpdir = tempfile::tempdir().expect("tmpdir");
        let wal = Wal::open(
            tmpdir.path(),
            Arc::new(StdIoProvider),
            WalOptions::default(),
            PanicState::new(),
        )
        .expect("wal");
        Self {
            _tmpdir: tmpdir,
            wal,
            payload: vec![0xCD; 256],
        }
    }

    fn append_batch(&self, count: usize, sync: bool) {
        let mut last = Lsn::ZERO;
        for i in 0..count {
            last = self
                .wal
                .append(&LogRecord::chained(
                    TxnId(1),
                    last,
                    RecordBody::Put {
                        table: TableId::MAIN,
                        key: (i as u64).to_be_bytes().to_vec(),
                        before: None,
                        after: self.payload.clone(),
                    },
                ))
                .expect("append");
        }
        if sync {
            self.wal.fsync_through(last).expect("fsync");
        }
    }
}

fn commit_concurrently(store: &Arc<Store>, writers: usize) {
    thread::scope(|scope| {
        for w in 0..writers {
            scope.spawn(move || {
                let txn = store.begin(BeginFlags::empty()).expect("begin");
                txn.put(format!("writer-{w}").as_bytes(), b"value").expect("put");
                txn.commit().expect("commit");
            });
        }
    });
}

criterion_group!(benches, micro_wal);
criterion_main!(benches);
