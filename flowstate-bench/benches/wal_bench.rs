//! WAL benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowstate_wal::{FsyncPolicy, SlotChange, Wal, WalConfig, WalEntry, WalOffset};
use tempfile::TempDir;

fn create_test_wal(fsync: FsyncPolicy) -> (TempDir, Wal) {
    let dir = TempDir::new().unwrap();
    let config = WalConfig::new(dir.path())
        .with_segment_size(64 * 1024 * 1024)
        .with_fsync_policy(fsync);
    let wal = Wal::open(config).unwrap();
    (dir, wal)
}

fn create_commit(size: usize) -> WalEntry {
    WalEntry::CommitTransition {
        run_id: "bench-run".to_string(),
        state: serde_json::json!({
            "kind": "RUNNING",
            "data": { "blob": "x".repeat(size) },
        }),
        run: serde_json::json!({ "run_count": 1 }),
        slots: vec![SlotChange::Acquire {
            tag: "db".to_string(),
            run_id: "bench-run".to_string(),
        }],
    }
}

fn bench_wal_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append");

    for (name, policy) in [
        ("no_fsync", FsyncPolicy::Never),
        ("fsync_every_100", FsyncPolicy::EveryN(100)),
    ] {
        let (_dir, wal) = create_test_wal(policy);
        let entry = create_commit(100);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("commit", name), &entry, |b, entry| {
            b.iter(|| black_box(wal.append(entry).unwrap()));
        });
    }

    let (_dir, wal) = create_test_wal(FsyncPolicy::Never);
    for size in [100, 1000, 10000] {
        let entry = create_commit(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("payload_bytes", size),
            &entry,
            |b, entry| {
                b.iter(|| black_box(wal.append(entry).unwrap()));
            },
        );
    }

    group.finish();
}

fn bench_wal_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_replay");

    for count in [100, 1000] {
        let (_dir, wal) = create_test_wal(FsyncPolicy::Never);
        let entry = create_commit(100);
        for _ in 0..count {
            wal.append(&entry).unwrap();
        }
        wal.sync().unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| black_box(wal.read_from(WalOffset::start(), None).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_wal_append, bench_wal_replay);
criterion_main!(benches);
