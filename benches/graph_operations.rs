//! Benchmark suite for graph operations

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cgstore::{AttrQuery, Direction, EdgeRecord, GraphEngine, GraphStore, NodeRecord, StoreConfig, UnitRecords};
use tempfile::TempDir;

fn test_node(i: usize) -> NodeRecord {
    NodeRecord::new(
        i as u128 + 1,
        if i % 10 == 0 { "CLASS" } else { "FUNCTION" },
        format!("func_{}", i),
        format!("src/dir_{}/file_{}.js", i % 10, i % 100),
    )
}

fn create_test_graph(node_count: usize, edge_count: usize) -> (TempDir, GraphEngine) {
    let dir = TempDir::new().unwrap();
    let engine = GraphEngine::create(dir.path().join("bench"), StoreConfig::default()).unwrap();

    // ноды группами по файлам, как их пишет анализатор
    let nodes: Vec<NodeRecord> = (0..node_count).map(test_node).collect();
    for chunk in nodes.chunks(100) {
        let file = chunk[0].file.clone();
        engine.upsert_batch(&file, chunk.to_vec()).unwrap();
    }

    let edges: Vec<EdgeRecord> = (0..edge_count)
        .map(|i| {
            EdgeRecord::new(
                (i % node_count) as u128 + 1,
                ((i * 7 + 1) % node_count) as u128 + 1,
                "CALLS",
            )
        })
        .collect();
    engine.upsert_edges("src/dir_0/file_0.js", edges).unwrap();
    engine.flush().unwrap();

    (dir, engine)
}

fn bench_upsert_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("upsert_batch");

    for size in [100, 1000, 10000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let engine = GraphEngine::ephemeral(StoreConfig::default()).unwrap();
                let nodes: Vec<NodeRecord> = (0..size).map(test_node).collect();
                engine.upsert_batch("src/test.js", black_box(nodes)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");
    group.sample_size(20);

    for size in [1000, 10000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let dir = TempDir::new().unwrap();
                let engine = GraphEngine::create(dir.path().join("bench"), StoreConfig::default()).unwrap();
                engine.upsert_batch("src/test.js", (0..size).map(test_node).collect()).unwrap();
                black_box(engine.flush().unwrap());
            });
        });
    }

    group.finish();
}

fn bench_find_by_kind(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_by_kind");

    for size in [1000, 10000, 100000] {
        let (_dir, engine) = create_test_graph(size, size * 2);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let result = engine.find_nodes(black_box(&AttrQuery::new().kind("CLASS"))).unwrap();
                black_box(result);
            });
        });
    }

    group.finish();
}

fn bench_bfs(c: &mut Criterion) {
    let mut group = c.benchmark_group("bfs");

    for size in [100, 1000, 10000] {
        let (_dir, engine) = create_test_graph(size, size * 3);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let result = engine.bfs(black_box(&[1]), 10, Some(&["CALLS"][..])).unwrap();
                black_box(result);
            });
        });
    }

    group.finish();
}

fn bench_neighbors(c: &mut Criterion) {
    let mut group = c.benchmark_group("neighbors");

    for size in [1000, 10000, 100000] {
        let (_dir, engine) = create_test_graph(size, size * 5);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let result = engine.neighbors(black_box(1), Direction::Outgoing, Some(&["CALLS"][..])).unwrap();
                black_box(result);
            });
        });
    }

    group.finish();
}

fn bench_reanalyze_unit(c: &mut Criterion) {
    let mut group = c.benchmark_group("reanalyze_unit");

    for size in [100, 1000] {
        let engine = GraphEngine::ephemeral(StoreConfig::default()).unwrap();
        let unit = |gen: usize| {
            let nodes = (0..size)
                .map(|i| {
                    let mut n = test_node(i);
                    if i % 10 == gen % 10 {
                        n.name = format!("changed_{}_{}", i, gen);
                    }
                    n
                })
                .collect();
            UnitRecords::new(nodes, vec![])
        };
        engine.reanalyze_unit("src/unit.js", unit(0)).unwrap();

        let mut gen = 0;
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                gen += 1;
                black_box(engine.reanalyze_unit("src/unit.js", unit(gen)).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_upsert_batch,
    bench_flush,
    bench_find_by_kind,
    bench_bfs,
    bench_neighbors,
    bench_reanalyze_unit
);
criterion_main!(benches);
