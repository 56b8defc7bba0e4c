//! Point lookup and attribute search over fresh (L0) vs compacted (L1) data

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cgstore::{AttrQuery, GraphEngine, GraphStore, NodeRecord, StoreConfig};

const SEGMENTS: usize = 8;

fn build(per_segment: usize, compacted: bool) -> GraphEngine {
    let mut config = StoreConfig::default().with_shard_count(4);
    // не даём политике компактить сама
    config.compaction.segment_threshold = SEGMENTS * 2;
    let engine = GraphEngine::ephemeral(config).unwrap();

    for seg in 0..SEGMENTS {
        for dir in 0..4 {
            let file = format!("src/mod_{}/file_{}.js", dir, seg);
            let nodes: Vec<NodeRecord> = (0..per_segment / 4)
                .map(|i| {
                    let id = (seg * per_segment + dir * (per_segment / 4) + i) as u128 + 1;
                    NodeRecord::new(id, if i % 50 == 0 { "CLASS" } else { "FUNCTION" }, format!("f_{}", id), &file)
                })
                .collect();
            engine.upsert_batch(&file, nodes).unwrap();
        }
        engine.flush().unwrap();
    }
    if compacted {
        engine.force_compact().unwrap();
    }
    engine
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");

    for (label, compacted) in [("l0", false), ("l1", true)] {
        let engine = build(4_000, compacted);
        let total = (SEGMENTS * 4_000) as u128;

        group.bench_with_input(BenchmarkId::new("hit", label), &total, |b, &total| {
            let mut id = 0u128;
            b.iter(|| {
                id = (id + 7919) % total + 1;
                black_box(engine.get_node(id).unwrap());
            });
        });
        group.bench_with_input(BenchmarkId::new("miss", label), &total, |b, &total| {
            let mut id = total;
            b.iter(|| {
                id += 1;
                black_box(engine.get_node(id).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("find");

    for (label, compacted) in [("l0", false), ("l1", true)] {
        let engine = build(4_000, compacted);

        group.bench_function(BenchmarkId::new("kind", label), |b| {
            b.iter(|| black_box(engine.find_nodes(&AttrQuery::new().kind("CLASS")).unwrap()));
        });
        group.bench_function(BenchmarkId::new("name", label), |b| {
            b.iter(|| black_box(engine.find_nodes(&AttrQuery::new().name("f_12345")).unwrap()));
        });
        group.bench_function(BenchmarkId::new("file", label), |b| {
            b.iter(|| black_box(engine.find_nodes(&AttrQuery::new().file("src/mod_2/file_3.js")).unwrap()));
        });
        group.bench_function(BenchmarkId::new("lazy_first", label), |b| {
            b.iter(|| black_box(engine.find(&AttrQuery::new().kind("FUNCTION")).unwrap().next()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_get, bench_find);
criterion_main!(benches);
