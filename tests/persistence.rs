//! Disk persistence: restart, crash semantics, startup verification

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cgstore::{compute_node_id, AttrQuery, GraphEngine, GraphError, GraphStore, NodeRecord, StoreConfig};
use tempfile::TempDir;

fn config() -> StoreConfig {
    StoreConfig::default().with_shard_count(1)
}

fn function(name: &str, file: &str) -> NodeRecord {
    let id = compute_node_id("FUNCTION", name, &format!("MODULE:{}", file), file);
    NodeRecord::new(id, "FUNCTION", name, file)
}

fn segment_files(db: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(db.join("shards").join("00"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().ends_with(suffix))
        .collect();
    files.sort();
    files
}

#[test]
fn test_flushed_records_survive_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph");
    let nodes: Vec<NodeRecord> = (0..50).map(|i| function(&format!("f{}", i), "src/api/users.js")).collect();

    // Phase 1: write + flush + "crash"
    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        let stats = engine.upsert_batch("src/api/users.js", nodes.clone()).unwrap();
        assert_eq!(stats.inserted, 50);
        engine.flush().unwrap();
    }

    // Phase 2: reopen
    let engine = GraphEngine::open(&db).unwrap();
    for node in &nodes {
        assert_eq!(engine.get_node(node.id).unwrap().as_ref(), Some(node));
    }
    assert_eq!(engine.find_nodes(&AttrQuery::new().kind("FUNCTION")).unwrap().len(), 50);
}

#[test]
fn test_crash_loses_unflushed_records() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph");
    let kept = function("kept", "src/a.js");
    let lost: Vec<NodeRecord> = (0..20).map(|i| function(&format!("lost{}", i), "src/a.js")).collect();

    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        engine.upsert("src/a.js", kept.clone()).unwrap();
        engine.flush().unwrap();
        engine.upsert_batch("src/a.js", lost.clone()).unwrap();
        // drop без close: буфер не сбрасывается
    }

    let engine = GraphEngine::open(&db).unwrap();
    assert!(engine.get_node(kept.id).unwrap().is_some());
    for node in &lost {
        assert!(engine.get_node(node.id).unwrap().is_none());
    }
}

#[test]
fn test_close_flushes_buffer() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph");
    let node = function("main", "src/main.js");

    let engine = GraphEngine::create(&db, config()).unwrap();
    engine.upsert("src/main.js", node.clone()).unwrap();
    let report = engine.close().unwrap();
    assert_eq!(report.nodes_written, 1);

    let engine = GraphEngine::open(&db).unwrap();
    assert_eq!(engine.get_node(node.id).unwrap(), Some(node));
}

#[test]
fn test_tombstone_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph");
    let a = function("a", "src/a.js");
    let b = function("b", "src/a.js");

    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        engine.upsert_batch("src/a.js", vec![a.clone(), b.clone()]).unwrap();
        engine.flush().unwrap();
        assert!(engine.delete_node(a.id).unwrap());
        engine.flush().unwrap();
    }

    let engine = GraphEngine::open(&db).unwrap();
    assert!(engine.get_node(a.id).unwrap().is_none());
    let found: Vec<u128> = engine
        .find_nodes(&AttrQuery::new().kind("FUNCTION"))
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(found, vec![b.id]);

    // после компакции удалённая нода тоже не возвращается
    engine.force_compact().unwrap();
    assert!(engine.get_node(a.id).unwrap().is_none());
    assert_eq!(engine.find_nodes(&AttrQuery::new().kind("FUNCTION")).unwrap().len(), 1);
}

#[test]
fn test_compacted_store_reopens() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph");
    let nodes: Vec<NodeRecord> = (0..6).map(|i| function(&format!("f{}", i), "src/a.js")).collect();

    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        for node in &nodes {
            engine.upsert("src/a.js", node.clone()).unwrap();
            engine.flush().unwrap();
        }
        let result = engine.force_compact().unwrap();
        assert_eq!(result.shards_compacted, vec![0]);
        engine.collect_garbage().unwrap();
    }

    let engine = GraphEngine::open(&db).unwrap();
    let stats = engine.stats();
    assert_eq!(stats.shards[0].l0_segments, 0);
    let (found, explain) = engine.explain_find(&AttrQuery::new().name("f3")).unwrap();
    assert_eq!(found, vec![nodes[3].clone()]);
    assert!(!explain.full_scan);
}

#[test]
fn test_missing_segment_is_fatal() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph");
    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        engine.upsert("src/a.js", function("f", "src/a.js")).unwrap();
        engine.close().unwrap();
    }

    let segments = segment_files(&db, "_nodes.seg");
    assert_eq!(segments.len(), 1);
    fs::remove_file(&segments[0]).unwrap();

    match GraphEngine::open(&db) {
        Err(GraphError::ManifestInconsistency(msg)) => assert!(msg.contains("missing"), "{}", msg),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("open must fail"),
    }
}

#[test]
fn test_corrupt_segment_is_fatal() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph");
    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        engine.upsert("src/a.js", function("f", "src/a.js")).unwrap();
        engine.close().unwrap();
    }

    // первый байт колонки id: размер и footer не меняются
    let segment = &segment_files(&db, "_nodes.seg")[0];
    let mut file = OpenOptions::new().read(true).write(true).open(segment).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(32)).unwrap();
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(32)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    drop(file);

    assert!(matches!(GraphEngine::open(&db), Err(GraphError::ManifestInconsistency(_))));
}

#[test]
fn test_orphans_collected_on_open() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph");
    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        engine.upsert("src/a.js", function("f", "src/a.js")).unwrap();
        engine.close().unwrap();
    }
    let stray = db.join("shards").join("00").join("seg_99999999_nodes.seg");
    fs::write(&stray, b"leftover from an interrupted flush").unwrap();

    let engine = GraphEngine::open(&db).unwrap();
    assert!(!stray.exists());
    assert_eq!(engine.find_nodes(&AttrQuery::new().kind("FUNCTION")).unwrap().len(), 1);
}

#[test]
fn test_strict_orphans_is_fatal() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph");
    let mut strict = config();
    strict.strict_orphans = true;
    {
        let engine = GraphEngine::create(&db, strict).unwrap();
        engine.upsert("src/a.js", function("f", "src/a.js")).unwrap();
        engine.close().unwrap();
    }
    // чистая база открывается
    drop(GraphEngine::open(&db).unwrap());

    let stray = db.join("shards").join("00").join("seg_99999999_nodes.seg");
    fs::write(&stray, b"junk").unwrap();

    assert!(matches!(GraphEngine::open(&db), Err(GraphError::ManifestInconsistency(_))));
    assert!(stray.exists());
}

#[test]
fn test_tagged_snapshot_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph");
    let tagged = {
        let engine = GraphEngine::create(&db, config()).unwrap();
        engine.upsert("src/a.js", function("f", "src/a.js")).unwrap();
        engine.flush().unwrap();
        let version = engine.tag_snapshot("commit", "abc123").unwrap();
        for i in 0..5 {
            engine.upsert("src/a.js", function(&format!("g{}", i), "src/a.js")).unwrap();
            engine.flush().unwrap();
        }
        engine.collect_garbage().unwrap();
        version
    };

    let engine = GraphEngine::open(&db).unwrap();
    assert_eq!(engine.find_snapshot("commit", "abc123").unwrap(), Some(tagged));
    let versions: Vec<u64> = engine.list_snapshots().unwrap().into_iter().map(|s| s.version).collect();
    assert!(versions.contains(&tagged));
    assert!(versions.contains(&engine.version()));
}
