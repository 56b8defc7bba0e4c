use super::*;
use crate::storage::{AttrQuery, CancelToken, Direction, EdgeRecord, NodeRecord, UpsertOutcome};
use tempfile::TempDir;

fn make_test_node(id: u128, kind: &str, name: &str, file: &str) -> NodeRecord {
    NodeRecord::new(id, kind, name, file)
}

fn config(shards: u16) -> StoreConfig {
    StoreConfig::default().with_shard_count(shards)
}

fn store(shards: u16) -> MultiShardStore {
    MultiShardStore::ephemeral(config(shards)).unwrap()
}

fn names(mut nodes: Vec<NodeRecord>) -> Vec<String> {
    nodes.sort_by_key(|n| n.id);
    nodes.into_iter().map(|n| n.name).collect()
}

// ============================================================
// Upserts
// ============================================================

#[test]
fn test_upsert_reports_inserted_then_updated() {
    let store = store(1);
    let node = make_test_node(1, "FUNCTION", "foo", "src/a.js");

    assert_eq!(store.upsert("src/a.js", node.clone()).unwrap(), UpsertOutcome::Inserted);
    assert_eq!(store.upsert("src/a.js", node.clone()).unwrap(), UpsertOutcome::Updated);
    assert_eq!(store.get(1).unwrap(), Some(node.clone()));

    store.flush().unwrap();
    assert_eq!(store.upsert("src/a.js", node.clone()).unwrap(), UpsertOutcome::Updated);
    assert_eq!(store.get(1).unwrap(), Some(node));
}

#[test]
fn test_batch_rejects_malformed_and_keeps_rest() {
    let store = store(2);
    let nodes = vec![
        make_test_node(1, "FUNCTION", "ok", "src/a.js"),
        make_test_node(0, "FUNCTION", "no id", "src/a.js"),
        make_test_node(2, "", "no kind", "src/a.js"),
        make_test_node(3, "CLASS", "ok too", "src/b.js"),
    ];
    let stats = store.upsert_batch("src/a.js", nodes).unwrap();

    assert_eq!(stats.inserted, 2);
    let rejected: Vec<usize> = stats.rejected.iter().map(|r| r.index).collect();
    assert_eq!(rejected, vec![1, 2]);
    assert_eq!(stats.rejected[1].id, Some(2));
    assert!(store.get(1).unwrap().is_some());
    assert!(store.get(3).unwrap().is_some());
    assert!(store.get(2).unwrap().is_none());
}

#[test]
fn test_empty_owner_takes_shard_key() {
    let store = store(1);
    let mut node = make_test_node(7, "FUNCTION", "f", "src/a.js");
    node.owner.clear();
    store.upsert("src/owner.js", node).unwrap();
    assert_eq!(store.get(7).unwrap().unwrap().owner, "src/owner.js");
}

#[test]
fn test_unresolvable_shard_key() {
    let store = store(1);
    let err = store
        .upsert_batch("", vec![make_test_node(1, "FUNCTION", "f", "src/a.js")])
        .unwrap_err();
    assert!(matches!(err, GraphError::UnresolvableShardKey(_)));
}

#[test]
fn test_auto_flush_on_node_limit() {
    let mut config = config(1);
    config.write_buffer_node_limit = 2;
    let store = MultiShardStore::ephemeral(config).unwrap();
    let before = store.version();

    let nodes = (1..=3u128)
        .map(|i| make_test_node(i, "FUNCTION", &format!("f{}", i), "src/a.js"))
        .collect();
    store.upsert_batch("src/a.js", nodes).unwrap();

    assert!(store.version() > before);
    assert_eq!(store.stats().shards[0].buffered_nodes, 0);
    assert_eq!(store.snapshot().shards()[0].node_segments().len(), 1);
}

/// A key in another directory that the planner sends to a different shard.
fn key_in_other_shard(store: &MultiShardStore, key: &str) -> String {
    let planner = store.planner.read();
    let home = planner.resolve(key).unwrap();
    (0..64)
        .map(|i| format!("lib{}/moved.js", i))
        .find(|k| planner.resolve(k).unwrap() != home)
        .unwrap()
}

#[test]
fn test_owner_change_moves_node_between_shards() {
    let store = store(4);
    let other = key_in_other_shard(&store, "src/a.js");

    let first = make_test_node(7, "FUNCTION", "f", "src/a.js");
    assert_eq!(store.upsert("src/a.js", first).unwrap(), UpsertOutcome::Inserted);
    store.flush().unwrap();

    let second = make_test_node(7, "FUNCTION", "g", &other);
    assert_eq!(store.upsert(&other, second).unwrap(), UpsertOutcome::Updated);
    store.flush().unwrap();

    assert_eq!(store.get(7).unwrap().unwrap().name, "g");
    let found = store.find(&AttrQuery::new().kind("FUNCTION")).unwrap().into_checked().unwrap();
    assert_eq!(names(found), vec!["g"]);

    let third = make_test_node(7, "FUNCTION", "h", "src/a.js");
    assert_eq!(store.upsert("src/a.js", third).unwrap(), UpsertOutcome::Updated);
    assert_eq!(store.find(&AttrQuery::new().kind("FUNCTION")).unwrap().count(), 1);

    // копия "h" пока только в буфере
    let fourth = make_test_node(7, "FUNCTION", "i", &other);
    assert_eq!(store.upsert(&other, fourth).unwrap(), UpsertOutcome::Updated);
    assert_eq!(store.get(7).unwrap().unwrap().name, "i");
    assert_eq!(store.find(&AttrQuery::new().kind("FUNCTION")).unwrap().count(), 1);

    store.flush().unwrap();
    store.force_compact().unwrap();
    assert_eq!(store.get(7).unwrap().unwrap().name, "i");
    for stale in ["f", "g", "h"] {
        assert_eq!(store.find(&AttrQuery::new().name(stale)).unwrap().count(), 0, "{} still visible", stale);
    }
    assert_eq!(store.find(&AttrQuery::new().kind("FUNCTION")).unwrap().count(), 1);
}

#[test]
fn test_owner_change_within_one_batch_keeps_last() {
    let store = store(4);
    let other = key_in_other_shard(&store, "src/a.js");

    let stats = store
        .upsert_batch(
            "src/a.js",
            vec![
                make_test_node(7, "FUNCTION", "f", "src/a.js"),
                make_test_node(7, "FUNCTION", "g", &other),
            ],
        )
        .unwrap();
    assert_eq!((stats.inserted, stats.updated), (1, 0));
    store.flush().unwrap();

    assert_eq!(store.get(7).unwrap().unwrap().name, "g");
    assert_eq!(store.find(&AttrQuery::new().kind("FUNCTION")).unwrap().count(), 1);
}

#[test]
fn test_owner_change_blocked_by_failed_shard() {
    let store = store(4);
    let other = key_in_other_shard(&store, "src/a.js");
    let home = store.planner.read().resolve("src/a.js").unwrap();

    store
        .upsert("src/a.js", make_test_node(7, "FUNCTION", "f", "src/a.js"))
        .unwrap();
    store.flush().unwrap();
    store.shards[home as usize].write().failed = Some("disk full".into());

    let stats = store
        .upsert_batch(&other, vec![make_test_node(7, "FUNCTION", "g", &other)])
        .unwrap();
    assert_eq!(stats.rejected.len(), 1);
    assert_eq!(stats.rejected[0].id, Some(7));
    assert!(stats.rejected[0].reason.contains("disk full"));
    assert_eq!(store.get(7).unwrap().unwrap().name, "f");
}

// ============================================================
// Reads
// ============================================================

#[test]
fn test_find_merges_buffer_and_segments() {
    let store = store(4);
    store
        .upsert_batch(
            "src/a.js",
            vec![
                make_test_node(1, "FUNCTION", "alpha", "src/a.js"),
                make_test_node(2, "CLASS", "Beta", "src/a.js"),
            ],
        )
        .unwrap();
    store.flush().unwrap();
    store
        .upsert_batch("lib/b.js", vec![make_test_node(3, "FUNCTION", "gamma", "lib/b.js")])
        .unwrap();
    // новая версия в буфере перекрывает сегмент
    store
        .upsert("src/a.js", make_test_node(1, "FUNCTION", "alpha2", "src/a.js"))
        .unwrap();

    let found = store.find(&AttrQuery::new().kind("FUNCTION")).unwrap().into_checked().unwrap();
    assert_eq!(names(found), vec!["alpha2", "gamma"]);

    let by_file = store.find(&AttrQuery::new().file("src/a.js")).unwrap().into_checked().unwrap();
    assert_eq!(names(by_file), vec!["alpha2", "Beta"]);
}

#[test]
fn test_find_unknown_kind_and_wildcard() {
    let store = store(1);
    assert!(matches!(
        store.find(&AttrQuery::new().kind("NOT_A_KIND")),
        Err(GraphError::UnknownKind(_))
    ));

    store
        .upsert("src/api.js", make_test_node(5, "http:route", "GET /users", "src/api.js"))
        .unwrap();
    let hits = store.find(&AttrQuery::new().kind("http:*")).unwrap().into_checked().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(store.find(&AttrQuery::new().kind("http:route")).unwrap().count(), 1);
}

#[test]
fn test_explain_reports_full_scan() {
    let store = store(2);
    store
        .upsert("src/a.js", make_test_node(1, "FUNCTION", "f", "src/a.js"))
        .unwrap();
    store.flush().unwrap();

    let (_, explain) = store.explain_find(&AttrQuery::new().file("src/a.js")).unwrap();
    assert!(explain.full_scan);
    let (found, explain) = store.explain_find(&AttrQuery::new().kind("FUNCTION")).unwrap();
    assert!(!explain.full_scan);
    assert_eq!(found.len(), 1);
    assert_eq!(explain.shards_scanned + explain.shards_skipped, 2);
}

#[test]
fn test_explain_star_kind_is_full_scan() {
    let store = store(2);
    store
        .upsert("src/a.js", make_test_node(1, "FUNCTION", "f", "src/a.js"))
        .unwrap();
    store.flush().unwrap();

    let (found, explain) = store.explain_find(&AttrQuery::new().kind("*")).unwrap();
    assert_eq!(found.len(), 1);
    assert!(explain.full_scan);
    let (_, explain) = store.explain_find(&AttrQuery::new().kind("*").name("f")).unwrap();
    assert!(!explain.full_scan);
}

#[test]
fn test_find_by_metadata_across_compaction() {
    let mut config = config(1);
    config.compaction.max_segment_records = 2;
    let store = MultiShardStore::ephemeral(config).unwrap();

    let node = |id: u128, meta: &str| {
        make_test_node(id, "FUNCTION", &format!("f{}", id), "src/a.js").with_metadata(meta)
    };
    store
        .upsert_batch(
            "src/a.js",
            vec![
                node(1, r#"{"async":true,"line":3}"#),
                node(2, r#"{"async":false,"line":9}"#),
            ],
        )
        .unwrap();
    store.flush().unwrap();
    store
        .upsert_batch("src/a.js", vec![node(3, r#"{"async":true,"line":9}"#)])
        .unwrap();
    store.flush().unwrap();
    // в буфере: новая версия 1 больше не async
    store.upsert("src/a.js", node(1, r#"{"async":false}"#)).unwrap();
    store
        .upsert("src/a.js", make_test_node(4, "FUNCTION", "bare", "src/a.js"))
        .unwrap();

    let query = AttrQuery::new().kind("FUNCTION").metadata_filter("async", "true");
    assert_eq!(names(store.find(&query).unwrap().into_checked().unwrap()), vec!["f3"]);

    let by_line = AttrQuery::new().metadata_filter("line", "9");
    assert_eq!(names(store.find(&by_line).unwrap().into_checked().unwrap()), vec!["f2", "f3"]);

    store.flush().unwrap();
    store.force_compact().unwrap();
    assert_eq!(store.snapshot().shards()[0].l0_count(), 0);

    assert_eq!(names(store.find(&query).unwrap().into_checked().unwrap()), vec!["f3"]);
    assert_eq!(names(store.find(&by_line).unwrap().into_checked().unwrap()), vec!["f2", "f3"]);
    let both = by_line.clone().metadata_filter("async", "false");
    assert_eq!(names(store.find(&both).unwrap().into_checked().unwrap()), vec!["f2"]);
}

#[test]
fn test_find_cancelled_at_segment_boundary() {
    let store = store(1);
    store
        .upsert("src/a.js", make_test_node(1, "FUNCTION", "f", "src/a.js"))
        .unwrap();
    store.flush().unwrap();

    let token = CancelToken::new();
    token.cancel();
    let iter = store.find_cancellable(&AttrQuery::new().kind("FUNCTION"), &token).unwrap();
    assert!(matches!(iter.into_checked(), Err(GraphError::Cancelled)));
}

#[test]
fn test_iterator_keeps_its_snapshot() {
    let store = store(1);
    store
        .upsert_batch(
            "src/a.js",
            vec![
                make_test_node(1, "FUNCTION", "a", "src/a.js"),
                make_test_node(2, "FUNCTION", "b", "src/a.js"),
            ],
        )
        .unwrap();
    store.flush().unwrap();

    let iter = store.find(&AttrQuery::new().kind("FUNCTION")).unwrap();
    let version = iter.version();

    store.delete_node(1).unwrap();
    store.flush().unwrap();
    store.force_compact().unwrap();
    assert!(store.version() > version);

    assert_eq!(names(iter.collect()), vec!["a", "b"]);
    assert_eq!(store.find(&AttrQuery::new().kind("FUNCTION")).unwrap().count(), 1);
}

#[test]
fn test_neighbors_directions_and_kinds() {
    let store = store(2);
    store
        .upsert_batch(
            "src/a.js",
            vec![
                make_test_node(1, "FUNCTION", "a", "src/a.js"),
                make_test_node(2, "FUNCTION", "b", "src/a.js"),
                make_test_node(3, "VARIABLE", "c", "src/a.js"),
            ],
        )
        .unwrap();
    store
        .upsert_edges(
            "src/a.js",
            vec![EdgeRecord::new(1, 2, "CALLS"), EdgeRecord::new(1, 3, "USES")],
        )
        .unwrap();
    store.flush().unwrap();
    store
        .upsert_edges("lib/x.js", vec![EdgeRecord::new(3, 2, "CALLS")])
        .unwrap();

    let out = store.neighbors(1, Direction::Outgoing, None).unwrap();
    let mut ids: Vec<u128> = out.iter().map(|(_, id)| *id).collect();
    ids.sort();
    assert_eq!(ids, vec![2, 3]);

    let calls = store.neighbors(1, Direction::Outgoing, Some(&["CALLS"][..])).unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, 2);

    let mut incoming: Vec<u128> = store
        .neighbors(2, Direction::Incoming, None)
        .unwrap()
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    incoming.sort();
    assert_eq!(incoming, vec![1, 3]);

    assert!(matches!(
        store.neighbors(1, Direction::Outgoing, Some(&["NOPE"][..])),
        Err(GraphError::UnknownKind(_))
    ));
}

#[test]
fn test_neighbors_cancelled_between_segments() {
    let store = store(1);
    for dst in 2..=4u128 {
        store
            .upsert_edges("src/a.js", vec![EdgeRecord::new(1, dst, "CALLS")])
            .unwrap();
        store.flush().unwrap();
    }

    let token = CancelToken::new();
    let all = store.neighbors_cancellable(1, Direction::Outgoing, None, &token).unwrap();
    assert_eq!(all.len(), 3);

    token.cancel();
    assert!(matches!(
        store.neighbors_cancellable(1, Direction::Outgoing, None, &token),
        Err(GraphError::Cancelled)
    ));
    assert!(matches!(
        store.neighbors_cancellable(4, Direction::Incoming, Some(&["CALLS"][..]), &token),
        Err(GraphError::Cancelled)
    ));
}

// ============================================================
// Deletes
// ============================================================

#[test]
fn test_delete_node_cascades_edges() {
    let store = store(4);
    store
        .upsert_batch(
            "src/a.js",
            vec![make_test_node(1, "FUNCTION", "a", "src/a.js"), make_test_node(2, "FUNCTION", "b", "src/a.js")],
        )
        .unwrap();
    store
        .upsert_edges("src/a.js", vec![EdgeRecord::new(1, 2, "CALLS"), EdgeRecord::new(2, 1, "CALLS")])
        .unwrap();
    store.flush().unwrap();

    assert!(store.delete_node(1).unwrap());
    assert!(!store.delete_node(1).unwrap());
    assert!(store.get(1).unwrap().is_none());
    assert!(store.neighbors(2, Direction::Incoming, None).unwrap().is_empty());
    assert!(store.neighbors(2, Direction::Outgoing, None).unwrap().is_empty());

    store.flush().unwrap();
    assert!(store.get(1).unwrap().is_none());
    assert!(store.get_edge(1, 2, "CALLS").unwrap().is_none());
    assert!(store.get(2).unwrap().is_some());
}

#[test]
fn test_delete_edge() {
    let store = store(1);
    store
        .upsert_edges("src/a.js", vec![EdgeRecord::new(1, 2, "CALLS")])
        .unwrap();
    store.flush().unwrap();

    assert!(store.delete_edge(1, 2, "CALLS").unwrap());
    assert!(!store.delete_edge(1, 2, "CALLS").unwrap());
    store.flush().unwrap();
    assert!(store.neighbors(1, Direction::Outgoing, None).unwrap().is_empty());
}

#[test]
fn test_reinsert_after_delete_is_visible() {
    let store = store(1);
    let node = make_test_node(9, "FUNCTION", "again", "src/a.js");
    store.upsert("src/a.js", node.clone()).unwrap();
    store.flush().unwrap();
    store.delete_node(9).unwrap();
    store.flush().unwrap();

    assert_eq!(store.upsert("src/a.js", node.clone()).unwrap(), UpsertOutcome::Inserted);
    store.flush().unwrap();
    assert_eq!(store.get(9).unwrap(), Some(node));
}

// ============================================================
// Re-analysis
// ============================================================

#[test]
fn test_reanalyze_reports_delta() {
    let store = store(2);
    let unit = "src/mod.js";
    let x = make_test_node(10, "FUNCTION", "x", unit);
    let y = make_test_node(11, "FUNCTION", "y", unit);
    let z = make_test_node(12, "CLASS", "z", unit);

    let first = store
        .reanalyze_unit(unit, UnitRecords::new(vec![x.clone(), y.clone()], vec![]))
        .unwrap();
    assert_eq!(first.added_nodes, vec![10, 11]);
    assert!(first.manifest_version.is_some());

    let delta = store
        .reanalyze_unit(unit, UnitRecords::new(vec![x.clone(), z.clone()], vec![]))
        .unwrap();
    assert_eq!(delta.added_nodes, vec![12]);
    assert_eq!(delta.removed_nodes, vec![11]);
    assert_eq!(delta.unchanged_nodes, vec![10]);
    assert!(delta.changed_kinds.contains("CLASS"));
    assert!(delta.removed_kinds.contains("FUNCTION"));

    let found = store.find(&AttrQuery::new().owner(unit)).unwrap().into_checked().unwrap();
    assert_eq!(names(found), vec!["x", "z"]);
}

#[test]
fn test_reanalyze_same_input_is_noop() {
    let store = store(1);
    let unit = "src/mod.js";
    let records = UnitRecords::new(
        vec![make_test_node(1, "FUNCTION", "f", unit), make_test_node(2, "FUNCTION", "g", unit)],
        vec![EdgeRecord::new(1, 2, "CALLS")],
    );

    store.reanalyze_unit(unit, records.clone()).unwrap();
    let version = store.version();

    let again = store.reanalyze_unit(unit, records).unwrap();
    assert!(again.is_empty());
    assert!(again.manifest_version.is_none());
    assert_eq!(again.unchanged_edges.len(), 1);
    assert_eq!(store.version(), version);
}

#[test]
fn test_reanalyze_edges_and_changed_payload() {
    let store = store(1);
    let unit = "src/mod.js";
    store
        .reanalyze_unit(
            unit,
            UnitRecords::new(
                vec![make_test_node(1, "FUNCTION", "f", unit)],
                vec![EdgeRecord::new(1, 2, "CALLS"), EdgeRecord::new(1, 3, "USES")],
            ),
        )
        .unwrap();

    let delta = store
        .reanalyze_unit(
            unit,
            UnitRecords::new(
                vec![make_test_node(1, "FUNCTION", "f", unit).with_metadata(r#"{"async":true}"#)],
                vec![EdgeRecord::new(1, 2, "CALLS")],
            ),
        )
        .unwrap();
    assert_eq!(delta.changed_nodes, vec![1]);
    assert_eq!(delta.removed_edges, vec![(1, 3, "USES".to_string())]);
    assert!(delta.changed_kinds.contains("USES"));
    assert!(!delta.changed_kinds.contains("CALLS"));

    let outgoing = store.neighbors(1, Direction::Outgoing, None).unwrap();
    assert_eq!(outgoing.len(), 1);
    assert_eq!(store.get(1).unwrap().unwrap().metadata.as_deref(), Some(r#"{"async":true}"#));
}

#[test]
fn test_enrichment_unit_is_independent() {
    let store = store(2);
    let file = "src/utils.js";
    let unit = crate::storage::enrichment_unit_key("data-flow", file);

    store
        .reanalyze_unit(file, UnitRecords::new(vec![make_test_node(1, "FUNCTION", "f", file)], vec![]))
        .unwrap();
    store
        .reanalyze_unit(&unit, UnitRecords::new(vec![], vec![EdgeRecord::new(1, 1, "FLOWS_INTO")]))
        .unwrap();

    // перезапуск анализа файла не трогает результат enricher-а
    store
        .reanalyze_unit(file, UnitRecords::new(vec![make_test_node(1, "FUNCTION", "f", file)], vec![]))
        .unwrap();
    assert_eq!(store.neighbors(1, Direction::Outgoing, None).unwrap().len(), 1);

    let cleared = store.reanalyze_unit(&unit, UnitRecords::default()).unwrap();
    assert_eq!(cleared.removed_edges.len(), 1);
    assert!(store.neighbors(1, Direction::Outgoing, None).unwrap().is_empty());
}

#[test]
fn test_commit_batch_one_version_with_tags() {
    let store = store(4);
    let before = store.version();
    let mut tags = BTreeMap::new();
    tags.insert("commit".to_string(), "abc123".to_string());

    let batch = store
        .commit_batch(
            vec![
                ("src/a.js".to_string(), UnitRecords::new(vec![make_test_node(1, "FUNCTION", "a", "src/a.js")], vec![])),
                ("lib/b.js".to_string(), UnitRecords::new(vec![make_test_node(2, "CLASS", "b", "lib/b.js")], vec![])),
            ],
            &tags,
        )
        .unwrap();

    assert_eq!(store.version(), before + 1);
    assert_eq!(batch.manifest_version, Some(before + 1));
    assert_eq!(batch.units.len(), 2);
    assert!(batch.changed_kinds.contains("FUNCTION") && batch.changed_kinds.contains("CLASS"));
    assert_eq!(store.find_snapshot("commit", "abc123").unwrap(), Some(before + 1));
}

// ============================================================
// Compaction, GC, snapshots
// ============================================================

#[test]
fn test_compaction_keeps_find_results() {
    let mut config = config(1);
    config.compaction.max_segment_records = 2;
    let store = MultiShardStore::ephemeral(config).unwrap();

    for round in 0..3u128 {
        let nodes = (0..3u128)
            .map(|i| make_test_node(round * 10 + i + 1, "FUNCTION", &format!("f{}_{}", round, i), "src/a.js"))
            .collect();
        store.upsert_batch("src/a.js", nodes).unwrap();
        store.flush().unwrap();
    }
    store.delete_node(2).unwrap();
    store.flush().unwrap();

    let query = AttrQuery::new().kind("FUNCTION");
    let before = names(store.find(&query).unwrap().into_checked().unwrap());

    let result = store.force_compact().unwrap();
    assert_eq!(result.shards_compacted, vec![0]);
    assert!(result.tombstones_removed >= 1);

    let after = names(store.find(&query).unwrap().into_checked().unwrap());
    assert_eq!(before, after);
    assert_eq!(after.len(), 8);

    let snap = store.snapshot();
    assert_eq!(snap.shards()[0].l0_count(), 0);
    assert!(snap.shards()[0].tombstones().is_empty());
    assert_eq!(snap.global_index().len(), 8);

    let (node, explain) = store.explain_get(11).unwrap();
    assert_eq!(node.unwrap().name, "f1_0");
    assert!(explain.index_probes > 0);
}

#[test]
fn test_compact_respects_policy() {
    let store = store(1);
    store
        .upsert("src/a.js", make_test_node(1, "FUNCTION", "f", "src/a.js"))
        .unwrap();
    store.flush().unwrap();

    let result = store.compact().unwrap();
    assert!(result.shards_compacted.is_empty());
    assert!(result.manifest_version.is_none());
}

#[test]
fn test_gc_keeps_files_of_live_snapshot() {
    let dir = TempDir::new().unwrap();
    let mut config = config(1);
    config.manifest_retention = 1;
    let store = MultiShardStore::create(dir.path(), config).unwrap();

    store
        .upsert("src/a.js", make_test_node(1, "FUNCTION", "f", "src/a.js"))
        .unwrap();
    store.flush().unwrap();
    let held = store.snapshot();
    let held_files = held.manifest().referenced_files();

    store
        .upsert("src/a.js", make_test_node(2, "FUNCTION", "g", "src/a.js"))
        .unwrap();
    store.flush().unwrap();
    store.force_compact().unwrap();
    store.collect_garbage().unwrap();

    for file in &held_files {
        assert!(dir.path().join(file).exists(), "{} collected while in use", file);
    }

    drop(held);
    let report = store.collect_garbage().unwrap();
    assert!(report.files_removed > 0);
    for file in &held_files {
        assert!(!dir.path().join(file).exists());
    }
}

#[test]
fn test_list_and_diff_snapshots() {
    let store = store(1);
    let v1 = store.version();
    store
        .upsert("src/a.js", make_test_node(1, "FUNCTION", "f", "src/a.js"))
        .unwrap();
    store.flush().unwrap();
    let v2 = store.version();

    let listed: Vec<u64> = store.list_snapshots().unwrap().iter().map(|s| s.version).collect();
    assert!(listed.contains(&v1) && listed.contains(&v2));

    let diff = store.diff_snapshots(v1, v2).unwrap();
    assert_eq!(diff.added_files.len(), 1);
    assert_eq!(diff.changed_shards, vec![0]);
    assert_eq!(diff.added_node_kinds, vec!["FUNCTION".to_string()]);
}

// ============================================================
// Routing
// ============================================================

#[test]
fn test_flat_directory_is_split() {
    let mut config = config(4);
    config.flat_dir_file_limit = 2;
    let store = MultiShardStore::ephemeral(config).unwrap();

    for i in 1..=3u128 {
        let file = format!("src/flat/f{}.js", i);
        store
            .upsert(&file, make_test_node(i, "FUNCTION", &format!("f{}", i), &file))
            .unwrap();
    }

    assert!(store.snapshot().manifest().split_dirs.contains("src/flat"));
    for i in 1..=3u128 {
        assert!(store.get(i).unwrap().is_some(), "node {} lost in split", i);
    }
    assert_eq!(store.find(&AttrQuery::new().kind("FUNCTION")).unwrap().count(), 3);
    assert!(!store.split_directory("src/flat").unwrap());
}

#[test]
fn test_failed_shard_refuses_writes() {
    let store = store(1);
    store.shards[0].write().failed = Some("disk full".into());

    let err = store
        .upsert("src/a.js", make_test_node(1, "FUNCTION", "f", "src/a.js"))
        .unwrap_err();
    assert!(matches!(err, GraphError::ShardFailed { shard: 0, .. }));

    let stats = store
        .upsert_batch("src/a.js", vec![make_test_node(1, "FUNCTION", "f", "src/a.js")])
        .unwrap();
    assert_eq!(stats.rejected.len(), 1);
    assert!(stats.rejected[0].reason.contains("disk full"));

    let report = store.flush().unwrap();
    assert_eq!(report.failed.len(), 1);
}

#[test]
fn test_maintenance_notify_survives_stopped_worker() {
    let store = store(1);
    let (tx, rx) = crossbeam_channel::unbounded();
    store.attach_maintenance(tx);

    store.notify_maintenance(MaintenanceTask::Compact);
    assert!(matches!(rx.try_recv(), Ok(MaintenanceTask::Compact)));

    drop(rx);
    store.notify_maintenance(MaintenanceTask::Compact);
    store
        .upsert("src/a.js", make_test_node(1, "FUNCTION", "f", "src/a.js"))
        .unwrap();
    store.flush().unwrap();
    assert!(store.get(1).unwrap().is_some());
}

#[test]
fn test_poisoned_store_rejects_everything() {
    let store = store(1);
    *store.poisoned.write() = Some("manifest write failed".into());
    assert!(store.is_poisoned());
    assert!(matches!(store.get(1), Err(GraphError::EnginePoisoned(_))));
    assert!(matches!(store.flush(), Err(GraphError::EnginePoisoned(_))));
}
