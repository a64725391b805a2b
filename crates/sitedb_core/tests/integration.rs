//! Integration tests for the indexed store over a file-backed log.

use serde_json::{json, Value};
use sitedb_codec::KeyValue;
use sitedb_core::{
    ChecksumStore, Direction, IndexedStore, KvStore, PlanCursor, RecordEnvelope, ScanPlan,
    StoreConfig, SyncStateStore, TableSchema, WhereOp,
};
use std::sync::Arc;

fn schema() -> TableSchema {
    TableSchema::new()
        .with_file_pattern("/broadcasts/*.json")
        .with_index("createdAt")
        .with_index("type+createdAt")
        .with_index("*tags")
}

fn open(kv: Arc<KvStore>) -> Arc<IndexedStore> {
    let defs = schema().compile_indexes().unwrap();
    Arc::new(IndexedStore::new(kv, "broadcasts", defs).unwrap())
}

fn env(n: u32, record: Value) -> RecordEnvelope {
    RecordEnvelope::new(
        format!("dweb://alice/broadcasts/{n}.json"),
        "dweb://alice",
        record,
    )
}

fn query(store: &Arc<IndexedStore>, index: &str, op: WhereOp, direction: Direction) -> Vec<Value> {
    let plan = ScanPlan::compile(&op, direction).unwrap();
    PlanCursor::new(store.clone(), Some(index.to_string()), plan, direction)
        .map(|e| e.unwrap().envelope.record)
        .collect()
}

#[test]
fn order_by_and_compound_equality() {
    let kv = Arc::new(KvStore::open_in_memory(StoreConfig::default()).unwrap());
    let store = open(kv);
    store
        .put(&env(1, json!({"type": "comment", "createdAt": 100})))
        .unwrap();
    store
        .put(&env(2, json!({"type": "image", "createdAt": 50})))
        .unwrap();

    let ordered = query(&store, "createdAt", WhereOp::AboveOrEqual(KeyValue::Null), Direction::Forward);
    assert_eq!(ordered[0]["createdAt"], 50);

    let found = query(
        &store,
        "type+createdAt",
        WhereOp::Equals(vec![KeyValue::from("comment"), 100.into()].into()),
        Direction::Forward,
    );
    assert_eq!(found, vec![json!({"type": "comment", "createdAt": 100})]);
}

#[test]
fn partial_tuple_is_prefix_bound() {
    let kv = Arc::new(KvStore::open_in_memory(StoreConfig::new().scan_batch_size(3)).unwrap());
    let store = open(kv);
    let types = ["a", "b", "c", "d"];
    let mut n = 0;
    for t in types {
        for created in [3, 1, 2] {
            n += 1;
            store
                .put(&env(n, json!({"type": t, "createdAt": created})))
                .unwrap();
        }
    }

    for (i, t) in types.iter().enumerate() {
        let bound = KeyValue::from(vec![KeyValue::from(*t)]);
        let gte = query(&store, "type+createdAt", WhereOp::AboveOrEqual(bound.clone()), Direction::Forward);
        assert_eq!(gte.len(), (types.len() - i) * 3);
        assert!(gte.iter().all(|r| r["type"].as_str().unwrap() >= *t));

        let lt = query(&store, "type+createdAt", WhereOp::Below(bound), Direction::Reverse);
        assert_eq!(lt.len(), i * 3);
        assert!(lt.iter().all(|r| r["type"].as_str().unwrap() < *t));
    }
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::new().sync_on_write(false);
    {
        let kv = Arc::new(KvStore::open(dir.path(), config.clone()).unwrap());
        let store = open(kv.clone());
        store
            .put(&env(1, json!({"type": "x", "createdAt": 1, "tags": ["p", "q"]})))
            .unwrap();
        store
            .put(&env(2, json!({"type": "y", "createdAt": 2, "tags": ["q"]})))
            .unwrap();
        store.delete("dweb://alice/broadcasts/1.json").unwrap();
        SyncStateStore::new(kv.clone()).advance("dweb://alice", 4).unwrap();
        ChecksumStore::new(kv).set_all([("broadcasts", "abc")]).unwrap();
    }

    let kv = Arc::new(KvStore::open(dir.path(), config).unwrap());
    let store = open(kv.clone());
    assert_eq!(store.len(), 1);
    assert_eq!(store.index_len("tags").unwrap(), 1);
    assert_eq!(store.index_len(":origin").unwrap(), 1);
    assert_eq!(SyncStateStore::new(kv.clone()).get("dweb://alice").unwrap(), 4);
    assert_eq!(
        ChecksumStore::new(kv).get("broadcasts").unwrap().as_deref(),
        Some("abc")
    );
}

#[test]
fn second_open_is_locked() {
    let dir = tempfile::tempdir().unwrap();
    let _first = KvStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert!(KvStore::open(dir.path(), StoreConfig::default()).is_err());
}

#[test]
fn compaction_keeps_live_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::new()
        .sync_on_write(false)
        .compaction_threshold(Some(4 * 1024));
    {
        let kv = Arc::new(KvStore::open(dir.path(), config.clone()).unwrap());
        let store = open(kv);
        for round in 0..20 {
            for n in 0..10 {
                store
                    .put(&env(n, json!({"type": "t", "createdAt": round, "tags": [round]})))
                    .unwrap();
            }
        }
    }
    let kv = Arc::new(KvStore::open(dir.path(), config).unwrap());
    assert!(kv.log_size().unwrap() < 32 * 1024);
    let store = open(kv);
    assert_eq!(store.len(), 10);
    assert_eq!(store.index_len("tags").unwrap(), 10);
    let latest = query(&store, "createdAt", WhereOp::Equals(19.into()), Direction::Forward);
    assert_eq!(latest.len(), 10);
}
