//! Multi-process scenarios against a real store file. Two `RecordStore`
//! handles on one database behave like two hook processes.

use filetime::FileTime;
use intelsync::atoms::constants::*;
use intelsync::atoms::types::{KvEntry, MemoryType, Trajectory};
use intelsync::engine::embedding::HashEmbedder;
use intelsync::engine::{learning, state, sync};
use intelsync::{
    EngineError, MirrorStore, RecordStore, ReplayTarget, SchemaRegistry, StateCarrier, StoreConfig,
    WarmReplayLoader,
};
use rusqlite::Connection;
use std::fs;
use std::thread;
use tempfile::TempDir;

fn config(dir: &TempDir) -> StoreConfig {
    StoreConfig::for_project(dir.path())
}

fn open(config: &StoreConfig) -> RecordStore {
    RecordStore::open(config, SchemaRegistry::standard(config.embedding_dim).unwrap()).unwrap()
}

fn kv(store: &RecordStore, key: &str, value: &str) {
    let mut session = store.begin_session().unwrap();
    StateCarrier::new(&mut session).set(key, value).unwrap();
    session.commit().unwrap();
}

#[test]
fn concurrent_hooks_keep_both_writes() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    open(&cfg);

    let memory_hook = {
        let cfg = cfg.clone();
        thread::spawn(move || {
            let store = open(&cfg);
            sync::import_if_newer(&store, &cfg.mirror_path).unwrap();
            let mut session = store.begin_session().unwrap();
            learning::remember(&mut session, &HashEmbedder::default(), MemoryType::Edit, "a.rs")
                .unwrap();
            session.commit().unwrap();
            sync::export_to_path(&store, &cfg.mirror_path).unwrap();
        })
    };
    let pattern_hook = {
        let cfg = cfg.clone();
        thread::spawn(move || {
            let store = open(&cfg);
            sync::import_if_newer(&store, &cfg.mirror_path).unwrap();
            let mut session = store.begin_session().unwrap();
            learning::update_q(&mut session, "edit_rs", "coder", 1.0).unwrap();
            session.commit().unwrap();
            sync::export_to_path(&store, &cfg.mirror_path).unwrap();
        })
    };
    memory_hook.join().unwrap();
    pattern_hook.join().unwrap();

    let store = open(&cfg);
    assert_eq!(store.count(MEMORIES).unwrap(), 1);
    assert_eq!(store.count(PATTERNS).unwrap(), 1);

    // The last export ran after both commits, so the mirror has both.
    let doc = MirrorStore::read(&cfg.mirror_path).unwrap();
    assert_eq!(doc.get(MEMORIES).map(|r| r.len()), Some(1));
    assert_eq!(doc.get(PATTERNS).map(|r| r.len()), Some(1));
}

#[test]
fn session_on_one_collection_leaves_others_alone() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);
    let mut seed = store.begin_session().unwrap();
    learning::update_q(&mut seed, "s", "a", 1.0).unwrap();
    learning::update_q(&mut seed, "s", "b", 0.5).unwrap();
    seed.commit().unwrap();
    let before = sync::snapshot(&store).unwrap();

    let mut session = store.begin_session().unwrap();
    session.load(MEMORIES).unwrap();
    learning::remember(&mut session, &HashEmbedder::default(), MemoryType::Edit, "x").unwrap();
    let summary = session.commit().unwrap();
    assert_eq!(summary.collections, vec![MEMORIES.to_string()]);

    let after = sync::snapshot(&store).unwrap();
    assert_eq!(after.get(PATTERNS), before.get(PATTERNS));
    assert_eq!(after.get(MEMORIES).map(|r| r.len()), Some(1));
}

#[test]
fn partial_mirror_does_not_erase_records() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);
    kv(&store, "a", "1");
    kv(&store, "b", "2");

    fs::create_dir_all(cfg.mirror_path.parent().unwrap()).unwrap();
    fs::write(&cfg.mirror_path, r#"{"kv_store": [{"id": "a", "key": "a", "value": "10"}]}"#)
        .unwrap();
    let summary = sync::import_if_newer(&store, &cfg.mirror_path).unwrap().unwrap();
    assert_eq!(summary.total_merged(), 1);
    assert_eq!(store.count(KV_STORE).unwrap(), 2);
    assert_eq!(store.get(KV_STORE, "a").unwrap().unwrap()["value"], "10");

    fs::write(&cfg.mirror_path, "{}").unwrap();
    filetime::set_file_mtime(&cfg.mirror_path, FileTime::from_unix_time(4_000_000_000, 0))
        .unwrap();
    sync::import_if_newer(&store, &cfg.mirror_path).unwrap().unwrap();
    assert_eq!(store.count(KV_STORE).unwrap(), 2);
}

#[test]
fn width_mismatch_is_rejected_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);

    let mut session = store.begin_session().unwrap();
    learning::remember(&mut session, &HashEmbedder::new(384), MemoryType::General, "first")
        .unwrap();
    session.commit().unwrap();
    assert_eq!(store.pinned_width(MEMORIES).unwrap(), Some(384));

    // A later process with a 64-wide model: the raw write is refused...
    let other = open(&cfg);
    let mut session = other.begin_session().unwrap();
    let mut record = serde_json::Map::new();
    record.insert("content".into(), "second".into());
    record.insert("memory_type".into(), "general".into());
    record.insert("timestamp".into(), 1.into());
    record.insert("embedding".into(), serde_json::to_value(vec![0.5f32; 64]).unwrap());
    match session.put(MEMORIES, "m2", record) {
        Err(EngineError::DimensionMismatch { expected, actual, .. }) => {
            assert_eq!((expected, actual), (384, 64));
        }
        other => panic!("expected DimensionMismatch, got {:?}", other),
    }

    // ...and the memory writer degrades to text-only instead.
    let m = learning::remember(&mut session, &HashEmbedder::new(64), MemoryType::General, "second")
        .unwrap();
    assert_eq!(m.embedding_model.as_deref(), Some(FALLBACK_EMBEDDING_MODEL));
    session.commit().unwrap();

    assert_eq!(other.count(MEMORIES).unwrap(), 2);
    assert_eq!(other.pinned_width(MEMORIES).unwrap(), Some(384));
}

#[test]
fn racing_first_embeddings_pin_one_width() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let a = open(&cfg);
    let b = open(&cfg);

    // Both sessions start before either pins.
    let mut sa = a.begin_session().unwrap();
    let mut sb = b.begin_session().unwrap();
    learning::remember(&mut sa, &HashEmbedder::new(32), MemoryType::General, "a").unwrap();
    learning::remember(&mut sb, &HashEmbedder::new(16), MemoryType::General, "b").unwrap();

    sa.commit().unwrap();
    match sb.commit() {
        Err(EngineError::DimensionMismatch { expected, actual, .. }) => {
            assert_eq!((expected, actual), (32, 16));
        }
        other => panic!("expected DimensionMismatch, got {:?}", other),
    }
    assert!(!sb.is_open());
    assert_eq!(a.count(MEMORIES).unwrap(), 1);
    assert_eq!(b.pinned_width(MEMORIES).unwrap(), Some(32));
}

#[test]
fn corrupt_mirror_is_tolerated() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);
    kv(&store, "keep", "me");
    sync::export_to_path(&store, &cfg.mirror_path).unwrap();

    fs::write(&cfg.mirror_path, r#"{"kv_store": [ {"id": "#).unwrap();
    filetime::set_file_mtime(&cfg.mirror_path, FileTime::from_unix_time(4_000_000_000, 0))
        .unwrap();

    let mut session = store.begin_session().unwrap();
    assert!(matches!(
        sync::import_from_path(&mut session, &cfg.mirror_path),
        Err(EngineError::CorruptDocument(_))
    ));
    session.rollback().unwrap();

    let summary = sync::import_if_newer(&store, &cfg.mirror_path).unwrap().unwrap();
    assert_eq!(summary.total_merged(), 0);
    assert_eq!(store.get(KV_STORE, "keep").unwrap().unwrap()["value"], "me");

    // Marker moved: the same corrupt file is not re-read.
    assert!(sync::import_if_newer(&store, &cfg.mirror_path).unwrap().is_none());
}

#[test]
fn reimporting_the_same_mirror_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);
    kv(&store, "x", "1");
    let mut session = store.begin_session().unwrap();
    learning::update_q(&mut session, "s", "a", 0.5).unwrap();
    session.commit().unwrap();
    let exported = sync::export_to_path(&store, &cfg.mirror_path).unwrap();

    for _ in 0..2 {
        let mut session = store.begin_session().unwrap();
        sync::import_from_path(&mut session, &cfg.mirror_path).unwrap();
        session.commit().unwrap();
    }
    let again = sync::snapshot(&store).unwrap();
    for collection in [KV_STORE, PATTERNS] {
        assert_eq!(again.get(collection), exported.get(collection), "{}", collection);
    }
}

#[test]
fn mirror_rebuilds_a_fresh_store() {
    let src_dir = TempDir::new().unwrap();
    let src_cfg = config(&src_dir);
    let src = open(&src_cfg);

    let mut session = src.begin_session().unwrap();
    learning::remember(&mut session, &HashEmbedder::default(), MemoryType::Edit, "a").unwrap();
    learning::update_q(&mut session, "s", "a", 1.0).unwrap();
    state::track_file_edit(&mut session, "a.rs").unwrap();
    session.commit().unwrap();
    let mut session = src.begin_session().unwrap();
    state::track_file_edit(&mut session, "b.rs").unwrap();
    learning::record_error(&mut session, "cargo build", "error[E0308]: mismatched").unwrap();
    session.commit().unwrap();
    let exported = sync::export_to_path(&src, &src_cfg.mirror_path).unwrap();

    let dst_dir = TempDir::new().unwrap();
    let dst_cfg = config(&dst_dir);
    fs::create_dir_all(dst_cfg.mirror_path.parent().unwrap()).unwrap();
    fs::copy(&src_cfg.mirror_path, &dst_cfg.mirror_path).unwrap();
    let dst = open(&dst_cfg);
    let summary = sync::import_if_newer(&dst, &dst_cfg.mirror_path).unwrap().unwrap();
    assert_eq!(summary.rejected, 0);

    for name in STANDARD_COLLECTIONS {
        assert_eq!(dst.count(name).unwrap(), src.count(name).unwrap(), "{}", name);
    }
    let rebuilt = sync::snapshot(&dst).unwrap();
    for (collection, records) in exported.collections() {
        let ids = |rs: &[intelsync::Record]| -> Vec<String> {
            rs.iter().map(|r| r["id"].as_str().unwrap_or_default().to_string()).collect()
        };
        assert_eq!(ids(records), ids(rebuilt.get(collection).unwrap()), "{}", collection);
    }
    assert_eq!(dst.pinned_width(MEMORIES).unwrap(), Some(HashEmbedder::DEFAULT_DIMS));
}

#[test]
fn failed_commit_leaves_no_partial_writes() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);

    let raw = Connection::open(&cfg.db_path).unwrap();
    raw.execute_batch(
        "CREATE TRIGGER fail_memories BEFORE INSERT ON memories
         BEGIN SELECT RAISE(ABORT, 'boom'); END;",
    )
    .unwrap();

    let mut session = store.begin_session().unwrap();
    learning::update_q(&mut session, "s", "a", 1.0).unwrap();
    learning::remember(&mut session, &HashEmbedder::default(), MemoryType::Edit, "x").unwrap();
    assert!(session.commit().is_err());
    assert!(matches!(session.commit(), Err(EngineError::InvalidSessionState(_))));

    assert_eq!(store.count(PATTERNS).unwrap(), 0);
    assert_eq!(store.count(MEMORIES).unwrap(), 0);
    assert_eq!(store.pinned_width(MEMORIES).unwrap(), None);
}

#[test]
fn held_write_lock_surfaces_as_storage_unavailable() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    cfg.busy_timeout_ms = 50;
    let store = open(&cfg);

    let raw = Connection::open(&cfg.db_path).unwrap();
    raw.execute_batch("BEGIN IMMEDIATE;").unwrap();

    let mut session = store.begin_session().unwrap();
    StateCarrier::new(&mut session).set("k", "v").unwrap();
    assert!(matches!(session.commit(), Err(EngineError::StorageUnavailable(_))));

    raw.execute_batch("ROLLBACK;").unwrap();
    assert_eq!(store.count(KV_STORE).unwrap(), 0);

    // The whole session can be retried once the lock is free.
    let mut retry = store.begin_session().unwrap();
    StateCarrier::new(&mut retry).set("k", "v").unwrap();
    retry.commit().unwrap();
    assert_eq!(store.count(KV_STORE).unwrap(), 1);
}

#[test]
fn abandoned_writer_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);

    {
        let raw = Connection::open(&cfg.db_path).unwrap();
        raw.execute_batch(
            "BEGIN IMMEDIATE;
             INSERT INTO kv_store (id, key, value) VALUES ('ghost', 'ghost', 'x');",
        )
        .unwrap();
        // Dropped mid-transaction, like a killed hook.
    }
    {
        let other = open(&cfg);
        let mut session = other.begin_session().unwrap();
        StateCarrier::new(&mut session).set("never", "committed").unwrap();
    }

    assert_eq!(store.count(KV_STORE).unwrap(), 0);
    kv(&store, "after", "ok");
    assert_eq!(store.count(KV_STORE).unwrap(), 1);
}

#[derive(Default)]
struct Order(Vec<String>);

impl ReplayTarget for Order {
    fn ingest(&mut self, trajectory: &Trajectory) -> intelsync::EngineResult<()> {
        self.0.push(trajectory.id.clone());
        Ok(())
    }
}

#[test]
fn warm_replay_after_restart() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    {
        let store = open(&cfg);
        let mut session = store.begin_session().unwrap();
        for i in 0..120 {
            let mut t = Trajectory::begin(format!("t{:03}", i), i);
            t.push_step("s", "a", 1.0).unwrap();
            t.seal(1.0, 1_000 + i).unwrap();
            session.put_record(&t).unwrap();
        }
        session.commit().unwrap();
    }

    let store = open(&cfg);
    let mut order = Order::default();
    let report = WarmReplayLoader::from_config(&cfg).replay(&store, &mut order).unwrap();
    assert_eq!(report.ingested, 50);
    assert_eq!(report.available, 120);
    assert_eq!(order.0.first().map(String::as_str), Some("t070"));
    assert_eq!(order.0.last().map(String::as_str), Some("t119"));
}

#[test]
fn legacy_keyed_mirror_imports() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);
    fs::create_dir_all(cfg.mirror_path.parent().unwrap()).unwrap();
    fs::write(
        &cfg.mirror_path,
        r#"{
            "kv_store": {"last_file": "src/lib.rs"},
            "stats": {"total_memories": 3},
            "patterns": {"edit_rs|coder": {"state": "edit_rs", "action": "coder",
                                           "value": 0.4, "update_count": 4}},
            "unknown_table": [{"id": "z"}]
        }"#,
    )
    .unwrap();

    let summary = sync::import_if_newer(&store, &cfg.mirror_path).unwrap().unwrap();
    assert_eq!(summary.rejected, 0);
    assert!(summary.skipped_collections.contains(&"unknown_table".to_string()));

    let session = store.begin_session().unwrap();
    let last: KvEntry = session.get_record(KV_LAST_FILE).unwrap().unwrap();
    assert_eq!(last.value, "src/lib.rs");
    assert_eq!(store.get(STATS, "total_memories").unwrap().unwrap()["value"], 3);
    assert_eq!(
        learning::best_action(&store, "edit_rs").unwrap().unwrap().update_count,
        4
    );
}

fn legacy_q_table(cfg: &StoreConfig) {
    fs::create_dir_all(cfg.db_path.parent().unwrap()).unwrap();
    let raw = Connection::open(&cfg.db_path).unwrap();
    raw.execute_batch(
        "CREATE TABLE patterns (state TEXT, action TEXT, value REAL, update_count INTEGER);
         INSERT INTO patterns VALUES ('edit_rs', 'coder', 0.5, 3);",
    )
    .unwrap();
}

#[test]
fn upgraded_legacy_q_table_keeps_learning() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    legacy_q_table(&cfg);

    let store = open(&cfg);
    let mut session = store.begin_session().unwrap();
    let p = learning::update_q(&mut session, "edit_rs", "coder", 1.0).unwrap();
    session.commit().unwrap();
    drop(session);

    assert!((p.value - 0.55).abs() < 1e-9);
    assert_eq!(p.update_count, 4);
    assert_eq!(store.count(PATTERNS).unwrap(), 1);
}

#[test]
fn simultaneous_first_opens_of_a_legacy_store() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    legacy_q_table(&cfg);

    let hooks: Vec<_> = (0..4)
        .map(|i| {
            let cfg = cfg.clone();
            thread::spawn(move || {
                let store = RecordStore::open(&cfg, SchemaRegistry::standard(None).unwrap())?;
                let mut session = store.begin_session()?;
                StateCarrier::new(&mut session).set(&format!("hook{}", i), "ran")?;
                session.commit()?;
                Ok::<(), EngineError>(())
            })
        })
        .collect();
    for hook in hooks {
        hook.join().unwrap().unwrap();
    }

    let store = open(&cfg);
    assert_eq!(store.count(KV_STORE).unwrap(), 4);
    assert_eq!(store.count(PATTERNS).unwrap(), 1);
    assert_eq!(
        learning::best_action(&store, "edit_rs").unwrap().unwrap().update_count,
        3
    );
}
