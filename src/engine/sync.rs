// ── Synchronizer ───────────────────────────────────────────────────────────
//
// Moves records between the mirror document and the record store.
//
// Import merges by id (insert-or-replace) and never deletes an id that is
// absent from the document, so an empty or partial mirror cannot erase data.
// Export either writes the collections a session touched or snapshots every
// declared collection from committed state.
//
// Hook flow per process:
//   open → import_if_newer → session (work) → commit → export_to_path

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{LearningData, Pattern, StatEntry};
use crate::engine::legacy;
use crate::engine::mirror::{Document, MirrorStore};
use crate::engine::store::{codec, write_meta, Record, RecordStore, Session};
use filetime::FileTime;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// Records merged per collection.
    pub merged: BTreeMap<String, usize>,
    /// Records that failed shape or dimension validation.
    pub rejected: usize,
    /// Document keys that are not declared collections.
    pub skipped_collections: Vec<String>,
}

impl ImportSummary {
    pub fn total_merged(&self) -> usize {
        self.merged.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// Only collections the session loaded or wrote, including its pending writes.
    Touched,
    /// Every declared collection, from committed state.
    Full,
}

// ── Import ─────────────────────────────────────────────────────────────────

/// Merge a document into a session. Invalid records are rejected one by one;
/// the rest of the document still merges.
pub fn import_document(session: &mut Session<'_>, doc: &Document) -> EngineResult<ImportSummary> {
    let mut summary = ImportSummary {
        skipped_collections: doc.skipped().to_vec(),
        ..Default::default()
    };

    let registry = session.store().registry();
    for (collection, records) in doc.collections() {
        let Ok(spec) = registry.spec_of(collection) else {
            debug!("[sync] Skipping undeclared collection '{}'", collection);
            summary.skipped_collections.push(collection.to_string());
            continue;
        };
        let mut merged = 0;
        for record in records {
            let mut record = record.clone();
            legacy::adapt(spec, &mut record);
            // Natural keys win so an import lands on the row typed writers use.
            let Some(id) = spec.natural_id(&record).or_else(|| record_id(&record)) else {
                warn!("[sync] {}: record without an id rejected", collection);
                summary.rejected += 1;
                continue;
            };
            record.insert(COL_ID.to_string(), Value::String(id.clone()));
            match session.put(collection, &id, record) {
                Ok(()) => merged += 1,
                Err(e @ (EngineError::InvalidRecord { .. } | EngineError::DimensionMismatch { .. })) => {
                    warn!("[sync] {}/{} rejected: {}", collection, id, e);
                    summary.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }
        summary.merged.insert(collection.to_string(), merged);
    }

    Ok(summary)
}

fn record_id(record: &Record) -> Option<String> {
    match record.get(COL_ID)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read the mirror at `path` and merge it. A missing mirror merges nothing;
/// an unparsable one fails with `CorruptDocument` before anything is merged.
pub fn import_from_path(session: &mut Session<'_>, path: &Path) -> EngineResult<ImportSummary> {
    let doc = match MirrorStore::read(path) {
        Ok(doc) => doc,
        Err(EngineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("[sync] No mirror at {:?}", path);
            return Ok(ImportSummary::default());
        }
        Err(e) => return Err(e),
    };
    import_document(session, &doc)
}

/// Import the mirror in its own session when it changed since the last sync.
/// Returns `None` when the mirror is missing or not newer. A corrupt mirror
/// is logged and treated as empty: the record store stays authoritative.
pub fn import_if_newer(store: &RecordStore, path: &Path) -> EngineResult<Option<ImportSummary>> {
    let Some(mtime) = mirror_mtime(path)? else {
        return Ok(None);
    };
    let synced = store.meta_get(META_MIRROR_SYNCED)?.and_then(|m| parse_marker(&m));
    if synced.map_or(false, |s| mtime <= s) {
        return Ok(None);
    }

    let mut session = store.begin_session()?;
    let summary = match import_from_path(&mut session, path) {
        Ok(summary) => summary,
        Err(EngineError::CorruptDocument(detail)) => {
            warn!("[sync] Mirror is corrupt, keeping the record store as-is: {}", detail);
            ImportSummary::default()
        }
        Err(e) => return Err(e),
    };
    session.commit()?;
    store.meta_set(META_MIRROR_SYNCED, &format_marker(mtime))?;

    info!(
        "[sync] Imported {} record(s) from {:?} ({} rejected)",
        summary.total_merged(),
        path,
        summary.rejected
    );
    Ok(Some(summary))
}

// ── Export ─────────────────────────────────────────────────────────────────

/// Build a document from a session.
pub fn export_document(session: &mut Session<'_>, mode: ExportMode) -> EngineResult<Document> {
    match mode {
        ExportMode::Touched => {
            let mut doc = Document::new();
            for collection in session.touched() {
                let records = session.load(&collection)?;
                doc.insert(collection, records);
            }
            Ok(doc)
        }
        ExportMode::Full => snapshot(session.store()),
    }
}

/// Every declared collection, read inside one transaction.
pub fn snapshot(store: &RecordStore) -> EngineResult<Document> {
    store.with_snapshot(|conn| read_document(store, conn))
}

fn read_document(store: &RecordStore, conn: &rusqlite::Connection) -> EngineResult<Document> {
    let mut doc = Document::new();
    for spec in store.registry().collections() {
        doc.insert(spec.name.clone(), codec::read_all(conn, spec)?);
    }
    Ok(doc)
}

/// Full export to the mirror file, holding the store's write lock for the
/// whole read-and-write so only one process exports at a time.
pub fn export_to_path(store: &RecordStore, path: &Path) -> EngineResult<Document> {
    let doc = store.with_write_lock(|conn| {
        let doc = read_document(store, conn)?;
        MirrorStore::write(path, &doc)?;
        if let Some(mtime) = mirror_mtime(path)? {
            write_meta(conn, META_MIRROR_SYNCED, &format_marker(mtime))?;
        }
        Ok(doc)
    })?;
    info!("[sync] Exported {} record(s) to {:?}", doc.record_count(), path);
    Ok(doc)
}

// ── Mirror modification marker ─────────────────────────────────────────────

fn mirror_mtime(path: &Path) -> EngineResult<Option<(i64, u32)>> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let t = FileTime::from_last_modification_time(&meta);
            Ok(Some((t.unix_seconds(), t.nanoseconds())))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn format_marker((secs, nanos): (i64, u32)) -> String {
    format!("{}.{:09}", secs, nanos)
}

fn parse_marker(s: &str) -> Option<(i64, u32)> {
    let (secs, nanos) = s.split_once('.')?;
    Some((secs.parse().ok()?, nanos.parse().ok()?))
}

// ── Stats and summary ──────────────────────────────────────────────────────

/// Rewrite `stats` with a `total_<collection>` counter per collection
/// (committed rows) and a `last_sync` timestamp.
pub fn refresh_stats(session: &mut Session<'_>) -> EngineResult<()> {
    let store = session.store();
    let names: Vec<String> = store
        .registry()
        .collections()
        .map(|c| c.name.clone())
        .filter(|n| n != STATS)
        .collect();
    for name in names {
        let value = store.count(&name)?;
        session.put_record(&StatEntry { key: format!("total_{}", name), value })?;
    }
    session.put_record(&StatEntry {
        key: "last_sync".into(),
        value: crate::engine::now_secs(),
    })?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub counts: BTreeMap<String, i64>,
    /// Embedding width pinned per collection.
    pub widths: BTreeMap<String, usize>,
    pub learning: LearningReport,
}

/// The legacy Q-table (`patterns`) and the multi-algorithm tables
/// (`learning_data`) are independent stores. They are reported side by side
/// and never merged into one figure.
#[derive(Debug, Clone, Serialize)]
pub struct LearningReport {
    pub separate_stores: bool,
    pub patterns: PatternReport,
    pub learning_data: Vec<AlgorithmReport>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PatternReport {
    pub entries: usize,
    pub states: usize,
    pub total_updates: i64,
    /// Highest-valued action per state, best first.
    pub best_actions: Vec<Pattern>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlgorithmReport {
    pub algorithm_id: String,
    pub updated_at: Option<i64>,
    /// Entries in the opaque table when it is a JSON array or object.
    pub size: Option<usize>,
}

pub fn summary(store: &RecordStore) -> EngineResult<StoreSummary> {
    let mut counts = BTreeMap::new();
    let mut widths = BTreeMap::new();
    for spec in store.registry().collections() {
        counts.insert(spec.name.clone(), store.count(&spec.name)?);
        if let Some(w) = store.pinned_width(&spec.name)? {
            widths.insert(spec.name.clone(), w);
        }
    }

    let mut patterns = PatternReport::default();
    let mut best: BTreeMap<String, Pattern> = BTreeMap::new();
    for row in store.query(PATTERNS, |_| true)? {
        let pattern: Pattern = serde_json::from_value(Value::Object(row?))?;
        patterns.entries += 1;
        patterns.total_updates += pattern.update_count;
        match best.get(&pattern.state) {
            Some(b) if b.value >= pattern.value => {}
            _ => {
                best.insert(pattern.state.clone(), pattern);
            }
        }
    }
    patterns.states = best.len();
    patterns.best_actions = best.into_values().collect();
    patterns
        .best_actions
        .sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(std::cmp::Ordering::Equal));

    let mut learning_data = Vec::new();
    for row in store.query(LEARNING_DATA, |_| true)? {
        let data: LearningData = serde_json::from_value(Value::Object(row?))?;
        let size = match &data.table_data {
            Value::Array(a) => Some(a.len()),
            Value::Object(o) => Some(o.len()),
            _ => None,
        };
        learning_data.push(AlgorithmReport {
            algorithm_id: data.algorithm_id,
            updated_at: data.updated_at,
            size,
        });
    }

    Ok(StoreSummary {
        counts,
        widths,
        learning: LearningReport { separate_stores: true, patterns, learning_data },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::schema::SchemaRegistry;
    use serde_json::json;

    fn store() -> RecordStore {
        RecordStore::open_in_memory(SchemaRegistry::standard(None).unwrap()).unwrap()
    }

    fn doc(v: Value) -> Document {
        Document::from_json(&v.to_string()).unwrap()
    }

    #[test]
    fn import_merges_and_rejects_individually() {
        let s = store();
        let d = doc(json!({
            "memories": [
                { "id": "m1", "content": "a", "memory_type": "edit", "timestamp": 1 },
                { "id": "m2", "memory_type": "edit", "timestamp": 1 },
                { "content": "no id", "memory_type": "edit", "timestamp": 1 }
            ],
            "kv_store": { "last_file": "a.rs" },
            "unknown": []
        }));
        let mut session = s.begin_session().unwrap();
        let summary = import_document(&mut session, &d).unwrap();
        session.commit().unwrap();

        assert_eq!(summary.merged[MEMORIES], 1);
        assert_eq!(summary.merged[KV_STORE], 1);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.skipped_collections, vec!["unknown".to_string()]);
        assert_eq!(s.count(MEMORIES).unwrap(), 1);
    }

    #[test]
    fn numeric_ids_are_stored_as_text() {
        let s = store();
        let d = doc(json!({
            "memories": [{ "id": 7, "content": "x", "memory_type": "edit", "timestamp": 1 }]
        }));
        let mut session = s.begin_session().unwrap();
        let summary = import_document(&mut session, &d).unwrap();
        session.commit().unwrap();
        assert_eq!(summary.rejected, 0);
        assert_eq!(s.get(MEMORIES, "7").unwrap().unwrap()["id"], "7");
    }

    #[test]
    fn natural_key_overrides_document_id() {
        let s = store();
        let d = doc(json!({ "stats": [{ "id": 7, "key": "seven", "value": 7 }] }));
        let mut session = s.begin_session().unwrap();
        import_document(&mut session, &d).unwrap();
        session.commit().unwrap();
        drop(session);
        assert!(s.get(STATS, "7").unwrap().is_none());
        assert_eq!(s.get(STATS, "seven").unwrap().unwrap()["value"], 7);
    }

    #[test]
    fn hook_producer_document_imports_every_record() {
        let s = store();
        let d = doc(json!({
            "patterns": {
                "edit_rs|coder": {
                    "state": "edit_rs", "action": "coder",
                    "q_value": 0.5, "visits": 3, "last_update": 1700000000
                }
            },
            "memories": [{
                "id": "mem_1", "memory_type": "edit", "content": "touched parser",
                "embedding": [], "metadata": { "file": "src/parser.rs" }, "timestamp": 1700000000
            }],
            "trajectories": [{
                "id": "traj_1", "state": "edit_rs", "action": "coder",
                "outcome": "success", "reward": 1.0, "timestamp": 1700000001
            }],
            "errors": {
                "E0308": {
                    "code": "E0308", "error_type": "type", "message": "mismatched types",
                    "fixes": ["add a cast"], "occurrences": 2
                }
            },
            "file_sequences": [{ "from_file": "src/a.rs", "to_file": "src/b.rs", "count": 4 }],
            "agents": {
                "coder-1": {
                    "id": "coder-1", "agent_type": "coder", "capabilities": ["rust"],
                    "success_rate": 0.9, "task_count": 5, "status": "idle"
                }
            },
            "edges": [{ "source": "coder-1", "target": "tester-1", "weight": 0.4, "coordination_count": 2 }],
            "stats": {
                "total_patterns": 1, "total_memories": 1, "total_trajectories": 1,
                "total_errors": 1, "session_count": 3, "last_session": 1700000002
            }
        }));

        let mut session = s.begin_session().unwrap();
        let summary = import_document(&mut session, &d).unwrap();
        session.commit().unwrap();
        drop(session);

        assert_eq!(summary.rejected, 0, "{:?}", summary);
        assert_eq!(summary.total_merged(), 13);

        let p: Pattern = serde_json::from_value(Value::Object(
            s.get(PATTERNS, &Pattern::key("edit_rs", "coder")).unwrap().unwrap(),
        ))
        .unwrap();
        assert_eq!((p.value, p.update_count), (0.5, 3));

        let m = s.get(MEMORIES, "mem_1").unwrap().unwrap();
        assert!(m.get("embedding").map_or(true, Value::is_null));

        let t = s.get(TRAJECTORIES, "traj_1").unwrap().unwrap();
        assert_eq!(t["sealed"], true);
        assert_eq!(t["steps"][0]["reward"], 1.0);

        let e = s.get(ERRORS, "E0308").unwrap().unwrap();
        assert_eq!(e["resolution"], "add a cast");
        assert!(s.get(FILE_SEQUENCES, "src/a.rs|src/b.rs").unwrap().is_some());
        assert!(s.get(EDGES, "coder-1|tester-1|coordination").unwrap().is_some());
        assert_eq!(s.get(STATS, "session_count").unwrap().unwrap()["value"], 3);
    }

    #[test]
    fn empty_document_erases_nothing() {
        let s = store();
        let mut seed = s.begin_session().unwrap();
        seed.put_record(&StatEntry { key: "k".into(), value: 1 }).unwrap();
        seed.commit().unwrap();

        let mut session = s.begin_session().unwrap();
        import_document(&mut session, &doc(json!({ "stats": [] }))).unwrap();
        session.commit().unwrap();
        assert_eq!(s.count(STATS).unwrap(), 1);
    }

    #[test]
    fn touched_export_only_includes_touched() {
        let s = store();
        let mut session = s.begin_session().unwrap();
        session.put_record(&StatEntry { key: "k".into(), value: 1 }).unwrap();
        let d = export_document(&mut session, ExportMode::Touched).unwrap();
        assert_eq!(d.collections().count(), 1);
        assert_eq!(d.get(STATS).unwrap().len(), 1);

        let full = export_document(&mut session, ExportMode::Full).unwrap();
        assert_eq!(full.collections().count(), STANDARD_COLLECTIONS.len());
        assert!(full.get(STATS).unwrap().is_empty());
    }

    #[test]
    fn refresh_stats_counts_committed_rows() {
        let s = store();
        let mut seed = s.begin_session().unwrap();
        seed.put(KV_STORE, "a", json!({ "key": "a", "value": "1" }).as_object().cloned().unwrap())
            .unwrap();
        seed.commit().unwrap();

        let mut session = s.begin_session().unwrap();
        refresh_stats(&mut session).unwrap();
        session.commit().unwrap();
        let total: StatEntry =
            serde_json::from_value(Value::Object(s.get(STATS, "total_kv_store").unwrap().unwrap()))
                .unwrap();
        assert_eq!(total.value, 1);
        assert!(s.get(STATS, "last_sync").unwrap().is_some());
    }

    #[test]
    fn summary_reports_both_learning_stores_separately() {
        let s = store();
        let mut session = s.begin_session().unwrap();
        for (state, action, value) in [("edit", "rust", 0.8), ("edit", "ts", 0.2), ("cmd", "test", 0.5)] {
            session
                .put_record(&Pattern {
                    state: state.into(),
                    action: action.into(),
                    value,
                    update_count: 1,
                    last_update: None,
                })
                .unwrap();
        }
        session
            .put_record(&LearningData {
                algorithm_id: "sarsa".into(),
                table_data: json!({ "a": 1, "b": 2 }),
                updated_at: Some(5),
            })
            .unwrap();
        session.commit().unwrap();

        let report = summary(&s).unwrap();
        assert!(report.learning.separate_stores);
        assert_eq!(report.learning.patterns.entries, 3);
        assert_eq!(report.learning.patterns.states, 2);
        assert_eq!(report.learning.patterns.best_actions[0].action, "rust");
        assert_eq!(report.learning.learning_data[0].algorithm_id, "sarsa");
        assert_eq!(report.learning.learning_data[0].size, Some(2));
        assert_eq!(report.counts[PATTERNS], 3);
    }

    #[test]
    fn marker_roundtrip() {
        assert_eq!(parse_marker(&format_marker((1_700_000_000, 42))), Some((1_700_000_000, 42)));
        assert_eq!(parse_marker("garbage"), None);
    }

    #[test]
    fn import_if_newer_skips_unchanged_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intelligence.json");
        let s = store();
        assert!(import_if_newer(&s, &path).unwrap().is_none());

        std::fs::write(&path, json!({ "stats": [{ "id": "k", "key": "k", "value": 2 }] }).to_string())
            .unwrap();
        let first = import_if_newer(&s, &path).unwrap().unwrap();
        assert_eq!(first.total_merged(), 1);
        assert!(import_if_newer(&s, &path).unwrap().is_none());
    }
}
