// Record Store sessions and the atomic save coordinator.
//
// A session buffers every put/delete in call order and applies them in one
// transaction on commit. It tracks which collections were loaded and which
// were written; collections it never wrote receive zero operations, so a
// session that only looked at `memories` can never disturb `patterns`.
//
// Reads see the committed state overlaid with the session's own pending
// writes (read-your-writes). `query` streams committed rows only.

use super::codec::{self, EncodedRecord, Record};
use super::{RecordQuery, RecordStore};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::CollectionRecord;
use crate::engine::guard::DimensionGuard;
use log::{debug, warn};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Committed,
    RolledBack,
}

/// One buffered write.
#[derive(Debug, Clone)]
pub(crate) enum PendingOp {
    Put { collection: String, id: String, encoded: EncodedRecord, record: Record },
    Delete { collection: String, id: String },
}

impl PendingOp {
    fn collection(&self) -> &str {
        match self {
            Self::Put { collection, .. } | Self::Delete { collection, .. } => collection,
        }
    }

    fn id(&self) -> &str {
        match self {
            Self::Put { id, .. } | Self::Delete { id, .. } => id,
        }
    }
}

/// What a commit wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub puts: usize,
    pub deletes: usize,
    /// Collections that received at least one operation.
    pub collections: Vec<String>,
}

pub struct Session<'a> {
    store: &'a RecordStore,
    state: SessionState,
    loaded: BTreeSet<String>,
    written: BTreeSet<String>,
    pending: Vec<PendingOp>,
    guard: DimensionGuard,
}

impl<'a> Session<'a> {
    pub(crate) fn new(store: &'a RecordStore, guard: DimensionGuard) -> Self {
        Session {
            store,
            state: SessionState::Open,
            loaded: BTreeSet::new(),
            written: BTreeSet::new(),
            pending: Vec::new(),
            guard,
        }
    }

    pub fn store(&self) -> &'a RecordStore {
        self.store
    }

    fn ensure_open(&self, action: &str) -> EngineResult<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Committed => Err(EngineError::InvalidSessionState(format!(
                "cannot {} a session that was already committed",
                action
            ))),
            SessionState::RolledBack => Err(EngineError::InvalidSessionState(format!(
                "cannot {} a session that was rolled back",
                action
            ))),
        }
    }

    // ── Reads ──────────────────────────────────────────────────────────

    /// Every record of a collection, as this session sees it. Marks the
    /// collection as loaded.
    pub fn load(&mut self, collection: &str) -> EngineResult<Vec<Record>> {
        self.ensure_open("load from")?;
        let spec = self.store.registry().spec_of(collection)?;
        let committed = {
            let conn = self.store.conn.lock();
            codec::read_all(&conn, spec)?
        };
        self.loaded.insert(collection.to_string());
        Ok(self.overlay(collection, committed))
    }

    /// The `limit` most recently inserted records, oldest first. A sliced
    /// view: it marks the collection loaded but is never treated as the
    /// whole collection.
    pub fn load_recent(&mut self, collection: &str, limit: usize) -> EngineResult<Vec<Record>> {
        self.ensure_open("load from")?;
        let spec = self.store.registry().spec_of(collection)?;
        let committed = {
            let conn = self.store.conn.lock();
            codec::read_recent(&conn, spec, limit)?
        };
        self.loaded.insert(collection.to_string());
        let mut view = self.overlay(collection, committed);
        if view.len() > limit {
            view.drain(..view.len() - limit);
        }
        Ok(view)
    }

    /// Point lookup, seeing this session's own pending writes.
    pub fn get(&self, collection: &str, id: &str) -> EngineResult<Option<Record>> {
        self.ensure_open("read from")?;
        let spec = self.store.registry().spec_of(collection)?;
        let latest = self
            .pending
            .iter()
            .rev()
            .find(|op| op.collection() == collection && op.id() == id);
        match latest {
            Some(PendingOp::Put { record, .. }) => Ok(Some(record.clone())),
            Some(PendingOp::Delete { .. }) => Ok(None),
            None => {
                let conn = self.store.conn.lock();
                codec::read_one(&conn, spec, id)
            }
        }
    }

    /// Typed point lookup.
    pub fn get_record<T: CollectionRecord>(&self, id: &str) -> EngineResult<Option<T>> {
        match self.get(T::COLLECTION, id)? {
            Some(record) => Ok(Some(serde_json::from_value(Value::Object(record))?)),
            None => Ok(None),
        }
    }

    /// Typed `load`.
    pub fn load_records<T: CollectionRecord>(&mut self) -> EngineResult<Vec<T>> {
        self.load(T::COLLECTION)?
            .into_iter()
            .map(|r| serde_json::from_value(Value::Object(r)).map_err(EngineError::from))
            .collect()
    }

    /// Lazy scan of committed rows matching `predicate`.
    pub fn query<P>(&self, collection: &str, predicate: P) -> EngineResult<RecordQuery<'a, P>>
    where
        P: FnMut(&Record) -> bool,
    {
        self.ensure_open("query")?;
        self.store.query(collection, predicate)
    }

    /// Apply this session's pending writes on top of committed rows.
    fn overlay(&self, collection: &str, mut rows: Vec<Record>) -> Vec<Record> {
        let mut position: BTreeMap<String, usize> = rows
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.get("id").and_then(Value::as_str).map(|id| (id.to_string(), i)))
            .collect();
        let mut removed = BTreeSet::new();

        for op in self.pending.iter().filter(|op| op.collection() == collection) {
            match op {
                PendingOp::Put { id, record, .. } => {
                    if let Some(&i) = position.get(id) {
                        rows[i] = record.clone();
                        removed.remove(&i);
                    } else {
                        position.insert(id.clone(), rows.len());
                        rows.push(record.clone());
                    }
                }
                PendingOp::Delete { id, .. } => {
                    if let Some(&i) = position.get(id) {
                        removed.insert(i);
                    }
                }
            }
        }

        rows.into_iter()
            .enumerate()
            .filter(|(i, _)| !removed.contains(i))
            .map(|(_, r)| r)
            .collect()
    }

    // ── Writes ─────────────────────────────────────────────────────────

    /// Buffer an insert-or-replace. The record is validated against its
    /// collection's shape and every embedding against the dimension guard
    /// before anything is buffered.
    pub fn put(&mut self, collection: &str, id: &str, record: Record) -> EngineResult<()> {
        self.ensure_open("write to")?;
        let spec = self.store.registry().spec_of(collection)?;
        let encoded = codec::encode_record(spec, id, &record)?;

        // Check every width before admitting any, so a rejected record pins nothing.
        if let Some(&first) = encoded.embedding_widths.first() {
            let expected = self.guard.expected(collection).unwrap_or(first);
            if let Some(&actual) = encoded.embedding_widths.iter().find(|&&w| w != expected) {
                return Err(EngineError::DimensionMismatch {
                    collection: collection.to_string(),
                    expected,
                    actual,
                });
            }
            self.guard.admit(collection, first)?;
        }

        self.written.insert(collection.to_string());
        self.pending.push(PendingOp::Put {
            collection: collection.to_string(),
            id: id.to_string(),
            encoded,
            record: codec::normalize(id, &record),
        });
        Ok(())
    }

    /// Typed `put`; the id comes from the record.
    pub fn put_record<T: CollectionRecord>(&mut self, record: &T) -> EngineResult<()> {
        let id = record.record_id();
        match serde_json::to_value(record)? {
            Value::Object(map) => self.put(T::COLLECTION, &id, map),
            other => Err(EngineError::invalid_record(
                T::COLLECTION,
                format!("record serialized to {} instead of an object", other),
            )),
        }
    }

    /// Buffer a delete. Only collections loaded in this session may be
    /// deleted from.
    pub fn delete(&mut self, collection: &str, id: &str) -> EngineResult<()> {
        self.ensure_open("delete from")?;
        self.store.registry().spec_of(collection)?;
        if !self.loaded.contains(collection) {
            return Err(EngineError::InvalidSessionState(format!(
                "delete from {} without loading it in this session",
                collection
            )));
        }
        self.written.insert(collection.to_string());
        self.pending.push(PendingOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    // ── Commit / rollback ──────────────────────────────────────────────

    /// Apply every buffered write atomically. On failure nothing is
    /// visible and the session is closed; retry with a fresh session.
    pub fn commit(&mut self) -> EngineResult<CommitSummary> {
        self.ensure_open("commit")?;
        let ops = std::mem::take(&mut self.pending);

        let mut summary = CommitSummary::default();
        for op in &ops {
            match op {
                PendingOp::Put { .. } => summary.puts += 1,
                PendingOp::Delete { .. } => summary.deletes += 1,
            }
        }
        summary.collections = self.written.iter().cloned().collect();

        if ops.is_empty() {
            self.state = SessionState::Committed;
            return Ok(summary);
        }

        match self.store.apply(&self.guard, &ops) {
            Ok(()) => {
                self.state = SessionState::Committed;
                debug!(
                    "[store] Committed {} put(s), {} delete(s) across {:?}",
                    summary.puts, summary.deletes, summary.collections
                );
                Ok(summary)
            }
            Err(e) => {
                self.state = SessionState::RolledBack;
                warn!("[store] Commit failed, nothing written: {}", e);
                Err(e)
            }
        }
    }

    /// Discard every buffered write.
    pub fn rollback(&mut self) -> EngineResult<()> {
        self.ensure_open("roll back")?;
        self.pending.clear();
        self.state = SessionState::RolledBack;
        Ok(())
    }

    // ── Introspection ──────────────────────────────────────────────────

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Collections read with `load`/`load_recent`.
    pub fn loaded(&self) -> impl Iterator<Item = &str> {
        self.loaded.iter().map(String::as_str)
    }

    /// Collections with buffered or committed writes.
    pub fn written(&self) -> impl Iterator<Item = &str> {
        self.written.iter().map(String::as_str)
    }

    /// Loaded or written collections, sorted.
    pub fn touched(&self) -> Vec<String> {
        self.loaded.union(&self.written).cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn guard(&self) -> &DimensionGuard {
        &self.guard
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.state == SessionState::Open && !self.pending.is_empty() {
            warn!(
                "[store] Session dropped with {} uncommitted write(s), rolled back",
                self.pending.len()
            );
        }
    }
}
