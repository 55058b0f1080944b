// ── State Carrier ──────────────────────────────────────────────────────────
//
// Scalars that must outlive a single hook process live in `kv_store`, written
// through the session like any other collection. The file-edit continuity
// tracker is its main consumer: it remembers the previous file and counts
// `prev -> next` transitions in `file_sequences`.

use crate::atoms::constants::{FILE_SEQUENCES, KV_LAST_FILE, KV_STORE};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{FileSequence, KvEntry};
use crate::engine::store::{RecordStore, Session};
use log::debug;
use serde_json::Value;

/// Key/value view over a session.
pub struct StateCarrier<'s, 'a> {
    session: &'s mut Session<'a>,
}

impl<'s, 'a> StateCarrier<'s, 'a> {
    pub fn new(session: &'s mut Session<'a>) -> Self {
        Self { session }
    }

    pub fn get(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(self.session.get_record::<KvEntry>(key)?.map(|kv| kv.value))
    }

    pub fn set(&mut self, key: &str, value: &str) -> EngineResult<()> {
        self.session.put_record(&KvEntry { key: key.to_string(), value: value.to_string() })
    }

    /// Remove a key. Returns whether it existed.
    pub fn remove(&mut self, key: &str) -> EngineResult<bool> {
        let existed = self.session.get(KV_STORE, key)?.is_some();
        if existed {
            self.session.load(KV_STORE)?;
            self.session.delete(KV_STORE, key)?;
        }
        Ok(existed)
    }

    /// Integer convenience on top of `get`/`set`.
    pub fn increment(&mut self, key: &str) -> EngineResult<i64> {
        let next = self.get(key)?.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0) + 1;
        self.set(key, &next.to_string())?;
        Ok(next)
    }
}

/// Record that `file` was edited. When a previous file is known, the
/// `previous -> file` transition count goes up by one. Returns the previous
/// file.
pub fn track_file_edit(session: &mut Session<'_>, file: &str) -> EngineResult<Option<String>> {
    let previous = StateCarrier::new(session).get(KV_LAST_FILE)?;

    if let Some(prev) = previous.as_deref().filter(|p| *p != file) {
        let key = FileSequence::key(prev, file);
        let count = session.get_record::<FileSequence>(&key)?.map_or(0, |s| s.count) + 1;
        session.put_record(&FileSequence {
            prev_file: prev.to_string(),
            next_file: file.to_string(),
            count,
        })?;
        debug!("[state] {} seen {} time(s)", key, count);
    }

    StateCarrier::new(session).set(KV_LAST_FILE, file)?;
    Ok(previous)
}

/// Most frequent successors of `file`, best first.
pub fn suggest_next_files(
    store: &RecordStore,
    file: &str,
    limit: usize,
) -> EngineResult<Vec<FileSequence>> {
    let mut successors = Vec::new();
    for row in store.query(FILE_SEQUENCES, |r| r.get("prev_file").and_then(Value::as_str) == Some(file))? {
        successors.push(serde_json::from_value::<FileSequence>(Value::Object(row?))?);
    }
    successors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.next_file.cmp(&b.next_file)));
    successors.truncate(limit);
    Ok(successors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::schema::SchemaRegistry;

    fn store() -> RecordStore {
        RecordStore::open_in_memory(SchemaRegistry::standard(None).unwrap()).unwrap()
    }

    #[test]
    fn kv_survives_across_sessions() {
        let s = store();
        let mut session = s.begin_session().unwrap();
        StateCarrier::new(&mut session).set("mode", "fast").unwrap();
        session.commit().unwrap();

        let mut session = s.begin_session().unwrap();
        let mut state = StateCarrier::new(&mut session);
        assert_eq!(state.get("mode").unwrap().as_deref(), Some("fast"));
        assert_eq!(state.get("absent").unwrap(), None);
        assert!(state.remove("mode").unwrap());
        assert!(!state.remove("mode").unwrap());
        session.commit().unwrap();
        assert_eq!(s.count(KV_STORE).unwrap(), 0);
    }

    #[test]
    fn increment_counts_up() {
        let s = store();
        let mut session = s.begin_session().unwrap();
        let mut state = StateCarrier::new(&mut session);
        assert_eq!(state.increment("n").unwrap(), 1);
        assert_eq!(state.increment("n").unwrap(), 2);
    }

    #[test]
    fn file_edits_build_sequences_across_processes() {
        let s = store();
        for file in ["a.rs", "b.rs", "a.rs", "b.rs", "a.rs", "c.rs"] {
            let mut session = s.begin_session().unwrap();
            track_file_edit(&mut session, file).unwrap();
            session.commit().unwrap();
        }
        let next = suggest_next_files(&s, "a.rs", 5).unwrap();
        let pairs: Vec<(&str, i64)> = next.iter().map(|f| (f.next_file.as_str(), f.count)).collect();
        assert_eq!(pairs, vec![("b.rs", 2), ("c.rs", 1)]);
        assert_eq!(suggest_next_files(&s, "b.rs", 5).unwrap()[0].count, 2);
    }

    #[test]
    fn repeated_edit_of_same_file_is_not_a_transition() {
        let s = store();
        let mut session = s.begin_session().unwrap();
        track_file_edit(&mut session, "a.rs").unwrap();
        assert_eq!(track_file_edit(&mut session, "a.rs").unwrap().as_deref(), Some("a.rs"));
        session.commit().unwrap();
        assert_eq!(s.count(FILE_SEQUENCES).unwrap(), 0);
    }
}
