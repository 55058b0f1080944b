// ── Mirror Store ───────────────────────────────────────────────────────────
//
// The portable JSON document: collection name → ordered list of records.
// It is never queried on the hot path, only synchronized with the record
// store. Writes replace the file atomically (temp sibling, fsync, rename) so a
// concurrent reader sees either the old document or the new one.
//
// Reading also accepts the shape older producers wrote, where a collection
// is an object keyed by id instead of an array:
//
//   { "patterns": { "edit|rust": { "state": "edit", "q_value": 0.5, ... } },
//     "stats": { "session_count": 3 } }
//
// Keyed entries get their `id` from the key; scalar entries become
// `{ "key": <key>, "value": <scalar> }`. Only the container shape is handled
// here. Their field names are translated at import time by `legacy`.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::store::Record;
use log::{debug, warn};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    collections: BTreeMap<String, Vec<Record>>,
    /// Top-level keys that were not collections (scalars, nulls).
    skipped: Vec<String>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collection: impl Into<String>, records: Vec<Record>) {
        self.collections.insert(collection.into(), records);
    }

    pub fn get(&self, collection: &str) -> Option<&[Record]> {
        self.collections.get(collection).map(Vec::as_slice)
    }

    /// Collections in name order.
    pub fn collections(&self) -> impl Iterator<Item = (&str, &[Record])> {
        self.collections.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Parse a document, failing with `CorruptDocument` on anything that is
    /// not a JSON object at the top level.
    pub fn from_json(text: &str) -> EngineResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| EngineError::CorruptDocument(e.to_string()))?;
        let Value::Object(top) = value else {
            return Err(EngineError::CorruptDocument(
                "top level is not an object".into(),
            ));
        };

        let mut doc = Document::new();
        for (name, value) in top {
            match value {
                Value::Array(items) => {
                    let records = items
                        .into_iter()
                        .filter_map(|item| match item {
                            Value::Object(map) => Some(map),
                            other => {
                                warn!("[mirror] {}: ignoring non-object entry {}", name, other);
                                None
                            }
                        })
                        .collect();
                    doc.collections.insert(name, records);
                }
                Value::Object(keyed) => {
                    let records = keyed.into_iter().map(|(k, v)| keyed_record(k, v)).collect();
                    doc.collections.insert(name, records);
                }
                _ => doc.skipped.push(name),
            }
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> EngineResult<String> {
        let mut top = Map::new();
        for (name, records) in &self.collections {
            top.insert(
                name.clone(),
                Value::Array(records.iter().cloned().map(Value::Object).collect()),
            );
        }
        Ok(serde_json::to_string_pretty(&Value::Object(top))?)
    }
}

fn keyed_record(key: String, value: Value) -> Record {
    match value {
        Value::Object(mut map) => {
            map.entry("id").or_insert_with(|| Value::String(key));
            map
        }
        scalar => {
            let mut map = Map::new();
            map.insert("id".into(), Value::String(key.clone()));
            map.insert("key".into(), Value::String(key));
            map.insert("value".into(), scalar);
            map
        }
    }
}

pub struct MirrorStore;

impl MirrorStore {
    /// Read and parse the mirror. A missing file is an `Io` error with kind
    /// `NotFound`; an unparsable one is `CorruptDocument`.
    pub fn read(path: &Path) -> EngineResult<Document> {
        let bytes = std::fs::read(path)?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| EngineError::CorruptDocument(format!("{}: {}", path.display(), e)))?;
        Document::from_json(text).map_err(|e| match e {
            EngineError::CorruptDocument(detail) => {
                EngineError::CorruptDocument(format!("{}: {}", path.display(), detail))
            }
            other => other,
        })
    }

    /// Replace the mirror atomically.
    pub fn write(path: &Path, doc: &Document) -> EngineResult<()> {
        let json = doc.to_json()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = temp_sibling(path);
        let written = (|| -> std::io::Result<()> {
            let mut f = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
            f.write_all(json.as_bytes())?;
            f.sync_all()?;
            std::fs::rename(&tmp, path)
        })();
        if let Err(e) = written {
            std::fs::remove_file(&tmp).ok();
            return Err(e.into());
        }

        debug!("[mirror] Wrote {} record(s) to {:?}", doc.record_count(), path);
        Ok(())
    }
}

/// `.<name>.<pid>.tmp` next to the target, so two writers never share a temp.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("mirror");
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}
