// ── Schema Registry ────────────────────────────────────────────────────────
//
// Declares the fixed set of collections and the shape of each record.
// Pure and in-memory: the record store generates its DDL from here, the
// dimension guard reads embedding widths from here, and the synchronizer
// uses it to decide which document keys are collections.
//
// Every collection has an implicit `id TEXT PRIMARY KEY`; declared fields
// map one-to-one onto columns. Collections whose records are identified by
// their content (a Q-table cell, a file transition) also name a natural key,
// and their id is always the escaped composite of those fields.

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::composite_key;
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Real,
    /// Stored as INTEGER 0/1, exchanged as JSON `true`/`false`.
    Bool,
    /// Arbitrary JSON, stored as TEXT.
    Json,
    /// Raw bytes, stored as BLOB, exchanged as base64 text.
    Blob,
    /// f32 vector, stored as little-endian BLOB, exchanged as a JSON array.
    /// Subject to the dimension guard.
    Embedding,
}

impl FieldKind {
    pub(crate) fn sql_type(&self) -> &'static str {
        match self {
            Self::Text | Self::Json => "TEXT",
            Self::Integer | Self::Bool => "INTEGER",
            Self::Real => "REAL",
            Self::Blob | Self::Embedding => "BLOB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &str, kind: FieldKind) -> Self {
        Self { name: name.to_string(), kind, required: true }
    }

    pub fn optional(name: &str, kind: FieldKind) -> Self {
        Self { name: name.to_string(), kind, required: false }
    }
}

/// Ordered field list of a collection (the `id` key is implicit).
pub type RecordShape = Vec<FieldSpec>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub fields: RecordShape,
    /// Declared embedding width. `None` on an embedding-bearing collection
    /// means the width is pinned by the first committed embedding.
    pub embedding_width: Option<usize>,
    /// Fields whose values make up the record id. Empty when ids are opaque.
    pub natural_key: Vec<String>,
}

impl CollectionSpec {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn embedding_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.kind == FieldKind::Embedding)
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding_fields().next().is_some()
    }

    /// Id derived from the natural key. `None` when the collection has no
    /// natural key or a key field is missing or not a scalar.
    pub fn natural_id(&self, record: &Map<String, Value>) -> Option<String> {
        if self.natural_key.is_empty() {
            return None;
        }
        let parts = self
            .natural_key
            .iter()
            .map(|name| match record.get(name)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            })
            .collect::<Option<Vec<String>>>()?;
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        Some(composite_key(&parts))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    collections: Vec<CollectionSpec>,
    index: HashMap<String, usize>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a collection. Names are plain lowercase identifiers; a leading
    /// underscore is reserved for the store's own tables.
    pub fn declare(
        &mut self,
        name: &str,
        shape: RecordShape,
        embedding_width: Option<usize>,
    ) -> EngineResult<&CollectionSpec> {
        self.declare_keyed(name, shape, embedding_width, &[])
    }

    /// Declare a collection whose ids derive from `natural_key`.
    pub fn declare_keyed(
        &mut self,
        name: &str,
        shape: RecordShape,
        embedding_width: Option<usize>,
        natural_key: &[&str],
    ) -> EngineResult<&CollectionSpec> {
        if !is_identifier(name) || name.starts_with('_') {
            return Err(EngineError::Config(format!("invalid collection name '{}'", name)));
        }
        if self.index.contains_key(name) {
            return Err(EngineError::Config(format!("collection '{}' declared twice", name)));
        }
        {
            let mut seen = std::collections::HashSet::new();
            for field in &shape {
                if !is_identifier(&field.name) || is_reserved_column(&field.name) {
                    return Err(EngineError::Config(format!(
                        "invalid field name '{}' in {}",
                        field.name, name
                    )));
                }
                if !seen.insert(field.name.as_str()) {
                    return Err(EngineError::Config(format!(
                        "duplicate field '{}' in {}",
                        field.name, name
                    )));
                }
            }
        }
        for key in natural_key {
            match shape.iter().find(|f| f.name == *key) {
                Some(f)
                    if f.required
                        && matches!(
                            f.kind,
                            FieldKind::Text | FieldKind::Integer | FieldKind::Real | FieldKind::Bool
                        ) => {}
                _ => {
                    return Err(EngineError::Config(format!(
                        "{}: natural key field '{}' must be a required scalar field",
                        name, key
                    )))
                }
            }
        }
        let spec = CollectionSpec {
            name: name.to_string(),
            fields: shape,
            embedding_width,
            natural_key: natural_key.iter().map(|k| k.to_string()).collect(),
        };
        match embedding_width {
            Some(0) => {
                return Err(EngineError::Config(format!("{}: embedding width must be positive", name)))
            }
            Some(_) if !spec.has_embedding() => {
                return Err(EngineError::Config(format!(
                    "{}: embedding width declared without an embedding field",
                    name
                )))
            }
            _ => {}
        }
        self.index.insert(name.to_string(), self.collections.len());
        self.collections.push(spec);
        Ok(&self.collections[self.collections.len() - 1])
    }

    pub fn spec_of(&self, name: &str) -> EngineResult<&CollectionSpec> {
        self.index
            .get(name)
            .map(|&i| &self.collections[i])
            .ok_or_else(|| EngineError::UnknownCollection(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Collections in declaration order.
    pub fn collections(&self) -> impl Iterator<Item = &CollectionSpec> {
        self.collections.iter()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// The twelve collections of the intelligence store.
    ///
    /// Some of them (`edges`, `agents`, `neural_patterns`) may legitimately
    /// stay empty: the registry records intent, not guaranteed population.
    pub fn standard(embedding_dim: Option<usize>) -> EngineResult<Self> {
        use FieldKind::*;
        let mut r = Self::new();
        r.declare(
            MEMORIES,
            vec![
                FieldSpec::required("content", Text),
                FieldSpec::optional("embedding", Embedding),
                FieldSpec::required("memory_type", Text),
                FieldSpec::required("timestamp", Integer),
                FieldSpec::optional("embedding_model", Text),
                FieldSpec::optional("metadata", Json),
            ],
            embedding_dim,
        )?;
        r.declare_keyed(
            PATTERNS,
            vec![
                FieldSpec::required("state", Text),
                FieldSpec::required("action", Text),
                FieldSpec::required("value", Real),
                FieldSpec::required("update_count", Integer),
                FieldSpec::optional("last_update", Integer),
            ],
            None,
            &["state", "action"],
        )?;
        r.declare_keyed(
            LEARNING_DATA,
            vec![
                FieldSpec::required("algorithm_id", Text),
                FieldSpec::required("table_data", Json),
                FieldSpec::optional("updated_at", Integer),
            ],
            None,
            &["algorithm_id"],
        )?;
        r.declare(
            TRAJECTORIES,
            vec![
                FieldSpec::required("steps", Json),
                FieldSpec::optional("final_score", Real),
                FieldSpec::optional("embedding", Embedding),
                FieldSpec::required("sealed", Bool),
                FieldSpec::required("started_at", Integer),
                FieldSpec::optional("ended_at", Integer),
            ],
            embedding_dim,
        )?;
        r.declare_keyed(
            EDGES,
            vec![
                FieldSpec::required("from_id", Text),
                FieldSpec::required("to_id", Text),
                FieldSpec::required("kind", Text),
                FieldSpec::required("weight", Real),
            ],
            None,
            &["from_id", "to_id", "kind"],
        )?;
        r.declare(
            NEURAL_PATTERNS,
            vec![
                FieldSpec::required("centroid", Embedding),
                FieldSpec::required("cluster_size", Integer),
                FieldSpec::required("confidence", Real),
            ],
            embedding_dim,
        )?;
        r.declare(
            COMPRESSED_PATTERNS,
            vec![
                FieldSpec::required("compression_level", Text),
                FieldSpec::required("payload", Blob),
                FieldSpec::optional("source_id", Text),
                FieldSpec::required("dims", Integer),
            ],
            None,
        )?;
        r.declare_keyed(
            FILE_SEQUENCES,
            vec![
                FieldSpec::required("prev_file", Text),
                FieldSpec::required("next_file", Text),
                FieldSpec::required("count", Integer),
            ],
            None,
            &["prev_file", "next_file"],
        )?;
        r.declare(
            AGENTS,
            vec![
                FieldSpec::required("role", Text),
                FieldSpec::required("created_at", Integer),
            ],
            None,
        )?;
        r.declare_keyed(
            KV_STORE,
            vec![FieldSpec::required("key", Text), FieldSpec::required("value", Text)],
            None,
            &["key"],
        )?;
        r.declare_keyed(
            STATS,
            vec![FieldSpec::required("key", Text), FieldSpec::required("value", Integer)],
            None,
            &["key"],
        )?;
        r.declare(
            ERRORS,
            vec![
                FieldSpec::required("signature", Text),
                FieldSpec::optional("context", Text),
                FieldSpec::optional("resolution", Text),
                FieldSpec::optional("occurrences", Integer),
            ],
            None,
        )?;
        Ok(r)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_reserved_column(s: &str) -> bool {
    s == COL_ID || s.starts_with('_')
}
