// Record ↔ row conversion.
// A record is a JSON object; the schema registry decides which keys become
// typed columns. Undeclared keys ride along in `_extra` so a legacy
// producer's fields survive a round trip through the store.

use crate::atoms::constants::{COL_EXTRA, COL_ID, COL_SEQ, COL_UPDATED};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::schema::{CollectionSpec, FieldKind};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, Row};
use serde_json::{Map, Value};

/// A record as exchanged with callers and the mirror document.
pub type Record = Map<String, Value>;

/// A validated record, ready to bind.
#[derive(Debug, Clone)]
pub(crate) struct EncodedRecord {
    /// One value per declared field, in declaration order.
    pub values: Vec<SqlValue>,
    pub extra: Option<String>,
    /// Width of every non-null embedding in the record.
    pub embedding_widths: Vec<usize>,
}

// ── Vector bytes ───────────────────────────────────────────────────────────

/// Convert a byte slice (from SQLite BLOB) to a Vec<f32>.
pub(crate) fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Convert a Vec<f32> to bytes for SQLite BLOB storage.
pub fn f32_vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Shortest decimal form of an f32, so `0.1f32` exports as `0.1`.
fn f32_to_json(f: f32) -> Value {
    let wide: f64 = f.to_string().parse().unwrap_or(f as f64);
    serde_json::Number::from_f64(wide).map(Value::Number).unwrap_or(Value::Null)
}

// ── Encode ─────────────────────────────────────────────────────────────────

pub(crate) fn encode_record(
    spec: &CollectionSpec,
    id: &str,
    record: &Record,
) -> EngineResult<EncodedRecord> {
    let bad = |msg: String| EngineError::invalid_record(&spec.name, msg);

    if id.is_empty() {
        return Err(bad("empty id".into()));
    }
    if let Some(inner) = record.get(COL_ID) {
        if inner.as_str() != Some(id) {
            return Err(bad(format!("record id {} does not match key '{}'", inner, id)));
        }
    }

    let mut values = Vec::with_capacity(spec.fields.len());
    let mut embedding_widths = Vec::new();

    for field in &spec.fields {
        let raw = record.get(&field.name).filter(|v| !v.is_null());
        let Some(v) = raw else {
            if field.required {
                return Err(bad(format!("missing required field '{}'", field.name)));
            }
            values.push(SqlValue::Null);
            continue;
        };
        let encoded = match field.kind {
            FieldKind::Text => match v {
                Value::String(s) => SqlValue::Text(s.clone()),
                _ => return Err(bad(format!("'{}' must be a string", field.name))),
            },
            FieldKind::Integer => match v.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => match v.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        SqlValue::Integer(f as i64)
                    }
                    _ => return Err(bad(format!("'{}' must be an integer", field.name))),
                },
            },
            FieldKind::Real => match v.as_f64() {
                Some(f) => SqlValue::Real(f),
                None => return Err(bad(format!("'{}' must be a number", field.name))),
            },
            FieldKind::Bool => match v {
                Value::Bool(b) => SqlValue::Integer(*b as i64),
                Value::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => {
                    SqlValue::Integer(n.as_i64().unwrap_or(0))
                }
                _ => return Err(bad(format!("'{}' must be a boolean", field.name))),
            },
            FieldKind::Json => SqlValue::Text(serde_json::to_string(v)?),
            FieldKind::Blob => match v {
                Value::String(s) => SqlValue::Blob(
                    BASE64
                        .decode(s.as_bytes())
                        .map_err(|e| bad(format!("'{}' is not base64: {}", field.name, e)))?,
                ),
                _ => return Err(bad(format!("'{}' must be a base64 string", field.name))),
            },
            FieldKind::Embedding => {
                let Value::Array(items) = v else {
                    return Err(bad(format!("'{}' must be an array of numbers", field.name)));
                };
                if items.is_empty() {
                    return Err(bad(format!("'{}' is an empty embedding", field.name)));
                }
                let mut vector = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_f64() {
                        Some(f) => vector.push(f as f32),
                        None => {
                            return Err(bad(format!("'{}' contains a non-number", field.name)))
                        }
                    }
                }
                embedding_widths.push(vector.len());
                SqlValue::Blob(f32_vec_to_bytes(&vector))
            }
        };
        values.push(encoded);
    }

    let extras: Map<String, Value> = record
        .iter()
        .filter(|(k, _)| k.as_str() != COL_ID && spec.field(k).is_none())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let extra = if extras.is_empty() { None } else { Some(serde_json::to_string(&extras)?) };

    Ok(EncodedRecord { values, extra, embedding_widths })
}

/// The canonical record for `(id, record)`: `id` first, then the caller's keys.
pub(crate) fn normalize(id: &str, record: &Record) -> Record {
    let mut out = Record::new();
    out.insert(COL_ID.to_string(), Value::String(id.to_string()));
    for (k, v) in record {
        if k != COL_ID && !v.is_null() {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

// ── Decode ─────────────────────────────────────────────────────────────────

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// `"id", "_extra", <fields…>`: the column list `decode_row` expects.
pub(crate) fn select_columns(spec: &CollectionSpec) -> String {
    let mut cols = vec![quote(COL_ID), quote(COL_EXTRA)];
    cols.extend(spec.fields.iter().map(|f| quote(&f.name)));
    cols.join(", ")
}

pub(crate) fn decode_row(spec: &CollectionSpec, row: &Row<'_>) -> rusqlite::Result<Record> {
    let mut record = Record::new();
    let id: String = row.get(0)?;
    record.insert(COL_ID.to_string(), Value::String(id));

    for (i, field) in spec.fields.iter().enumerate() {
        let value = decode_value(field.kind, row.get_ref(i + 2)?);
        if !value.is_null() {
            record.insert(field.name.clone(), value);
        }
    }

    let extra: Option<String> = row.get(1)?;
    if let Some(text) = extra {
        if let Ok(Value::Object(extras)) = serde_json::from_str::<Value>(&text) {
            for (k, v) in extras {
                record.entry(k).or_insert(v);
            }
        }
    }
    Ok(record)
}

fn decode_value(kind: FieldKind, raw: ValueRef<'_>) -> Value {
    match (kind, raw) {
        (_, ValueRef::Null) => Value::Null,
        (FieldKind::Bool, ValueRef::Integer(i)) => Value::Bool(i != 0),
        (FieldKind::Json, ValueRef::Text(t)) => {
            let text = String::from_utf8_lossy(t);
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.into_owned()))
        }
        (FieldKind::Blob, ValueRef::Blob(b)) => Value::String(BASE64.encode(b)),
        (FieldKind::Embedding, ValueRef::Blob(b)) => {
            Value::Array(bytes_to_f32_vec(b).into_iter().map(f32_to_json).collect())
        }
        (_, ValueRef::Integer(i)) => Value::from(i),
        (_, ValueRef::Real(f)) => {
            serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        (_, ValueRef::Text(t)) => Value::String(String::from_utf8_lossy(t).into_owned()),
        (_, ValueRef::Blob(b)) => Value::String(BASE64.encode(b)),
    }
}

// ── Row I/O ────────────────────────────────────────────────────────────────

/// Every committed record of a collection, in insertion order.
pub(crate) fn read_all(conn: &Connection, spec: &CollectionSpec) -> EngineResult<Vec<Record>> {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        select_columns(spec),
        quote(&spec.name),
        quote(COL_SEQ)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| decode_row(spec, row))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// The `limit` most recently inserted records, oldest first.
pub(crate) fn read_recent(
    conn: &Connection,
    spec: &CollectionSpec,
    limit: usize,
) -> EngineResult<Vec<Record>> {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {} DESC LIMIT ?1",
        select_columns(spec),
        quote(&spec.name),
        quote(COL_SEQ)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit as i64], |row| decode_row(spec, row))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    out.reverse();
    Ok(out)
}

pub(crate) fn read_one(
    conn: &Connection,
    spec: &CollectionSpec,
    id: &str,
) -> EngineResult<Option<Record>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        select_columns(spec),
        quote(&spec.name),
        quote(COL_ID)
    );
    let result = conn.query_row(&sql, params![id], |row| decode_row(spec, row));
    match result {
        Ok(r) => Ok(Some(r)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn count(conn: &Connection, spec: &CollectionSpec) -> EngineResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote(&spec.name));
    Ok(conn.query_row(&sql, [], |r| r.get(0))?)
}

/// Insert or replace by id. The insertion sequence of an existing row is kept.
pub(crate) fn upsert(
    conn: &Connection,
    spec: &CollectionSpec,
    id: &str,
    encoded: &EncodedRecord,
    now_ms: i64,
) -> rusqlite::Result<usize> {
    let table = quote(&spec.name);
    let mut cols = vec![quote(COL_ID), quote(COL_SEQ), quote(COL_EXTRA), quote(COL_UPDATED)];
    cols.extend(spec.fields.iter().map(|f| quote(&f.name)));

    let mut placeholders = vec![
        "?1".to_string(),
        format!("(SELECT COALESCE(MAX({}), 0) + 1 FROM {})", quote(COL_SEQ), table),
        "?2".to_string(),
        "?3".to_string(),
    ];
    placeholders.extend((0..spec.fields.len()).map(|i| format!("?{}", i + 4)));

    let mut updates = vec![
        format!("{0} = excluded.{0}", quote(COL_EXTRA)),
        format!("{0} = excluded.{0}", quote(COL_UPDATED)),
    ];
    updates.extend(spec.fields.iter().map(|f| format!("{0} = excluded.{0}", quote(&f.name))));

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
        table,
        cols.join(", "),
        placeholders.join(", "),
        quote(COL_ID),
        updates.join(", ")
    );

    let mut bound: Vec<SqlValue> = Vec::with_capacity(encoded.values.len() + 3);
    bound.push(SqlValue::Text(id.to_string()));
    bound.push(encoded.extra.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null));
    bound.push(SqlValue::Integer(now_ms));
    bound.extend(encoded.values.iter().cloned());

    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(rusqlite::params_from_iter(bound))
}

pub(crate) fn delete(conn: &Connection, spec: &CollectionSpec, id: &str) -> rusqlite::Result<usize> {
    let sql = format!("DELETE FROM {} WHERE {} = ?1", quote(&spec.name), quote(COL_ID));
    conn.execute(&sql, params![id])
}

pub(crate) fn quote_ident(ident: &str) -> String {
    quote(ident)
}
