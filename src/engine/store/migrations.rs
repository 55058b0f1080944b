// Database schema and migrations for the record store.
// Called once by RecordStore::open() after WAL is enabled.
// DDL is generated from the schema registry. Every step is idempotent:
// CREATE TABLE IF NOT EXISTS for new collections, ALTER TABLE … ADD COLUMN
// for fields an older store lacks. Nothing is ever dropped or rewritten.
// The whole pass runs in one IMMEDIATE transaction, so concurrent openers
// queue on the write lock and see either the old schema or the finished one.

use super::codec::quote_ident as q;
use crate::atoms::constants::*;
use crate::atoms::error::EngineResult;
use crate::engine::schema::{CollectionSpec, SchemaRegistry};
use log::{info, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, TransactionBehavior};
use serde_json::{Map, Value};
use std::collections::HashSet;

pub(crate) fn run_migrations(conn: &mut Connection, registry: &SchemaRegistry) -> EngineResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    // ── Store-internal tables ───────────────────────────────────────
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS _meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS _dimensions (
            collection TEXT PRIMARY KEY,
            width INTEGER NOT NULL,
            pinned_at INTEGER NOT NULL DEFAULT 0
        );
    ",
    )?;

    // ── One table per declared collection ───────────────────────────
    for spec in registry.collections() {
        migrate_collection(&tx, spec)?;
    }

    // ── Schema version (never downgraded) ───────────────────────────
    let stored: i64 = tx
        .query_row(
            "SELECT value FROM _meta WHERE key = ?1",
            params![META_SCHEMA_VERSION],
            |r| r.get::<_, String>(0),
        )
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if stored > SCHEMA_VERSION {
        warn!(
            "[store] Store schema v{} is newer than this build (v{}), continuing additively",
            stored, SCHEMA_VERSION
        );
    } else if stored < SCHEMA_VERSION {
        tx.execute(
            "INSERT OR REPLACE INTO _meta (key, value) VALUES (?1, ?2)",
            params![META_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
        )?;
        if stored > 0 {
            info!("[store] Upgraded schema v{} → v{}", stored, SCHEMA_VERSION);
        }
    }

    tx.commit()?;
    Ok(())
}

fn existing_columns(conn: &Connection, table: &str) -> EngineResult<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let cols = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(cols)
}

fn migrate_collection(conn: &Connection, spec: &CollectionSpec) -> EngineResult<()> {
    let table = q(&spec.name);

    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            {} TEXT PRIMARY KEY,
            {} INTEGER NOT NULL DEFAULT 0,
            {} TEXT,
            {} INTEGER NOT NULL DEFAULT 0",
        table,
        q(COL_ID),
        q(COL_SEQ),
        q(COL_EXTRA),
        q(COL_UPDATED)
    );
    for field in &spec.fields {
        ddl.push_str(&format!(",\n            {} {}", q(&field.name), field.kind.sql_type()));
    }
    ddl.push_str("\n        );");
    conn.execute_batch(&ddl)?;

    let existing = existing_columns(conn, &spec.name)?;

    if !existing.contains(COL_SEQ) {
        conn.execute_batch(&format!(
            "ALTER TABLE {t} ADD COLUMN {seq} INTEGER NOT NULL DEFAULT 0;
             UPDATE {t} SET {seq} = rowid WHERE {seq} = 0;",
            t = table,
            seq = q(COL_SEQ),
        ))?;
    }
    if !existing.contains(COL_EXTRA) {
        conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} TEXT", table, q(COL_EXTRA)), [])?;
    }
    if !existing.contains(COL_UPDATED) {
        conn.execute(
            &format!(
                "ALTER TABLE {} ADD COLUMN {} INTEGER NOT NULL DEFAULT 0",
                table,
                q(COL_UPDATED)
            ),
            [],
        )?;
    }

    for field in &spec.fields {
        if !existing.contains(&field.name) {
            conn.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    table,
                    q(&field.name),
                    field.kind.sql_type()
                ),
                [],
            )?;
            if !existing.is_empty() {
                info!("[store] Added column {}.{}", spec.name, field.name);
            }
        }
    }

    // Legacy tables keyed by something else: add an id, backfill it, and
    // give it the unique index the upsert path conflicts on.
    if !existing.contains(COL_ID) {
        warn!("[store] {} has no id column, adding one", spec.name);
        conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} TEXT", table, q(COL_ID)), [])?;
        backfill_ids(conn, spec)?;
        conn.execute_batch(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {}({});",
            q(&format!("uq_{}_id", spec.name)),
            table,
            q(COL_ID),
        ))?;
    }

    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS {} ON {}({});",
        q(&format!("idx_{}_seq", spec.name)),
        table,
        q(COL_SEQ)
    ))?;

    Ok(())
}

/// Give every legacy row the id the current writers would use for it: the
/// escaped natural key where the collection has one. Rows without a usable
/// key, and later duplicates of a key, fall back to `rowid:<n>`.
fn backfill_ids(conn: &Connection, spec: &CollectionSpec) -> EngineResult<()> {
    let mut select = String::from("SELECT rowid");
    for name in &spec.natural_key {
        select.push_str(", ");
        select.push_str(&q(name));
    }
    select.push_str(&format!(" FROM {} ORDER BY rowid", q(&spec.name)));

    let mut stmt = conn.prepare(&select)?;
    let rows = stmt
        .query_map([], |row| {
            let rowid: i64 = row.get(0)?;
            let mut key = Map::new();
            for (i, name) in spec.natural_key.iter().enumerate() {
                key.insert(name.clone(), sql_to_json(row.get(i + 1)?));
            }
            Ok((rowid, key))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut taken = HashSet::new();
    let mut fallbacks = 0usize;
    let mut update = conn.prepare(&format!(
        "UPDATE {} SET {} = ?1 WHERE rowid = ?2",
        q(&spec.name),
        q(COL_ID)
    ))?;
    for (rowid, key) in rows {
        let id = match spec.natural_id(&key) {
            Some(id) if taken.insert(id.clone()) => id,
            _ => {
                fallbacks += 1;
                format!("rowid:{}", rowid)
            }
        };
        update.execute(params![id, rowid])?;
    }
    if fallbacks > 0 && !spec.natural_key.is_empty() {
        warn!(
            "[store] {}: {} legacy rows had a missing or duplicate natural key",
            spec.name, fallbacks
        );
    }
    Ok(())
}

fn sql_to_json(v: SqlValue) -> Value {
    match v {
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Null | SqlValue::Blob(_) => Value::Null,
    }
}
