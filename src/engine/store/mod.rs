// Intelsync Engine: Record Store
// The relational backend: one SQLite file, one table per declared collection.
//
// Module layout:
//   codec       record ↔ row conversion, row-level read/write helpers
//   migrations  registry-driven DDL, additive upgrades
//   session     buffered read/write session + commit coordinator
//   query       lazy keyset-paginated record stream
//
// A process holds at most a handful of short sessions. All writes of a
// session land in one IMMEDIATE transaction, which is also the cross-process
// single-writer lock.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::StoreConfig;
use crate::engine::guard::DimensionGuard;
use crate::engine::schema::SchemaRegistry;
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};

pub(crate) mod codec;
mod migrations;
mod query;
mod session;

pub use codec::{f32_vec_to_bytes, Record};
pub use query::RecordQuery;
pub use session::{CommitSummary, Session};

pub(crate) use session::PendingOp;

/// Handle on an open record store.
pub struct RecordStore {
    /// The SQLite connection, protected by a Mutex.
    pub(crate) conn: Mutex<Connection>,
    registry: SchemaRegistry,
    path: Option<PathBuf>,
    page_size: usize,
}

impl RecordStore {
    /// Open (or create) the store at `config.db_path` and bring its schema up
    /// to the registry's declarations.
    pub fn open(config: &StoreConfig, registry: SchemaRegistry) -> EngineResult<Self> {
        config.validate()?;
        let path = config.db_path.clone();
        info!("[store] Opening record store at {:?}", path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path).map_err(EngineError::from_write_failure)?;
        conn.busy_timeout(config.busy_timeout())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA synchronous=NORMAL;").ok();

        Self::init(conn, registry, Some(path), config.query_page_size)
    }

    /// A private in-memory store. Used by unit tests.
    pub fn open_in_memory(registry: SchemaRegistry) -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, registry, None, crate::atoms::constants::DEFAULT_QUERY_PAGE_SIZE)
    }

    fn init(
        mut conn: Connection,
        registry: SchemaRegistry,
        path: Option<PathBuf>,
        page_size: usize,
    ) -> EngineResult<Self> {
        migrations::run_migrations(&mut conn, &registry).map_err(|e| match e {
            EngineError::Database(db) => EngineError::from_write_failure(db),
            other => other,
        })?;
        Ok(RecordStore { conn: Mutex::new(conn), registry, path, page_size })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Start a session. The guard is seeded with the widths already pinned
    /// in the store.
    pub fn begin_session(&self) -> EngineResult<Session<'_>> {
        let pinned = {
            let conn = self.conn.lock();
            DimensionGuard::load_pinned(&conn)?
        };
        Ok(Session::new(self, DimensionGuard::new(&self.registry, pinned)))
    }

    /// Committed record count of a collection.
    pub fn count(&self, collection: &str) -> EngineResult<i64> {
        let spec = self.registry.spec_of(collection)?;
        let conn = self.conn.lock();
        codec::count(&conn, spec)
    }

    /// One committed record by id.
    pub fn get(&self, collection: &str, id: &str) -> EngineResult<Option<Record>> {
        let spec = self.registry.spec_of(collection)?;
        let conn = self.conn.lock();
        codec::read_one(&conn, spec, id)
    }

    /// Lazy scan of committed rows, in insertion order.
    pub fn query<P>(&self, collection: &str, predicate: P) -> EngineResult<RecordQuery<'_, P>>
    where
        P: FnMut(&Record) -> bool,
    {
        let spec = self.registry.spec_of(collection)?;
        Ok(RecordQuery::new(self, spec, predicate))
    }

    /// Width pinned for a collection, if any embedding was ever committed.
    pub fn pinned_width(&self, collection: &str) -> EngineResult<Option<usize>> {
        self.registry.spec_of(collection)?;
        let conn = self.conn.lock();
        let width: Option<i64> = conn
            .query_row(
                "SELECT width FROM _dimensions WHERE collection = ?1",
                params![collection],
                |r| r.get(0),
            )
            .optional()?;
        Ok(width.map(|w| w as usize))
    }

    // ── _meta ──────────────────────────────────────────────────────────

    pub(crate) fn meta_get(&self, key: &str) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT value FROM _meta WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?)
    }

    pub(crate) fn meta_set(&self, key: &str, value: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        write_meta(&conn, key, value)
    }

    // ── Whole-store reads ──────────────────────────────────────────────

    /// Run `f` inside a read transaction, so every read sees one snapshot.
    pub(crate) fn with_snapshot<R>(
        &self,
        f: impl FnOnce(&Connection) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let out = f(&*tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` holding the store's write lock. Other processes' commits and
    /// exports wait until `f` returns.
    pub(crate) fn with_write_lock<R>(
        &self,
        f: impl FnOnce(&Connection) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(EngineError::from_write_failure)?;
        let out = f(&*tx)?;
        tx.commit().map_err(EngineError::from_write_failure)?;
        Ok(out)
    }

    // ── Commit ─────────────────────────────────────────────────────────

    /// Apply a session's buffered operations in one IMMEDIATE transaction.
    /// Either every operation lands or none does.
    pub(crate) fn apply(&self, guard: &DimensionGuard, ops: &[PendingOp]) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(EngineError::from_write_failure)?;
        let now = super::now_ms();

        guard.persist(&tx, now)?;

        for op in ops {
            match op {
                PendingOp::Put { collection, id, encoded, .. } => {
                    let spec = self.registry.spec_of(collection)?;
                    codec::upsert(&tx, spec, id, encoded, now)
                        .map_err(EngineError::from_write_failure)?;
                }
                PendingOp::Delete { collection, id } => {
                    let spec = self.registry.spec_of(collection)?;
                    codec::delete(&tx, spec, id).map_err(EngineError::from_write_failure)?;
                }
            }
        }

        tx.commit().map_err(EngineError::from_write_failure)?;
        debug!("[store] Applied {} operation(s)", ops.len());
        Ok(())
    }
}

/// Upsert a `_meta` entry on an already-locked connection.
pub(crate) fn write_meta(conn: &Connection, key: &str, value: &str) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO _meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(EngineError::from_write_failure)?;
    Ok(())
}
