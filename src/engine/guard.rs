// ── Dimension Guard ────────────────────────────────────────────────────────
//
// Every non-null embedding in a collection must have the same width.
// The expected width comes from, in order:
//   1. the width already pinned in the store (`_dimensions`), which reflects
//      the vectors actually on disk,
//   2. the width declared in the schema registry,
//   3. the first embedding admitted in the current session.
// A mismatch is rejected with `DimensionMismatch`, never stored.
//
// Widths admitted in a session are pinned inside the commit transaction and
// re-read there, so two processes racing to pin different widths cannot both
// commit.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::schema::SchemaRegistry;
use log::warn;
use rusqlite::{params, Connection};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct DimensionGuard {
    declared: HashMap<String, usize>,
    pinned: HashMap<String, usize>,
    /// Widths written during the current session, per collection.
    admitted: HashMap<String, usize>,
}

impl DimensionGuard {
    pub fn new(registry: &SchemaRegistry, pinned: HashMap<String, usize>) -> Self {
        let declared: HashMap<String, usize> = registry
            .collections()
            .filter_map(|c| c.embedding_width.map(|w| (c.name.clone(), w)))
            .collect();
        for (name, &width) in &declared {
            if let Some(&stored) = pinned.get(name) {
                if stored != width {
                    warn!(
                        "[guard] {} declares width {} but the store holds width {}; writes at {} will be rejected",
                        name, width, stored, width
                    );
                }
            }
        }
        Self { declared, pinned, admitted: HashMap::new() }
    }

    /// Load pinned widths from the store.
    pub(crate) fn load_pinned(conn: &Connection) -> EngineResult<HashMap<String, usize>> {
        let mut stmt = conn.prepare("SELECT collection, width FROM _dimensions")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(collection, width)| match usize::try_from(width) {
                Ok(w) if w > 0 => Ok((collection, w)),
                _ => Err(EngineError::InvalidRecord {
                    collection: "_dimensions".into(),
                    message: format!("{} is pinned to invalid width {}", collection, width),
                }),
            })
            .collect()
    }

    /// Width every embedding in `collection` must have, if one is fixed yet.
    pub fn expected(&self, collection: &str) -> Option<usize> {
        self.pinned
            .get(collection)
            .or_else(|| self.declared.get(collection))
            .or_else(|| self.admitted.get(collection))
            .copied()
    }

    /// Check a vector against the collection's width without recording it.
    pub fn check(&self, collection: &str, embedding: &[f32]) -> EngineResult<()> {
        self.check_width(collection, embedding.len())
    }

    fn check_width(&self, collection: &str, actual: usize) -> EngineResult<()> {
        match self.expected(collection) {
            Some(expected) if expected != actual => Err(EngineError::DimensionMismatch {
                collection: collection.to_string(),
                expected,
                actual,
            }),
            _ => Ok(()),
        }
    }

    /// Check and record a width for this session. The first admitted width of
    /// an unpinned, undeclared collection becomes its width.
    pub(crate) fn admit(&mut self, collection: &str, actual: usize) -> EngineResult<()> {
        self.check_width(collection, actual)?;
        self.admitted.entry(collection.to_string()).or_insert(actual);
        Ok(())
    }

    /// Pin every admitted width inside the commit transaction. Fails if
    /// another process pinned a different width since this session began.
    pub(crate) fn persist(&self, conn: &Connection, now_ms: i64) -> EngineResult<()> {
        for (collection, &width) in &self.admitted {
            conn.execute(
                "INSERT OR IGNORE INTO _dimensions (collection, width, pinned_at) VALUES (?1, ?2, ?3)",
                params![collection, width as i64, now_ms],
            )
            .map_err(EngineError::from_write_failure)?;
            let stored: i64 = conn.query_row(
                "SELECT width FROM _dimensions WHERE collection = ?1",
                params![collection],
                |r| r.get(0),
            )?;
            if stored as usize != width {
                return Err(EngineError::DimensionMismatch {
                    collection: collection.clone(),
                    expected: stored as usize,
                    actual: width,
                });
            }
        }
        Ok(())
    }
}
