// ── Warm Replay Loader ─────────────────────────────────────────────────────
//
// In-process learners have no on-disk format of their own. On every fresh
// start they are rebuilt by replaying the most recent sealed trajectories:
// the N newest (by end time, ties by insertion order) are fetched and fed
// oldest first, so recency weighting matches a process that never stopped.
//
// Best effort: a learner that is non-linear in replay order will not reach
// bit-identical state to a long-running one.

use crate::atoms::constants::{COL_SEQ, DEFAULT_REPLAY_DEPTH, TRAJECTORIES};
use crate::atoms::error::EngineResult;
use crate::atoms::traits::ReplayTarget;
use crate::atoms::types::Trajectory;
use crate::engine::config::StoreConfig;
use crate::engine::store::{codec, RecordStore};
use log::{info, warn};
use rusqlite::params;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayReport {
    /// Trajectories handed to the target.
    pub ingested: usize,
    /// Sealed trajectories in the store.
    pub available: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct WarmReplayLoader {
    depth: usize,
}

impl Default for WarmReplayLoader {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_DEPTH)
    }
}

impl WarmReplayLoader {
    pub fn new(depth: usize) -> Self {
        Self { depth }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.replay_depth)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The trajectories a replay would feed, oldest first.
    pub fn recent(&self, store: &RecordStore) -> EngineResult<(Vec<Trajectory>, usize)> {
        let spec = store.registry().spec_of(TRAJECTORIES)?;
        let (rows, available) = store.with_snapshot(|conn| {
            let available: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE sealed = 1", codec::quote_ident(TRAJECTORIES)),
                [],
                |r| r.get(0),
            )?;
            let sql = format!(
                "SELECT {cols} FROM {t} WHERE sealed = 1
                 ORDER BY COALESCE(ended_at, started_at) DESC, {seq} DESC LIMIT ?1",
                cols = codec::select_columns(spec),
                t = codec::quote_ident(TRAJECTORIES),
                seq = codec::quote_ident(COL_SEQ),
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![self.depth as i64], |row| codec::decode_row(spec, row))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok((rows, available as usize))
        })?;

        let mut trajectories = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            match serde_json::from_value::<Trajectory>(Value::Object(row)) {
                Ok(t) => trajectories.push(t),
                Err(e) => warn!("[replay] Skipping unreadable trajectory: {}", e),
            }
        }
        Ok((trajectories, available))
    }

    /// Feed the recent window into `target`, oldest first.
    pub fn replay<T: ReplayTarget + ?Sized>(
        &self,
        store: &RecordStore,
        target: &mut T,
    ) -> EngineResult<ReplayReport> {
        let (trajectories, available) = self.recent(store)?;
        let mut report = ReplayReport { ingested: 0, available };
        for t in &trajectories {
            match target.ingest(t) {
                Ok(()) => report.ingested += 1,
                Err(e) => warn!("[replay] Target rejected trajectory {}: {}", t.id, e),
            }
        }
        info!(
            "[replay] Warmed up from {} of {} sealed trajectories",
            report.ingested, report.available
        );
        Ok(report)
    }
}
