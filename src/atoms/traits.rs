// ── Intelsync Atoms: Traits ────────────────────────────────────────────────
// Seams between the engine and its collaborators: typed records, the
// external embedding function, and volatile learning components that are
// warmed up by replay.

use crate::atoms::error::EngineResult;
use crate::atoms::types::Trajectory;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed view over one collection's records.
///
/// The serialized form must use the collection's declared field names;
/// `record_id` supplies the primary key (derived for composite-key tables).
pub trait CollectionRecord: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;

    fn record_id(&self) -> String;
}

/// External embedding function: text → fixed-width vector.
pub trait Embedder {
    /// Width of every vector this embedder returns.
    fn dimensions(&self) -> usize;

    /// Tag stored next to each vector (`memories.embedding_model`).
    fn model_name(&self) -> String {
        format!("external-{}", self.dimensions())
    }

    /// Embed `text`, or fail with `EngineError::EmbeddingUnavailable`.
    fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

/// An in-memory learning component with no native persistence.
/// The warm replay loader feeds it sealed trajectories, oldest first.
pub trait ReplayTarget {
    fn ingest(&mut self, trajectory: &Trajectory) -> EngineResult<()>;
}

impl<F> ReplayTarget for F
where
    F: FnMut(&Trajectory) -> EngineResult<()>,
{
    fn ingest(&mut self, trajectory: &Trajectory) -> EngineResult<()> {
        self(trajectory)
    }
}
