// ── Intelsync Atoms: Record Types ──────────────────────────────────────────
// Typed records for the twelve standard collections.
// Field names match the schema registry's declarations exactly; the engine
// moves these through `serde_json` and validates them against the registry.

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::CollectionRecord;
use serde::{Deserialize, Serialize};

// ── Composite ids ──────────────────────────────────────────────────────────

/// Join key parts with `|`, backslash-escaping `|` and `\` inside each part,
/// so two different tuples never map to the same id. A single part is used
/// verbatim.
pub fn composite_key(parts: &[&str]) -> String {
    if let [only] = parts {
        return (*only).to_string();
    }
    let mut out = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push('|');
        }
        for c in part.chars() {
            if c == '|' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

// ── Memories ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Edit,
    Command,
    Decision,
    Pattern,
    Error,
    General,
}

impl MemoryType {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "edit" => Self::Edit,
            "command" => Self::Command,
            "decision" => Self::Decision,
            "pattern" => Self::Pattern,
            "error" => Self::Error,
            _ => Self::General,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub memory_type: MemoryType,
    pub timestamp: i64,
    /// Embedding scheme tag; `"fallback"` marks a text-only memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl CollectionRecord for Memory {
    const COLLECTION: &'static str = MEMORIES;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

// ── Legacy Q-table ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub state: String,
    pub action: String,
    pub value: f64,
    pub update_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<i64>,
}

impl Pattern {
    pub fn key(state: &str, action: &str) -> String {
        composite_key(&[state, action])
    }
}

impl CollectionRecord for Pattern {
    const COLLECTION: &'static str = PATTERNS;

    fn record_id(&self) -> String {
        Self::key(&self.state, &self.action)
    }
}

// ── Multi-algorithm learning tables ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningData {
    pub algorithm_id: String,
    /// Opaque serialized table owned by the learning subsystem.
    pub table_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl CollectionRecord for LearningData {
    const COLLECTION: &'static str = LEARNING_DATA;

    fn record_id(&self) -> String {
        self.algorithm_id.clone()
    }
}

// ── Trajectories ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryStep {
    pub state: String,
    pub action: String,
    pub reward: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trajectory {
    pub id: String,
    pub steps: Vec<TrajectoryStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub sealed: bool,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

impl Trajectory {
    /// Open a new, empty episode.
    pub fn begin(id: impl Into<String>, started_at: i64) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            final_score: None,
            embedding: None,
            sealed: false,
            started_at,
            ended_at: None,
        }
    }

    /// Append a step. Sealed episodes are immutable.
    pub fn push_step(&mut self, state: &str, action: &str, reward: f64) -> EngineResult<()> {
        if self.sealed {
            return Err(EngineError::invalid_record(
                TRAJECTORIES,
                format!("trajectory {} is sealed", self.id),
            ));
        }
        self.steps.push(TrajectoryStep {
            state: state.to_string(),
            action: action.to_string(),
            reward,
        });
        Ok(())
    }

    /// Close the episode with its final score.
    pub fn seal(&mut self, final_score: f64, ended_at: i64) -> EngineResult<()> {
        if self.sealed {
            return Err(EngineError::invalid_record(
                TRAJECTORIES,
                format!("trajectory {} is already sealed", self.id),
            ));
        }
        self.sealed = true;
        self.final_score = Some(final_score);
        self.ended_at = Some(ended_at);
        Ok(())
    }

    pub fn total_reward(&self) -> f64 {
        self.steps.iter().map(|s| s.reward).sum()
    }
}

impl CollectionRecord for Trajectory {
    const COLLECTION: &'static str = TRAJECTORIES;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

// ── Edges ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Semantic,
    Temporal,
    Coordination,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Temporal => "temporal",
            Self::Coordination => "coordination",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub from_id: String,
    pub to_id: String,
    pub kind: EdgeKind,
    pub weight: f64,
}

impl CollectionRecord for Edge {
    const COLLECTION: &'static str = EDGES;

    fn record_id(&self) -> String {
        composite_key(&[&self.from_id, &self.to_id, self.kind.as_str()])
    }
}

// ── Consolidated patterns ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NeuralPattern {
    pub id: String,
    pub centroid: Vec<f32>,
    pub cluster_size: i64,
    pub confidence: f64,
}

impl CollectionRecord for NeuralPattern {
    const COLLECTION: &'static str = NEURAL_PATTERNS;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

/// Storage tier of a compressed pattern, from lossless to coarsest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    Full,
    Half,
    Int8,
    Binary,
}

impl CompressionLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Some(Self::Full),
            "half" => Some(Self::Half),
            "int8" => Some(Self::Int8),
            "binary" => Some(Self::Binary),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Half => "half",
            Self::Int8 => "int8",
            Self::Binary => "binary",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressedPattern {
    pub id: String,
    pub compression_level: CompressionLevel,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub dims: i64,
}

impl CollectionRecord for CompressedPattern {
    const COLLECTION: &'static str = COMPRESSED_PATTERNS;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

// ── Continuity tables ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileSequence {
    pub prev_file: String,
    pub next_file: String,
    pub count: i64,
}

impl FileSequence {
    pub fn key(prev: &str, next: &str) -> String {
        composite_key(&[prev, next])
    }
}

impl CollectionRecord for FileSequence {
    const COLLECTION: &'static str = FILE_SEQUENCES;

    fn record_id(&self) -> String {
        Self::key(&self.prev_file, &self.next_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub role: String,
    pub created_at: i64,
}

impl CollectionRecord for Agent {
    const COLLECTION: &'static str = AGENTS;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

impl CollectionRecord for KvEntry {
    const COLLECTION: &'static str = KV_STORE;

    fn record_id(&self) -> String {
        self.key.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatEntry {
    pub key: String,
    pub value: i64,
}

impl CollectionRecord for StatEntry {
    const COLLECTION: &'static str = STATS;

    fn record_id(&self) -> String {
        self.key.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub id: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default)]
    pub occurrences: i64,
}

impl CollectionRecord for ErrorRecord {
    const COLLECTION: &'static str = ERRORS;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

// ── Serde helper: Vec<u8> as standard base64 ──────────────────────────────

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
