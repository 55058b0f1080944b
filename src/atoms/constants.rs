// ── Intelsync Atoms: Constants ─────────────────────────────────────────────
// Named constants for the crate. Collection names are stable identifiers:
// they are table names in the record store and top-level keys in the mirror
// document, so renaming one orphans existing data.

// ── Collections ────────────────────────────────────────────────────────────
pub const MEMORIES: &str = "memories";
pub const PATTERNS: &str = "patterns";
pub const LEARNING_DATA: &str = "learning_data";
pub const TRAJECTORIES: &str = "trajectories";
pub const EDGES: &str = "edges";
pub const NEURAL_PATTERNS: &str = "neural_patterns";
pub const COMPRESSED_PATTERNS: &str = "compressed_patterns";
pub const FILE_SEQUENCES: &str = "file_sequences";
pub const AGENTS: &str = "agents";
pub const KV_STORE: &str = "kv_store";
pub const STATS: &str = "stats";
pub const ERRORS: &str = "errors";

/// Declaration order of the standard schema (also the export order).
pub const STANDARD_COLLECTIONS: [&str; 12] = [
    MEMORIES,
    PATTERNS,
    LEARNING_DATA,
    TRAJECTORIES,
    EDGES,
    NEURAL_PATTERNS,
    COMPRESSED_PATTERNS,
    FILE_SEQUENCES,
    AGENTS,
    KV_STORE,
    STATS,
    ERRORS,
];

// ── Store layout ───────────────────────────────────────────────────────────
pub const DEFAULT_STATE_DIR: &str = ".intelsync";
pub const DEFAULT_DB_FILE: &str = "intelligence.db";
pub const DEFAULT_MIRROR_FILE: &str = "intelligence.json";

/// Bumped whenever the generated DDL gains a table or column.
/// Upgrades are additive only.
pub const SCHEMA_VERSION: i64 = 2;

// Reserved column names on every collection table.
pub(crate) const COL_ID: &str = "id";
pub(crate) const COL_SEQ: &str = "_seq";
pub(crate) const COL_EXTRA: &str = "_extra";
pub(crate) const COL_UPDATED: &str = "_updated_at";

// `_meta` keys.
pub(crate) const META_SCHEMA_VERSION: &str = "schema_version";
pub(crate) const META_MIRROR_SYNCED: &str = "mirror_synced_mtime";

// ── Tunables ───────────────────────────────────────────────────────────────
pub const DEFAULT_REPLAY_DEPTH: usize = 50;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_QUERY_PAGE_SIZE: usize = 256;

// ── State carrier keys ─────────────────────────────────────────────────────
pub const KV_LAST_FILE: &str = "last_file";
pub const KV_SESSION_COUNT: &str = "session_count";

/// Tag stored in `memories.embedding_model` when a memory was kept text-only.
pub const FALLBACK_EMBEDDING_MODEL: &str = "fallback";

// ── Q-learning ─────────────────────────────────────────────────────────────
pub const Q_LEARNING_RATE: f64 = 0.1;
