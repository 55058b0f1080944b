// ── Store configuration ────────────────────────────────────────────────────
// Explicit constructor arguments for `RecordStore::open`. The library never
// reads environment variables; the CLI builds one of these from its flags or
// from a TOML file.

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Record store (SQLite) file.
    pub db_path: PathBuf,
    /// Mirror store (JSON) file, normally a sibling of `db_path`.
    pub mirror_path: PathBuf,
    /// Width for every embedding-bearing collection. `None` pins each
    /// collection's width on its first committed embedding.
    pub embedding_dim: Option<usize>,
    /// Trajectories replayed into volatile learners on start.
    pub replay_depth: usize,
    /// How long a commit waits for another process's write lock.
    pub busy_timeout_ms: u64,
    /// Rows fetched per page by lazy queries.
    pub query_page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::for_project(".")
    }
}

impl StoreConfig {
    /// Default layout under `<root>/.intelsync/`.
    pub fn for_project(root: impl AsRef<Path>) -> Self {
        let dir = root.as_ref().join(DEFAULT_STATE_DIR);
        Self {
            db_path: dir.join(DEFAULT_DB_FILE),
            mirror_path: dir.join(DEFAULT_MIRROR_FILE),
            embedding_dim: None,
            replay_depth: DEFAULT_REPLAY_DEPTH,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            query_page_size: DEFAULT_QUERY_PAGE_SIZE,
        }
    }

    /// Read a TOML config file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: StoreConfig = toml::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(EngineError::Config("db_path is empty".into()));
        }
        if self.mirror_path.as_os_str().is_empty() {
            return Err(EngineError::Config("mirror_path is empty".into()));
        }
        if self.db_path == self.mirror_path {
            return Err(EngineError::Config(
                "db_path and mirror_path must be different files".into(),
            ));
        }
        if self.embedding_dim == Some(0) {
            return Err(EngineError::Config("embedding_dim must be positive".into()));
        }
        if self.replay_depth == 0 {
            return Err(EngineError::Config("replay_depth must be positive".into()));
        }
        if self.query_page_size == 0 {
            return Err(EngineError::Config("query_page_size must be positive".into()));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
