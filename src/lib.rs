//! Intelligence store synchronization engine.
//!
//! Short-lived hook processes share one durable store: a SQLite record
//! store (authoritative, multi-table) mirrored to a portable JSON document.
//! A process opens the store, pulls a newer mirror if there is one, works
//! inside a [`Session`], commits atomically, and exports the mirror.
//!
//! ```no_run
//! use intelsync::{RecordStore, SchemaRegistry, StoreConfig};
//! use intelsync::engine::{state, sync};
//!
//! # fn main() -> intelsync::EngineResult<()> {
//! let config = StoreConfig::for_project(".");
//! let store = RecordStore::open(&config, SchemaRegistry::standard(config.embedding_dim)?)?;
//! sync::import_if_newer(&store, &config.mirror_path)?;
//!
//! let mut session = store.begin_session()?;
//! state::track_file_edit(&mut session, "src/main.rs")?;
//! session.commit()?;
//!
//! sync::export_to_path(&store, &config.mirror_path)?;
//! # Ok(())
//! # }
//! ```

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::traits::{CollectionRecord, Embedder, ReplayTarget};
pub use engine::config::StoreConfig;
pub use engine::mirror::{Document, MirrorStore};
pub use engine::replay::{ReplayReport, WarmReplayLoader};
pub use engine::schema::{CollectionSpec, FieldKind, FieldSpec, SchemaRegistry};
pub use engine::state::StateCarrier;
pub use engine::store::{CommitSummary, Record, RecordStore, Session};
pub use engine::sync::{ExportMode, ImportSummary, StoreSummary};
