// Intelsync Engine: store synchronization for stateless hook processes.
// Every invocation opens the record store, optionally pulls a newer mirror,
// works inside one session, commits, and exports the mirror on the way out.

pub mod compression;
pub mod config;
pub mod embedding;
pub mod guard;
pub mod learning;
mod legacy;
pub mod mirror;
pub mod replay;
pub mod schema;
pub mod state;
pub mod store;
pub mod sync;

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wall-clock seconds since the Unix epoch.
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
