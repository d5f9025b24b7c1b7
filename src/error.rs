//! Error types shared across the client, daemon and cache.

use std::io;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes of the daemon lifecycle and the query pipeline.
///
/// "No entry found" is not represented here: it is a valid
/// [`QueryResult`](crate::query::QueryResult) with `found == false`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Inspecting the process table or runtime state failed. Fatal at
    /// startup; distinct from "no daemon running", which is not an error.
    #[error("process discovery failed: {0}")]
    Discovery(String),

    /// The configured port is bound by a process that does not speak our
    /// protocol. User-actionable, not a crash.
    #[error("port {port} is already in use by another process")]
    PortInUse { port: u16 },

    /// The spawned daemon exited immediately or never became reachable.
    #[error("daemon did not become ready within {timeout:?}: {detail}")]
    Startup { timeout: Duration, detail: String },

    /// Neither the graceful signal nor the forced kill removed the process.
    #[error("could not stop daemon process {pid}")]
    Stop { pid: u32 },

    /// The daemon was reachable but the query round-trip failed. Degrades
    /// to an error result for the single query; the caller may retry once.
    #[error("lookup failed: {0}")]
    Lookup(String),

    /// The persistent store is unreadable or unwritable.
    #[error("cache store error: {0}")]
    Cache(#[from] rusqlite::Error),

    /// The store opened but its contents cannot be used. Fatal at startup;
    /// there is no silent fallback to running without a cache.
    #[error("cache store unusable: {0}")]
    CacheCorrupt(String),

    /// Filesystem-level failure around the cache or runtime files.
    #[error("cache I/O error: {0}")]
    CacheIo(#[from] io::Error),
}
