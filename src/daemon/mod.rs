//! Daemon module for the lexd background process.
//!
//! The daemon is a long-running process that:
//! - Holds a warm HTTP client to the remote dictionary source
//! - Listens on a loopback TCP port
//! - Answers lookup and status requests from short-lived CLI clients
//!
//! The submodules split along the resource boundaries: `process` finds a
//! running daemon, `lifecycle` starts and stops one, `server` is the daemon
//! itself, `dict` talks to the remote source.

pub mod dict;
pub mod lifecycle;
pub mod process;
pub mod server;

pub use lifecycle::DaemonLifecycle;
pub use server::DaemonServer;
