//! Daemon discovery.
//!
//! The configured loopback port is the source of truth: a port nobody
//! listens on means no daemon, even when a stale runtime info file is still
//! on disk. A process that does hold the port must also answer our Status
//! round-trip and carry our executable name before it is reported as ours,
//! so a PID recycled by the OS never produces a false positive.

use std::net::Ipv4Addr;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::net::TcpStream;
use tracing::debug;

use crate::client;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::DaemonInfo;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const STATUS_TIMEOUT: Duration = Duration::from_secs(1);

/// What a probe of the daemon port found.
#[derive(Debug, Clone, Copy)]
pub enum PortState {
    /// Nothing is listening. Authoritative: no daemon runs.
    Free,
    /// Our daemon answered the status round-trip.
    Ours(DaemonInfo),
    /// Something else holds the port.
    Foreign,
}

/// Find the running daemon, if any.
///
/// Returns `Ok(None)` when nothing is running; an error only when the
/// discovery mechanism itself fails (unreadable runtime state).
pub async fn locate(config: &Config) -> Result<Option<DaemonInfo>> {
    match probe_port(config.port).await {
        PortState::Free => {
            // The runtime file may have outlived a crashed daemon. It is
            // not evidence of liveness, but an unreadable one still means
            // broken discovery state worth surfacing.
            sweep_stale_runtime_file()?;
            Ok(None)
        }
        PortState::Foreign => Ok(None),
        PortState::Ours(info) => {
            if process_is_ours(info.pid) {
                Ok(Some(info))
            } else {
                debug!(pid = info.pid, "status answer from PID that is not ours");
                Ok(None)
            }
        }
    }
}

/// Probe the daemon port and classify who holds it.
pub async fn probe_port(port: u16) -> PortState {
    let addr = (Ipv4Addr::LOCALHOST, port);
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        // Refused, unreachable or timed out: nothing of ours is serving.
        Ok(Err(_)) | Err(_) => return PortState::Free,
    };

    match client::status_round_trip(stream, STATUS_TIMEOUT).await {
        Ok(info) => PortState::Ours(info),
        Err(err) => {
            debug!("port {port} is bound but does not speak our protocol: {err}");
            PortState::Foreign
        }
    }
}

/// Whether `pid` is a live process. Signal 0 checks existence without
/// delivering anything.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        ProcessRefreshKind::everything(),
    );
    system.process(Pid::from_u32(pid)).is_some()
}

/// Whether `pid` exists and its image looks like this executable. Guards
/// against the OS recycling a recorded PID for an unrelated process.
pub fn process_is_ours(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        ProcessRefreshKind::everything(),
    );

    let Some(process) = system.process(Pid::from_u32(pid)) else {
        return false;
    };

    let name = process.name().to_string_lossy().to_ascii_lowercase();
    name.contains(own_process_name())
}

fn own_process_name() -> &'static str {
    "lexd"
}

/// Remove a runtime info file left behind by a daemon that is no longer
/// serving, so status output cannot mislead. The port already said
/// "not running"; only an unreadable file is an error here.
fn sweep_stale_runtime_file() -> Result<()> {
    let Ok(path) = Config::runtime_info_path() else {
        return Ok(());
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let stale: Option<DaemonInfo> = serde_json::from_str(&contents).ok();
            if let Some(stale) = stale {
                debug!(pid = stale.pid, "removing stale runtime file");
            }
            let _ = std::fs::remove_file(&path);
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::Discovery(format!(
            "cannot read runtime file {}: {err}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_unbound_port_is_free() {
        // Bind then immediately release a port so nothing listens on it.
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(matches!(probe_port(port).await, PortState::Free));
    }

    #[tokio::test]
    async fn test_probe_foreign_listener() {
        // A listener that accepts but never answers the protocol.
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        assert!(matches!(probe_port(port).await, PortState::Foreign));
    }

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn test_dead_pid_is_not_ours() {
        // Far above any real pid_max, and still a positive signed pid.
        let pid = i32::MAX as u32;
        assert!(!pid_alive(pid));
        assert!(!process_is_ours(pid));
    }
}
