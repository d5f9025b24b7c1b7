//! Starting and stopping the daemon process.
//!
//! The lifecycle is a small state machine:
//!
//! ```text
//! NotRunning -> Starting -> Running -> Stopping -> NotRunning
//! ```
//!
//! Both operations are idempotent primitives. `ensure_running` no-ops when
//! a daemon is already up; `stop` succeeds trivially when nothing runs.
//! Restart-on-config-change is the caller's job: it detects staleness and
//! drives `stop` followed by `ensure_running`.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::daemon::process::{self, pid_alive, PortState};
use crate::error::{Error, Result};
use crate::protocol::DaemonInfo;

/// Where the daemon is in its life. Tracked for logging; the filesystem and
/// the port carry the authoritative state between short-lived clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    NotRunning,
    Starting,
    Running,
    Stopping,
}

/// Hard cap on waiting for a spawned daemon to become reachable.
const STARTUP_CAP: Duration = Duration::from_secs(5);
/// Fixed polling interval while the daemon comes up.
const STARTUP_POLL: Duration = Duration::from_millis(100);
/// How long to wait after the graceful signal before escalating.
const GRACEFUL_WAIT: Duration = Duration::from_secs(2);
/// How long to wait after the forced kill before giving up.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Platform kill command, pid appended as the last argument. Scoped by PID
/// rather than process name so unrelated processes are never touched.
struct KillCommand {
    program: &'static str,
    args: &'static [&'static str],
}

#[cfg(target_os = "windows")]
const FORCE_KILL: KillCommand = KillCommand {
    program: "taskkill",
    args: &["/F", "/T", "/PID"],
};

#[cfg(not(target_os = "windows"))]
const FORCE_KILL: KillCommand = KillCommand {
    program: "kill",
    args: &["-9"],
};

pub struct DaemonLifecycle {
    config: Config,
}

impl DaemonLifecycle {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Return the running daemon's identity, starting one if necessary.
    ///
    /// Blocks the caller while polling, bounded by [`STARTUP_CAP`].
    pub async fn ensure_running(&self) -> Result<DaemonInfo> {
        match process::probe_port(self.config.port).await {
            PortState::Ours(info) => {
                debug!(pid = info.pid, "daemon already running");
                return Ok(info);
            }
            PortState::Foreign => {
                return Err(Error::PortInUse {
                    port: self.config.port,
                });
            }
            PortState::Free => {}
        }

        debug!(state = ?DaemonState::Starting, "spawning daemon");
        let exe = std::env::current_exe()
            .map_err(|err| Error::Discovery(format!("cannot resolve own executable: {err}")))?;

        let mut child = std::process::Command::new(&exe)
            .args(["daemon", "run"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|err| Error::Startup {
                timeout: STARTUP_CAP,
                detail: format!("failed to spawn daemon process: {err}"),
            })?;

        let mut waited = Duration::ZERO;
        while waited < STARTUP_CAP {
            tokio::time::sleep(STARTUP_POLL).await;
            waited += STARTUP_POLL;

            // An early exit is definitive; don't keep polling the port.
            if let Ok(Some(status)) = child.try_wait() {
                return Err(self.classify_startup_failure(format!(
                    "daemon process exited early ({status})"
                ))
                .await);
            }

            if let Some(info) = process::locate(&self.config).await? {
                info!(state = ?DaemonState::Running, pid = info.pid, "daemon ready");
                return Ok(info);
            }
        }

        Err(self
            .classify_startup_failure("daemon never became reachable".to_string())
            .await)
    }

    /// A failed startup is either our port taken by someone else or a
    /// daemon that could not come up; re-probe to tell them apart.
    async fn classify_startup_failure(&self, detail: String) -> Error {
        match process::probe_port(self.config.port).await {
            PortState::Foreign => Error::PortInUse {
                port: self.config.port,
            },
            _ => Error::Startup {
                timeout: STARTUP_CAP,
                detail,
            },
        }
    }

    /// Stop the running daemon, if any.
    ///
    /// Graceful interrupt first, forced kill as escalation. Confirms the
    /// process is gone before reporting success; returns [`Error::Stop`]
    /// after a failed escalation instead of retrying forever.
    pub async fn stop(&self) -> Result<()> {
        let Some(info) = process::locate(&self.config).await? else {
            debug!("no daemon running, nothing to stop");
            return Ok(());
        };

        let pid = info.pid;
        debug!(state = ?DaemonState::Stopping, pid, "stopping daemon");

        if send_interrupt(pid) {
            if wait_for_exit(pid, GRACEFUL_WAIT).await {
                info!(state = ?DaemonState::NotRunning, pid, "daemon stopped");
                return Ok(());
            }
            warn!(pid, "daemon ignored interrupt, escalating to forced kill");
        } else {
            warn!(pid, "could not deliver interrupt, escalating to forced kill");
        }

        let output = tokio::process::Command::new(FORCE_KILL.program)
            .args(FORCE_KILL.args)
            .arg(pid.to_string())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                debug!(pid, "forced kill issued");
            }
            Ok(output) => {
                warn!(
                    pid,
                    "forced kill exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(err) => {
                warn!(pid, "failed to run {}: {err}", FORCE_KILL.program);
            }
        }

        if !wait_for_exit(pid, KILL_WAIT).await {
            return Err(Error::Stop { pid });
        }

        // A SIGKILL'd daemon had no chance to clean up after itself.
        if let Ok(path) = Config::runtime_info_path() {
            let _ = std::fs::remove_file(path);
        }

        info!(state = ?DaemonState::NotRunning, pid, "daemon stopped");
        Ok(())
    }
}

/// Deliver the platform's interrupt signal. Returns false when the signal
/// cannot be sent, which routes the caller to escalation.
#[cfg(unix)]
fn send_interrupt(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGINT) == 0 }
}

/// Windows has no cross-console interrupt delivery; escalate directly.
#[cfg(not(unix))]
fn send_interrupt(_pid: u32) -> bool {
    false
}

/// Poll until the process is gone or the wait elapses.
async fn wait_for_exit(pid: u32, wait: Duration) -> bool {
    const POLL: Duration = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < wait {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(POLL).await;
        waited += POLL;
    }
    !pid_alive(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    fn free_port_config() -> Config {
        // Bind then release so the port is known to be unoccupied.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        Config {
            port,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_when_nothing_runs() {
        let lifecycle = DaemonLifecycle::new(free_port_config());
        lifecycle.stop().await.unwrap();
        lifecycle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_running_rejects_foreign_port() {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let lifecycle = DaemonLifecycle::new(Config {
            port,
            ..Config::default()
        });

        match lifecycle.ensure_running().await {
            Err(Error::PortInUse { port: reported }) => assert_eq!(reported, port),
            other => panic!("expected PortInUse, got {other:?}"),
        }
    }

    #[test]
    fn test_force_kill_is_pid_scoped() {
        // The escalation command takes the pid as its final argument and
        // never matches by process name.
        assert!(FORCE_KILL
            .args
            .iter()
            .all(|arg| !arg.contains("lexd")));
        assert!(!FORCE_KILL.program.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_exit_on_dead_pid() {
        assert!(wait_for_exit(i32::MAX as u32, Duration::from_millis(200)).await);
    }
}
