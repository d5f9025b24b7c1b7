//! TCP client side of the daemon protocol.
//!
//! Short-lived connections: one connect, one request, one response. The
//! daemon is always on loopback, so timeouts here are about a wedged
//! daemon, not a slow network.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::protocol::{framing, DaemonInfo, LookupRequest, LookupResponse, Message};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Send a lookup to the daemon and return its structured answer.
///
/// Call this only after the daemon is known to be running; a failure here
/// is a transient per-query condition, not a lifecycle problem.
pub async fn lookup(port: u16, query: &str) -> Result<LookupResponse> {
    let addr = (Ipv4Addr::LOCALHOST, port);

    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Lookup(format!("connection to daemon on port {port} timed out")))?
        .map_err(|err| Error::Lookup(format!("cannot connect to daemon on port {port}: {err}")))?;

    let message = Message::Lookup(LookupRequest {
        query: query.to_string(),
    });

    framing::write_message(&mut stream, &message)
        .await
        .map_err(|err| Error::Lookup(format!("failed to send query: {err}")))?;

    let response: LookupResponse =
        tokio::time::timeout(LOOKUP_TIMEOUT, framing::read_message(&mut stream))
            .await
            .map_err(|_| Error::Lookup("daemon did not answer in time".to_string()))?
            .map_err(|err| Error::Lookup(format!("invalid answer from daemon: {err}")))?;

    if let Some(error) = response.error {
        return Err(Error::Lookup(error));
    }

    Ok(response)
}

/// Status round-trip over an already-connected stream. Used by discovery to
/// tell our daemon apart from a foreign process squatting on the port.
pub async fn status_round_trip(
    mut stream: TcpStream,
    timeout: Duration,
) -> anyhow::Result<DaemonInfo> {
    framing::write_message(&mut stream, &Message::Status)
        .await
        .context("failed to send status request")?;

    let info: DaemonInfo = tokio::time::timeout(timeout, framing::read_message(&mut stream))
        .await
        .context("status request timed out")?
        .context("invalid status answer")?;

    Ok(info)
}
