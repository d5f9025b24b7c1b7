//! Wire protocol between the CLI client and the daemon.
//!
//! JSON over a loopback TCP connection, length-prefixed for framing. JSON
//! keeps the protocol debuggable with nothing more than `nc` and a hex dump.

use serde::{Deserialize, Serialize};

/// A lookup request carrying the raw (un-normalized) query text. The daemon
/// forwards it to the remote source verbatim; normalization is a cache
/// concern and stays on the client side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupRequest {
    pub query: String,
}

/// A single dictionary entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// The headword as the source spells it.
    pub word: String,
    /// IPA transcription, when the source provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phonetic: Option<String>,
    pub senses: Vec<Sense>,
}

/// One part-of-speech block within an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sense {
    pub part_of_speech: String,
    pub definitions: Vec<String>,
}

/// Response sent from daemon to client for a lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    /// Whether the source had a usable entry.
    pub found: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<Entry>,
    /// Human-readable explanation when nothing was found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Error message, if the round-trip to the source failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LookupResponse {
    pub fn found(entries: Vec<Entry>) -> Self {
        Self {
            found: true,
            entries,
            prompt: None,
            error: None,
        }
    }

    /// A valid "no entry" answer. Not an error.
    pub fn missing(prompt: impl Into<String>) -> Self {
        Self {
            found: false,
            entries: Vec::new(),
            prompt: Some(prompt.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            found: false,
            entries: Vec::new(),
            prompt: None,
            error: Some(message.into()),
        }
    }
}

/// Identity of a running daemon, persisted to the runtime info file when the
/// server comes up and reported over the Status round-trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub pid: u32,
    pub port: u16,
    /// Unix timestamp of the moment the daemon began serving. Compared
    /// against the config file's mtime to detect a stale daemon.
    pub started_at: i64,
}

/// Message type for client-daemon communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A dictionary lookup from the client.
    Lookup(LookupRequest),
    /// Request the daemon's identity. Doubles as the liveness probe.
    Status,
}

/// Framing for messages: length-prefixed JSON.
/// Format: 4 bytes (big-endian u32) length + JSON payload
pub mod framing {
    use anyhow::{anyhow, Result};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Write a length-prefixed message.
    pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
    where
        W: AsyncWriteExt + Unpin,
        T: serde::Serialize,
    {
        let json = serde_json::to_vec(message)?;
        let len = json.len() as u32;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&json).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a length-prefixed message.
    pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
    where
        R: AsyncReadExt + Unpin,
        T: serde::de::DeserializeOwned,
    {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        // Sanity check: max 1MB message
        if len > 1_000_000 {
            return Err(anyhow!("Message too large: {} bytes", len));
        }

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        let message = serde_json::from_slice(&buf)?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_found() {
        let resp = LookupResponse::found(vec![Entry {
            word: "hello".to_string(),
            phonetic: Some("/həˈləʊ/".to_string()),
            senses: vec![Sense {
                part_of_speech: "exclamation".to_string(),
                definitions: vec!["used as a greeting".to_string()],
            }],
        }]);
        assert!(resp.found);
        assert_eq!(resp.entries.len(), 1);
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_response_missing_is_not_error() {
        let resp = LookupResponse::missing("No definitions for 'qwzx'");
        assert!(!resp.found);
        assert!(resp.entries.is_empty());
        assert!(resp.prompt.is_some());
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_message_round_trip() {
        let msg = Message::Lookup(LookupRequest {
            query: "long time ago".to_string(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        match parsed {
            Message::Lookup(req) => assert_eq!(req.query, "long time ago"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_framing_round_trip() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let msg = Message::Status;
        framing::write_message(&mut cursor, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(cursor.into_inner());
        let parsed: Message = framing::read_message(&mut cursor).await.unwrap();
        assert!(matches!(parsed, Message::Status));
    }
}
