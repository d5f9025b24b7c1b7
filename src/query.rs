//! The cached query pipeline.
//!
//! One call per CLI invocation: normalize the text, try the local cache,
//! fall back to the daemon (starting it when needed), write the answer
//! back. The per-month frequency count is computed off the critical path
//! and handed to the caller as a one-shot signal it may ignore.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::client;
use crate::config::Config;
use crate::daemon::DaemonLifecycle;
use crate::error::{Error, Result};
use crate::protocol::Entry;

/// Outcome of one query, owned by the caller for its duration.
#[derive(Debug)]
pub struct QueryResult {
    /// The original query text, un-normalized.
    pub query: String,
    pub found: bool,
    pub entries: Vec<Entry>,
    /// Human-readable explanation when nothing was found.
    pub prompt: Option<String>,
    /// How many times this key has been queried this month. Computed in the
    /// background; read it or drop it, it never blocks the result.
    pub history: HistorySignal,
}

/// One-shot receiver for the month count with a read-or-timeout contract.
#[derive(Debug)]
pub struct HistorySignal {
    rx: oneshot::Receiver<u64>,
}

impl HistorySignal {
    /// Wait at most `wait` for the count. `None` when the counter update
    /// has not finished in time or failed; the CLI must not hang on it.
    pub async fn read(self, wait: Duration) -> Option<u64> {
        tokio::time::timeout(wait, self.rx).await.ok()?.ok()
    }
}

pub struct QueryPipeline {
    store: CacheStore,
    lifecycle: DaemonLifecycle,
    /// Spawned counter updates, joined by the caller before the store closes.
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl QueryPipeline {
    pub fn new(config: Config, store: CacheStore) -> Self {
        Self {
            store,
            lifecycle: DaemonLifecycle::new(config),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Answer a query, from cache when possible.
    ///
    /// A cache hit never contacts the daemon but still counts toward the
    /// month frequency. `bypass_cache` forces a remote lookup and
    /// overwrites whatever was cached. "No entry" comes back as a valid
    /// `found == false` result, not an error.
    pub async fn query(&self, text: &str, bypass_cache: bool) -> Result<QueryResult> {
        let key = normalize(text);
        let history = self.spawn_frequency_update(key.clone());

        if !bypass_cache {
            if let Some(record) = self.store.get(&key).await? {
                debug!(key = %key, "cache hit");
                let entries: Vec<Entry> = serde_json::from_str(&record.payload)
                    .map_err(|err| Error::CacheCorrupt(format!("bad payload for `{key}`: {err}")))?;
                return Ok(QueryResult {
                    query: text.to_string(),
                    found: true,
                    entries,
                    prompt: None,
                    history,
                });
            }
            debug!(key = %key, "cache miss");
        }

        let info = self.lifecycle.ensure_running().await?;
        let response = client::lookup(info.port, text).await?;

        if response.found {
            let payload = serde_json::to_string(&response.entries)
                .map_err(|err| Error::CacheCorrupt(format!("unencodable payload: {err}")))?;
            self.store.put(&key, &payload).await?;
        }

        Ok(QueryResult {
            query: text.to_string(),
            found: response.found,
            entries: response.entries,
            prompt: response.prompt,
            history,
        })
    }

    /// Count the query off the critical path and hand back the signal.
    fn spawn_frequency_update(&self, key: String) -> HistorySignal {
        let (tx, rx) = oneshot::channel();
        let store = self.store.clone();

        let handle = tokio::spawn(async move {
            match store.increment_frequency(&key).await {
                Ok(count) => {
                    let _ = tx.send(count);
                }
                Err(err) => warn!(key = %key, "frequency update failed: {err}"),
            }
        });

        self.background.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
        HistorySignal { rx }
    }

    /// Join barrier for background counter updates. The top-level caller
    /// invokes this during shutdown so every spawned update completes (or
    /// is abandoned after the timeout) before the store handle drops.
    pub async fn join_background(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.background.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                warn!("abandoning unfinished background counter update");
            }
        }
    }
}

/// Normalize query text to a cache key: case-folded, whitespace collapsed.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Sense;

    fn pipeline_with_store() -> (QueryPipeline, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.db")).unwrap();
        // Port is irrelevant for cache-hit paths; the daemon is never
        // contacted when the store answers.
        let config = Config::default();
        (QueryPipeline::new(config, store), dir)
    }

    fn sample_entries() -> Vec<Entry> {
        vec![Entry {
            word: "hello".to_string(),
            phonetic: None,
            senses: vec![Sense {
                part_of_speech: "exclamation".to_string(),
                definitions: vec!["used as a greeting".to_string()],
            }],
        }]
    }

    #[test]
    fn test_normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize("  Hello   World "), "hello world");
        assert_eq!(normalize("HELLO"), "hello");
        assert_eq!(normalize("long\ttime\nago"), "long time ago");
    }

    #[tokio::test]
    async fn test_cache_hit_serves_without_daemon() {
        let (pipeline, _dir) = pipeline_with_store();
        let payload = serde_json::to_string(&sample_entries()).unwrap();
        pipeline.store.put("hello", &payload).await.unwrap();

        // Differs in case and spacing from the stored key; must still hit.
        let result = pipeline.query("  HELLO ", false).await.unwrap();
        assert!(result.found);
        assert_eq!(result.query, "  HELLO ");
        assert_eq!(result.entries[0].word, "hello");

        let count = result.history.read(Duration::from_secs(2)).await;
        assert_eq!(count, Some(1));

        pipeline.join_background().await;
    }

    #[tokio::test]
    async fn test_repeat_queries_raise_history_count() {
        let (pipeline, _dir) = pipeline_with_store();
        let payload = serde_json::to_string(&sample_entries()).unwrap();
        pipeline.store.put("hello", &payload).await.unwrap();

        let mut last = 0;
        for _ in 0..4 {
            let result = pipeline.query("hello", false).await.unwrap();
            last = result.history.read(Duration::from_secs(2)).await.unwrap();
        }
        // The fourth query carries the count that crosses the >3 threshold.
        assert_eq!(last, 4);

        pipeline.join_background().await;
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_an_error_not_a_miss() {
        let (pipeline, _dir) = pipeline_with_store();
        pipeline.store.put("hello", "not json").await.unwrap();

        let err = pipeline.query("hello", false).await.unwrap_err();
        assert!(matches!(err, Error::CacheCorrupt(_)));

        pipeline.join_background().await;
    }

    #[tokio::test]
    async fn test_join_background_flushes_pending_counts() {
        let (pipeline, _dir) = pipeline_with_store();
        let payload = serde_json::to_string(&sample_entries()).unwrap();
        pipeline.store.put("hello", &payload).await.unwrap();

        // Drop the signal unread; the update must still land in the store.
        let result = pipeline.query("hello", false).await.unwrap();
        drop(result);
        pipeline.join_background().await;

        let record = pipeline.store.get("hello").await.unwrap().unwrap();
        assert_eq!(record.hit_count, 1);
    }
}
