//! Persistent lookup cache.
//!
//! An SQLite database under the user data directory, owned by a dedicated
//! worker thread. Callers talk to it through an async facade: commands go
//! over an mpsc channel, results come back on a oneshot. This gives every
//! record a single writer without holding any lock across the network
//! round-trip to the daemon.
//!
//! Records are never evicted; the store only grows with the user's
//! vocabulary, which in practice stays tiny.

use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;
use tracing::error;

mod migrations;

use crate::error::{Error, Result};
use migrations::run_migrations;

/// A cached lookup result for one normalized key.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub key: String,
    /// Serialized lookup payload (JSON-encoded entries).
    pub payload: String,
    pub stored_at: DateTime<Utc>,
    /// Total number of times this key has been queried.
    pub hit_count: u64,
}

type CacheTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum CacheCommand {
    Execute(CacheTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<CacheCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Commands already queued drain before the Shutdown marker, so any
        // in-flight counter update completes before the connection closes.
        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(CacheCommand::Shutdown) {
                error!("Failed to send shutdown to cache thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join cache thread: {join_err:?}");
            }
        }
    }
}

/// Handle to the cache store. Cheap to clone; the last clone dropped joins
/// the worker thread and closes the database.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    /// Open (or create) the store at `db_path` and run migrations.
    ///
    /// A database that cannot be opened or migrated is a fatal condition
    /// for the caller; there is no degraded no-cache mode.
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (command_tx, command_rx) = mpsc::channel::<CacheCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("lexd-cache".into())
            .spawn(move || {
                let mut conn = match Connection::open(&db_path) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(Error::Cache(err)));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result = run_migrations(&mut conn);
                if ready_tx.send(init_result).is_err() {
                    error!("Cache initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        CacheCommand::Execute(task) => task(&mut conn),
                        CacheCommand::Shutdown => break,
                    }
                }
            })
            .map_err(Error::CacheIo)?;

        ready_rx
            .recv()
            .map_err(|_| Error::CacheCorrupt("cache worker exited before signaling readiness".into()))??;

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = CacheCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Cache caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|_| Error::CacheCorrupt("cache thread terminated unexpectedly".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::CacheCorrupt("cache thread terminated unexpectedly".into()))?
    }

    /// Fetch the record for a normalized key, if one exists.
    pub async fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let key = key.to_string();
        self.execute(move |conn| get_record(conn, &key)).await
    }

    /// Upsert the payload for a key, refreshing `stored_at`.
    ///
    /// A forced refetch overwrites the previous payload; the hit counter
    /// is left alone, it only moves through [`Self::increment_frequency`].
    pub async fn put(&self, key: &str, payload: &str) -> Result<()> {
        let key = key.to_string();
        let payload = payload.to_string();
        self.execute(move |conn| put_record(conn, &key, &payload, Utc::now()))
            .await
    }

    /// Count one query against the key and return how many times it has
    /// been queried in the current calendar month. The first query of a
    /// new month starts at 1 regardless of the prior month's total.
    pub async fn increment_frequency(&self, key: &str) -> Result<u64> {
        let key = key.to_string();
        self.execute(move |conn| bump_frequency(conn, &key, &month_bucket(Utc::now())))
            .await
    }
}

/// Calendar-month bucket for the frequency index.
fn month_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

fn get_record(conn: &Connection, key: &str) -> Result<Option<CacheRecord>> {
    let row = conn
        .query_row(
            "SELECT key, payload, stored_at, hit_count FROM records WHERE key = ?1",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((key, payload, stored_at, hit_count)) => {
            let stored_at = DateTime::parse_from_rfc3339(&stored_at)
                .map_err(|err| Error::CacheCorrupt(format!("invalid stored_at '{stored_at}': {err}")))?
                .with_timezone(&Utc);
            Ok(Some(CacheRecord {
                key,
                payload,
                stored_at,
                hit_count: hit_count.max(0) as u64,
            }))
        }
        None => Ok(None),
    }
}

fn put_record(conn: &Connection, key: &str, payload: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO records (key, payload, stored_at, hit_count)
         VALUES (?1, ?2, ?3, 0)
         ON CONFLICT(key) DO UPDATE SET
             payload = excluded.payload,
             stored_at = excluded.stored_at",
        params![key, payload, now.to_rfc3339()],
    )?;
    Ok(())
}

fn bump_frequency(conn: &Connection, key: &str, month: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "INSERT INTO query_counts (key, month, count)
         VALUES (?1, ?2, 1)
         ON CONFLICT(key, month) DO UPDATE SET count = count + 1
         RETURNING count",
        params![key, month],
        |row| row.get(0),
    )?;

    // Total across all months lives on the record itself, when one exists.
    conn.execute(
        "UPDATE records SET hit_count = hit_count + 1 WHERE key = ?1",
        params![key],
    )?;

    Ok(count.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn
    }

    #[test]
    fn test_put_then_get_round_trip() {
        let conn = test_conn();
        put_record(&conn, "hello", r#"{"entries":[]}"#, Utc::now()).unwrap();

        let record = get_record(&conn, "hello").unwrap().unwrap();
        assert_eq!(record.key, "hello");
        assert_eq!(record.payload, r#"{"entries":[]}"#);
        assert_eq!(record.hit_count, 0);
    }

    #[test]
    fn test_get_absent_key() {
        let conn = test_conn();
        assert!(get_record(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_put_is_upsert() {
        let conn = test_conn();
        let earlier = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();

        put_record(&conn, "hello", "old", earlier).unwrap();
        put_record(&conn, "hello", "fresh", later).unwrap();

        let record = get_record(&conn, "hello").unwrap().unwrap();
        assert_eq!(record.payload, "fresh");
        assert_eq!(record.stored_at, later);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_frequency_counts_within_month() {
        let conn = test_conn();
        assert_eq!(bump_frequency(&conn, "hello", "2024-03").unwrap(), 1);
        assert_eq!(bump_frequency(&conn, "hello", "2024-03").unwrap(), 2);
        assert_eq!(bump_frequency(&conn, "hello", "2024-03").unwrap(), 3);
        assert_eq!(bump_frequency(&conn, "hello", "2024-03").unwrap(), 4);
    }

    #[test]
    fn test_frequency_resets_on_new_month() {
        let conn = test_conn();
        for _ in 0..7 {
            bump_frequency(&conn, "hello", "2024-03").unwrap();
        }
        assert_eq!(bump_frequency(&conn, "hello", "2024-04").unwrap(), 1);
    }

    #[test]
    fn test_frequency_tracks_record_hit_count() {
        let conn = test_conn();
        put_record(&conn, "hello", "payload", Utc::now()).unwrap();
        bump_frequency(&conn, "hello", "2024-03").unwrap();
        bump_frequency(&conn, "hello", "2024-04").unwrap();

        let record = get_record(&conn, "hello").unwrap().unwrap();
        assert_eq!(record.hit_count, 2);
    }

    #[test]
    fn test_frequency_before_record_exists() {
        // A query is counted even when the lookup has not been cached yet.
        let conn = test_conn();
        assert_eq!(bump_frequency(&conn, "hello", "2024-03").unwrap(), 1);
        assert!(get_record(&conn, "hello").unwrap().is_none());
    }

    #[test]
    fn test_month_bucket_format() {
        let at = Utc.with_ymd_and_hms(2024, 11, 30, 23, 59, 59).unwrap();
        assert_eq!(month_bucket(at), "2024-11");
    }

    #[tokio::test]
    async fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        {
            let store = CacheStore::open(path.clone()).unwrap();
            store.put("hello", "payload").await.unwrap();
            assert_eq!(store.increment_frequency("hello").await.unwrap(), 1);
        }

        let store = CacheStore::open(path).unwrap();
        let record = store.get("hello").await.unwrap().unwrap();
        assert_eq!(record.payload, "payload");
        assert_eq!(record.hit_count, 1);
        assert_eq!(store.increment_frequency("hello").await.unwrap(), 2);
    }
}
