use rusqlite::{Connection, Transaction};

use crate::error::{Error, Result};

const CURRENT_SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS records (
    key        TEXT PRIMARY KEY,
    payload    TEXT NOT NULL,
    stored_at  TEXT NOT NULL,
    hit_count  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS query_counts (
    key    TEXT NOT NULL,
    month  TEXT NOT NULL,
    count  INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (key, month)
);
";

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(Error::CacheCorrupt(format!(
            "schema version ({}) is newer than supported ({})",
            version, CURRENT_SCHEMA_VERSION
        )));
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;

    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)?;
        version = next_version;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<()> {
    match version {
        1 => {
            tx.execute_batch(SCHEMA_V1)?;
            Ok(())
        }
        _ => Err(Error::CacheCorrupt(format!(
            "unknown migration target version: {version}"
        ))),
    }
}
