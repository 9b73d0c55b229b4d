//! File-backed store on SQLite.
//!
//! Every key is one row; the value column holds the dump encoding of the
//! stored value, so `dump` and `restore` are byte-for-byte copies.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};

use super::{Backend, DumpBlob, Entry, StoreError};

const BUSY_TIMEOUT_MS: u64 = 5_000;
const SCHEMA_VERSION: i64 = 1;

pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (creating if needed) the store database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = open_connection(path)?;
        init_schema(&conn)?;
        tracing::debug!(path = %path.display(), "opened sqlite store");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let conn = Connection::open_with_flags(path, flags)?;
    apply_pragmas(&conn)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL,
            expires_at_ms INTEGER
        );",
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn load_row(conn: &Connection, key: &str, now_ms: u64) -> Result<Option<Entry>, StoreError> {
    let row: Option<(Vec<u8>, Option<i64>)> = conn
        .query_row(
            "SELECT value, expires_at_ms FROM kv WHERE key = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((bytes, expires_at_ms)) = row else {
        return Ok(None);
    };
    let value = DumpBlob::from_bytes(bytes)
        .decode()
        .map_err(|source| StoreError::CorruptEntry {
            key: key.to_string(),
            source,
        })?;
    let entry = Entry {
        value,
        expires_at_ms: expires_at_ms.map(|at| at.max(0) as u64),
    };
    Ok(entry.is_live(now_ms).then_some(entry))
}

impl Backend for SqliteStore {
    fn read(&self, key: &str, now_ms: u64) -> Result<Option<Entry>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        load_row(&conn, key, now_ms)
    }

    fn update<R>(
        &self,
        key: &str,
        now_ms: u64,
        f: impl FnOnce(&mut Option<Entry>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut slot = load_row(&tx, key, now_ms)?;
        let out = f(&mut slot)?;
        match slot {
            Some(entry) => {
                let blob = DumpBlob::encode(&entry.value)?;
                tx.execute(
                    "INSERT INTO kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        expires_at_ms = excluded.expires_at_ms",
                    params![
                        key,
                        blob.as_bytes(),
                        entry.expires_at_ms.map(|at| at as i64)
                    ],
                )?;
            }
            None => {
                tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            }
        }
        tx.commit()?;
        Ok(out)
    }

    fn page(
        &self,
        after: Option<&str>,
        count: usize,
        now_ms: u64,
    ) -> Result<(Vec<String>, Option<String>), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        // One extra row tells us whether the scan is complete.
        let limit = count as i64 + 1;
        let mut stmt = conn.prepare_cached(
            "SELECT key, expires_at_ms FROM kv
             WHERE ?1 IS NULL OR key > ?1
             ORDER BY key
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
        })?;
        let mut examined = Vec::new();
        for row in rows {
            examined.push(row?);
        }
        let more = examined.len() > count;
        examined.truncate(count);
        let last = examined.last().map(|(key, _)| key.clone());
        let keys = examined
            .into_iter()
            .filter(|(_, expires)| expires.is_none_or(|at| at.max(0) as u64 > now_ms))
            .map(|(key, _)| key)
            .collect();
        Ok((keys, if more { last } else { None }))
    }
}
