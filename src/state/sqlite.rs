//! SQLite-backed [`StateStore`], following the teacher pack's single-writer
//! `rusqlite` pattern (`haven-db`, `haven-file-server`): one connection
//! behind a `Mutex`, WAL journal mode, and a `schema_version` table driving
//! forward-only migrations.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::{ChunkRow, ChunkStatus, DownloadFilter, DownloadRow, DownloadStatus, Key, StateStore, StateTxn};
use crate::error::{Error, Result};

const CURRENT_SCHEMA_VERSION: u32 = 2;

pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::new_rusqlite(e, "state_store::open"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::new_rusqlite(e, "state_store::open_in_memory"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").map_err(|e| Error::new_rusqlite(e, "pragma"))?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(|e| Error::new_rusqlite(e, "pragma"))?;
        run_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().expect("state store connection poisoned");
        f(&conn)
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")
        .map_err(|e| Error::new_rusqlite(e, "migrations::schema_version"))?;

    let version: u32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))
        .map_err(|e| Error::new_rusqlite(e, "migrations::current_version"))?;

    if version < 1 {
        info!("state store: applying migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE downloads (
                source_uri      TEXT NOT NULL,
                dest_path       TEXT NOT NULL,
                resolved_url    TEXT,
                total_size      INTEGER NOT NULL DEFAULT 0,
                expected_sha256 TEXT,
                actual_sha256   TEXT,
                etag            TEXT,
                last_modified   TEXT,
                status          TEXT NOT NULL,
                retries         INTEGER NOT NULL DEFAULT 0,
                last_error      TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                PRIMARY KEY (source_uri, dest_path)
            );

            CREATE TABLE chunks (
                source_uri  TEXT NOT NULL,
                dest_path   TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                offset_bytes INTEGER NOT NULL,
                size_bytes  INTEGER NOT NULL,
                status      TEXT NOT NULL,
                attempts    INTEGER NOT NULL DEFAULT 0,
                last_error  TEXT,
                sha256      TEXT,
                PRIMARY KEY (source_uri, dest_path, chunk_index),
                FOREIGN KEY (source_uri, dest_path) REFERENCES downloads(source_uri, dest_path) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);

            CREATE TABLE kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )
        .map_err(|e| Error::new_rusqlite(e, "migrations::v1"))?;
    }

    if version < 2 {
        info!("state store: applying migration v2 (legacy digest columns)");
        conn.execute_batch(
            "
            ALTER TABLE downloads ADD COLUMN expected_md5 TEXT;
            ALTER TABLE downloads ADD COLUMN expected_sha1 TEXT;
            INSERT INTO schema_version (version) VALUES (2);
            ",
        )
        .map_err(|e| Error::new_rusqlite(e, "migrations::v2"))?;
    }

    Ok(())
}

fn row_to_download(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadRow> {
    let status_str: String = row.get("status")?;
    Ok(DownloadRow {
        source_uri: row.get("source_uri")?,
        dest_path: std::path::PathBuf::from(row.get::<_, String>("dest_path")?),
        resolved_url: row.get("resolved_url")?,
        total_size: row.get::<_, i64>("total_size")? as u64,
        expected_sha256: row.get("expected_sha256")?,
        actual_sha256: row.get("actual_sha256")?,
        expected_md5: row.get("expected_md5")?,
        expected_sha1: row.get("expected_sha1")?,
        etag: row.get("etag")?,
        last_modified: row.get("last_modified")?,
        status: DownloadStatus::parse(&status_str).unwrap_or(DownloadStatus::Error),
        retries: row.get::<_, i64>("retries")? as u32,
        last_error: row.get("last_error")?,
        created_at: row.get::<_, String>("created_at")?.parse().unwrap_or_else(|_| chrono::Utc::now()),
        updated_at: row.get::<_, String>("updated_at")?.parse().unwrap_or_else(|_| chrono::Utc::now()),
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    let status_str: String = row.get("status")?;
    Ok(ChunkRow {
        source_uri: row.get("source_uri")?,
        dest_path: std::path::PathBuf::from(row.get::<_, String>("dest_path")?),
        index: row.get::<_, i64>("chunk_index")? as u32,
        offset: row.get::<_, i64>("offset_bytes")? as u64,
        size: row.get::<_, i64>("size_bytes")? as u64,
        status: ChunkStatus::parse(&status_str).unwrap_or(ChunkStatus::Dirty),
        attempts: row.get::<_, i64>("attempts")? as u32,
        last_error: row.get("last_error")?,
        sha256: row.get("sha256")?,
    })
}

fn upsert_download_stmt(conn: &Connection, row: &DownloadRow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO downloads (
            source_uri, dest_path, resolved_url, total_size, expected_sha256, actual_sha256,
            expected_md5, expected_sha1, etag, last_modified, status, retries, last_error, created_at, updated_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
        ON CONFLICT (source_uri, dest_path) DO UPDATE SET
            resolved_url = excluded.resolved_url,
            total_size = excluded.total_size,
            expected_sha256 = excluded.expected_sha256,
            actual_sha256 = excluded.actual_sha256,
            expected_md5 = excluded.expected_md5,
            expected_sha1 = excluded.expected_sha1,
            etag = excluded.etag,
            last_modified = excluded.last_modified,
            status = excluded.status,
            retries = excluded.retries,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at",
        params![
            row.source_uri,
            row.dest_path.to_string_lossy(),
            row.resolved_url,
            row.total_size as i64,
            row.expected_sha256,
            row.actual_sha256,
            row.expected_md5,
            row.expected_sha1,
            row.etag,
            row.last_modified,
            row.status.as_str(),
            row.retries as i64,
            row.last_error,
            row.created_at.to_rfc3339(),
            row.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn upsert_chunk_stmt(conn: &Connection, chunk: &ChunkRow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO chunks (
            source_uri, dest_path, chunk_index, offset_bytes, size_bytes, status, attempts, last_error, sha256
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
        ON CONFLICT (source_uri, dest_path, chunk_index) DO UPDATE SET
            offset_bytes = excluded.offset_bytes,
            size_bytes = excluded.size_bytes,
            status = excluded.status,
            attempts = excluded.attempts,
            last_error = excluded.last_error,
            sha256 = excluded.sha256",
        params![
            chunk.source_uri,
            chunk.dest_path.to_string_lossy(),
            chunk.index,
            chunk.offset as i64,
            chunk.size as i64,
            chunk.status.as_str(),
            chunk.attempts as i64,
            chunk.last_error,
            chunk.sha256,
        ],
    )?;
    Ok(())
}

fn delete_chunks_stmt(conn: &Connection, key: &Key) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM chunks WHERE source_uri = ?1 AND dest_path = ?2",
        params![key.source_uri, key.dest_path.to_string_lossy()],
    )?;
    Ok(())
}

impl StateStore for SqliteStateStore {
    fn upsert_download(&self, row: &DownloadRow) -> Result<()> {
        self.with_conn(|conn| upsert_download_stmt(conn, row).map_err(|e| Error::new_rusqlite(e, "upsert_download")))
    }

    fn get(&self, key: &Key) -> Result<Option<DownloadRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM downloads WHERE source_uri = ?1 AND dest_path = ?2",
                params![key.source_uri, key.dest_path.to_string_lossy()],
                row_to_download,
            )
            .optional()
            .map_err(|e| Error::new_rusqlite(e, "get"))
        })
    }

    fn list(&self, filter: &DownloadFilter) -> Result<Vec<DownloadRow>> {
        self.with_conn(|conn| {
            let mut rows = Vec::new();
            let mut collect = |stmt: &mut rusqlite::Statement, params: &[&dyn rusqlite::ToSql]| -> rusqlite::Result<()> {
                let mut iter = stmt.query_map(params, row_to_download)?;
                while let Some(row) = iter.next() {
                    rows.push(row?);
                }
                Ok(())
            };

            let result = if let Some(status) = filter.status {
                let mut stmt = conn
                    .prepare("SELECT * FROM downloads WHERE status = ?1")
                    .map_err(|e| Error::new_rusqlite(e, "list"))?;
                collect(&mut stmt, params![status.as_str()])
            } else {
                let mut stmt = conn
                    .prepare("SELECT * FROM downloads")
                    .map_err(|e| Error::new_rusqlite(e, "list"))?;
                collect(&mut stmt, params![])
            };
            result.map_err(|e| Error::new_rusqlite(e, "list"))?;
            Ok(rows)
        })
    }

    fn delete(&self, key: &Key) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM downloads WHERE source_uri = ?1 AND dest_path = ?2",
                params![key.source_uri, key.dest_path.to_string_lossy()],
            )
            .map_err(|e| Error::new_rusqlite(e, "delete"))?;
            delete_chunks_stmt(conn, key).map_err(|e| Error::new_rusqlite(e, "delete::chunks"))
        })
    }

    fn upsert_chunk(&self, chunk: &ChunkRow) -> Result<()> {
        self.with_conn(|conn| upsert_chunk_stmt(conn, chunk).map_err(|e| Error::new_rusqlite(e, "upsert_chunk")))
    }

    fn list_chunks(&self, key: &Key) -> Result<Vec<ChunkRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM chunks WHERE source_uri = ?1 AND dest_path = ?2 ORDER BY chunk_index ASC")
                .map_err(|e| Error::new_rusqlite(e, "list_chunks"))?;
            let rows = stmt
                .query_map(params![key.source_uri, key.dest_path.to_string_lossy()], row_to_chunk)
                .map_err(|e| Error::new_rusqlite(e, "list_chunks"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::new_rusqlite(e, "list_chunks"))?;
            Ok(rows)
        })
    }

    fn delete_chunks(&self, key: &Key) -> Result<()> {
        self.with_conn(|conn| delete_chunks_stmt(conn, key).map_err(|e| Error::new_rusqlite(e, "delete_chunks")))
    }

    fn transaction(&self, f: &mut dyn FnMut(&dyn StateTxn) -> Result<()>) -> Result<()> {
        let mut conn = self.conn.lock().expect("state store connection poisoned");
        let txn = conn.transaction().map_err(|e| Error::new_rusqlite(e, "transaction::begin"))?;
        let handle = SqliteTxn { conn: &txn };
        f(&handle)?;
        txn.commit().map_err(|e| Error::new_rusqlite(e, "transaction::commit"))
    }

    fn recover_running_on_start(&self) -> Result<Vec<DownloadRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM downloads WHERE status IN ('running', 'hold')")
                .map_err(|e| Error::new_rusqlite(e, "recover_running_on_start"))?;
            let rows = stmt
                .query_map(params![], row_to_download)
                .map_err(|e| Error::new_rusqlite(e, "recover_running_on_start"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::new_rusqlite(e, "recover_running_on_start"))?;
            Ok(rows)
        })
    }

    fn kv_get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| r.get(0))
                .optional()
                .map_err(|e| Error::new_rusqlite(e, "kv_get"))
        })
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|e| Error::new_rusqlite(e, "kv_set"))?;
            Ok(())
        })
    }
}

struct SqliteTxn<'a> {
    conn: &'a Connection,
}

impl StateTxn for SqliteTxn<'_> {
    fn upsert_download(&self, row: &DownloadRow) -> Result<()> {
        upsert_download_stmt(self.conn, row).map_err(|e| Error::new_rusqlite(e, "txn::upsert_download"))
    }

    fn upsert_chunk(&self, chunk: &ChunkRow) -> Result<()> {
        upsert_chunk_stmt(self.conn, chunk).map_err(|e| Error::new_rusqlite(e, "txn::upsert_chunk"))
    }

    fn delete_chunks(&self, key: &Key) -> Result<()> {
        delete_chunks_stmt(self.conn, key).map_err(|e| Error::new_rusqlite(e, "txn::delete_chunks"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DownloadStatus;

    #[test]
    fn upsert_and_get_round_trip() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let key = Key::new("http://h/x", "/tmp/x.bin");
        let mut row = DownloadRow::new(key.clone());
        row.total_size = 100;
        row.status = DownloadStatus::Running;
        store.upsert_download(&row).unwrap();

        let fetched = store.get(&key).unwrap().unwrap();
        assert_eq!(fetched.total_size, 100);
        assert_eq!(fetched.status, DownloadStatus::Running);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let key = Key::new("http://h/x", "/tmp/x.bin");
        let row = DownloadRow::new(key.clone());
        store.upsert_download(&row).unwrap();

        let result = store.transaction(&mut |txn| {
            let mut updated = row.clone();
            updated.status = DownloadStatus::Complete;
            txn.upsert_download(&updated)?;
            Err(Error::Canceled)
        });
        assert!(result.is_err());

        let fetched = store.get(&key).unwrap().unwrap();
        assert_eq!(fetched.status, DownloadStatus::Pending);
    }

    #[test]
    fn recover_running_on_start_finds_running_and_hold() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        for (i, status) in [DownloadStatus::Running, DownloadStatus::Hold, DownloadStatus::Complete].into_iter().enumerate() {
            let key = Key::new(format!("http://h/{i}"), format!("/tmp/{i}.bin"));
            let mut row = DownloadRow::new(key);
            row.status = status;
            store.upsert_download(&row).unwrap();
        }

        let recovered = store.recover_running_on_start().unwrap();
        assert_eq!(recovered.len(), 2);
    }

    #[test]
    fn upsert_chunk_then_delete_chunks_for_key() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let key = Key::new("http://h/x", "/tmp/x.bin");
        store.upsert_download(&DownloadRow::new(key.clone())).unwrap();

        for i in 0..3 {
            store
                .upsert_chunk(&ChunkRow {
                    source_uri: key.source_uri.clone(),
                    dest_path: key.dest_path.clone(),
                    index: i,
                    offset: i as u64 * 10,
                    size: 10,
                    status: ChunkStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    sha256: None,
                })
                .unwrap();
        }

        assert_eq!(store.list_chunks(&key).unwrap().len(), 3);
        store.delete_chunks(&key).unwrap();
        assert!(store.list_chunks(&key).unwrap().is_empty());
    }
}
