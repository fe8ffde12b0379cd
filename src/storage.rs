use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// One cached media download, keyed by the archive URL it came from.
#[derive(Debug, Clone)]
pub struct MediaEntry {
    pub id: i64,
    pub url: String,
    pub media_type: String,
    pub file_path: String,
    pub size_bytes: i64,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub checksum: String,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "foreign_keys", &"ON")
            .context("storage: enable foreign keys")?;
        conn.pragma_update(None, "busy_timeout", &5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn upsert_media(&self, mut entry: MediaEntry) -> Result<i64> {
        if entry.url.is_empty() {
            bail!("storage: media url required");
        }
        if entry.fetched_at.timestamp() == 0 {
            entry.fetched_at = Utc::now();
        }

        let conn = self.conn.lock();
        let id: i64 = conn.query_row(
            r#"
INSERT INTO media_cache (url, media_type, file_path, size_bytes, fetched_at, expires_at, checksum)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(url) DO UPDATE SET
  media_type = excluded.media_type,
  file_path = excluded.file_path,
  size_bytes = excluded.size_bytes,
  fetched_at = excluded.fetched_at,
  expires_at = excluded.expires_at,
  checksum = excluded.checksum
RETURNING id
"#,
            params![
                entry.url,
                entry.media_type,
                entry.file_path,
                entry.size_bytes,
                entry.fetched_at.timestamp(),
                entry.expires_at.map(|ts| ts.timestamp()),
                entry.checksum,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_media_by_url(&self, url: &str) -> Result<Option<MediaEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT id, url, media_type, file_path, size_bytes, fetched_at, expires_at, checksum
FROM media_cache
WHERE url = ?1
"#,
            params![url],
            media_from_row,
        )
        .optional()
        .context("storage: query media by url")
    }

    pub fn delete_media(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM media_cache WHERE id = ?1", params![id])
            .context("storage: delete media entry")?;
        Ok(())
    }

    /// Entries whose expiry has passed as of `now`.
    pub fn list_expired_media(&self, now: DateTime<Utc>) -> Result<Vec<MediaEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT id, url, media_type, file_path, size_bytes, fetched_at, expires_at, checksum
FROM media_cache
WHERE expires_at IS NOT NULL AND expires_at <= ?1
"#,
        )?;
        let rows = stmt.query_map(params![now.timestamp()], media_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Oldest-first listing used by the size-budget prune.
    pub fn list_media_by_fetched(&self) -> Result<Vec<MediaEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT id, url, media_type, file_path, size_bytes, fetched_at, expires_at, checksum
FROM media_cache
ORDER BY fetched_at ASC
"#,
        )?;
        let rows = stmt.query_map([], media_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn total_media_size(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM media_cache",
            [],
            |row| row.get(0),
        )
        .context("storage: sum media sizes")
    }
}

fn media_from_row(row: &Row<'_>) -> rusqlite::Result<MediaEntry> {
    let fetched_at: i64 = row.get(5)?;
    let expires_at: Option<i64> = row.get(6)?;
    Ok(MediaEntry {
        id: row.get(0)?,
        url: row.get(1)?,
        media_type: row.get(2)?,
        file_path: row.get(3)?,
        size_bytes: row.get(4)?,
        fetched_at: Utc
            .timestamp_opt(fetched_at, 0)
            .single()
            .unwrap_or_else(Utc::now),
        expires_at: expires_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        checksum: row.get(7)?,
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    for statement in migrations() {
        conn.execute_batch(statement)
            .context("storage: run migration")?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS media_cache (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  url TEXT NOT NULL UNIQUE,
  media_type TEXT NOT NULL,
  file_path TEXT NOT NULL,
  size_bytes INTEGER,
  fetched_at INTEGER NOT NULL,
  expires_at INTEGER,
  checksum TEXT
);

CREATE INDEX IF NOT EXISTS idx_media_cache_fetched_at ON media_cache(fetched_at);
CREATE INDEX IF NOT EXISTS idx_media_cache_expires_at ON media_cache(expires_at);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("msgvault").join("state.db"))
}
