use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

const SELECTED_MESSAGE_KEY: &str = "selected_message_id";
const VIEWER_VISIBLE_KEY: &str = "viewer_visible";

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

impl MediaKind {
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.starts_with("image/") {
            MediaKind::Image
        } else if content_type.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Other
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Other => "other",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "image" => MediaKind::Image,
            "video" => MediaKind::Video,
            _ => MediaKind::Other,
        }
    }
}

/// One cached media record, keyed by URL. `last_used_at` is the LRU signal:
/// refreshed on every successful read and on write.
#[derive(Debug, Clone)]
pub struct MediaRecord {
    pub id: i64,
    pub url: String,
    pub blob: Vec<u8>,
    pub media_type: MediaKind,
    pub filename: String,
    pub original_ext: String,
    pub size_bytes: i64,
    pub last_used_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
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

    pub fn upsert_media(&self, mut record: MediaRecord) -> Result<i64> {
        if record.url.is_empty() {
            bail!("storage: media url required");
        }
        let now = Utc::now();
        if record.stored_at.timestamp() == 0 {
            record.stored_at = now;
        }
        record.last_used_at = now;

        let conn = self.conn.lock();
        let id: i64 = conn.query_row(
            r#"
INSERT INTO media_cache (url, blob, media_type, filename, original_ext, size_bytes, last_used_at, stored_at, checksum)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT(url) DO UPDATE SET
  blob = excluded.blob,
  media_type = excluded.media_type,
  filename = excluded.filename,
  original_ext = excluded.original_ext,
  size_bytes = excluded.size_bytes,
  last_used_at = excluded.last_used_at,
  stored_at = excluded.stored_at,
  checksum = excluded.checksum
RETURNING id
"#,
            params![
                record.url,
                record.blob,
                record.media_type.as_str(),
                record.filename,
                record.original_ext,
                record.size_bytes,
                record.last_used_at.timestamp(),
                record.stored_at.timestamp(),
                record.checksum,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_media(&self, url: &str) -> Result<Option<MediaRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT id, url, blob, media_type, filename, original_ext, size_bytes, last_used_at, stored_at, checksum
FROM media_cache
WHERE url = ?1
"#,
            params![url],
            media_record_from_row,
        )
        .optional()
        .context("storage: query media record")
    }

    /// LRU touch. Separate from `get_media` so a failed touch can still
    /// return the cached blob.
    pub fn touch_media(&self, url: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE media_cache SET last_used_at = ?1 WHERE url = ?2",
            params![Utc::now().timestamp(), url],
        )?;
        Ok(())
    }

    pub fn total_media_size(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let total: Option<i64> = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM media_cache",
            [],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0))
    }

    /// Least recently used records first, blob column excluded.
    pub fn list_lru_media(&self, limit: usize) -> Result<Vec<(i64, String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT id, url, size_bytes
FROM media_cache
ORDER BY last_used_at ASC
LIMIT ?1
"#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_media(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(",");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "DELETE FROM media_cache WHERE id IN ({})",
            placeholders
        ))?;
        stmt.execute(rusqlite::params_from_iter(ids.iter()))?;
        Ok(())
    }

    pub fn selected_message(&self) -> Result<Option<i64>> {
        Ok(self
            .get_state(SELECTED_MESSAGE_KEY)?
            .and_then(|raw| raw.parse().ok()))
    }

    pub fn set_selected_message(&self, id: Option<i64>) -> Result<()> {
        match id {
            Some(id) => self.set_state(SELECTED_MESSAGE_KEY, &id.to_string()),
            None => self.clear_state(SELECTED_MESSAGE_KEY),
        }
    }

    pub fn viewer_visible(&self) -> Result<bool> {
        Ok(self
            .get_state(VIEWER_VISIBLE_KEY)?
            .map(|raw| raw == "true")
            .unwrap_or(false))
    }

    pub fn set_viewer_visible(&self, visible: bool) -> Result<()> {
        self.set_state(VIEWER_VISIBLE_KEY, if visible { "true" } else { "false" })
    }

    fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM viewer_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("storage: query viewer state")
    }

    fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO viewer_state (key, value) VALUES (?1, ?2)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#,
            params![key, value],
        )?;
        Ok(())
    }

    fn clear_state(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM viewer_state WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn media_record_from_row(row: &Row<'_>) -> rusqlite::Result<MediaRecord> {
    let media_type: String = row.get(3)?;
    let last_used: i64 = row.get(7)?;
    let stored: i64 = row.get(8)?;
    Ok(MediaRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        blob: row.get(2)?,
        media_type: MediaKind::parse(&media_type),
        filename: row.get(4)?,
        original_ext: row.get(5)?,
        size_bytes: row.get(6)?,
        last_used_at: Utc
            .timestamp_opt(last_used, 0)
            .single()
            .unwrap_or_else(Utc::now),
        stored_at: Utc
            .timestamp_opt(stored, 0)
            .single()
            .unwrap_or_else(Utc::now),
        checksum: row.get(9)?,
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS media_cache (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  url TEXT NOT NULL UNIQUE,
  blob BLOB NOT NULL,
  media_type TEXT NOT NULL,
  filename TEXT,
  original_ext TEXT,
  size_bytes INTEGER NOT NULL,
  last_used_at INTEGER NOT NULL,
  stored_at INTEGER NOT NULL,
  checksum TEXT
);

CREATE INDEX IF NOT EXISTS idx_media_cache_last_used_at ON media_cache(last_used_at);

CREATE TABLE IF NOT EXISTS viewer_state (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("threadloom").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap();
        (dir, store)
    }

    fn record(url: &str, blob: Vec<u8>) -> MediaRecord {
        MediaRecord {
            id: 0,
            url: url.into(),
            size_bytes: blob.len() as i64,
            blob,
            media_type: MediaKind::Image,
            filename: "a.png".into(),
            original_ext: ".png".into(),
            last_used_at: Utc::now(),
            stored_at: Utc::now(),
            checksum: String::new(),
        }
    }

    #[test]
    fn open_creates_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = Store::open(Options {
            path: Some(path.clone()),
        })
        .unwrap();
        assert!(path.exists());
        store.close().unwrap();
    }

    #[test]
    fn media_upsert_overwrites_by_url() {
        let (_dir, store) = open_temp();
        store.upsert_media(record("u1", vec![1, 2, 3])).unwrap();
        store.upsert_media(record("u1", vec![9, 9])).unwrap();
        let loaded = store.get_media("u1").unwrap().unwrap();
        assert_eq!(loaded.blob, vec![9, 9]);
        assert_eq!(store.total_media_size().unwrap(), 2);
    }

    #[test]
    fn viewer_state_round_trip() {
        let (_dir, store) = open_temp();
        assert!(store.selected_message().unwrap().is_none());
        store.set_selected_message(Some(42)).unwrap();
        assert_eq!(store.selected_message().unwrap(), Some(42));
        store.set_selected_message(None).unwrap();
        assert!(store.selected_message().unwrap().is_none());

        assert!(!store.viewer_visible().unwrap());
        store.set_viewer_visible(true).unwrap();
        assert!(store.viewer_visible().unwrap());
    }
}
