use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use crate::log::debug_log;
use crate::storage::{self, MediaKind, MediaRecord, Store};

const EVICT_BATCH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache: refusing to store empty payload for {url}")]
    EmptyPayload { url: String },
    #[error("cache: storage quota exceeded")]
    QuotaExceeded,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub max_size_bytes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            max_size_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Persistent URL-keyed blob cache. The store handle is opened lazily on
/// first use and shared by every caller; a failed open resets the slot so a
/// later call can retry. Concurrent operations rely on the store's
/// per-statement transactions only, so interleaved writes to the same key
/// resolve last-write-wins.
pub struct BlobCache {
    cfg: Config,
    handle: Mutex<Option<Arc<Store>>>,
    evicting: Mutex<()>,
}

impl BlobCache {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            handle: Mutex::new(None),
            evicting: Mutex::new(()),
        }
    }

    pub fn with_store(cfg: Config, store: Arc<Store>) -> Self {
        Self {
            cfg,
            handle: Mutex::new(Some(store)),
            evicting: Mutex::new(()),
        }
    }

    /// Single-flight open: the mutex is held across the open attempt so
    /// concurrent callers converge on one handle.
    fn store(&self) -> Result<Arc<Store>> {
        let mut slot = self.handle.lock();
        if let Some(store) = slot.as_ref() {
            return Ok(store.clone());
        }
        let store = Store::open(storage::Options {
            path: self.cfg.db_path.clone(),
        })
        .context("cache: open backing store")?;
        let store = Arc::new(store);
        *slot = Some(store.clone());
        Ok(store)
    }

    /// Lookup by URL. A hit refreshes `last_used_at`; if the touch fails the
    /// cached record is still returned. A miss is `Ok(None)`, never an error.
    pub fn get(&self, url: &str) -> Result<Option<MediaRecord>> {
        let store = self.store()?;
        let record = match store.get_media(url)? {
            Some(record) => record,
            None => return Ok(None),
        };
        if let Err(err) = store.touch_media(url) {
            debug_log(format!("cache: LRU touch failed for {url}: {err:#}"));
        }
        Ok(Some(record))
    }

    /// Upsert keyed by URL. Rejects empty payloads; signals quota pressure
    /// when the write would push the cache past its byte budget so the
    /// caller can evict and retry.
    pub fn put(
        &self,
        url: &str,
        blob: Vec<u8>,
        content_type: &str,
        filename: &str,
        original_ext: &str,
    ) -> Result<(), CacheError> {
        if blob.is_empty() {
            return Err(CacheError::EmptyPayload { url: url.into() });
        }
        let store = self.store()?;
        let total = store.total_media_size().context("cache: total size")?;
        let existing = store
            .get_media(url)
            .context("cache: check existing")?
            .map(|record| record.size_bytes)
            .unwrap_or(0);
        if total - existing + blob.len() as i64 > self.cfg.max_size_bytes {
            return Err(CacheError::QuotaExceeded);
        }

        let checksum = sha1_hex(&blob);
        let record = MediaRecord {
            id: 0,
            url: url.into(),
            size_bytes: blob.len() as i64,
            media_type: MediaKind::from_content_type(content_type),
            blob,
            filename: filename.into(),
            original_ext: original_ext.into(),
            last_used_at: Utc::now(),
            stored_at: Utc::now(),
            checksum,
        };
        store.upsert_media(record).context("cache: upsert")?;
        Ok(())
    }

    /// Put with one eviction retry on quota pressure.
    pub fn put_evicting(
        &self,
        url: &str,
        blob: Vec<u8>,
        content_type: &str,
        filename: &str,
        original_ext: &str,
    ) -> Result<(), CacheError> {
        match self.put(url, blob.clone(), content_type, filename, original_ext) {
            Err(CacheError::QuotaExceeded) => {
                let freed = self.evict_to_budget(blob.len() as i64)?;
                debug_log(format!("cache: quota pressure, evicted {freed} records"));
                self.put(url, blob, content_type, filename, original_ext)
            }
            other => other,
        }
    }

    /// Delete least-recently-used records in batches until the cache plus
    /// `incoming` pending bytes fits the budget. Returns records removed.
    pub fn evict_to_budget(&self, incoming: i64) -> Result<usize> {
        let _guard = self.evicting.lock();
        let store = self.store()?;
        let mut total = store.total_media_size()? + incoming;
        let mut removed = 0;

        while total > self.cfg.max_size_bytes {
            let batch = store.list_lru_media(EVICT_BATCH)?;
            if batch.is_empty() {
                break;
            }
            let mut ids = Vec::new();
            for (id, url, size) in batch {
                total -= size;
                ids.push(id);
                debug_log(format!("cache: evicting {url} ({size} bytes)"));
                if total <= self.cfg.max_size_bytes {
                    break;
                }
            }
            removed += ids.len();
            store.delete_media(&ids)?;
        }
        Ok(removed)
    }
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
