use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use image::ImageFormat;
use reqwest::blocking::Client;

use crate::cache::{BlobCache, CacheError};
use crate::log::debug_log;
use crate::storage::{MediaKind, MediaRecord};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("media: request for {url} failed with status {status}")]
    BadStatus { url: String, status: u16 },
    #[error("media: {url} returned {got}, expected {expected} content")]
    WrongKind {
        url: String,
        got: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub http_client: Option<Client>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 2,
            http_client: None,
        }
    }
}

/// One cache-first fetch: look up the URL, else download, validate the
/// content kind, store through the cache, return the record.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub url: String,
    /// When set, a response of a different kind is a failure rather than a
    /// cacheable success (drives the iframe fallback for embeds).
    pub expect: Option<MediaKind>,
    pub filename: String,
    pub original_ext: String,
}

#[derive(Debug)]
pub struct Fetched {
    pub record: Option<MediaRecord>,
    pub error: Option<anyhow::Error>,
    pub from_cache: bool,
}

struct Job {
    request: Request,
    tx: Sender<Fetched>,
}

struct Inner {
    cache: Arc<BlobCache>,
    client: Client,
    jobs: Sender<Job>,
    stop: Sender<()>,
}

/// Worker pool serving cache-first media requests. Results come back on a
/// per-job channel so callers can poll without blocking the render pass.
pub struct Manager {
    inner: Arc<Inner>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Manager {
    pub fn new(cache: Arc<BlobCache>, cfg: Config) -> Result<Self> {
        let workers = cfg.workers.max(1);
        let client = if let Some(client) = cfg.http_client.clone() {
            client
        } else {
            Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .context("media: build http client")?
        };

        let (job_tx, job_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();

        let inner = Arc::new(Inner {
            cache,
            client,
            jobs: job_tx,
            stop: stop_tx,
        });

        let mut handles = Vec::new();
        for _ in 0..workers {
            let rx_jobs = job_rx.clone();
            let rx_stop = stop_rx.clone();
            let worker_inner = inner.clone();
            handles.push(thread::spawn(move || worker_inner.worker(rx_jobs, rx_stop)));
        }

        Ok(Self { inner, handles })
    }

    pub fn enqueue(&self, request: Request) -> Receiver<Fetched> {
        let (tx, rx) = unbounded();
        let job = Job { request, tx };
        let _ = self.inner.jobs.send(job);
        rx
    }

    /// Synchronous variant used where the caller is already off the render
    /// path (tests, tweet batch worker threads).
    pub fn fetch_now(&self, request: Request) -> Fetched {
        self.inner.serve(request)
    }

    fn shutdown(&mut self) {
        for _ in &self.handles {
            let _ = self.inner.stop.send(());
        }
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn worker(&self, jobs: Receiver<Job>, stop: Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => break,
                recv(jobs) -> msg => {
                    match msg {
                        Ok(job) => {
                            let result = self.serve(job.request);
                            let _ = job.tx.send(result);
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    }

    fn serve(&self, request: Request) -> Fetched {
        match self.cache.get(&request.url) {
            Ok(Some(record)) => {
                return Fetched {
                    record: Some(record),
                    error: None,
                    from_cache: true,
                }
            }
            Ok(None) => {}
            Err(err) => {
                // Callers treat a cache read error as one of the fallback
                // edges, same as a failed download.
                return Fetched {
                    record: None,
                    error: Some(err),
                    from_cache: false,
                };
            }
        }

        match self.fetch(&request) {
            Ok(record) => Fetched {
                record: Some(record),
                error: None,
                from_cache: false,
            },
            Err(err) => Fetched {
                record: None,
                error: Some(err),
                from_cache: false,
            },
        }
    }

    fn fetch(&self, request: &Request) -> Result<MediaRecord> {
        if request.url.is_empty() {
            return Err(anyhow!("media: url required"));
        }

        let response = self
            .client
            .get(&request.url)
            .send()
            .context("media: download")?;

        if !response.status().is_success() {
            return Err(FetchError::BadStatus {
                url: request.url.clone(),
                status: response.status().as_u16(),
            }
            .into());
        }

        let headers = response.headers().clone();
        let bytes = response.bytes().context("media: body")?.to_vec();
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|val| val.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| detect_mime(&bytes));

        if let Some(expected) = request.expect {
            let got = MediaKind::from_content_type(&content_type);
            if got != expected {
                return Err(FetchError::WrongKind {
                    url: request.url.clone(),
                    got: content_type,
                    expected: match expected {
                        MediaKind::Image => "image",
                        MediaKind::Video => "video",
                        MediaKind::Other => "other",
                    },
                }
                .into());
            }
        }

        match self.cache.put_evicting(
            &request.url,
            bytes,
            &content_type,
            &request.filename,
            &request.original_ext,
        ) {
            Ok(()) => {}
            Err(CacheError::QuotaExceeded) => {
                // We evicted once and still could not fit.
                debug_log(format!(
                    "media: {} exceeds cache budget even after eviction",
                    request.url
                ));
                return Err(anyhow!("media: cache quota exhausted for {}", request.url));
            }
            Err(err) => return Err(err.into()),
        }

        self.cache
            .get(&request.url)?
            .ok_or_else(|| anyhow!("media: record vanished after store for {}", request.url))
    }
}

fn detect_mime(bytes: &[u8]) -> String {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg".into(),
        Ok(ImageFormat::Png) => "image/png".into(),
        Ok(ImageFormat::Gif) => "image/gif".into(),
        Ok(ImageFormat::WebP) => "image/webp".into(),
        _ => {
            let mut buffer = [0u8; 512];
            let mut cursor = std::io::Cursor::new(bytes);
            let read = cursor.read(&mut buffer).unwrap_or(0);
            tree_magic_mini::from_u8(&buffer[..read]).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache;
    use tempfile::tempdir;

    fn temp_manager() -> (tempfile::TempDir, Arc<BlobCache>, Manager) {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlobCache::new(cache::Config {
            db_path: Some(dir.path().join("cache.db")),
            max_size_bytes: 1024 * 1024,
        }));
        let manager = Manager::new(cache.clone(), Config::default()).unwrap();
        (dir, cache, manager)
    }

    #[test]
    fn cache_hit_skips_network() {
        let (_dir, cache, manager) = temp_manager();
        cache
            .put(
                "https://example.invalid/a.png",
                vec![5; 10],
                "image/png",
                "a.png",
                ".png",
            )
            .unwrap();
        let rx = manager.enqueue(Request {
            url: "https://example.invalid/a.png".into(),
            expect: Some(MediaKind::Image),
            filename: "a.png".into(),
            original_ext: ".png".into(),
        });
        let fetched = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fetched.from_cache);
        assert_eq!(fetched.record.unwrap().blob, vec![5; 10]);
    }

    #[test]
    fn unreachable_host_reports_error() {
        let (_dir, _cache, manager) = temp_manager();
        let fetched = manager.fetch_now(Request {
            url: "http://127.0.0.1:1/missing.mp4".into(),
            expect: Some(MediaKind::Video),
            filename: "missing.mp4".into(),
            original_ext: ".mp4".into(),
        });
        assert!(fetched.record.is_none());
        assert!(fetched.error.is_some());
    }
}
