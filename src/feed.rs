use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One attachment per message at most. Field names follow the upstream
/// tracker's records: `tim` is the upload id the media URLs are derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub tim: i64,
    pub ext: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub w: i64,
    #[serde(default)]
    pub h: i64,
    #[serde(default)]
    pub tn_w: i64,
    #[serde(default)]
    pub tn_h: i64,
    #[serde(default = "default_board")]
    pub board: String,
}

fn default_board() -> String {
    "b".into()
}

/// Immutable once read from the tracker store; the viewer only derives
/// rendering state from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub time: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedMessage {
    pub message: Message,
    pub thread_id: i64,
}

/// Whether an update notification came from the user pressing refresh or
/// from the tracker's background sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Manual,
    Background,
}

/// Read contract against the upstream tracker store: three keyed records,
/// always read wholesale.
pub trait ThreadStore: Send + Sync {
    fn active_threads(&self) -> Result<Vec<i64>>;
    fn messages(&self, thread_id: i64) -> Result<Vec<Message>>;
    fn thread_colors(&self) -> Result<HashMap<i64, String>>;
}

/// Full tracked corpus, sorted by time ascending. The sort is stable so
/// messages with identical timestamps keep the store's relative order.
pub fn collect_sorted(store: &dyn ThreadStore) -> Result<Vec<TrackedMessage>> {
    let mut all = Vec::new();
    for thread_id in store.active_threads()? {
        for message in store.messages(thread_id)? {
            all.push(TrackedMessage { message, thread_id });
        }
    }
    all.sort_by_key(|tracked| tracked.message.time);
    Ok(all)
}

/// Tracker store persisted as three JSON documents in one directory.
pub struct JsonThreadStore {
    dir: PathBuf,
}

impl JsonThreadStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn read_value<T: for<'de> Deserialize<'de> + Default>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(T::default());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("feed: read {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("feed: parse {}", path.display()))
    }
}

impl ThreadStore for JsonThreadStore {
    fn active_threads(&self) -> Result<Vec<i64>> {
        self.read_value("active_threads.json")
    }

    fn messages(&self, thread_id: i64) -> Result<Vec<Message>> {
        let by_thread: HashMap<String, Vec<Message>> = self.read_value("messages.json")?;
        Ok(by_thread
            .get(&thread_id.to_string())
            .cloned()
            .unwrap_or_default())
    }

    fn thread_colors(&self) -> Result<HashMap<i64, String>> {
        let raw: HashMap<String, String> = self.read_value("thread_colors.json")?;
        let mut colors = HashMap::new();
        for (key, value) in raw {
            if let Ok(id) = key.parse::<i64>() {
                colors.insert(id, value);
            }
        }
        Ok(colors)
    }
}

/// In-memory store used by tests and offline mode.
#[derive(Default)]
pub struct MemoryThreadStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    threads: Vec<i64>,
    messages: HashMap<i64, Vec<Message>>,
    colors: HashMap<i64, String>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_thread(&self, thread_id: i64, messages: Vec<Message>) {
        let mut inner = self.inner.write();
        if !inner.threads.contains(&thread_id) {
            inner.threads.push(thread_id);
        }
        inner.messages.insert(thread_id, messages);
    }

    pub fn push_message(&self, thread_id: i64, message: Message) {
        let mut inner = self.inner.write();
        if !inner.threads.contains(&thread_id) {
            inner.threads.push(thread_id);
        }
        inner.messages.entry(thread_id).or_default().push(message);
    }

    pub fn set_color(&self, thread_id: i64, color: &str) {
        self.inner.write().colors.insert(thread_id, color.into());
    }
}

impl ThreadStore for MemoryThreadStore {
    fn active_threads(&self) -> Result<Vec<i64>> {
        Ok(self.inner.read().threads.clone())
    }

    fn messages(&self, thread_id: i64) -> Result<Vec<Message>> {
        Ok(self
            .inner
            .read()
            .messages
            .get(&thread_id)
            .cloned()
            .unwrap_or_default())
    }

    fn thread_colors(&self) -> Result<HashMap<i64, String>> {
        Ok(self.inner.read().colors.clone())
    }
}

pub fn message(id: i64, time: i64, text: &str) -> Message {
    Message {
        id,
        time,
        text: text.into(),
        attachment: None,
    }
}
