use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "THREADLOOM";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub embed: EmbedConfig,
    #[serde(default)]
    pub widget: WidgetConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    /// Directory holding the tracker's exported JSON records.
    #[serde(default = "default_data_dir")]
    pub data_dir: Option<PathBuf>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("threadloom"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_db_path")]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_size_bytes: default_max_size_bytes(),
        }
    }
}

fn default_db_path() -> Option<PathBuf> {
    None
}

fn default_max_size_bytes() -> i64 {
    500 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbedConfig {
    /// Hostname handed to Twitch player embeds as the `parent` param.
    #[serde(default = "default_parent_host")]
    pub parent_host: String,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            parent_host: default_parent_host(),
        }
    }
}

fn default_parent_host() -> String {
    "localhost".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WidgetConfig {
    #[serde(default = "default_ready_timeout", with = "humantime_serde")]
    pub ready_timeout: Duration,
    #[serde(default = "default_ready_grace", with = "humantime_serde")]
    pub ready_grace: Duration,
    #[serde(default = "default_tweet_timeout", with = "humantime_serde")]
    pub tweet_timeout: Duration,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            ready_timeout: default_ready_timeout(),
            ready_grace: default_ready_grace(),
            tweet_timeout: default_tweet_timeout(),
        }
    }
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(6)
}

fn default_ready_grace() -> Duration {
    Duration::from_millis(500)
}

fn default_tweet_timeout() -> Duration {
    Duration::from_secs(40)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewerConfig {
    /// Pause before the loading overlay is dismissed after a pass.
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            settle_delay: default_settle_delay(),
        }
    }
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("config: read file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("config: parse file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if other.feed.data_dir.is_some() {
        base.feed.data_dir = other.feed.data_dir;
    }

    if other.cache.db_path.is_some() {
        base.cache.db_path = other.cache.db_path;
    }
    if other.cache.max_size_bytes != 0 {
        base.cache.max_size_bytes = other.cache.max_size_bytes;
    }

    if other.media.workers != 0 {
        base.media.workers = other.media.workers;
    }

    if !other.embed.parent_host.is_empty() {
        base.embed.parent_host = other.embed.parent_host;
    }

    base.widget.ready_timeout = other.widget.ready_timeout;
    base.widget.ready_grace = other.widget.ready_grace;
    base.widget.tweet_timeout = other.widget.tweet_timeout;
    base.viewer.settle_delay = other.viewer.settle_delay;

    base
}

/// Env overrides are applied in place so unset variables leave file-loaded
/// values untouched.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            apply_env_value(cfg, &normalized, value);
        }
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "feed.data_dir" => cfg.feed.data_dir = Some(PathBuf::from(value)),
        "cache.db_path" => cfg.cache.db_path = Some(PathBuf::from(value)),
        "cache.max_size_bytes" => {
            if let Ok(parsed) = value.parse::<i64>() {
                cfg.cache.max_size_bytes = parsed;
            }
        }
        "media.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.media.workers = parsed;
            }
        }
        "embed.parent_host" => cfg.embed.parent_host = value,
        "widget.ready_timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.widget.ready_timeout = duration;
            }
        }
        "widget.ready_grace" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.widget.ready_grace = duration;
            }
        }
        "widget.tweet_timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.widget.tweet_timeout = duration;
            }
        }
        "viewer.settle_delay" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.viewer.settle_delay = duration;
            }
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("threadloom").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_without_files() {
        let cfg = load(LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/config.yaml")),
            env_prefix: Some("THREADLOOM_TEST_NONE".into()),
        })
        .unwrap();
        assert_eq!(cfg.embed.parent_host, "localhost");
        assert_eq!(cfg.cache.max_size_bytes, default_max_size_bytes());
        assert_eq!(cfg.viewer.settle_delay, Duration::from_secs(1));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "cache:\n  max_size_bytes: 1024\nembed:\n  parent_host: viewer.example\nwidget:\n  tweet_timeout: 5s\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("THREADLOOM_TEST_NONE".into()),
        })
        .unwrap();
        assert_eq!(cfg.cache.max_size_bytes, 1024);
        assert_eq!(cfg.embed.parent_host, "viewer.example");
        assert_eq!(cfg.widget.tweet_timeout, Duration::from_secs(5));
    }

    #[test]
    fn partial_env_keeps_file_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "cache:\n  max_size_bytes: 2048\nviewer:\n  settle_delay: 3s\n",
        )
        .unwrap();
        env::set_var("THREADLOOM_PARTIAL_MEDIA__WORKERS", "7");
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("THREADLOOM_PARTIAL".into()),
        })
        .unwrap();
        // The env var touches only media.workers; everything the file set
        // survives the env stage.
        assert_eq!(cfg.media.workers, 7);
        assert_eq!(cfg.cache.max_size_bytes, 2048);
        assert_eq!(cfg.viewer.settle_delay, Duration::from_secs(3));
        assert_eq!(cfg.embed.parent_host, "localhost");
        env::remove_var("THREADLOOM_PARTIAL_MEDIA__WORKERS");
    }

    #[test]
    fn env_overrides() {
        env::set_var("THREADLOOM_ENVTEST_EMBED__PARENT_HOST", "env.example");
        env::set_var("THREADLOOM_ENVTEST_VIEWER__SETTLE_DELAY", "250ms");
        let cfg = load(LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/config.yaml")),
            env_prefix: Some("THREADLOOM_ENVTEST".into()),
        })
        .unwrap();
        assert_eq!(cfg.embed.parent_host, "env.example");
        assert_eq!(cfg.viewer.settle_delay, Duration::from_millis(250));
        env::remove_var("THREADLOOM_ENVTEST_EMBED__PARENT_HOST");
        env::remove_var("THREADLOOM_ENVTEST_VIEWER__SETTLE_DELAY");
    }
}
