use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::{self, BlobCache};
use crate::config;
use crate::embed::{self, EmbedController};
use crate::feed::{JsonThreadStore, ThreadStore};
use crate::media;
use crate::storage;
use crate::viewer::Viewer;
use crate::widget::{self, DisabledScript, WidgetLoader};

/// Wire everything up, run one full render pass over the tracked feed, and
/// write the document to stdout.
pub fn run() -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;

    let store = Arc::new(
        storage::Store::open(storage::Options {
            path: cfg.cache.db_path.clone(),
        })
        .context("open storage")?,
    );

    let cache = Arc::new(BlobCache::with_store(
        cache::Config {
            db_path: cfg.cache.db_path.clone(),
            max_size_bytes: cfg.cache.max_size_bytes,
        },
        store.clone(),
    ));
    let manager = Arc::new(
        media::Manager::new(
            cache,
            media::Config {
                workers: cfg.media.workers,
                http_client: None,
            },
        )
        .context("start media workers")?,
    );
    let embeds = Arc::new(EmbedController::new(
        manager,
        embed::Config {
            parent_host: cfg.embed.parent_host.clone(),
        },
    ));
    let widgets = Arc::new(WidgetLoader::new(
        Arc::new(DisabledScript),
        widget::Config {
            ready_timeout: cfg.widget.ready_timeout,
            ready_grace: cfg.widget.ready_grace,
            tweet_timeout: cfg.widget.tweet_timeout,
        },
    ));

    let data_dir = cfg
        .feed
        .data_dir
        .clone()
        .context("config: feed.data_dir is not set")?;
    let feed: Arc<dyn ThreadStore> = Arc::new(JsonThreadStore::new(data_dir));

    let mut viewer = Viewer::new(cfg.viewer.clone(), store, feed, embeds, widgets)
        .context("construct viewer")?;
    viewer.set_status_callback(Box::new(|status| {
        eprintln!("threadloom: {status}");
    }));

    viewer.full_pass().context("full render pass")?;
    viewer.pump_embeds();

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(viewer.document().as_bytes())
        .context("write document")?;
    stdout.write_all(b"\n").context("write document")?;
    Ok(())
}
