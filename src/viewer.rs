use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};

use crate::appender::{emit_frame_html, Appender};
use crate::config::ViewerConfig;
use crate::embed::EmbedController;
use crate::feed::{collect_sorted, ThreadStore, TrackedMessage, UpdateKind};
use crate::links::EmbedKind;
use crate::log::debug_log;
use crate::render::{emit_html, PlaceholderSpec, Renderer, Selection};
use crate::storage::Store;
use crate::widget::WidgetLoader;

pub type StatusFn = Box<dyn Fn(&str) + Send + Sync>;

/// Top-level pass orchestration: owns the rendered document, the known-id
/// set, the selection, and the persisted visibility flag. Page chrome sits
/// behind the status callback.
pub struct Viewer {
    cfg: ViewerConfig,
    store: Arc<Store>,
    feed: Arc<dyn ThreadStore>,
    embeds: Arc<EmbedController>,
    widgets: Arc<WidgetLoader>,
    appender: Appender,
    selection: Selection,
    visible: bool,
    corpus: Vec<TrackedMessage>,
    colors: HashMap<i64, String>,
    renderer: Renderer,
    document: String,
    status: StatusFn,
}

impl Viewer {
    /// Restores the persisted selection and visibility flag.
    pub fn new(
        cfg: ViewerConfig,
        store: Arc<Store>,
        feed: Arc<dyn ThreadStore>,
        embeds: Arc<EmbedController>,
        widgets: Arc<WidgetLoader>,
    ) -> Result<Self> {
        let selected = store
            .selected_message()
            .context("viewer: load selected message")?;
        let visible = store
            .viewer_visible()
            .context("viewer: load visibility flag")?;
        Ok(Self {
            cfg,
            store,
            feed,
            embeds,
            widgets,
            appender: Appender::new(),
            selection: Selection::restore(selected),
            visible,
            corpus: Vec::new(),
            colors: HashMap::new(),
            renderer: Renderer::new(&[], HashMap::new()),
            document: String::new(),
            status: Box::new(|_| {}),
        })
    }

    pub fn set_status_callback(&mut self, status: StatusFn) {
        self.status = status;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    /// Show/hide the rendered view, persisting the flag. Showing runs a full
    /// pass; a failure there is the catastrophic surface.
    pub fn toggle(&mut self) -> Result<bool> {
        self.visible = !self.visible;
        self.store
            .set_viewer_visible(self.visible)
            .context("viewer: persist visibility flag")?;
        if self.visible {
            if let Err(err) = self.full_pass() {
                (self.status)(&format!("error: {err:#}"));
                return Err(err);
            }
        }
        Ok(self.visible)
    }

    /// Full pass: refresh data, re-render everything, observe placeholders,
    /// run the tweet batch.
    pub fn full_pass(&mut self) -> Result<()> {
        (self.status)("loading");
        self.refresh_data()?;
        self.embeds.begin_pass();

        let selected = self.selection.current();
        let output = self
            .appender
            .full_render(&self.renderer, &self.corpus, selected);
        self.embeds.observe(&output.placeholders);
        self.process_tweets(&output.placeholders);
        self.document = emit_html(&output.nodes);

        debug_log(format!(
            "viewer: full pass rendered {} messages (yt {}, twitch {}, streamable {}, tweets {}; images {}, videos {}, other {})",
            output.nodes.len(),
            output.counts.youtube,
            output.counts.twitch,
            output.counts.streamable,
            output.counts.tweet,
            output.stats.images,
            output.stats.videos,
            output.stats.other,
        ));

        self.settle();
        (self.status)("ready");
        Ok(())
    }

    /// Data-changed notification. A manual refresh appends the delta; a
    /// background sync only refreshes the in-memory copies. Returns whether
    /// anything was appended.
    pub fn handle_update(&mut self, kind: UpdateKind) -> Result<bool> {
        self.refresh_data()?;
        if kind == UpdateKind::Background {
            return Ok(false);
        }

        (self.status)("loading");
        let selected = self.selection.current();
        let appended = match self
            .appender
            .append_new(&self.renderer, &self.corpus, selected)
        {
            Some(frame) => {
                self.embeds.observe(&frame.output.placeholders);
                self.process_tweets(&frame.output.placeholders);
                debug_log(format!(
                    "viewer: appended {} ({} placeholders)",
                    frame.caption,
                    frame.output.placeholders.len()
                ));
                self.document.push_str(&emit_frame_html(&frame));
                self.settle();
                true
            }
            None => {
                (self.status)("no new messages");
                false
            }
        };
        (self.status)("ready");
        Ok(appended)
    }

    /// Click-to-select on a depth-0 message; persisted so the highlight and
    /// scroll target survive a restart.
    pub fn select_message(&mut self, id: i64) -> Result<Option<i64>> {
        let current = self.selection.toggle(id);
        self.store
            .set_selected_message(current)
            .context("viewer: persist selection")?;
        Ok(current)
    }

    pub fn selected_message(&self) -> Option<i64> {
        self.selection.current()
    }

    /// Apply settled embed materializations. Call periodically.
    pub fn pump_embeds(&self) -> Vec<String> {
        self.embeds.pump()
    }

    fn refresh_data(&mut self) -> Result<()> {
        self.corpus = collect_sorted(self.feed.as_ref()).context("viewer: read feed")?;
        self.colors = self.feed.thread_colors().context("viewer: read colors")?;
        self.renderer = Renderer::new(&self.corpus, self.colors.clone());
        Ok(())
    }

    fn process_tweets(&self, placeholders: &[PlaceholderSpec]) {
        let tweets: Vec<PlaceholderSpec> = placeholders
            .iter()
            .filter(|spec| spec.kind == EmbedKind::Tweet)
            .cloned()
            .collect();
        if tweets.is_empty() {
            return;
        }
        for spec in &tweets {
            self.embeds.activate(&spec.slot_id);
        }
        for (slot_id, content) in self.widgets.process_batch(&tweets) {
            self.embeds.resolve_tweet(&slot_id, content);
        }
    }

    /// Give in-flight materializations a beat before the overlay drops.
    fn settle(&self) {
        if !self.cfg.settle_delay.is_zero() {
            thread::sleep(self.cfg.settle_delay);
        }
    }
}
