use std::collections::{HashMap, HashSet};

use chrono::{Local, TimeZone};
use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;

use crate::feed::{Attachment, Message, TrackedMessage};
use crate::links::{self, EmbedCounts, EmbedKind, LinkSegment};

static BACKLINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r">>(\d+)").expect("backlink regex"));

/// A not-yet-materialized slot in the rendered document. The lifecycle
/// controller observes these and fills them in once visible.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderSpec {
    pub slot_id: String,
    pub kind: EmbedKind,
    pub resource: String,
    pub start_time: Option<u64>,
    pub original_url: String,
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub ordinal: usize,
    pub timestamp: String,
    pub thread_color: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BodySegment {
    Text(String),
    Backlink { id: i64 },
    Embed { slot_id: String, kind: EmbedKind },
    LinkOut { url: String, label: String },
}

/// Quoted context nested above a message. A reference back into the current
/// ancestor chain collapses to a marker instead of recursing.
#[derive(Debug, Clone, PartialEq)]
pub enum QuoteNode {
    Message(Box<RenderedMessageNode>),
    Cycle(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessageNode {
    pub message: Message,
    pub thread_id: i64,
    pub depth: usize,
    pub quotes: Vec<QuoteNode>,
    pub header: Header,
    pub body: Vec<BodySegment>,
    pub attachment_slot: Option<String>,
    pub selected: bool,
}

/// Attachments seen during one pass, logged as pass metrics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentStats {
    pub images: usize,
    pub videos: usize,
    pub other: usize,
}

#[derive(Debug, Default)]
pub struct RenderOutput {
    pub nodes: Vec<RenderedMessageNode>,
    pub placeholders: Vec<PlaceholderSpec>,
    pub counts: EmbedCounts,
    pub stats: AttachmentStats,
}

/// The one selected depth-0 message. Selecting it again deselects; selecting
/// another moves the highlight.
#[derive(Debug, Default, Clone, Copy)]
pub struct Selection {
    current: Option<i64>,
}

impl Selection {
    pub fn restore(id: Option<i64>) -> Self {
        Self { current: id }
    }

    pub fn toggle(&mut self, id: i64) -> Option<i64> {
        if self.current == Some(id) {
            self.current = None;
        } else {
            self.current = Some(id);
        }
        self.current
    }

    pub fn current(&self) -> Option<i64> {
        self.current
    }
}

/// Structure pass over the tracked corpus. Pure: produces a node tree with
/// placeholder slots, no I/O. Materialization happens later against the slot
/// ids recorded in `RenderOutput::placeholders`.
pub struct Renderer {
    by_id: HashMap<i64, TrackedMessage>,
    ordinals: HashMap<i64, usize>,
    colors: HashMap<i64, String>,
}

impl Renderer {
    /// `corpus` must already be time-sorted; ordinals follow its order.
    pub fn new(corpus: &[TrackedMessage], colors: HashMap<i64, String>) -> Self {
        let mut by_id = HashMap::new();
        let mut ordinals = HashMap::new();
        for (index, tracked) in corpus.iter().enumerate() {
            ordinals.insert(tracked.message.id, index + 1);
            by_id.insert(tracked.message.id, tracked.clone());
        }
        Self {
            by_id,
            ordinals,
            colors,
        }
    }

    /// Render every message in `corpus` order as a depth-0 node.
    pub fn render_all(
        &self,
        corpus: &[TrackedMessage],
        selected: Option<i64>,
    ) -> RenderOutput {
        let mut out = RenderOutput::default();
        for tracked in corpus {
            let node = self.render_message(tracked, selected, &mut out);
            out.nodes.push(node);
        }
        out
    }

    /// Render one message as a depth-0 node into `out`.
    pub fn render_message(
        &self,
        tracked: &TrackedMessage,
        selected: Option<i64>,
        out: &mut RenderOutput,
    ) -> RenderedMessageNode {
        let mut ancestors = HashSet::new();
        let mut node = self.render_at(tracked, 0, &mut ancestors, out);
        node.selected = selected == Some(tracked.message.id);
        node
    }

    fn render_at(
        &self,
        tracked: &TrackedMessage,
        depth: usize,
        ancestors: &mut HashSet<i64>,
        out: &mut RenderOutput,
    ) -> RenderedMessageNode {
        let message = &tracked.message;
        ancestors.insert(message.id);

        let mut quotes = Vec::new();
        for quoted_id in quoted_ids(&message.text) {
            if ancestors.contains(&quoted_id) {
                quotes.push(QuoteNode::Cycle(quoted_id));
                continue;
            }
            if let Some(quoted) = self.by_id.get(&quoted_id) {
                let child = self.render_at(quoted, depth + 1, ancestors, out);
                quotes.push(QuoteNode::Message(Box::new(child)));
            }
            // Unresolvable references add no quote node.
        }

        let body = self.render_body(message, out);
        let attachment_slot = message
            .attachment
            .as_ref()
            .and_then(|attachment| self.attachment_placeholder(message.id, attachment, out));

        let node = RenderedMessageNode {
            message: message.clone(),
            thread_id: tracked.thread_id,
            depth,
            quotes,
            header: Header {
                ordinal: self.ordinals.get(&message.id).copied().unwrap_or(0),
                timestamp: format_timestamp(message.time),
                thread_color: self.colors.get(&tracked.thread_id).cloned(),
            },
            body,
            attachment_slot,
            selected: false,
        };

        ancestors.remove(&message.id);
        node
    }

    fn render_body(&self, message: &Message, out: &mut RenderOutput) -> Vec<BodySegment> {
        let mut segments = Vec::new();
        let text = &message.text;
        let mut cursor = 0;
        for found in BACKLINK_RE.find_iter(text) {
            if found.start() > cursor {
                self.render_text_run(&text[cursor..found.start()], out, &mut segments);
            }
            let id: i64 = match text[found.start() + 2..found.end()].parse() {
                Ok(id) => id,
                Err(_) => {
                    segments.push(BodySegment::Text(found.as_str().to_string()));
                    cursor = found.end();
                    continue;
                }
            };
            if self.by_id.contains_key(&id) {
                segments.push(BodySegment::Backlink { id });
            } else {
                segments.push(BodySegment::Text(found.as_str().to_string()));
            }
            cursor = found.end();
        }
        if cursor < text.len() {
            self.render_text_run(&text[cursor..], out, &mut segments);
        }
        segments
    }

    fn render_text_run(
        &self,
        run: &str,
        out: &mut RenderOutput,
        segments: &mut Vec<BodySegment>,
    ) {
        for segment in links::detect_segments(run, &mut out.counts) {
            match segment {
                LinkSegment::Text(text) => segments.push(BodySegment::Text(text)),
                LinkSegment::Embed(link) => {
                    let slot_id = slot_id(link.kind, &link.resource);
                    out.placeholders.push(PlaceholderSpec {
                        slot_id: slot_id.clone(),
                        kind: link.kind,
                        resource: link.resource,
                        start_time: link.start_time,
                        original_url: link.original_url,
                        attachment: None,
                    });
                    segments.push(BodySegment::Embed {
                        slot_id,
                        kind: link.kind,
                    });
                }
                LinkSegment::LinkOut { url, label } => {
                    segments.push(BodySegment::LinkOut { url, label });
                }
            }
        }
    }

    /// At most one attachment slot per message, image or video by extension.
    fn attachment_placeholder(
        &self,
        message_id: i64,
        attachment: &Attachment,
        out: &mut RenderOutput,
    ) -> Option<String> {
        let kind = match attachment.ext.to_ascii_lowercase().as_str() {
            ".jpg" | ".jpeg" | ".png" | ".gif" => EmbedKind::Image,
            ".webm" | ".mp4" => EmbedKind::Video,
            _ => {
                out.stats.other += 1;
                return None;
            }
        };
        match kind {
            EmbedKind::Image => out.stats.images += 1,
            EmbedKind::Video => out.stats.videos += 1,
            _ => {}
        }
        let slot_id = slot_id(kind, &message_id.to_string());
        out.placeholders.push(PlaceholderSpec {
            slot_id: slot_id.clone(),
            kind,
            resource: attachment.tim.to_string(),
            start_time: None,
            original_url: String::new(),
            attachment: Some(attachment.clone()),
        });
        Some(slot_id)
    }
}

fn quoted_ids(text: &str) -> Vec<i64> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for caps in BACKLINK_RE.captures_iter(text) {
        if let Ok(id) = caps[1].parse::<i64>() {
            if seen.insert(id) {
                ids.push(id);
            }
        }
    }
    ids
}

fn format_timestamp(time: i64) -> String {
    match Local.timestamp_opt(time, 0).single() {
        Some(when) => when.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::new(),
    }
}

fn slot_id(kind: EmbedKind, resource: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    let tag = match kind {
        EmbedKind::Youtube => "yt",
        EmbedKind::TwitchClip | EmbedKind::TwitchVod => "twitch",
        EmbedKind::Streamable => "streamable",
        EmbedKind::Tweet => "tweet",
        EmbedKind::Image => "img",
        EmbedKind::Video => "vid",
    };
    format!("slot-{tag}-{resource}-{suffix}")
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Emit the node tree as an HTML fragment. Placeholder slots keep their ids
/// so materialized content can be swapped in by slot id later.
pub fn emit_html(nodes: &[RenderedMessageNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        emit_node(node, &mut out);
    }
    out
}

fn emit_node(node: &RenderedMessageNode, out: &mut String) {
    let selected = if node.selected { " selected" } else { "" };
    let color = node
        .header
        .thread_color
        .as_deref()
        .map(|c| format!(" style=\"border-left-color: {}\"", escape_html(c)))
        .unwrap_or_default();
    out.push_str(&format!(
        "<div class=\"message depth-{}{}\" id=\"msg-{}\"{}>",
        node.depth, selected, node.message.id, color
    ));

    // Quoted context precedes the quoting message.
    for quote in &node.quotes {
        match quote {
            QuoteNode::Message(child) => {
                out.push_str("<div class=\"quote\">");
                emit_node(child, out);
                out.push_str("</div>");
            }
            QuoteNode::Cycle(id) => {
                out.push_str(&format!("<div class=\"cycle-marker\">&gt;&gt;{id}</div>"));
            }
        }
    }

    out.push_str(&format!(
        "<div class=\"header\"><span class=\"ordinal\">#{}</span> <span class=\"time\">{}</span></div>",
        node.header.ordinal,
        escape_html(&node.header.timestamp)
    ));

    out.push_str("<div class=\"body\">");
    for segment in &node.body {
        match segment {
            BodySegment::Text(text) => out.push_str(&escape_html(text)),
            BodySegment::Backlink { id } => {
                out.push_str(&format!(
                    "<a class=\"backlink\" href=\"#msg-{id}\">&gt;&gt;{id}</a>"
                ));
            }
            BodySegment::Embed { slot_id, kind } => {
                out.push_str(&format!(
                    "<div class=\"embed-slot\" id=\"{}\">{}</div>",
                    escape_html(slot_id),
                    escape_html(kind.label())
                ));
            }
            BodySegment::LinkOut { url, label } => {
                out.push_str(&format!(
                    "<a class=\"link-out\" href=\"{}\">{}</a>",
                    escape_html(url),
                    escape_html(label)
                ));
            }
        }
    }
    out.push_str("</div>");

    if let Some(slot) = &node.attachment_slot {
        out.push_str(&format!(
            "<div class=\"attachment-slot\" id=\"{}\"></div>",
            escape_html(slot)
        ));
    }

    out.push_str("</div>");
}
