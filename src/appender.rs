use std::collections::HashSet;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::feed::TrackedMessage;
use crate::render::{emit_html, escape_html, RenderOutput, Renderer};

/// A visually delimited batch of newly appended messages.
#[derive(Debug)]
pub struct Frame {
    pub frame_id: String,
    pub caption: String,
    pub output: RenderOutput,
}

/// Tracks which message ids are already on screen and renders only the
/// delta on updates. The known set is cleared by a full render and only
/// ever grows between them.
#[derive(Debug, Default)]
pub struct Appender {
    known: HashSet<i64>,
}

impl Appender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// Full pass: reset the known set, render everything, remember all ids.
    pub fn full_render(
        &mut self,
        renderer: &Renderer,
        corpus: &[TrackedMessage],
        selected: Option<i64>,
    ) -> RenderOutput {
        self.known.clear();
        let output = renderer.render_all(corpus, selected);
        for node in &output.nodes {
            self.known.insert(node.message.id);
        }
        output
    }

    /// Delta pass: render messages whose ids are not yet known into a new
    /// frame. `None` means nothing new arrived.
    pub fn append_new(
        &mut self,
        renderer: &Renderer,
        corpus: &[TrackedMessage],
        selected: Option<i64>,
    ) -> Option<Frame> {
        let fresh: Vec<&TrackedMessage> = corpus
            .iter()
            .filter(|tracked| !self.known.contains(&tracked.message.id))
            .collect();
        if fresh.is_empty() {
            return None;
        }

        let mut output = RenderOutput::default();
        for tracked in &fresh {
            let node = renderer.render_message(tracked, selected, &mut output);
            self.known.insert(tracked.message.id);
            output.nodes.push(node);
        }

        let caption = if output.nodes.len() == 1 {
            "1 new message".to_string()
        } else {
            format!("{} new messages", output.nodes.len())
        };
        Some(Frame {
            frame_id: frame_id(),
            caption,
            output,
        })
    }
}

fn frame_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("frame-{suffix}")
}

/// Frame markup: a header block followed by the batch's message nodes.
pub fn emit_frame_html(frame: &Frame) -> String {
    format!(
        "<div class=\"batch-frame\" id=\"{}\"><div class=\"frame-header\">{}</div>{}</div>",
        escape_html(&frame.frame_id),
        escape_html(&frame.caption),
        emit_html(&frame.output.nodes)
    )
}
