use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::feed::Attachment;
use crate::links::EmbedKind;
use crate::log::debug_log;
use crate::media::{Fetched, Manager, Request};
use crate::render::PlaceholderSpec;
use crate::storage::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedState {
    Unloaded,
    Loading,
    Loaded,
}

/// What currently occupies a slot's region.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotContent {
    /// Lightweight stand-in markup naming the embed kind.
    Placeholder,
    Iframe { src: String },
    /// Playable element backed by a cached blob, keyed by its cache URL.
    NativeVideo { url: String, from_cache: bool },
    NativeImage { url: String, from_cache: bool },
    /// Awaiting the social widget batch.
    TweetPending,
    Tweet { html: String },
    LinkOut { url: String, label: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Hostname passed to Twitch player embeds as the `parent` param.
    pub parent_host: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parent_host: "localhost".into(),
        }
    }
}

struct Slot {
    spec: PlaceholderSpec,
    state: EmbedState,
    content: SlotContent,
    attached: bool,
    pending: Option<Receiver<Fetched>>,
    /// Whether the attachment is currently requested at full size.
    full_size: bool,
}

/// Drives each placeholder through `Unloaded -> Loading -> Loaded` on
/// visibility and interaction events. Loaded embeds are torn down when they
/// leave the viewport; in-flight loads always run to completion, and a result
/// arriving for a detached slot is dropped.
pub struct EmbedController {
    cfg: Config,
    media: Arc<Manager>,
    slots: Mutex<HashMap<String, Slot>>,
    /// Attachments shown at full size, reset each render pass.
    full_size_shown: Mutex<HashSet<i64>>,
}

impl EmbedController {
    pub fn new(media: Arc<Manager>, cfg: Config) -> Self {
        Self {
            cfg,
            media,
            slots: Mutex::new(HashMap::new()),
            full_size_shown: Mutex::new(HashSet::new()),
        }
    }

    /// Start a render pass: previously observed slots are detached so late
    /// results land nowhere, and the full-size set resets.
    pub fn begin_pass(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.values_mut() {
            slot.attached = false;
        }
        slots.retain(|_, slot| slot.pending.is_some());
        self.full_size_shown.lock().clear();
    }

    /// Register freshly rendered placeholders.
    pub fn observe(&self, specs: &[PlaceholderSpec]) {
        let mut slots = self.slots.lock();
        for spec in specs {
            slots.insert(
                spec.slot_id.clone(),
                Slot {
                    spec: spec.clone(),
                    state: EmbedState::Unloaded,
                    content: SlotContent::Placeholder,
                    attached: true,
                    pending: None,
                    full_size: false,
                },
            );
        }
    }

    pub fn state(&self, slot_id: &str) -> Option<EmbedState> {
        self.slots.lock().get(slot_id).map(|slot| slot.state)
    }

    pub fn content(&self, slot_id: &str) -> Option<SlotContent> {
        self.slots.lock().get(slot_id).map(|slot| slot.content.clone())
    }

    pub fn visibility_enter(&self, slot_id: &str) {
        self.start_if_unloaded(slot_id);
    }

    /// Pointer or keyboard activation loads immediately, visibility aside.
    pub fn activate(&self, slot_id: &str) {
        self.start_if_unloaded(slot_id);
    }

    /// A Loaded embed leaving the viewport is torn down to its placeholder.
    /// Loading slots are left alone so in-flight work can finish.
    pub fn visibility_exit(&self, slot_id: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(slot_id) {
            if slot.state == EmbedState::Loaded {
                slot.state = EmbedState::Unloaded;
                slot.content = SlotContent::Placeholder;
            }
        }
    }

    /// Switch an attachment between thumbnail and full size. Re-enters the
    /// cache-first path with the other derived URL.
    pub fn toggle_full_size(&self, slot_id: &str) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(slot_id) else {
            return;
        };
        let Some(attachment) = slot.spec.attachment.clone() else {
            return;
        };
        let mut shown = self.full_size_shown.lock();
        let full = if shown.contains(&attachment.tim) {
            shown.remove(&attachment.tim);
            false
        } else {
            shown.insert(attachment.tim);
            true
        };
        drop(shown);
        slot.full_size = full;
        slot.state = EmbedState::Loading;
        slot.pending = Some(self.media.enqueue(attachment_request(
            &attachment,
            slot.spec.kind,
            full,
        )));
    }

    fn start_if_unloaded(&self, slot_id: &str) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(slot_id) else {
            return;
        };
        if slot.state != EmbedState::Unloaded || !slot.attached {
            return;
        }
        match slot.spec.kind {
            // Provider iframes materialize synchronously.
            EmbedKind::Youtube => {
                slot.state = EmbedState::Loaded;
                slot.content = SlotContent::Iframe {
                    src: youtube_embed_url(&slot.spec.resource, slot.spec.start_time),
                };
            }
            EmbedKind::TwitchClip => {
                slot.state = EmbedState::Loaded;
                slot.content = SlotContent::Iframe {
                    src: twitch_clip_embed_url(&slot.spec.resource, &self.cfg.parent_host),
                };
            }
            EmbedKind::TwitchVod => {
                slot.state = EmbedState::Loaded;
                slot.content = SlotContent::Iframe {
                    src: twitch_vod_embed_url(
                        &slot.spec.resource,
                        &self.cfg.parent_host,
                        slot.spec.start_time,
                    ),
                };
            }
            EmbedKind::Streamable => {
                slot.state = EmbedState::Loading;
                slot.pending = Some(self.media.enqueue(Request {
                    url: streamable_direct_url(&slot.spec.resource),
                    expect: Some(MediaKind::Video),
                    filename: format!("{}.mp4", slot.spec.resource),
                    original_ext: ".mp4".into(),
                }));
            }
            EmbedKind::Image | EmbedKind::Video => {
                let Some(attachment) = slot.spec.attachment.clone() else {
                    return;
                };
                let full = self.full_size_shown.lock().contains(&attachment.tim);
                slot.full_size = full;
                slot.state = EmbedState::Loading;
                slot.pending =
                    Some(self.media.enqueue(attachment_request(&attachment, slot.spec.kind, full)));
            }
            EmbedKind::Tweet => {
                slot.state = EmbedState::Loading;
                slot.content = SlotContent::TweetPending;
            }
        }
    }

    /// Called by the widget batch once a tweet settles. Results for detached
    /// slots are dropped.
    pub fn resolve_tweet(&self, slot_id: &str, content: SlotContent) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(slot_id) {
            if !slot.attached {
                return;
            }
            slot.state = EmbedState::Loaded;
            slot.content = content;
        }
    }

    /// Drain settled fetches and apply them to their slots. Returns slot ids
    /// whose content changed.
    pub fn pump(&self) -> Vec<String> {
        let mut changed = Vec::new();
        let mut slots = self.slots.lock();
        for (slot_id, slot) in slots.iter_mut() {
            let result = match &slot.pending {
                Some(rx) => rx.try_recv(),
                None => continue,
            };
            let fetched = match result {
                Ok(fetched) => fetched,
                Err(crossbeam_channel::TryRecvError::Empty) => continue,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    slot.pending = None;
                    continue;
                }
            };
            slot.pending = None;
            if !slot.attached || slot.state != EmbedState::Loading {
                debug_log(format!("embed: dropping stale result for {slot_id}"));
                continue;
            }
            slot.state = EmbedState::Loaded;
            slot.content = resolved_content(&slot.spec, slot.full_size, fetched);
            changed.push(slot_id.clone());
        }
        slots.retain(|_, slot| slot.attached || slot.pending.is_some());
        changed
    }
}

/// Map a settled fetch to slot content, including the fallback edges: a
/// cache error, a failed download, or a wrong content kind all degrade to
/// the provider iframe (streamable) or a link-out (attachments).
fn resolved_content(spec: &PlaceholderSpec, full_size: bool, fetched: Fetched) -> SlotContent {
    match spec.kind {
        EmbedKind::Streamable => match fetched.record {
            Some(record) => SlotContent::NativeVideo {
                url: record.url,
                from_cache: fetched.from_cache,
            },
            None => {
                if let Some(err) = fetched.error {
                    debug_log(format!(
                        "embed: streamable {} fell back to iframe: {err:#}",
                        spec.resource
                    ));
                }
                SlotContent::Iframe {
                    src: streamable_iframe_url(&spec.resource),
                }
            }
        },
        EmbedKind::Image | EmbedKind::Video => {
            let attachment = spec.attachment.as_ref();
            match (fetched.record, attachment) {
                (Some(record), _) => {
                    if spec.kind == EmbedKind::Video && full_size {
                        SlotContent::NativeVideo {
                            url: record.url,
                            from_cache: fetched.from_cache,
                        }
                    } else {
                        SlotContent::NativeImage {
                            url: record.url,
                            from_cache: fetched.from_cache,
                        }
                    }
                }
                (None, Some(attachment)) => {
                    if let Some(err) = fetched.error {
                        debug_log(format!(
                            "embed: attachment {} failed: {err:#}",
                            attachment.tim
                        ));
                    }
                    let url = attachment_full_url(attachment);
                    SlotContent::LinkOut {
                        label: attachment.filename.clone(),
                        url,
                    }
                }
                (None, None) => SlotContent::Placeholder,
            }
        }
        _ => SlotContent::Placeholder,
    }
}

fn attachment_request(attachment: &Attachment, kind: EmbedKind, full: bool) -> Request {
    if full {
        Request {
            url: attachment_full_url(attachment),
            expect: Some(match kind {
                EmbedKind::Video => MediaKind::Video,
                _ => MediaKind::Image,
            }),
            filename: format!("{}{}", attachment.filename, attachment.ext),
            original_ext: attachment.ext.clone(),
        }
    } else {
        // Thumbnails are always jpegs, video attachments included.
        Request {
            url: attachment_thumb_url(attachment),
            expect: Some(MediaKind::Image),
            filename: format!("{}s.jpg", attachment.tim),
            original_ext: ".jpg".into(),
        }
    }
}

pub fn youtube_embed_url(video_id: &str, start_time: Option<u64>) -> String {
    match start_time {
        Some(seconds) => format!("https://www.youtube.com/embed/{video_id}?start={seconds}"),
        None => format!("https://www.youtube.com/embed/{video_id}"),
    }
}

/// Characters escaped in provider URL query values.
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'&')
    .add(b'#');

pub fn twitch_clip_embed_url(clip_id: &str, parent: &str) -> String {
    format!(
        "https://clips.twitch.tv/embed?clip={}&parent={}&autoplay=false",
        utf8_percent_encode(clip_id, QUERY_VALUE),
        utf8_percent_encode(parent, QUERY_VALUE)
    )
}

pub fn twitch_vod_embed_url(video_id: &str, parent: &str, start_time: Option<u64>) -> String {
    let mut url = format!(
        "https://player.twitch.tv/?video={}&parent={}&autoplay=false",
        utf8_percent_encode(video_id, QUERY_VALUE),
        utf8_percent_encode(parent, QUERY_VALUE)
    );
    if let Some(seconds) = start_time {
        url.push_str(&format!("&t={}", twitch_time(seconds)));
    }
    url
}

/// Twitch start-time encoding, `1h2m3s`.
pub fn twitch_time(seconds: u64) -> String {
    format!(
        "{}h{}m{}s",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

pub fn streamable_iframe_url(video_id: &str) -> String {
    format!("https://streamable.com/e/{video_id}?loop=false")
}

/// Guessed direct-media URL tried before falling back to the iframe.
pub fn streamable_direct_url(video_id: &str) -> String {
    format!("https://cf-files.streamable.com/temp/{video_id}.mp4")
}

pub fn attachment_full_url(attachment: &Attachment) -> String {
    format!(
        "https://i.4cdn.org/{}/{}{}",
        attachment.board, attachment.tim, attachment.ext
    )
}

pub fn attachment_thumb_url(attachment: &Attachment) -> String {
    format!("https://i.4cdn.org/{}/{}s.jpg", attachment.board, attachment.tim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{self, BlobCache};
    use crate::media;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn controller() -> (tempfile::TempDir, Arc<BlobCache>, EmbedController) {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlobCache::new(cache::Config {
            db_path: Some(dir.path().join("cache.db")),
            max_size_bytes: 10 * 1024 * 1024,
        }));
        let manager =
            Arc::new(Manager::new(cache.clone(), media::Config::default()).unwrap());
        let ctrl = EmbedController::new(manager, Config::default());
        (dir, cache, ctrl)
    }

    fn spec(slot_id: &str, kind: EmbedKind, resource: &str) -> PlaceholderSpec {
        PlaceholderSpec {
            slot_id: slot_id.into(),
            kind,
            resource: resource.into(),
            start_time: None,
            original_url: String::new(),
            attachment: None,
        }
    }

    fn pump_until_loaded(ctrl: &EmbedController, slot_id: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while ctrl.state(slot_id) == Some(EmbedState::Loading) {
            ctrl.pump();
            if Instant::now() > deadline {
                panic!("slot {slot_id} never loaded");
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn iframe_embed_lifecycle_round_trip() {
        let (_dir, _cache, ctrl) = controller();
        let mut yt = spec("s1", EmbedKind::Youtube, "dQw4w9WgXcQ");
        yt.start_time = Some(90);
        ctrl.observe(&[yt]);
        assert_eq!(ctrl.state("s1"), Some(EmbedState::Unloaded));

        ctrl.visibility_enter("s1");
        assert_eq!(ctrl.state("s1"), Some(EmbedState::Loaded));
        assert_eq!(
            ctrl.content("s1"),
            Some(SlotContent::Iframe {
                src: "https://www.youtube.com/embed/dQw4w9WgXcQ?start=90".into()
            })
        );

        ctrl.visibility_exit("s1");
        assert_eq!(ctrl.state("s1"), Some(EmbedState::Unloaded));
        assert_eq!(ctrl.content("s1"), Some(SlotContent::Placeholder));
    }

    #[test]
    fn streamable_cache_hit_materializes_native_video() {
        let (_dir, cache, ctrl) = controller();
        let direct = streamable_direct_url("abc123");
        cache
            .put(&direct, vec![9u8; 64], "video/mp4", "abc123.mp4", ".mp4")
            .unwrap();

        ctrl.observe(&[spec("s1", EmbedKind::Streamable, "abc123")]);
        ctrl.activate("s1");
        pump_until_loaded(&ctrl, "s1");
        assert_eq!(
            ctrl.content("s1"),
            Some(SlotContent::NativeVideo {
                url: direct,
                from_cache: true
            })
        );
    }

    #[test]
    fn streamable_fetch_failure_falls_back_to_iframe() {
        // The guessed direct URL cannot resolve from tests, so the fetch
        // error path drives the fallback.
        let (_dir, cache, ctrl) = controller();
        drop(cache);
        ctrl.observe(&[spec("s1", EmbedKind::Streamable, "nosuch")]);
        ctrl.visibility_enter("s1");
        pump_until_loaded(&ctrl, "s1");
        assert_eq!(
            ctrl.content("s1"),
            Some(SlotContent::Iframe {
                src: streamable_iframe_url("nosuch")
            })
        );
    }

    #[test]
    fn stale_result_for_detached_slot_is_dropped() {
        let (_dir, _cache, ctrl) = controller();
        ctrl.observe(&[spec("s1", EmbedKind::Streamable, "gone")]);
        ctrl.visibility_enter("s1");
        assert_eq!(ctrl.state("s1"), Some(EmbedState::Loading));

        ctrl.begin_pass();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            ctrl.pump();
            if ctrl.state("s1").is_none() {
                break;
            }
            if Instant::now() > deadline {
                panic!("detached slot never drained");
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn exit_during_loading_does_not_revert() {
        let (_dir, _cache, ctrl) = controller();
        ctrl.observe(&[spec("s1", EmbedKind::Streamable, "slow")]);
        ctrl.visibility_enter("s1");
        ctrl.visibility_exit("s1");
        assert_eq!(ctrl.state("s1"), Some(EmbedState::Loading));
    }

    #[test]
    fn attachment_thumb_then_full_toggle() {
        let (_dir, cache, ctrl) = controller();
        let attachment = Attachment {
            tim: 555,
            ext: ".jpg".into(),
            filename: "pic".into(),
            w: 800,
            h: 600,
            tn_w: 200,
            tn_h: 150,
            board: "b".into(),
        };
        let thumb = attachment_thumb_url(&attachment);
        let full = attachment_full_url(&attachment);
        cache.put(&thumb, vec![1u8; 16], "image/jpeg", "555s.jpg", ".jpg").unwrap();
        cache.put(&full, vec![2u8; 32], "image/jpeg", "pic.jpg", ".jpg").unwrap();

        let mut image = spec("s1", EmbedKind::Image, "555");
        image.attachment = Some(attachment);
        ctrl.observe(&[image]);
        ctrl.visibility_enter("s1");
        pump_until_loaded(&ctrl, "s1");
        assert_eq!(
            ctrl.content("s1"),
            Some(SlotContent::NativeImage {
                url: thumb.clone(),
                from_cache: true
            })
        );

        ctrl.toggle_full_size("s1");
        pump_until_loaded(&ctrl, "s1");
        assert_eq!(
            ctrl.content("s1"),
            Some(SlotContent::NativeImage {
                url: full,
                from_cache: true
            })
        );

        ctrl.toggle_full_size("s1");
        pump_until_loaded(&ctrl, "s1");
        assert_eq!(
            ctrl.content("s1"),
            Some(SlotContent::NativeImage {
                url: thumb,
                from_cache: true
            })
        );
    }

    #[test]
    fn twitch_url_synthesis() {
        assert_eq!(
            twitch_clip_embed_url("MyClip", "localhost"),
            "https://clips.twitch.tv/embed?clip=MyClip&parent=localhost&autoplay=false"
        );
        assert_eq!(
            twitch_vod_embed_url("123", "localhost", Some(3723)),
            "https://player.twitch.tv/?video=123&parent=localhost&autoplay=false&t=1h2m3s"
        );
        assert_eq!(twitch_time(59), "0h0m59s");
    }
}
