use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// What a placeholder will materialize into. Image and Video cover message
/// attachments; the rest are third-party embeds found in body text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbedKind {
    Youtube,
    TwitchClip,
    TwitchVod,
    Streamable,
    Tweet,
    Image,
    Video,
}

impl EmbedKind {
    pub fn label(self) -> &'static str {
        match self {
            EmbedKind::Youtube => "YouTube",
            EmbedKind::TwitchClip => "Twitch Clip",
            EmbedKind::TwitchVod => "Twitch VOD",
            EmbedKind::Streamable => "Streamable Video",
            EmbedKind::Tweet => "Tweet",
            EmbedKind::Image => "Image",
            EmbedKind::Video => "Video",
        }
    }
}

/// An embeddable link lifted out of message text.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedLink {
    pub kind: EmbedKind,
    pub resource: String,
    pub start_time: Option<u64>,
    pub original_url: String,
}

/// Body text split around recognized links.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkSegment {
    Text(String),
    Embed(EmbedLink),
    /// Never embedded, rendered as a styled link with a derived title.
    LinkOut { url: String, label: String },
}

/// Embeds recognized during one render pass, logged as pass metrics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmbedCounts {
    pub youtube: usize,
    pub twitch: usize,
    pub streamable: usize,
    pub tweet: usize,
}

impl EmbedCounts {
    pub fn bump(&mut self, kind: EmbedKind) {
        match kind {
            EmbedKind::Youtube => self.youtube += 1,
            EmbedKind::TwitchClip | EmbedKind::TwitchVod => self.twitch += 1,
            EmbedKind::Streamable => self.streamable += 1,
            EmbedKind::Tweet => self.tweet += 1,
            EmbedKind::Image | EmbedKind::Video => {}
        }
    }
}

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("url regex"));
static YOUTUBE_WATCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:www\.)?youtube\.com/(?:watch\?|.*[?&])v=([A-Za-z0-9_-]{6,})").expect("yt watch")
});
static YOUTUBE_SHORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"youtu\.be/([A-Za-z0-9_-]{6,})").expect("yt short"));
static YOUTUBE_EMBED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"youtube\.com/embed/([A-Za-z0-9_-]{6,})").expect("yt embed"));
static TWITCH_CLIP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:clips\.twitch\.tv/|twitch\.tv/[A-Za-z0-9_]+/clip/)([A-Za-z0-9_-]+)")
        .expect("twitch clip")
});
static TWITCH_VOD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"twitch\.tv/videos/(\d+)").expect("twitch vod"));
static STREAMABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"streamable\.com/(?:e/)?([A-Za-z0-9]+)").expect("streamable"));
static TWEET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:twitter\.com|x\.com)/([A-Za-z0-9_]+)/status/(\d+)").expect("tweet")
});
static RUMBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"rumble\.com/(?:(v[a-zA-Z0-9]+)-)?([A-Za-z0-9_-]+)(?:\.html|$|\?)").expect("rumble")
});
static HOURS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)h").expect("hours"));
static MINUTES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)m").expect("minutes"));
static SECONDS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)s").expect("seconds"));

/// Split body text into plain runs and recognized links.
pub fn detect_segments(text: &str, counts: &mut EmbedCounts) -> Vec<LinkSegment> {
    let mut segments = Vec::new();
    let mut cursor = 0;
    for found in URL_RE.find_iter(text) {
        if found.start() > cursor {
            segments.push(LinkSegment::Text(text[cursor..found.start()].to_string()));
        }
        let url = found.as_str().trim_end_matches(['.', ',', ')']);
        let trailing = &found.as_str()[url.len()..];
        match classify_url(url) {
            Some(Classified::Embed(link)) => {
                counts.bump(link.kind);
                segments.push(LinkSegment::Embed(link));
            }
            Some(Classified::LinkOut { label }) => {
                segments.push(LinkSegment::LinkOut {
                    url: url.to_string(),
                    label,
                });
            }
            None => {
                segments.push(LinkSegment::Text(found.as_str().to_string()));
                cursor = found.end();
                continue;
            }
        }
        // Punctuation trimmed off the URL stays in the rendered text.
        if !trailing.is_empty() {
            segments.push(LinkSegment::Text(trailing.to_string()));
        }
        cursor = found.end();
    }
    if cursor < text.len() {
        segments.push(LinkSegment::Text(text[cursor..].to_string()));
    }
    segments
}

enum Classified {
    Embed(EmbedLink),
    LinkOut { label: String },
}

fn classify_url(url: &str) -> Option<Classified> {
    if let Some(caps) = YOUTUBE_WATCH_RE
        .captures(url)
        .or_else(|| YOUTUBE_SHORT_RE.captures(url))
        .or_else(|| YOUTUBE_EMBED_RE.captures(url))
    {
        return Some(Classified::Embed(EmbedLink {
            kind: EmbedKind::Youtube,
            resource: caps[1].to_string(),
            start_time: time_from_query(url),
            original_url: url.to_string(),
        }));
    }
    if let Some(caps) = TWITCH_VOD_RE.captures(url) {
        return Some(Classified::Embed(EmbedLink {
            kind: EmbedKind::TwitchVod,
            resource: caps[1].to_string(),
            start_time: time_from_query(url),
            original_url: url.to_string(),
        }));
    }
    if let Some(caps) = TWITCH_CLIP_RE.captures(url) {
        return Some(Classified::Embed(EmbedLink {
            kind: EmbedKind::TwitchClip,
            resource: caps[1].to_string(),
            start_time: None,
            original_url: url.to_string(),
        }));
    }
    if let Some(caps) = STREAMABLE_RE.captures(url) {
        return Some(Classified::Embed(EmbedLink {
            kind: EmbedKind::Streamable,
            resource: caps[1].to_string(),
            start_time: None,
            original_url: url.to_string(),
        }));
    }
    if let Some(caps) = TWEET_RE.captures(url) {
        return Some(Classified::Embed(EmbedLink {
            kind: EmbedKind::Tweet,
            resource: caps[2].to_string(),
            start_time: None,
            original_url: url.to_string(),
        }));
    }
    if let Some(caps) = RUMBLE_RE.captures(url) {
        let label = rumble_label(caps.get(1).map(|m| m.as_str()), &caps[2]);
        return Some(Classified::LinkOut { label });
    }
    None
}

fn rumble_label(clip_id: Option<&str>, slug: &str) -> String {
    if slug.eq_ignore_ascii_case("embed") {
        if let Some(id) = clip_id {
            return format!("View on Rumble (Clip ID: {id})");
        }
    }
    let mut title = slug.replace(['-', '_'], " ");
    if let Some(first) = title.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    format!("View on Rumble: {title}")
}

/// Tweet author handle, for fallback link captions.
pub fn tweet_author(url: &str) -> Option<String> {
    TWEET_RE.captures(url).map(|caps| caps[1].to_string())
}

/// `t=`/`start=` query value in seconds. Accepts bare digits and the
/// `1h2m30s` form.
pub fn time_from_query(url: &str) -> Option<u64> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "t" || key == "start")
        .and_then(|(_, value)| parse_time_param(&value))
}

pub fn parse_time_param(raw: &str) -> Option<u64> {
    if raw.is_empty() {
        return None;
    }
    let mut total = 0u64;
    if raw.chars().all(|c| c.is_ascii_digit()) {
        total = raw.parse().ok()?;
    } else {
        if let Some(caps) = HOURS_RE.captures(raw) {
            total += caps[1].parse::<u64>().ok()? * 3600;
        }
        if let Some(caps) = MINUTES_RE.captures(raw) {
            total += caps[1].parse::<u64>().ok()? * 60;
        }
        if let Some(caps) = SECONDS_RE.captures(raw) {
            total += caps[1].parse::<u64>().ok()?;
        }
    }
    if total > 0 {
        Some(total)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_embed(text: &str) -> EmbedLink {
        let mut counts = EmbedCounts::default();
        let segments = detect_segments(text, &mut counts);
        segments
            .into_iter()
            .find_map(|seg| match seg {
                LinkSegment::Embed(link) => Some(link),
                _ => None,
            })
            .expect("embed link")
    }

    #[test]
    fn youtube_forms() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
        ] {
            let link = single_embed(url);
            assert_eq!(link.kind, EmbedKind::Youtube);
            assert_eq!(link.resource, "dQw4w9WgXcQ");
        }
    }

    #[test]
    fn youtube_start_time_forms() {
        let link = single_embed("https://youtu.be/dQw4w9WgXcQ?t=90");
        assert_eq!(link.start_time, Some(90));
        let link = single_embed("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=1h2m30s");
        assert_eq!(link.start_time, Some(3750));
    }

    #[test]
    fn twitch_clip_vs_vod() {
        let clip = single_embed("https://clips.twitch.tv/BraveClipName");
        assert_eq!(clip.kind, EmbedKind::TwitchClip);
        assert_eq!(clip.resource, "BraveClipName");

        let clip = single_embed("https://www.twitch.tv/streamer/clip/OtherClip");
        assert_eq!(clip.kind, EmbedKind::TwitchClip);

        let vod = single_embed("https://www.twitch.tv/videos/123456789?t=1h2m3s");
        assert_eq!(vod.kind, EmbedKind::TwitchVod);
        assert_eq!(vod.resource, "123456789");
        assert_eq!(vod.start_time, Some(3723));
    }

    #[test]
    fn streamable_and_tweet() {
        let video = single_embed("https://streamable.com/abc123");
        assert_eq!(video.kind, EmbedKind::Streamable);
        assert_eq!(video.resource, "abc123");

        let tweet = single_embed("https://twitter.com/someone/status/1234567890");
        assert_eq!(tweet.kind, EmbedKind::Tweet);
        assert_eq!(tweet.resource, "1234567890");
        assert_eq!(
            tweet_author("https://twitter.com/someone/status/1234567890").unwrap(),
            "someone"
        );
    }

    #[test]
    fn rumble_becomes_link_out() {
        let mut counts = EmbedCounts::default();
        let segments = detect_segments(
            "see https://rumble.com/v4abcd-some-great-clip.html now",
            &mut counts,
        );
        assert!(segments.iter().any(|seg| matches!(
            seg,
            LinkSegment::LinkOut { label, .. } if label.contains("Some great clip")
        )));
        assert_eq!(counts, EmbedCounts::default());
    }

    #[test]
    fn plain_text_between_links_preserved() {
        let mut counts = EmbedCounts::default();
        let segments = detect_segments(
            "before https://streamable.com/xyz after",
            &mut counts,
        );
        assert_eq!(segments.len(), 3);
        assert!(matches!(&segments[0], LinkSegment::Text(t) if t == "before "));
        assert!(matches!(&segments[2], LinkSegment::Text(t) if t == " after"));
        assert_eq!(counts.streamable, 1);
    }

    #[test]
    fn trailing_punctuation_survives_as_text() {
        let mut counts = EmbedCounts::default();
        let segments = detect_segments(
            "watch https://streamable.com/xyz, then reply",
            &mut counts,
        );
        assert_eq!(segments.len(), 4);
        assert!(matches!(&segments[1], LinkSegment::Embed(link) if link.resource == "xyz"));
        assert!(matches!(&segments[2], LinkSegment::Text(t) if t == ","));
        assert!(matches!(&segments[3], LinkSegment::Text(t) if t == " then reply"));

        let segments = detect_segments(
            "see https://rumble.com/v4abcd-some-great-clip.html.",
            &mut counts,
        );
        assert!(matches!(segments.last(), Some(LinkSegment::Text(t)) if t == "."));
    }

    #[test]
    fn unrecognized_url_stays_text() {
        let mut counts = EmbedCounts::default();
        let segments = detect_segments("https://example.com/page", &mut counts);
        assert_eq!(segments.len(), 1);
        assert!(matches!(&segments[0], LinkSegment::Text(_)));
    }
}
