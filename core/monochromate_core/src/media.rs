//! Heuristic for "media-only" pages: a lone image or video with little text
//! around it. False positives are acceptable.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use url::Url;

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".svg"];
const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".webm", ".ogg", ".avi", ".mov", ".wmv", ".flv", ".mkv", ".m4v",
];
const TITLE_MEDIA_WORDS: &[&str] = &["image", "photo", "picture", "video", "watch"];

const MAX_MEDIA_ELEMENTS: usize = 3;
const TEXT_LENGTH_THRESHOLD: usize = 100;
const LARGE_MEDIA_PX: u32 = 400;
pub const MEDIA_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// An `<img>` or `<video>` element with its intrinsic size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MediaElement {
    pub kind: MediaKind,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

impl MediaElement {
    fn is_large(&self) -> bool {
        self.width > LARGE_MEDIA_PX || self.height > LARGE_MEDIA_PX
    }
}

/// Read-only view of a document, enough for the heuristic.
pub trait DocumentProbe {
    fn url(&self) -> &str;
    fn is_complete(&self) -> bool;
    fn title(&self) -> &str;
    fn text_length(&self) -> usize;
    fn media_elements(&self) -> &[MediaElement];
    /// A player container or an embedded youtube/vimeo/twitch iframe.
    fn has_player_container(&self) -> bool;
}

fn path_has_extension(url: &str, extensions: &[&str]) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let path = parsed.path().to_lowercase();
    extensions.iter().any(|ext| path.ends_with(ext))
}

pub fn is_direct_image_url(url: &str) -> bool {
    path_has_extension(url, IMAGE_EXTENSIONS)
}

pub fn is_direct_video_url(url: &str) -> bool {
    path_has_extension(url, VIDEO_EXTENSIONS)
}

pub fn is_direct_media_url(url: &str) -> bool {
    is_direct_image_url(url) || is_direct_video_url(url)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaMix {
    Image,
    Video,
    Mixed,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MediaCheck {
    pub media_only: bool,
    pub media_count: usize,
    pub mix: MediaMix,
}

/// Classifies a loaded document. Returns `None` when the document is not
/// complete yet and the answer is still unknown.
pub fn classify(doc: &dyn DocumentProbe) -> Option<MediaCheck> {
    let url = doc.url();
    if is_direct_media_url(url) {
        let mix = if is_direct_image_url(url) {
            MediaMix::Image
        } else {
            MediaMix::Video
        };
        return Some(MediaCheck {
            media_only: true,
            media_count: 1,
            mix,
        });
    }

    if !doc.is_complete() {
        return None;
    }

    let media = doc.media_elements();
    let images = media.iter().filter(|m| m.kind == MediaKind::Image).count();
    let videos = media.len() - images;
    let mix = match (images > 0, videos > 0) {
        (true, true) => MediaMix::Mixed,
        (true, false) => MediaMix::Image,
        (false, true) => MediaMix::Video,
        (false, false) => MediaMix::None,
    };

    if media.is_empty() || media.len() > MAX_MEDIA_ELEMENTS {
        return Some(MediaCheck {
            media_only: false,
            media_count: media.len(),
            mix: MediaMix::None,
        });
    }

    let minimal_text = doc.text_length() < TEXT_LENGTH_THRESHOLD;
    let title = doc.title().to_lowercase();
    let media_title = TITLE_MEDIA_WORDS.iter().any(|w| title.contains(w));
    let large_media = media.iter().any(MediaElement::is_large);
    let player = videos > 0 || doc.has_player_container();

    Some(MediaCheck {
        media_only: minimal_text || media_title || large_media || player,
        media_count: media.len(),
        mix,
    })
}

struct CacheEntry {
    check: MediaCheck,
    at: Instant,
}

/// Per-tab cache in front of [`classify`], keyed by URL.
pub struct MediaPageDetector {
    ttl: Duration,
    cache: HashMap<String, CacheEntry>,
}

impl Default for MediaPageDetector {
    fn default() -> Self {
        Self::new(MEDIA_CACHE_TTL)
    }
}

impl MediaPageDetector {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: HashMap::new(),
        }
    }

    pub fn is_media_only(&mut self, doc: &dyn DocumentProbe, now: Instant) -> bool {
        if let Some(entry) = self.cache.get(doc.url()) {
            if now.saturating_duration_since(entry.at) < self.ttl {
                return entry.check.media_only;
            }
        }

        match classify(doc) {
            Some(check) => {
                self.cache
                    .insert(doc.url().to_string(), CacheEntry { check, at: now });
                check.media_only
            }
            None => false,
        }
    }

    pub fn cached(&self, url: &str) -> Option<MediaCheck> {
        self.cache.get(url).map(|e| e.check)
    }

    /// Called on navigation.
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }
}
