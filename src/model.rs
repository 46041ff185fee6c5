//! Feed, stream and token values passed between workers and the UI thread.
//!
//! Every value here is owned and `Send`: tasks carry copies into worker
//! threads and results come back by value through channels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Most videos a single feed result carries.
pub const FEED_MAX_VIDEOS: usize = 64;
/// Most streams a single stream set carries.
pub const STREAM_SET_MAX: usize = 32;

const VIDEO_ID_MAX: usize = 15;

/// Fixed-length video identifier (the thumbnail cache key).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VideoId(String);

impl VideoId {
    pub fn new(id: impl Into<String>) -> Result<Self, FetchError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= VIDEO_ID_MAX
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(id))
        } else {
            Err(FetchError::InvalidId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VideoId {
    type Error = FetchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VideoId> for String {
    fn from(id: VideoId) -> Self {
        id.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Video {
    pub id: VideoId,
    pub title: String,
    pub channel: String,
    pub thumb_url: Option<String>,
    pub duration_secs: Option<u64>,
    pub view_count: Option<u64>,
}

impl Video {
    /// `m:ss` / `h:mm:ss`, or an empty string for live/unknown.
    pub fn duration_label(&self) -> String {
        match self.duration_secs {
            Some(secs) => format_clock(secs as f64),
            None => String::new(),
        }
    }
}

/// A page of videos from a browse or search request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Feed {
    pub videos: Vec<Video>,
}

impl Feed {
    pub fn new(mut videos: Vec<Video>) -> Self {
        videos.truncate(FEED_MAX_VIDEOS);
        Self { videos }
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stream {
    pub url: String,
    pub mime: String,
    pub itag: u32,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub is_audio: bool,
}

/// Playable streams resolved for one video.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamSet {
    pub video_id: VideoId,
    pub streams: Vec<Stream>,
    pub duration_secs: Option<f64>,
}

impl StreamSet {
    pub fn new(video_id: VideoId, mut streams: Vec<Stream>, duration_secs: Option<f64>) -> Self {
        streams.truncate(STREAM_SET_MAX);
        Self {
            video_id,
            streams,
            duration_secs,
        }
    }

    /// Pick the stream to hand to the decode engine.
    ///
    /// Prefers the tallest video-bearing stream that fits in `max_height`
    /// (ties broken by bitrate). Falls back to the first stream at all.
    pub fn best_for_height(&self, max_height: u32) -> Option<&Stream> {
        self.streams
            .iter()
            .filter(|s| !s.is_audio && s.height > 0 && s.height <= max_height)
            .max_by_key(|s| (s.height, s.bitrate))
            .or_else(|| self.streams.iter().find(|s| !s.is_audio))
            .or_else(|| self.streams.first())
    }

    /// Highest-bitrate audio-only stream, if the set is split into separate
    /// audio and video streams.
    pub fn best_audio(&self) -> Option<&Stream> {
        self.streams
            .iter()
            .filter(|s| s.is_audio)
            .max_by_key(|s| s.bitrate)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub access: String,
    #[serde(default)]
    pub refresh: String,
    pub expiry_epoch: u64,
}

impl Token {
    pub fn is_expired(&self, now_epoch: u64) -> bool {
        self.expiry_epoch <= now_epoch
    }
}

/// Format seconds as `m:ss` or `h:mm:ss`.
pub fn format_clock(secs: f64) -> String {
    let total = if secs.is_finite() && secs > 0.0 {
        secs as u64
    } else {
        0
    };
    let (h, m, s) = (total / 3600, (total / 60) % 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}
