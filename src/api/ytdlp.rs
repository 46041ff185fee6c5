//! [`FeedSource`] backed by the `yt-dlp` executable.
//!
//! Feeds come from `--dump-json --flat-playlist` (one JSON object per line);
//! streams from `-j --no-download` (one object with a `formats` array).

use std::process::{Command, Stdio};

use log::{debug, warn};
use serde::Deserialize;

use super::{FeedRequest, FeedSource};
use crate::error::FetchError;
use crate::model::{FEED_MAX_VIDEOS, Feed, Stream, StreamSet, Video, VideoId};

pub struct YtDlp {
    program: String,
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl YtDlp {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str], access_token: Option<&str>) -> Result<String, FetchError> {
        let mut cmd = Command::new(&self.program);
        if let Some(tok) = access_token {
            cmd.arg("--add-header")
                .arg(format!("Authorization:Bearer {tok}"));
        }
        debug!("yt-dlp: {}", args.join(" "));
        let output = cmd
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Subprocess {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr.lines().last().unwrap_or_default().trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn clamp_results(n: u32) -> u32 {
    if n == 0 || n as usize > FEED_MAX_VIDEOS {
        FEED_MAX_VIDEOS as u32
    } else {
        n
    }
}

impl FeedSource for YtDlp {
    fn browse(&self, req: &FeedRequest) -> Result<Feed, FetchError> {
        let end = clamp_results(req.max_results).to_string();
        let out = self.run(
            &[
                "--dump-json",
                "--flat-playlist",
                "--playlist-end",
                &end,
                "--",
                &req.home_url,
            ],
            req.access_token.as_deref(),
        )?;
        Ok(parse_feed_lines(&out))
    }

    fn search(&self, req: &FeedRequest, query: &str) -> Result<Feed, FetchError> {
        let target = format!("ytsearch{}:{query}", clamp_results(req.max_results));
        let out = self.run(
            &["--dump-json", "--flat-playlist", "--", &target],
            req.access_token.as_deref(),
        )?;
        Ok(parse_feed_lines(&out))
    }

    fn streams(&self, id: &VideoId, access_token: Option<&str>) -> Result<StreamSet, FetchError> {
        let out = self.run(&["-j", "--no-download", "--", id.as_str()], access_token)?;
        parse_streams(id.clone(), &out)
    }
}

// ---------------------------------------------------------------------------
// JSON shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawThumb {
    url: String,
}

#[derive(Deserialize)]
struct RawVideo {
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<RawThumb>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    view_count: Option<f64>,
}

impl RawVideo {
    fn into_video(self) -> Option<Video> {
        let id = VideoId::new(self.id?).ok()?;
        let thumb_url = self
            .thumbnail
            .or_else(|| self.thumbnails.into_iter().last().map(|t| t.url))
            .or_else(|| Some(format!("https://i.ytimg.com/vi/{id}/mqdefault.jpg")));
        Some(Video {
            title: self.title.unwrap_or_default(),
            channel: self.channel.or(self.uploader).unwrap_or_default(),
            thumb_url,
            duration_secs: self.duration.filter(|d| *d >= 0.0).map(|d| d as u64),
            view_count: self.view_count.filter(|v| *v >= 0.0).map(|v| v as u64),
            id,
        })
    }
}

#[derive(Deserialize)]
struct RawFormat {
    url: Option<String>,
    #[serde(default)]
    format_id: Option<String>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    width: Option<f64>,
    #[serde(default)]
    height: Option<f64>,
    #[serde(default)]
    tbr: Option<f64>,
    #[serde(default)]
    acodec: Option<String>,
    #[serde(default)]
    vcodec: Option<String>,
}

#[derive(Deserialize)]
struct RawInfo {
    #[serde(default)]
    formats: Vec<RawFormat>,
    #[serde(default)]
    duration: Option<f64>,
}

/// Parse `--dump-json` output. Lines that are not a video are skipped.
pub fn parse_feed_lines(text: &str) -> Feed {
    let videos = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| match serde_json::from_str::<RawVideo>(l) {
            Ok(raw) => raw.into_video(),
            Err(e) => {
                warn!("yt-dlp: skipping malformed line: {e}");
                None
            }
        })
        .take(FEED_MAX_VIDEOS)
        .collect();
    Feed::new(videos)
}

/// Parse `-j` output into the formats that carry a URL.
pub fn parse_streams(id: VideoId, text: &str) -> Result<StreamSet, FetchError> {
    let info: RawInfo = serde_json::from_str(text.trim())?;
    let streams = info
        .formats
        .into_iter()
        .filter_map(|f| {
            let url = f.url?;
            let itag = f
                .format_id
                .as_deref()
                .map(|s| s.chars().take_while(char::is_ascii_digit).collect::<String>())
                .and_then(|d| d.parse().ok())
                .unwrap_or(0);
            let is_audio = f.acodec.as_deref().is_some_and(|a| a != "none")
                && f.vcodec.as_deref() == Some("none");
            let kind = if is_audio { "audio" } else { "video" };
            Some(Stream {
                url,
                mime: format!("{kind}/{}", f.ext.as_deref().unwrap_or("unknown")),
                itag,
                width: f.width.map_or(0, |w| w as u32),
                height: f.height.map_or(0, |h| h as u32),
                bitrate: f.tbr.map_or(0, |t| (t * 1000.0) as u32),
                is_audio,
            })
        })
        .collect();
    Ok(StreamSet::new(id, streams, info.duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_lines_parse_and_skip_junk() {
        let text = concat!(
            r#"{"id":"dQw4w9WgXcQ","title":"Song","channel":"Rick","duration":212.0,"view_count":1500000000}"#,
            "\n",
            "not json\n",
            r#"{"id":"bad/id","title":"x"}"#,
            "\n",
            r#"{"id":"abc-_123","title":"Other","uploader":"Up","thumbnails":[{"url":"https://t/1.jpg"},{"url":"https://t/2.jpg"}]}"#,
            "\n",
        );
        let feed = parse_feed_lines(text);
        assert_eq!(feed.len(), 2);
        let v = &feed.videos[0];
        assert_eq!(v.id.as_str(), "dQw4w9WgXcQ");
        assert_eq!(v.duration_secs, Some(212));
        assert_eq!(v.view_count, Some(1_500_000_000));
        assert_eq!(
            v.thumb_url.as_deref(),
            Some("https://i.ytimg.com/vi/dQw4w9WgXcQ/mqdefault.jpg")
        );
        let w = &feed.videos[1];
        assert_eq!(w.channel, "Up");
        assert_eq!(w.thumb_url.as_deref(), Some("https://t/2.jpg"));
    }

    #[test]
    fn formats_parse() {
        let id = VideoId::new("abc").unwrap();
        let text = r#"{
            "duration": 61.5,
            "formats": [
                {"format_id":"140","url":"https://a","ext":"m4a","acodec":"mp4a","vcodec":"none","tbr":129.5},
                {"format_id":"137-drc","url":"https://v","ext":"mp4","acodec":"none","vcodec":"avc1","width":1920,"height":1080,"tbr":4000.0},
                {"format_id":"sb0","ext":"mhtml"}
            ]
        }"#;
        let set = parse_streams(id, text).unwrap();
        assert_eq!(set.streams.len(), 2);
        assert_eq!(set.duration_secs, Some(61.5));
        let a = &set.streams[0];
        assert!(a.is_audio);
        assert_eq!((a.itag, a.bitrate, a.mime.as_str()), (140, 129_500, "audio/m4a"));
        let v = &set.streams[1];
        assert!(!v.is_audio);
        assert_eq!((v.itag, v.width, v.height), (137, 1920, 1080));
    }

    #[test]
    fn formats_reject_garbage() {
        let id = VideoId::new("abc").unwrap();
        assert!(matches!(parse_streams(id, "nope"), Err(FetchError::Parse(_))));
    }

    #[test]
    fn result_count_is_clamped() {
        assert_eq!(clamp_results(0), FEED_MAX_VIDEOS as u32);
        assert_eq!(clamp_results(1000), FEED_MAX_VIDEOS as u32);
        assert_eq!(clamp_results(20), 20);
    }

    #[test]
    fn missing_program_is_io_error() {
        let y = YtDlp::new("/nonexistent/yt-dlp");
        let req = FeedRequest {
            home_url: "https://example.invalid/".into(),
            max_results: 5,
            access_token: None,
        };
        assert!(matches!(y.browse(&req), Err(FetchError::Io(_))));
    }
}
