use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;

use crate::compositor::CompositorConfig;

// ---------------------------------------------------------------------------
// ConfigFile: deserialized from TOML (all fields optional)
// ---------------------------------------------------------------------------

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub pool_workers: Option<usize>,
    pub thumb_cache_max: Option<usize>,
    pub engine: Option<EngineKind>,
    pub channels: ChannelsFile,
    pub render: RenderFile,
    pub ui: UiFile,
    pub feed: FeedFile,
    pub auth: AuthFile,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ChannelsFile {
    pub feed: Option<usize>,
    pub auth: Option<usize>,
    pub streams: Option<usize>,
    pub thumbs: Option<usize>,
    pub player_events: Option<usize>,
    pub submit_queue: Option<usize>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct RenderFile {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub poll_us: Option<u64>,
    pub shm_dir: Option<PathBuf>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct UiFile {
    pub tick_ms: Option<u64>,
    pub seek_secs: Option<f64>,
    pub volume_step: Option<u32>,
    pub info_rows: Option<u16>,
    pub video_width_pct: Option<u16>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct FeedFile {
    pub home: Option<String>,
    pub search_results: Option<u32>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct AuthFile {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Ffmpeg,
    Testcard,
}

// ---------------------------------------------------------------------------
// Config: resolved (all fields concrete)
// ---------------------------------------------------------------------------

pub struct Config {
    pub pool_workers: usize,
    pub thumb_cache_max: usize,
    pub engine: EngineKind,
    pub channels: ChannelConfig,
    pub render: RenderConfig,
    pub ui: UiConfig,
    pub feed: FeedConfig,
    /// `None` when no client id is configured; sign-in is then skipped.
    pub auth: Option<AuthConfig>,
}

#[derive(Clone, Copy)]
pub struct ChannelConfig {
    pub feed: usize,
    pub auth: usize,
    pub streams: usize,
    pub thumbs: usize,
    pub player_events: usize,
    pub submit_queue: usize,
}

pub struct RenderConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub poll_interval: Duration,
    pub shm_dir: PathBuf,
}

pub struct UiConfig {
    pub tick: Duration,
    pub seek_secs: f64,
    pub volume_step: u32,
    pub info_rows: u16,
    pub video_width_pct: u16,
}

pub struct FeedConfig {
    pub home: String,
    pub search_results: u32,
}

#[derive(Clone)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
}

impl RenderConfig {
    pub fn compositor_config(&self) -> CompositorConfig {
        CompositorConfig {
            max_width: self.max_width,
            max_height: self.max_height,
            poll_interval: self.poll_interval,
            shm_dir: self.shm_dir.clone(),
            ..CompositorConfig::default()
        }
    }
}

impl ConfigFile {
    /// Merge CLI values (overwrites non-None fields).
    pub fn merge_cli(&mut self, engine: Option<EngineKind>, workers: Option<usize>) {
        if let Some(v) = engine {
            debug!("config: CLI override engine={v:?}");
            self.engine = engine;
        }
        if let Some(v) = workers {
            debug!("config: CLI override pool_workers={v}");
            self.pool_workers = workers;
        }
    }

    /// Resolve to a Config by applying defaults to missing fields.
    pub fn resolve(self) -> Config {
        let ch = self.channels;
        let config = Config {
            pool_workers: self.pool_workers.unwrap_or(4).max(1),
            thumb_cache_max: self.thumb_cache_max.unwrap_or(128).max(1),
            engine: self.engine.unwrap_or(EngineKind::Ffmpeg),
            channels: ChannelConfig {
                feed: ch.feed.unwrap_or(4),
                auth: ch.auth.unwrap_or(2),
                streams: ch.streams.unwrap_or(4),
                thumbs: ch.thumbs.unwrap_or(32),
                player_events: ch.player_events.unwrap_or(64),
                submit_queue: ch.submit_queue.unwrap_or(64),
            },
            render: RenderConfig {
                max_width: self.render.max_width.unwrap_or(1920),
                max_height: self.render.max_height.unwrap_or(1080),
                poll_interval: Duration::from_micros(self.render.poll_us.unwrap_or(500)),
                shm_dir: self
                    .render
                    .shm_dir
                    .unwrap_or_else(|| PathBuf::from("/dev/shm")),
            },
            ui: UiConfig {
                tick: Duration::from_millis(self.ui.tick_ms.unwrap_or(50)),
                seek_secs: self.ui.seek_secs.unwrap_or(10.0),
                volume_step: self.ui.volume_step.unwrap_or(5),
                info_rows: self.ui.info_rows.unwrap_or(3),
                video_width_pct: self.ui.video_width_pct.unwrap_or(95).clamp(10, 100),
            },
            feed: FeedConfig {
                home: self
                    .feed
                    .home
                    .unwrap_or_else(|| "https://www.youtube.com/feed/trending".into()),
                search_results: self.feed.search_results.unwrap_or(20),
            },
            auth: self.auth.client_id.map(|client_id| AuthConfig {
                client_id,
                client_secret: self.auth.client_secret.unwrap_or_default(),
            }),
        };
        info!(
            "config: resolved engine={:?}, workers={}, thumb_cache_max={}, \
             max={}x{}, tick={}ms, auth={}",
            config.engine,
            config.pool_workers,
            config.thumb_cache_max,
            config.render.max_width,
            config.render.max_height,
            config.ui.tick.as_millis(),
            if config.auth.is_some() { "on" } else { "off" },
        );
        config
    }
}

/// `$XDG_<var>` or `$HOME/<fallback>`, joined with `ytview`.
fn xdg_dir(var: &str, fallback: &str) -> Option<PathBuf> {
    let base = std::env::var_os(var)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(fallback)))?;
    Some(base.join("ytview"))
}

fn config_path() -> Option<PathBuf> {
    Some(xdg_dir("XDG_CONFIG_HOME", ".config")?.join("config.toml"))
}

/// Thumbnail temp files.
pub fn cache_dir() -> PathBuf {
    xdg_dir("XDG_CACHE_HOME", ".cache").unwrap_or_else(|| std::env::temp_dir().join("ytview"))
}

/// Token file.
pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
        .unwrap_or_else(|| std::env::temp_dir().join("ytview"))
}

/// Load config file. Returns `ConfigFile::default()` if no file exists.
/// Returns an error if the file exists but cannot be parsed.
pub fn load_config() -> anyhow::Result<ConfigFile> {
    let path = match config_path() {
        Some(p) => p,
        None => {
            info!("config: no HOME or XDG_CONFIG_HOME set, using defaults");
            return Ok(ConfigFile::default());
        }
    };
    debug!("config: looking for {}", path.display());
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            info!("config: loaded from {}", path.display());
            let cfg: ConfigFile = toml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("config: {} not found, using defaults", path.display());
            Ok(ConfigFile::default())
        }
        Err(e) => Err(anyhow::anyhow!("failed to read {}: {e}", path.display())),
    }
}
