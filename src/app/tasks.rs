//! Task submission and result draining for the UI thread.
//!
//! Every request builds an owned context (strings, ids, paths cloned out of
//! UI state), runs on the worker pool, and reports through its own bounded
//! channel. Failures travel as error-tagged results. `drain` is called once
//! per tick and empties every channel in a fixed order.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};

use crate::api::oauth::{DeviceCode, OAuthClient};
use crate::api::token::TokenStore;
use crate::api::{FeedRequest, FeedSource};
use crate::config::ChannelConfig;
use crate::model::{Feed, StreamSet, Token, Video, VideoId};
use crate::pool::{self, WorkerPool};
use crate::spsc::{self, Consumer, SharedProducer};
use crate::thumb::{self, Clock, ThumbCache, Thumbnail};

/// Progress of a sign-in or token refresh.
#[derive(Debug)]
pub enum AuthUpdate {
    /// Show this code to the user; polling continues in the background.
    Code(DeviceCode),
    Granted(Token),
    Failed(String),
}

#[derive(Debug)]
pub struct FeedOutcome {
    /// `"home"` or the search query.
    pub source: String,
    pub result: Result<Feed, String>,
}

#[derive(Debug)]
pub struct StreamOutcome {
    pub video: VideoId,
    pub result: Result<StreamSet, String>,
}

pub struct ThumbOutcome {
    pub video: VideoId,
    pub result: Result<Thumbnail, String>,
}

/// Everything drained in one tick, in application order.
#[derive(Default)]
pub struct Drained {
    pub auth: Vec<AuthUpdate>,
    pub feeds: Vec<FeedOutcome>,
    pub streams: Vec<StreamOutcome>,
    pub thumbs: Vec<ThumbOutcome>,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.auth.is_empty()
            && self.feeds.is_empty()
            && self.streams.is_empty()
            && self.thumbs.is_empty()
    }
}

struct Lane<T> {
    tx: SharedProducer<T>,
    rx: Consumer<T>,
}

impl<T: Send> Lane<T> {
    fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = spsc::channel(name, capacity);
        Self {
            tx: SharedProducer::new(tx),
            rx,
        }
    }
}

pub struct TaskSettings {
    pub workers: usize,
    pub channels: ChannelConfig,
    /// Thumbnail temp files.
    pub cache_dir: PathBuf,
    /// Token file.
    pub data_dir: PathBuf,
}

pub struct Tasks {
    pool: WorkerPool,
    source: Arc<dyn FeedSource>,
    oauth: Option<Arc<OAuthClient>>,
    cache_dir: PathBuf,
    data_dir: PathBuf,
    closing: Arc<AtomicBool>,

    feed: Lane<FeedOutcome>,
    auth: Lane<AuthUpdate>,
    streams: Lane<StreamOutcome>,
    thumbs: Lane<ThumbOutcome>,

    feed_pending: bool,
    auth_pending: bool,
    streams_pending: Option<VideoId>,
    thumbs_in_flight: HashSet<VideoId>,
}

impl Tasks {
    pub fn new(
        settings: TaskSettings,
        source: Arc<dyn FeedSource>,
        oauth: Option<OAuthClient>,
    ) -> std::io::Result<Self> {
        let ch = settings.channels;
        let pool = WorkerPool::new(settings.workers, ch.submit_queue)?;
        Ok(Self {
            pool,
            source,
            oauth: oauth.map(Arc::new),
            cache_dir: settings.cache_dir,
            data_dir: settings.data_dir,
            closing: Arc::new(AtomicBool::new(false)),
            feed: Lane::new("feed", ch.feed),
            auth: Lane::new("auth", ch.auth),
            streams: Lane::new("streams", ch.streams),
            thumbs: Lane::new("thumbs", ch.thumbs),
            feed_pending: false,
            auth_pending: false,
            streams_pending: None,
            thumbs_in_flight: HashSet::new(),
        })
    }

    pub fn feed_pending(&self) -> bool {
        self.feed_pending
    }

    pub fn auth_pending(&self) -> bool {
        self.auth_pending
    }

    pub fn has_oauth(&self) -> bool {
        self.oauth.is_some()
    }

    pub fn thumbs_in_flight(&self) -> usize {
        self.thumbs_in_flight.len()
    }

    fn submit<F>(&self, what: &str, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.pool.submit(task) {
            Ok(()) => true,
            Err(e) => {
                warn!("tasks: {what} not submitted: {e}");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Fetch the home feed. No-op while a feed or search is pending.
    pub fn request_feed(&mut self, req: FeedRequest) -> bool {
        if self.feed_pending {
            debug!("tasks: feed request suppressed, one is pending");
            return false;
        }
        let source = Arc::clone(&self.source);
        let tx = self.feed.tx.clone();
        self.feed_pending = self.submit("feed", move || {
            let result = guarded("feed fetch", || {
                source.browse(&req).map_err(|e| {
                    warn!("tasks: feed fetch failed: {e}");
                    e.to_string()
                })
            });
            tx.push_or_drop(FeedOutcome {
                source: "home".into(),
                result,
            });
        });
        self.feed_pending
    }

    /// Search. Shares the feed channel and its pending flag.
    pub fn request_search(&mut self, req: FeedRequest, query: String) -> bool {
        if self.feed_pending {
            debug!("tasks: search suppressed, a feed request is pending");
            return false;
        }
        let source = Arc::clone(&self.source);
        let tx = self.feed.tx.clone();
        self.feed_pending = self.submit("search", move || {
            let result = guarded("search", || {
                source.search(&req, &query).map_err(|e| {
                    warn!("tasks: search {query:?} failed: {e}");
                    e.to_string()
                })
            });
            tx.push_or_drop(FeedOutcome {
                source: query,
                result,
            });
        });
        self.feed_pending
    }

    /// Device-code sign-in: reports the code, then polls until the user
    /// approves. The granted token is saved before it is reported.
    pub fn start_auth(&mut self) -> bool {
        if self.auth_pending {
            return false;
        }
        let Some(oauth) = self.oauth.clone() else {
            warn!("tasks: sign-in requested without a client id");
            return false;
        };
        let tx = self.auth.tx.clone();
        let store = TokenStore::new(&self.data_dir);
        let closing = Arc::clone(&self.closing);
        self.auth_pending = self.submit("auth", move || {
            let result = guarded("sign-in", || {
                let code = oauth.request_device_code().map_err(|e| {
                    warn!("tasks: device code request failed: {e}");
                    e.to_string()
                })?;
                tx.push_or_drop(AuthUpdate::Code(code.clone()));
                let token = oauth.poll_for_token(&code, &closing).map_err(|e| {
                    warn!("tasks: sign-in failed: {e}");
                    e.to_string()
                })?;
                if let Err(e) = store.save(&token) {
                    warn!("tasks: token not saved: {e}");
                }
                Ok(token)
            });
            tx.push_or_drop(match result {
                Ok(token) => AuthUpdate::Granted(token),
                Err(msg) => AuthUpdate::Failed(msg),
            });
        });
        self.auth_pending
    }

    /// Exchange an expired token's refresh token. Reports through the auth
    /// channel like a sign-in.
    pub fn request_refresh(&mut self, token: Token) -> bool {
        if self.auth_pending {
            return false;
        }
        let Some(oauth) = self.oauth.clone() else {
            return false;
        };
        let tx = self.auth.tx.clone();
        let store = TokenStore::new(&self.data_dir);
        self.auth_pending = self.submit("token refresh", move || {
            let result = guarded("token refresh", || {
                let fresh = oauth.refresh(&token).map_err(|e| {
                    warn!("tasks: token refresh failed: {e}");
                    e.to_string()
                })?;
                if let Err(e) = store.save(&fresh) {
                    warn!("tasks: refreshed token not saved: {e}");
                }
                Ok(fresh)
            });
            tx.push_or_drop(match result {
                Ok(fresh) => AuthUpdate::Granted(fresh),
                Err(msg) => AuthUpdate::Failed(msg),
            });
        });
        self.auth_pending
    }

    /// Resolve playable streams for `video`. A request for another video
    /// supersedes the pending one; its late result is still delivered and
    /// left to the caller to ignore.
    pub fn request_streams(&mut self, video: VideoId, access_token: Option<String>) -> bool {
        if self.streams_pending.as_ref() == Some(&video) {
            return false;
        }
        let source = Arc::clone(&self.source);
        let tx = self.streams.tx.clone();
        let id = video.clone();
        if self.submit("streams", move || {
            let result = guarded("stream lookup", || {
                source.streams(&id, access_token.as_deref()).map_err(|e| {
                    warn!("tasks: streams for {id} failed: {e}");
                    e.to_string()
                })
            });
            tx.push_or_drop(StreamOutcome { video: id, result });
        }) {
            self.streams_pending = Some(video);
            true
        } else {
            false
        }
    }

    /// One fetch task per video that has a thumbnail URL, is not cached and
    /// is not already being fetched. Returns how many were submitted.
    pub fn request_thumbnails<C: Clock>(
        &mut self,
        videos: &[Video],
        cache: &ThumbCache<Thumbnail, C>,
    ) -> usize {
        let mut submitted = 0;
        for v in videos {
            let Some(url) = v.thumb_url.clone() else {
                continue;
            };
            if cache.contains(&v.id) || self.thumbs_in_flight.contains(&v.id) {
                continue;
            }
            let tx = self.thumbs.tx.clone();
            let dir = self.cache_dir.clone();
            let id = v.id.clone();
            let ok = self.submit("thumbnail", move || {
                let result = guarded("thumbnail fetch", || {
                    thumb::fetch_thumbnail(&url, &id, &dir).map_err(|e| {
                        debug!("tasks: thumbnail {id} failed: {e}");
                        e.to_string()
                    })
                });
                tx.push_or_drop(ThumbOutcome { video: id, result });
            });
            if !ok {
                break;
            }
            self.thumbs_in_flight.insert(v.id.clone());
            submitted += 1;
        }
        if submitted > 0 {
            debug!("tasks: {submitted} thumbnail fetches submitted");
        }
        submitted
    }

    /// Forget in-flight thumbnail ids. Called when a new feed lands so that
    /// a result lost to a full channel does not block its id forever.
    pub fn forget_thumbnails_in_flight(&mut self) {
        self.thumbs_in_flight.clear();
    }

    // -----------------------------------------------------------------------
    // Draining
    // -----------------------------------------------------------------------

    /// Empty every result channel (auth, feed, streams, thumbs) and clear
    /// the matching pending state.
    pub fn drain(&mut self) -> Drained {
        let mut out = Drained::default();

        for update in self.auth.rx.drain() {
            if !matches!(update, AuthUpdate::Code(_)) {
                self.auth_pending = false;
            }
            out.auth.push(update);
        }

        for outcome in self.feed.rx.drain() {
            self.feed_pending = false;
            out.feeds.push(outcome);
        }

        for outcome in self.streams.rx.drain() {
            if self.streams_pending.as_ref() == Some(&outcome.video) {
                self.streams_pending = None;
            }
            out.streams.push(outcome);
        }

        for outcome in self.thumbs.rx.drain() {
            self.thumbs_in_flight.remove(&outcome.video);
            out.thumbs.push(outcome);
        }

        out
    }

    /// Results dropped on full channels so far, per channel.
    pub fn dropped(&self) -> [(&'static str, u64); 4] {
        [
            ("auth", self.auth.rx.rejected()),
            ("feed", self.feed.rx.rejected()),
            ("streams", self.streams.rx.rejected()),
            ("thumbs", self.thumbs.rx.rejected()),
        ]
    }

    /// Abandon sign-in polling, run what is queued, join the workers.
    pub fn shutdown(&mut self) {
        self.closing.store(true, Ordering::Release);
        self.pool.shutdown();
        for (name, n) in self.dropped() {
            if n > 0 {
                info!("tasks: {n} {name} result(s) dropped on a full channel");
            }
        }
    }
}

/// Run a task body, turning a panic into an error result so that every
/// submitted request reports back and clears its pending state.
fn guarded<T>(what: &str, body: impl FnOnce() -> Result<T, String>) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        let msg = pool::panic_message(payload.as_ref());
        error!("tasks: {what} panicked: {msg}");
        Err(format!("{what} failed: {msg}"))
    })
}

impl Drop for Tasks {
    fn drop(&mut self) {
        self.shutdown();
    }
}
