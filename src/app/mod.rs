//! Terminal YouTube client: feed, search, queue and an in-terminal player.
//!
//! Layout:
//!   row 0             : header (view title)
//!   rows 1..rows-1    : content (list + thumbnail preview, or video + info)
//!   row rows-1        : status bar
//!
//! Threads:
//!   UI thread         : this event loop; sole owner of all view state
//!   worker pool       : feed/search/streams/auth/thumbnail tasks, results
//!                       come back over bounded SPSC channels (see `tasks`)
//!   compositor        : present only in the player view; shares the output
//!                       stream with the UI under one mutex
//!   engine threads    : decoder + its event channel, drained here each tick
//!
//! Kitty response suppression:
//!   Every graphics command carries `q=2`. Responses would otherwise arrive
//!   as APC sequences on stdin and be misparsed as key events.

mod diag;
mod input;
mod state;
mod terminal;
pub mod tasks;

pub use diag::{probe, testcard};
pub use state::{PlayQueue, QUEUE_MAX, SEARCH_MAX, VOLUME_MAX};

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use crossterm::event::{self, Event, KeyEvent};
use log::{debug, info, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::api::oauth::OAuthClient;
use crate::api::token::{self, TokenStore};
use crate::api::ytdlp::YtDlp;
use crate::api::{FeedRequest, FeedSource};
use crate::compositor::geometry::{GeometrySource, TerminalGeometry};
use crate::compositor::{self, Compositor, SharedOutput};
use crate::config::{self, Config, EngineKind};
use crate::engine::DecodeEngine;
use crate::engine::ffmpeg::FfmpegEngine;
use crate::engine::testcard::TestCard;
use crate::error::RenderInitError;
use crate::model::{FEED_MAX_VIDEOS, Token, Video, VideoId};
use crate::thumb::{ThumbCache, Thumbnail};

use input::{Action, SearchAction, map_key_event, map_search_key};
use state::{AuthState, FeedView, Layout, PlayerStatus, SearchPrompt, View};
use tasks::{AuthUpdate, Drained, TaskSettings, Tasks};

/// Image id of the feed thumbnail preview. Frame images use 1 and 2.
const PREVIEW_IMAGE_ID: u32 = 10;
/// Player info line refresh while nothing else changes.
const INFO_REFRESH: Duration = Duration::from_millis(500);
const TESTCARD_FPS: u32 = 30;
const TESTCARD_SECS: u64 = 60;

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_: nix::libc::c_int) {
    TERMINATE.store(true, Ordering::Release);
}

/// SIGTERM and SIGHUP end the event loop so the terminal gets restored.
fn install_signal_handlers() -> anyhow::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGHUP] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { signal::sigaction(sig, &action) }
            .with_context(|| format!("failed to install {sig:?} handler"))?;
    }
    Ok(())
}

/// Decode engine for `kind`, its events buffered up to `event_cap`.
pub fn make_engine(kind: EngineKind, event_cap: usize) -> Box<dyn DecodeEngine> {
    match kind {
        EngineKind::Ffmpeg => Box::new(FfmpegEngine::new("ffmpeg", event_cap)),
        EngineKind::Testcard => Box::new(TestCard::new(
            TESTCARD_FPS,
            Duration::from_secs(TESTCARD_SECS),
            event_cap,
        )),
    }
}

/// Run the interactive client until the user quits or a termination
/// signal arrives.
pub fn run(config: Config) -> anyhow::Result<()> {
    terminal::check_tty()?;
    install_signal_handlers()?;

    let cache_dir = config::cache_dir();
    let data_dir = config::data_dir();
    for dir in [&cache_dir, &data_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let oauth = config
        .auth
        .as_ref()
        .map(|a| OAuthClient::new(a.client_id.as_str(), a.client_secret.as_str()));
    let stored = TokenStore::new(&data_dir).load();
    let source: Arc<dyn FeedSource> = Arc::new(YtDlp::default());
    let tasks = Tasks::new(
        TaskSettings {
            workers: config.pool_workers,
            channels: config.channels,
            cache_dir,
            data_dir,
        },
        source,
        oauth,
    )
    .context("failed to start worker pool")?;
    let engine = make_engine(config.engine, config.channels.player_events);

    let (cols, rows) = crossterm::terminal::size().context("failed to get terminal size")?;
    let output = compositor::shared_output(io::stdout());

    let mut guard = terminal::RawGuard::enter()?;
    let mut app = App::new(
        config,
        tasks,
        engine,
        Box::new(TerminalGeometry),
        output,
        Layout::new(cols, rows),
    );
    app.start(stored);
    let result = app.run_loop();
    app.shutdown();
    guard.cleanup();
    result
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

struct App {
    config: Config,
    tasks: Tasks,
    engine: Box<dyn DecodeEngine>,
    geometry: Box<dyn GeometrySource>,
    output: SharedOutput,
    layout: Layout,

    view: View,
    feed: FeedView,
    queue: PlayQueue,
    search: SearchPrompt,
    auth: AuthState,
    player: PlayerStatus,
    thumbs: ThumbCache<Thumbnail>,
    token: Option<Token>,

    compositor: Option<Compositor>,
    /// Video whose thumbnail is transmitted as PREVIEW_IMAGE_ID.
    preview: Option<VideoId>,
    /// One-shot status message, cleared on the next key press.
    flash: Option<String>,
    dirty: bool,
    /// Wipe the whole text layer on the next redraw.
    clear: bool,
    last_info: Instant,
}

impl App {
    fn new(
        config: Config,
        tasks: Tasks,
        engine: Box<dyn DecodeEngine>,
        geometry: Box<dyn GeometrySource>,
        output: SharedOutput,
        layout: Layout,
    ) -> Self {
        let thumbs = ThumbCache::new(config.thumb_cache_max);
        Self {
            config,
            tasks,
            engine,
            geometry,
            output,
            layout,
            view: View::Feed,
            feed: FeedView::new(),
            queue: PlayQueue::new(),
            search: SearchPrompt::default(),
            auth: AuthState::default(),
            player: PlayerStatus::new(),
            thumbs,
            token: None,
            compositor: None,
            preview: None,
            flash: None,
            dirty: true,
            clear: true,
            last_info: Instant::now(),
        }
    }

    /// Pick the first view from the stored token.
    ///
    /// A valid token (or no client id at all) goes straight to the feed. An
    /// expired token with a refresh token is exchanged first; anything else
    /// starts the device-code sign-in.
    fn start(&mut self, stored: Option<Token>) {
        if !self.tasks.has_oauth() {
            info!("app: no client id configured, browsing without sign-in");
            self.feed.loading = true;
            self.view = View::Feed;
            return;
        }
        match stored {
            Some(tok) if !tok.is_expired(token::now_epoch()) => {
                info!("app: stored token is valid");
                self.token = Some(tok);
                self.feed.loading = true;
                self.view = View::Feed;
            }
            Some(tok) if !tok.refresh.is_empty() => {
                info!("app: stored token expired, refreshing");
                self.view = View::Auth;
                self.auth.started = true;
                self.auth.refreshing = true;
                if !self.tasks.request_refresh(tok) {
                    self.auth.refreshing = false;
                    self.auth.error = Some("token refresh could not be started".into());
                }
            }
            _ => {
                info!("app: no usable token, starting sign-in");
                self.view = View::Auth;
            }
        }
    }

    fn run_loop(&mut self) -> anyhow::Result<()> {
        self.redraw()?;
        loop {
            if TERMINATE.load(Ordering::Acquire) {
                info!("app: termination signal received");
                return Ok(());
            }
            self.kick_requests();

            let ready = match event::poll(self.config.ui.tick) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
                Err(e) => return Err(e.into()),
            };
            if ready {
                match event::read()? {
                    Event::Key(key) => {
                        if self.handle_key(key) == Flow::Quit {
                            return Ok(());
                        }
                    }
                    Event::Resize(cols, rows) => self.on_resize(cols, rows),
                    _ => {}
                }
            }

            let drained = self.tasks.drain();
            if !drained.is_empty() {
                self.apply(drained);
            }
            self.drain_player_events();

            let info_due =
                self.view == View::Player && self.last_info.elapsed() >= INFO_REFRESH;
            if self.dirty || info_due {
                self.redraw()?;
            }
        }
    }

    /// Submit whatever the current state is waiting for.
    fn kick_requests(&mut self) {
        if self.view == View::Auth && !self.auth.started {
            self.auth.started = true;
            self.dirty = true;
            if !self.tasks.start_auth() {
                self.auth.error = Some("sign-in could not be started".into());
            }
        }
        if self.view != View::Auth && self.feed.loading && !self.tasks.feed_pending() {
            let req = self.feed_request(FEED_MAX_VIDEOS as u32);
            if !self.tasks.request_feed(req) {
                self.feed.loading = false;
                self.feed.error = Some("feed request could not be submitted".into());
                self.dirty = true;
            }
        }
    }

    fn feed_request(&self, max_results: u32) -> FeedRequest {
        FeedRequest {
            home_url: self.config.feed.home.clone(),
            max_results,
            access_token: self.access_token(),
        }
    }

    fn access_token(&self) -> Option<String> {
        self.token
            .as_ref()
            .filter(|t| !t.access.is_empty())
            .map(|t| t.access.clone())
    }

    fn set_view(&mut self, view: View) {
        if self.view == view {
            return;
        }
        debug!("app: view {} -> {}", self.view.title(), view.title());
        if self.view == View::Feed {
            self.drop_preview();
        }
        self.view = view;
        self.dirty = true;
        self.clear = true;
    }

    fn drop_preview(&mut self) {
        if self.preview.take().is_some() {
            let mut out = compositor::lock_output(&self.output);
            if let Err(e) = terminal::delete_image(&mut **out, PREVIEW_IMAGE_ID) {
                debug!("app: preview delete failed: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Keys
    // -----------------------------------------------------------------------

    fn handle_key(&mut self, key: KeyEvent) -> Flow {
        if self.view == View::Search {
            return self.handle_search_key(key);
        }
        let Some(action) = map_key_event(key) else {
            return Flow::Continue;
        };
        if self.flash.take().is_some() {
            self.dirty = true;
        }
        if action == Action::Quit {
            return Flow::Quit;
        }
        match self.view {
            View::Auth => self.on_auth_action(action),
            View::Feed => self.on_feed_action(action),
            View::Player => self.on_player_action(action),
            View::Queue => self.on_queue_action(action),
            View::Search => {}
        }
        Flow::Continue
    }

    fn handle_search_key(&mut self, key: KeyEvent) -> Flow {
        let Some(action) = map_search_key(key, self.search.query.is_empty()) else {
            return Flow::Continue;
        };
        self.dirty = true;
        match action {
            SearchAction::Type(c) => self.search.push(c),
            SearchAction::Backspace => self.search.pop(),
            SearchAction::Confirm => {
                let query = self.search.take();
                self.set_view(View::Feed);
                if query.trim().is_empty() {
                    return Flow::Continue;
                }
                let req = self.feed_request(self.config.feed.search_results);
                if self.tasks.request_search(req, query) {
                    self.feed.loading = true;
                    self.feed.error = None;
                } else {
                    self.flash = Some("a feed request is already running".into());
                }
            }
            SearchAction::Cancel => {
                self.search.query.clear();
                self.set_view(View::Feed);
            }
            SearchAction::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    fn on_auth_action(&mut self, action: Action) {
        match action {
            Action::Refresh if !self.tasks.auth_pending() => {
                self.auth = AuthState::default();
                self.dirty = true;
            }
            Action::Back => {
                info!("app: continuing without sign-in");
                self.feed.loading = true;
                self.set_view(View::Feed);
            }
            _ => {}
        }
    }

    fn on_feed_action(&mut self, action: Action) {
        match action {
            Action::Up => {
                self.feed.cursor.up();
                self.dirty = true;
            }
            Action::Down => {
                self.feed.cursor.down(self.feed.feed.len());
                self.dirty = true;
            }
            Action::Select => {
                if let Some(v) = self.feed.selected().cloned() {
                    match self.queue.play_now(v).cloned() {
                        Some(v) => self.start_video(v),
                        None => {
                            self.flash = Some("queue is full".into());
                            self.dirty = true;
                        }
                    }
                }
            }
            Action::Enqueue => {
                if let Some(v) = self.feed.selected().cloned() {
                    let title = v.title.clone();
                    self.flash = Some(if self.queue.push(v) {
                        format!("queued: {title}")
                    } else {
                        "queue is full".into()
                    });
                    self.dirty = true;
                }
            }
            Action::OpenQueue => self.set_view(View::Queue),
            Action::Refresh => {
                self.feed.loading = true;
                self.feed.error = None;
                self.dirty = true;
            }
            Action::Search => {
                self.search.query.clear();
                self.set_view(View::Search);
            }
            _ => {}
        }
    }

    fn on_player_action(&mut self, action: Action) {
        match action {
            Action::TogglePause => {
                if let Err(e) = self.engine.toggle_pause() {
                    debug!("app: pause toggle ignored: {e}");
                }
            }
            Action::SeekBack | Action::SeekForward => {
                let secs = self.config.ui.seek_secs;
                let delta = if action == Action::SeekBack { -secs } else { secs };
                if let Err(e) = self.engine.seek(delta) {
                    debug!("app: seek ignored: {e}");
                }
            }
            Action::VolumeUp | Action::VolumeDown => {
                let step = i64::from(self.config.ui.volume_step);
                let delta = if action == Action::VolumeUp { step } else { -step };
                let volume = self.player.stepped_volume(delta);
                self.engine.set_volume(volume);
                self.player.volume = volume;
                self.dirty = true;
            }
            Action::Next => self.step_queue(true),
            Action::Prev => self.step_queue(false),
            Action::Shuffle => self.shuffle_queue(),
            Action::OpenQueue => {
                self.stop_playback();
                self.set_view(View::Queue);
            }
            Action::Back => {
                self.stop_playback();
                self.set_view(View::Feed);
            }
            _ => {}
        }
    }

    fn on_queue_action(&mut self, action: Action) {
        match action {
            Action::Up => {
                self.queue.cursor.up();
                self.dirty = true;
            }
            Action::Down => {
                self.queue.cursor.down(self.queue.len());
                self.dirty = true;
            }
            Action::Select => {
                let idx = self.queue.cursor.selected;
                if let Some(v) = self.queue.jump(idx).cloned() {
                    self.start_video(v);
                }
            }
            Action::Next => self.step_queue(true),
            Action::Prev => self.step_queue(false),
            Action::Shuffle => self.shuffle_queue(),
            Action::Back => self.set_view(View::Feed),
            _ => {}
        }
    }

    fn step_queue(&mut self, forward: bool) {
        let next = if forward {
            self.queue.next().cloned()
        } else {
            self.queue.prev().cloned()
        };
        match next {
            Some(v) => self.start_video(v),
            None => {
                self.flash = Some("end of queue".into());
                self.dirty = true;
            }
        }
    }

    fn shuffle_queue(&mut self) {
        self.queue.shuffle(&mut rand::rng());
        self.queue.cursor.reset();
        self.flash = Some(format!("shuffled {} videos", self.queue.len()));
        self.dirty = true;
    }

    // -----------------------------------------------------------------------
    // Playback
    // -----------------------------------------------------------------------

    /// Switch to the player and start `video`. The testcard engine plays
    /// without stream resolution.
    fn start_video(&mut self, video: Video) {
        info!("app: play {} ({})", video.id, video.title);
        // Whatever played before must not report into this video.
        self.engine.stop();
        let stale = self.engine.discard_events();
        if stale > 0 {
            debug!("app: {stale} player events of the previous video dropped");
        }
        self.set_view(View::Player);
        self.player.reset();
        self.dirty = true;
        if let Err(e) = self.ensure_compositor() {
            warn!("app: compositor unavailable: {e}");
            self.flash = Some(format!("video output unavailable: {e}"));
        }
        match self.config.engine {
            EngineKind::Testcard => self.load_url(&video.id.watch_url(), None),
            EngineKind::Ffmpeg => {
                let token = self.access_token();
                self.tasks.request_streams(video.id.clone(), token);
                self.flash = Some("resolving stream...".into());
            }
        }
    }

    fn load_url(&mut self, url: &str, audio_url: Option<&str>) {
        if let Err(e) = self.engine.load_with_audio(url, audio_url) {
            warn!("app: load failed: {e}");
            self.flash = Some(format!("playback failed: {e}"));
            self.dirty = true;
        }
    }

    fn ensure_compositor(&mut self) -> Result<(), RenderInitError> {
        if self.compositor.is_some() {
            return Ok(());
        }
        let ui = &self.config.ui;
        let Some(region) = self.layout.video_region(ui.info_rows, ui.video_width_pct) else {
            return Err(RenderInitError::Geometry("terminal too small".into()));
        };
        let cfg = self.config.render.compositor_config();
        let c = Compositor::init(
            self.engine.as_mut(),
            self.geometry.as_ref(),
            region,
            Arc::clone(&self.output),
            &cfg,
        )?;
        let g = c.geometry();
        info!("app: compositor {}x{} in {:?}", g.width, g.height, region);
        self.compositor = Some(c);
        Ok(())
    }

    fn stop_compositor(&mut self) {
        if let Some(mut c) = self.compositor.take()
            && let Err(e) = c.shutdown()
        {
            warn!("app: compositor: {e}");
        }
    }

    fn stop_playback(&mut self) {
        self.engine.stop();
        self.stop_compositor();
        self.player.reset();
    }

    fn drain_player_events(&mut self) {
        let mut eof = false;
        while let Some(ev) = self.engine.poll_event() {
            eof |= self.player.apply(&ev);
            if self.view == View::Player {
                self.dirty = true;
            }
        }
        if eof {
            self.on_end_of_file();
        }
    }

    /// Advance to the next queued video, or leave the player when the
    /// queue is exhausted.
    fn on_end_of_file(&mut self) {
        match self.queue.next().cloned() {
            Some(v) => {
                debug!("app: end of file, advancing queue");
                self.start_video(v);
            }
            None => {
                info!("app: end of queue");
                self.stop_playback();
                self.set_view(View::Feed);
                self.flash = Some("queue finished".into());
            }
        }
    }

    fn on_resize(&mut self, cols: u16, rows: u16) {
        debug!("app: resize to {cols}x{rows}");
        self.layout = Layout::new(cols, rows);
        self.dirty = true;
        self.clear = true;
        if self.compositor.is_none() {
            return;
        }
        self.stop_compositor();
        if let Err(e) = self.ensure_compositor() {
            warn!("app: compositor not rebuilt after resize: {e}");
            self.flash = Some(format!("video output unavailable: {e}"));
        }
    }

    // -----------------------------------------------------------------------
    // Task results
    // -----------------------------------------------------------------------

    fn apply(&mut self, drained: Drained) {
        self.dirty = true;

        for update in drained.auth {
            match update {
                AuthUpdate::Code(code) => {
                    info!("app: device code issued, visit {}", code.verification_url);
                    self.auth.code = Some(code);
                }
                AuthUpdate::Granted(tok) => {
                    info!("app: signed in");
                    self.token = Some(tok);
                    self.auth = AuthState::default();
                    if self.view == View::Auth {
                        self.feed.loading = true;
                        self.set_view(View::Feed);
                        self.flash = Some("signed in".into());
                    }
                }
                AuthUpdate::Failed(msg) => {
                    self.auth.refreshing = false;
                    self.auth.code = None;
                    self.auth.error = Some(msg);
                }
            }
        }

        for outcome in drained.feeds {
            match outcome.result {
                Ok(feed) => {
                    info!("app: {} videos from {:?}", feed.len(), outcome.source);
                    self.feed.replace(feed, outcome.source);
                    self.tasks.forget_thumbnails_in_flight();
                    self.tasks
                        .request_thumbnails(&self.feed.feed.videos, &self.thumbs);
                }
                Err(msg) => {
                    self.feed.loading = false;
                    self.feed.error = Some(msg);
                }
            }
        }

        for outcome in drained.streams {
            if self.queue.current().map(|v| &v.id) != Some(&outcome.video) {
                debug!("app: late streams for {} ignored", outcome.video);
                continue;
            }
            match outcome.result {
                Ok(set) => {
                    let max_h = self
                        .compositor
                        .as_ref()
                        .map_or(self.config.render.max_height, |c| c.geometry().height);
                    match set.best_for_height(max_h).map(|s| s.url.clone()) {
                        Some(url) => {
                            self.flash = None;
                            let audio = set
                                .best_audio()
                                .filter(|a| a.url != url)
                                .map(|a| a.url.clone());
                            self.load_url(&url, audio.as_deref());
                        }
                        None => self.flash = Some("no playable stream".into()),
                    }
                }
                Err(msg) => self.flash = Some(format!("stream lookup failed: {msg}")),
            }
        }

        for outcome in drained.thumbs {
            if let Ok(thumb) = outcome.result {
                self.thumbs.put(outcome.video, thumb);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Drawing
    // -----------------------------------------------------------------------

    fn status_hints(&self) -> String {
        match self.view {
            View::Auth => "r:retry  esc:skip  q:quit".into(),
            View::Feed => format!(
                "{} ({}) | j/k:move enter:play a:queue l:list r:refresh /:search q:quit",
                self.feed.source,
                self.feed.feed.len()
            ),
            View::Player => {
                "space:pause </>:seek +/-:vol n/p:next/prev s:shuffle esc:back".into()
            }
            View::Search => "enter:search  esc:cancel".into(),
            View::Queue => format!(
                "{} queued | enter:play n/p:next/prev s:shuffle esc:back",
                self.queue.len()
            ),
        }
    }

    fn redraw(&mut self) -> io::Result<()> {
        let output = Arc::clone(&self.output);
        let mut guard = compositor::lock_output(&output);
        let out: &mut dyn Write = &mut **guard;

        write!(out, "{}", terminal::SYNC_BEGIN)?;
        if self.view == View::Player {
            // The video area is owned by the compositor; repaint text only.
            if self.clear {
                terminal::clear_screen(out)?;
            }
            let info_top = self.layout.info_top(self.config.ui.info_rows);
            terminal::draw_header(out, &self.layout, self.view.title())?;
            terminal::draw_player_info(
                out,
                &self.layout,
                info_top,
                self.queue.current(),
                &self.player,
            )?;
        } else {
            terminal::clear_screen(out)?;
            terminal::draw_header(out, &self.layout, self.view.title())?;
            match self.view {
                View::Auth => terminal::draw_auth(out, &self.layout, &self.auth)?,
                View::Feed => {
                    let list_cols = self.layout.list_cols();
                    terminal::draw_feed(out, &self.layout, &mut self.feed, list_cols)?;
                    self.draw_preview(out)?;
                }
                View::Search => terminal::draw_search(out, &self.layout, &self.search.query)?,
                View::Queue => terminal::draw_queue(out, &self.layout, &mut self.queue)?,
                View::Player => {}
            }
        }

        let left = self.flash.clone().unwrap_or_else(|| self.status_hints());
        let right = self.compositor.as_ref().map(|c| {
            let g = c.geometry();
            format!("{}x{} {} fps", g.width, g.height, c.fps())
        });
        terminal::draw_status_bar(out, &self.layout, &left, right.as_deref())?;
        write!(out, "{}", terminal::SYNC_END)?;
        out.flush()?;

        self.dirty = false;
        self.clear = false;
        self.last_info = Instant::now();
        Ok(())
    }

    /// Thumbnail and details of the selected video, right of the list.
    fn draw_preview(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let Some(region) = self.layout.preview_region() else {
            return Ok(());
        };
        let Some(video) = self.feed.selected().cloned() else {
            return Ok(());
        };
        match self.thumbs.get(&video.id) {
            Some(thumb) => {
                if self.preview.as_ref() != Some(&video.id) {
                    terminal::send_image(
                        out,
                        thumb.rgba(),
                        thumb.width(),
                        thumb.height(),
                        PREVIEW_IMAGE_ID,
                    )?;
                    self.preview = Some(video.id.clone());
                }
                terminal::place_image(out, PREVIEW_IMAGE_ID, region)?;
            }
            None => {
                if self.preview.take().is_some() {
                    terminal::delete_image(out, PREVIEW_IMAGE_ID)?;
                }
            }
        }
        if region.row + region.rows + 3 < self.layout.status_row() {
            terminal::draw_feed_details(out, &video, region)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.stop_compositor();
        self.engine.stop();
        self.drop_preview();
        self.tasks.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::geometry::{CellSize, FixedGeometry};
    use crate::config::ConfigFile;
    use crate::error::FetchError;
    use crate::model::{Feed, StreamSet};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn video(id: &str) -> Video {
        Video {
            id: VideoId::new(id).unwrap(),
            title: format!("title {id}"),
            channel: "chan".into(),
            thumb_url: None,
            duration_secs: Some(90),
            view_count: Some(3),
        }
    }

    struct TwoVideos;

    impl FeedSource for TwoVideos {
        fn browse(&self, _req: &FeedRequest) -> Result<Feed, FetchError> {
            Ok(Feed::new(vec![video("aaa"), video("bbb")]))
        }
        fn search(&self, _req: &FeedRequest, query: &str) -> Result<Feed, FetchError> {
            Ok(Feed::new(vec![video(query)]))
        }
        fn streams(&self, id: &VideoId, _tok: Option<&str>) -> Result<StreamSet, FetchError> {
            Ok(StreamSet::new(id.clone(), Vec::new(), None))
        }
    }

    /// App on a testcard engine that plays `secs` per video, drawing into
    /// a byte sink with a fixed 8x16 px cell.
    fn app(secs: f64) -> (App, Sink, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut file: ConfigFile = toml::from_str(r#"engine = "testcard""#).unwrap();
        file.pool_workers = Some(2);
        let mut config = file.resolve();
        config.render.shm_dir = dir.path().to_path_buf();
        let tasks = Tasks::new(
            TaskSettings {
                workers: config.pool_workers,
                channels: config.channels,
                cache_dir: dir.path().to_path_buf(),
                data_dir: dir.path().to_path_buf(),
            },
            Arc::new(TwoVideos),
            None,
        )
        .unwrap();
        let engine = Box::new(TestCard::new(
            30,
            Duration::from_secs_f64(secs),
            config.channels.player_events,
        ));
        let sink = Sink::default();
        let app = App::new(
            config,
            tasks,
            engine,
            Box::new(FixedGeometry(CellSize {
                width: 8,
                height: 16,
            })),
            compositor::shared_output(sink.clone()),
            Layout::new(80, 24),
        );
        (app, sink, dir)
    }

    /// Run one loop iteration without terminal input.
    fn tick(app: &mut App) {
        app.kick_requests();
        let drained = app.tasks.drain();
        if !drained.is_empty() {
            app.apply(drained);
        }
        app.drain_player_events();
        std::thread::sleep(Duration::from_millis(10));
    }

    fn tick_until(app: &mut App, done: impl Fn(&App) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done(app) {
            assert!(Instant::now() < deadline, "timed out");
            tick(app);
        }
    }

    #[test]
    fn without_client_id_feed_loads_directly() {
        let (mut a, _sink, _dir) = app(1.0);
        a.start(None);
        assert_eq!(a.view, View::Feed);
        tick_until(&mut a, |a| a.feed.feed.len() == 2);
        assert!(!a.feed.loading);
        assert_eq!(a.feed.source, "home");
    }

    #[test]
    fn playback_advances_queue_then_returns_to_feed() {
        let (mut a, sink, _dir) = app(0.2);
        a.start(None);
        tick_until(&mut a, |a| a.feed.feed.len() == 2);

        a.on_feed_action(Action::Enqueue);
        a.on_feed_action(Action::Down);
        a.on_feed_action(Action::Enqueue);
        assert_eq!(a.queue.len(), 2);

        a.on_queue_action(Action::Select);
        assert_eq!(a.view, View::Player);
        assert!(a.compositor.is_some());
        assert_eq!(a.queue.current_index(), Some(0));

        tick_until(&mut a, |a| a.queue.current_index() == Some(1));
        assert_eq!(a.view, View::Player);
        tick_until(&mut a, |a| a.view == View::Feed);
        assert!(a.compositor.is_none());
        assert_eq!(a.flash.as_deref(), Some("queue finished"));

        let written = String::from_utf8_lossy(&sink.0.lock().unwrap()).into_owned();
        assert!(written.contains("\x1b_Ga=T"));
    }

    #[test]
    fn finished_video_does_not_skip_the_one_after_it() {
        let (mut a, _sink, _dir) = app(0.1);
        for id in ["v0", "v1", "v2"] {
            assert!(a.queue.push(video(id)));
        }
        a.on_queue_action(Action::Select);
        assert_eq!(a.queue.current_index(), Some(0));

        // v0 ends and its EndOfFile sits in the queue, unread
        std::thread::sleep(Duration::from_millis(400));
        a.on_player_action(Action::Next);
        assert_eq!(a.queue.current_index(), Some(1));
        a.drain_player_events();
        assert_eq!(a.queue.current_index(), Some(1));
        assert_eq!(a.view, View::Player);
    }

    #[test]
    fn volume_steps_are_clamped() {
        let (mut a, _sink, _dir) = app(1.0);
        for _ in 0..40 {
            a.on_player_action(Action::VolumeUp);
        }
        assert_eq!(a.player.volume, VOLUME_MAX);
        for _ in 0..40 {
            a.on_player_action(Action::VolumeDown);
        }
        assert_eq!(a.player.volume, 0);
    }

    #[test]
    fn search_replaces_feed_with_query_results() {
        let (mut a, _sink, _dir) = app(1.0);
        a.start(None);
        tick_until(&mut a, |a| a.feed.feed.len() == 2);

        a.on_feed_action(Action::Search);
        assert_eq!(a.view, View::Search);
        a.search.query = "kittens".into();
        a.handle_search_key(KeyEvent::from(crossterm::event::KeyCode::Enter));
        assert_eq!(a.view, View::Feed);
        tick_until(&mut a, |a| a.feed.source == "kittens");
        assert_eq!(a.feed.feed.len(), 1);
        assert!(a.search.query.is_empty());
    }

    #[test]
    fn redraw_draws_status_bar_and_resize_rebuilds_compositor() {
        let (mut a, sink, _dir) = app(5.0);
        a.start(None);
        tick_until(&mut a, |a| a.feed.feed.len() == 2);
        a.redraw().unwrap();

        a.on_feed_action(Action::Select);
        assert!(a.compositor.is_some());
        let before = a.compositor.as_ref().map(|c| *c.geometry());
        a.on_resize(120, 40);
        let after = a.compositor.as_ref().map(|c| *c.geometry());
        assert!(after.is_some());
        assert_ne!(before, after);

        a.redraw().unwrap();
        a.shutdown();
        let written = String::from_utf8_lossy(&sink.0.lock().unwrap()).into_owned();
        assert!(written.contains("title aaa"));
        assert!(written.contains("fps"));
    }
}
