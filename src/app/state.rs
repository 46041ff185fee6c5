//! Application state: views, layout, feed list, play queue, player status.

use std::ops::Range;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::api::oauth::DeviceCode;
use crate::compositor::geometry::Region;
use crate::engine::{PlaybackState, PlayerEvent};
use crate::model::{Feed, Video};

/// Most entries the play queue holds.
pub const QUEUE_MAX: usize = 256;
/// Longest search query, in characters.
pub const SEARCH_MAX: usize = 255;
/// Loudest volume the player accepts, in percent.
pub const VOLUME_MAX: u32 = 150;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum View {
    Auth,
    Feed,
    Player,
    Search,
    Queue,
}

impl View {
    pub(super) fn title(self) -> &'static str {
        match self {
            View::Auth => "auth",
            View::Feed => "feed",
            View::Player => "player",
            View::Search => "search",
            View::Queue => "queue",
        }
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Screen split: header row, content rows, status row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Layout {
    pub cols: u16,
    pub rows: u16,
}

impl Layout {
    pub(super) fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    pub(super) fn content_top(&self) -> u16 {
        1
    }

    pub(super) fn content_rows(&self) -> u16 {
        self.rows.saturating_sub(2)
    }

    pub(super) fn status_row(&self) -> u16 {
        self.rows.saturating_sub(1)
    }

    /// Video area of the player view: the content area minus `info_rows`
    /// rows at the bottom, `width_pct` of the width, centered.
    pub(super) fn video_region(&self, info_rows: u16, width_pct: u16) -> Option<Region> {
        let content = self.content_rows();
        let rows = if content > info_rows {
            content - info_rows
        } else {
            content
        };
        let cols = (u32::from(self.cols) * u32::from(width_pct) / 100) as u16;
        if rows == 0 || cols == 0 {
            return None;
        }
        Some(Region {
            row: self.content_top(),
            col: (self.cols - cols) / 2,
            rows,
            cols,
        })
    }

    /// First row below the video area.
    pub(super) fn info_top(&self, info_rows: u16) -> u16 {
        let content = self.content_rows();
        let video = if content > info_rows {
            content - info_rows
        } else {
            content
        };
        self.content_top() + video
    }

    /// Width of the feed list when a preview pane is shown beside it.
    pub(super) fn list_cols(&self) -> u16 {
        self.cols * 3 / 5
    }

    /// Cell area of the thumbnail preview: right of the list, 16:9-ish in
    /// cells roughly twice as tall as wide.
    pub(super) fn preview_region(&self) -> Option<Region> {
        let col = self.list_cols() + 2;
        let cols = self.cols.saturating_sub(col + 1);
        let max_rows = self.content_rows().saturating_sub(2);
        let rows = (u32::from(cols) * 9 / 32).min(u32::from(max_rows)) as u16;
        if cols < 4 || rows < 2 {
            return None;
        }
        Some(Region {
            row: self.content_top() + 1,
            col,
            rows,
            cols,
        })
    }
}

// ---------------------------------------------------------------------------
// Lists
// ---------------------------------------------------------------------------

/// Selection and scroll position in a list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct ListCursor {
    pub selected: usize,
    pub scroll: usize,
}

impl ListCursor {
    pub(super) fn up(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    pub(super) fn down(&mut self, len: usize) {
        if self.selected + 1 < len {
            self.selected += 1;
        }
    }

    pub(super) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Scroll so the selection is on screen and return the visible indices.
    pub(super) fn visible(&mut self, len: usize, rows: usize) -> Range<usize> {
        if len == 0 || rows == 0 {
            return 0..0;
        }
        self.selected = self.selected.min(len - 1);
        if self.selected < self.scroll {
            self.scroll = self.selected;
        } else if self.selected >= self.scroll + rows {
            self.scroll = self.selected + 1 - rows;
        }
        self.scroll..(self.scroll + rows).min(len)
    }
}

pub(super) struct FeedView {
    pub feed: Feed,
    pub cursor: ListCursor,
    /// "home" or the search query the feed came from.
    pub source: String,
    pub loading: bool,
    pub error: Option<String>,
}

impl FeedView {
    pub(super) fn new() -> Self {
        Self {
            feed: Feed::default(),
            cursor: ListCursor::default(),
            source: "home".into(),
            loading: false,
            error: None,
        }
    }

    /// Replace the list and select its first entry.
    pub(super) fn replace(&mut self, feed: Feed, source: String) {
        self.feed = feed;
        self.source = source;
        self.cursor.reset();
        self.loading = false;
        self.error = None;
    }

    pub(super) fn selected(&self) -> Option<&Video> {
        self.feed.videos.get(self.cursor.selected)
    }
}

// ---------------------------------------------------------------------------
// PlayQueue
// ---------------------------------------------------------------------------

/// Ordered list of videos to play, with a current entry.
///
/// `next` stops at the last entry; `prev` wraps to the last entry.
#[derive(Default)]
pub struct PlayQueue {
    items: Vec<Video>,
    current: Option<usize>,
    pub(super) cursor: ListCursor,
}

impl PlayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append. Returns false (and drops `video`) when the queue is full.
    /// The first entry pushed becomes current.
    pub fn push(&mut self, video: Video) -> bool {
        if self.items.len() >= QUEUE_MAX {
            return false;
        }
        self.items.push(video);
        if self.current.is_none() {
            self.current = Some(0);
        }
        true
    }

    /// Append and make it current.
    pub fn play_now(&mut self, video: Video) -> Option<&Video> {
        if !self.push(video) {
            return None;
        }
        self.current = Some(self.items.len() - 1);
        self.current()
    }

    pub fn current(&self) -> Option<&Video> {
        self.items.get(self.current?)
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Advance. `None` at the end of the queue, where the current entry
    /// stays put.
    pub fn next(&mut self) -> Option<&Video> {
        let cur = self.current?;
        if cur + 1 >= self.items.len() {
            return None;
        }
        self.current = Some(cur + 1);
        self.current()
    }

    /// Step back, wrapping from the first entry to the last.
    pub fn prev(&mut self) -> Option<&Video> {
        if self.items.is_empty() {
            return None;
        }
        let cur = self.current.unwrap_or(0);
        let prev = if cur == 0 { self.items.len() - 1 } else { cur - 1 };
        self.current = Some(prev);
        self.current()
    }

    /// Make entry `idx` current.
    pub fn jump(&mut self, idx: usize) -> Option<&Video> {
        if idx >= self.items.len() {
            return None;
        }
        self.current = Some(idx);
        self.current()
    }

    /// Shuffle. The current entry moves to the head and stays current; the
    /// rest are permuted behind it.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if self.items.len() < 2 {
            return;
        }
        let rest = match self.current {
            Some(cur) => {
                self.items.swap(0, cur);
                self.current = Some(0);
                1
            }
            None => 0,
        };
        self.items[rest..].shuffle(rng);
    }

    pub fn items(&self) -> &[Video] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Search / auth / player
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(super) struct SearchPrompt {
    pub query: String,
}

impl SearchPrompt {
    pub(super) fn push(&mut self, c: char) {
        if self.query.chars().count() < SEARCH_MAX {
            self.query.push(c);
        }
    }

    pub(super) fn pop(&mut self) {
        self.query.pop();
    }

    pub(super) fn take(&mut self) -> String {
        std::mem::take(&mut self.query)
    }
}

#[derive(Default)]
pub(super) struct AuthState {
    pub started: bool,
    /// A stored refresh token is being exchanged; no device code yet.
    pub refreshing: bool,
    pub code: Option<DeviceCode>,
    pub error: Option<String>,
}

pub(super) struct PlayerStatus {
    pub state: PlaybackState,
    pub position: f64,
    pub duration: f64,
    pub paused: bool,
    pub volume: u32,
}

impl PlayerStatus {
    pub(super) fn new() -> Self {
        Self {
            state: PlaybackState::Idle,
            position: 0.0,
            duration: 0.0,
            paused: false,
            volume: 100,
        }
    }

    /// Forget the previous video's position and duration.
    pub(super) fn reset(&mut self) {
        let volume = self.volume;
        *self = Self::new();
        self.volume = volume;
    }

    /// Fold one event in. Returns true on end of file.
    pub(super) fn apply(&mut self, ev: &PlayerEvent) -> bool {
        match *ev {
            PlayerEvent::State(s) => self.state = s,
            PlayerEvent::TimePos(t) => self.position = t,
            PlayerEvent::Duration(d) => self.duration = d,
            PlayerEvent::Paused(p) => self.paused = p,
            PlayerEvent::EndOfFile => return true,
        }
        false
    }

    /// New volume after a step of `delta` percent, within 0..=VOLUME_MAX.
    pub(super) fn stepped_volume(&self, delta: i64) -> u32 {
        (i64::from(self.volume) + delta).clamp(0, i64::from(VOLUME_MAX)) as u32
    }
}

/// `width` cells of `=` (played) and `-` (remaining).
pub(super) fn progress_bar(position: f64, duration: f64, width: usize) -> String {
    let filled = if duration > 0.0 {
        ((position / duration) * width as f64).clamp(0.0, width as f64) as usize
    } else {
        0
    };
    let mut bar = "=".repeat(filled);
    bar.push_str(&"-".repeat(width - filled));
    bar
}
