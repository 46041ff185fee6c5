//! Terminal I/O layer: raw mode, Kitty preview image, text views, status bar.
//!
//! Drawing functions write into the caller's locked output (see
//! [`crate::compositor::lock_output`]) and never flush; the caller flushes
//! once per redraw.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use crossterm::{
    ExecutableCommand, QueueableCommand, cursor,
    style::{self, Stylize},
    terminal,
};
use std::io::{self, Write, stdout};

use super::state::{AuthState, FeedView, Layout, PlayQueue, PlayerStatus, progress_bar};
use crate::compositor::geometry::Region;
use crate::engine::PlaybackState;
use crate::model::{Video, format_clock};

const CHUNK_SIZE: usize = 4096;

/// Begin/end a synchronized update so a redraw lands in one repaint.
pub(super) const SYNC_BEGIN: &str = "\x1b[?2026h";
pub(super) const SYNC_END: &str = "\x1b[?2026l";

// ---------------------------------------------------------------------------
// RawGuard: restores the terminal on Drop
// ---------------------------------------------------------------------------

pub(super) struct RawGuard {
    cleaned: bool,
}

impl RawGuard {
    pub(super) fn enter() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        stdout().execute(terminal::EnterAlternateScreen)?;
        stdout().execute(cursor::Hide)?;
        Ok(Self { cleaned: false })
    }

    pub(super) fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        let mut out = stdout();
        let _ = write!(out, "\x1b_Ga=d,d=A,q=2\x1b\\");
        let _ = out.execute(cursor::Show);
        let _ = out.execute(terminal::LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ---------------------------------------------------------------------------
// Kitty protocol helpers
// ---------------------------------------------------------------------------

/// Transmit raw RGBA pixels in chunks (a=t: store only, no placement).
pub(super) fn send_image(
    out: &mut dyn Write,
    rgba: &[u8],
    width: u32,
    height: u32,
    image_id: u32,
) -> io::Result<()> {
    let encoded = BASE64.encode(rgba);
    // base64 output is ASCII, so any byte split is a char boundary
    let chunks: Vec<&[u8]> = encoded.as_bytes().chunks(CHUNK_SIZE).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        let m = if i + 1 == chunks.len() { 0 } else { 1 };
        if i == 0 {
            write!(
                out,
                "\x1b_Ga=t,f=32,s={width},v={height},i={image_id},t=d,q=2,m={m};"
            )?;
        } else {
            write!(out, "\x1b_Gm={m},q=2;")?;
        }
        out.write_all(chunk)?;
        out.write_all(b"\x1b\\")?;
    }
    Ok(())
}

/// Place a transmitted image scaled into `region`.
pub(super) fn place_image(out: &mut dyn Write, image_id: u32, region: Region) -> io::Result<()> {
    out.queue(cursor::MoveTo(region.col, region.row))?;
    write!(
        out,
        "\x1b_Ga=p,i={image_id},c={},r={},C=1,q=2\x1b\\",
        region.cols, region.rows
    )
}

/// Delete an image's data and placements.
pub(super) fn delete_image(out: &mut dyn Write, image_id: u32) -> io::Result<()> {
    write!(out, "\x1b_Ga=d,d=I,i={image_id},q=2\x1b\\")
}

/// Clear the text layer.
pub(super) fn clear_screen(out: &mut dyn Write) -> io::Result<()> {
    out.queue(terminal::Clear(terminal::ClearType::All))?;
    Ok(())
}

/// Blank rows `from..to`.
pub(super) fn clear_rows(out: &mut dyn Write, from: u16, to: u16) -> io::Result<()> {
    for row in from..to {
        out.queue(cursor::MoveTo(0, row))?;
        out.queue(terminal::Clear(terminal::ClearType::CurrentLine))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// At most `max` chars of `s`.
fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn pad(s: &str, width: usize) -> String {
    let mut t = truncate(s, width);
    let len = t.chars().count();
    t.extend(std::iter::repeat_n(' ', width - len));
    t
}

pub(super) fn draw_header(out: &mut dyn Write, layout: &Layout, title: &str) -> io::Result<()> {
    out.queue(cursor::MoveTo(0, 0))?;
    out.queue(terminal::Clear(terminal::ClearType::CurrentLine))?;
    write!(out, "{}", " \u{25b6} ytview ".on_dark_red().white().bold())?;
    let rest = layout.cols.saturating_sub(10) as usize;
    write!(out, " {}", truncate(title, rest).grey())?;
    Ok(())
}

/// Status bar on the last row: `left` hints or message, `right` aligned
/// to the right edge.
pub(super) fn draw_status_bar(
    out: &mut dyn Write,
    layout: &Layout,
    left: &str,
    right: Option<&str>,
) -> io::Result<()> {
    out.queue(cursor::MoveTo(0, layout.status_row()))?;
    let width = layout.cols as usize;
    let line = match right {
        Some(r) => {
            let r_len = r.chars().count() + 1;
            let l = pad(&format!(" {left}"), width.saturating_sub(r_len));
            format!("{l}{r} ")
        }
        None => format!(" {left}"),
    };
    write!(out, "{}", pad(&line, width).on_dark_grey().white())?;
    out.queue(style::ResetColor)?;
    Ok(())
}

fn video_line(v: &Video, width: usize) -> String {
    let dur = v.duration_label();
    let head = format!("{} - {}", v.title, v.channel);
    let head_w = width.saturating_sub(dur.chars().count() + 3);
    format!("{}  {dur}", pad(&head, head_w))
}

/// Feed list in the left part of the content area.
pub(super) fn draw_feed(
    out: &mut dyn Write,
    layout: &Layout,
    feed: &mut FeedView,
    list_cols: u16,
) -> io::Result<()> {
    let top = layout.content_top();
    let width = list_cols as usize;
    if feed.feed.is_empty() {
        out.queue(cursor::MoveTo(2, top + 1))?;
        let msg = if let Some(e) = &feed.error {
            format!("feed failed: {e}").red().to_string()
        } else if feed.loading {
            "loading feed...".grey().to_string()
        } else {
            "no videos".grey().to_string()
        };
        write!(out, "{msg}")?;
        return Ok(());
    }

    let rows = layout.content_rows() as usize;
    let range = feed.cursor.visible(feed.feed.len(), rows);
    for (line, idx) in range.enumerate() {
        let v = &feed.feed.videos[idx];
        out.queue(cursor::MoveTo(0, top + line as u16))?;
        let text = video_line(v, width.saturating_sub(2));
        if idx == feed.cursor.selected {
            write!(out, "{}", format!("> {text}").on_dark_blue().white())?;
        } else {
            write!(out, "  {text}")?;
        }
    }
    Ok(())
}

/// Title, channel and views of the selected video under the preview.
pub(super) fn draw_feed_details(
    out: &mut dyn Write,
    video: &Video,
    region: Region,
) -> io::Result<()> {
    let width = region.cols as usize;
    let row = region.row + region.rows + 1;
    out.queue(cursor::MoveTo(region.col, row))?;
    write!(out, "{}", truncate(&video.title, width).white().bold())?;
    out.queue(cursor::MoveTo(region.col, row + 1))?;
    write!(out, "{}", truncate(&video.channel, width).cyan())?;
    if let Some(n) = video.view_count {
        out.queue(cursor::MoveTo(region.col, row + 2))?;
        write!(out, "{}", format!("{n} views").grey())?;
    }
    Ok(())
}

pub(super) fn draw_queue(out: &mut dyn Write, layout: &Layout, queue: &mut PlayQueue) -> io::Result<()> {
    let top = layout.content_top();
    if queue.is_empty() {
        out.queue(cursor::MoveTo(2, top + 1))?;
        write!(out, "{}", "queue is empty (a: add from feed)".grey())?;
        return Ok(());
    }
    let width = (layout.cols as usize).saturating_sub(8);
    let current = queue.current_index();
    let len = queue.len();
    let rows = layout.content_rows() as usize;
    let range = queue.cursor.visible(len, rows);
    let selected = queue.cursor.selected;
    for (line, idx) in range.enumerate() {
        let v = &queue.items()[idx];
        out.queue(cursor::MoveTo(0, top + line as u16))?;
        let marker = if Some(idx) == current { '>' } else { ' ' };
        let text = format!("{marker} [{:>3}] {}", idx + 1, video_line(v, width));
        if idx == selected {
            write!(out, "{}", text.on_dark_blue().white())?;
        } else if Some(idx) == current {
            write!(out, "{}", text.on_dark_green().white())?;
        } else {
            write!(out, "{text}")?;
        }
    }
    Ok(())
}

pub(super) fn draw_search(out: &mut dyn Write, layout: &Layout, query: &str) -> io::Result<()> {
    let row = layout.content_top() + 1;
    out.queue(cursor::MoveTo(2, row))?;
    write!(out, "search: ")?;
    let width = (layout.cols as usize).saturating_sub(12);
    let shown: String = {
        // keep the tail visible while typing
        let n = query.chars().count();
        query.chars().skip(n.saturating_sub(width)).collect()
    };
    write!(out, "{}{}", shown.white().bold(), "_".dark_grey())?;
    Ok(())
}

pub(super) fn draw_auth(out: &mut dyn Write, layout: &Layout, auth: &AuthState) -> io::Result<()> {
    let top = layout.content_top() + 1;
    out.queue(cursor::MoveTo(2, top))?;
    if let Some(err) = &auth.error {
        write!(out, "{} {err}", "sign-in failed:".red())?;
        out.queue(cursor::MoveTo(2, top + 2))?;
        write!(out, "{}", "r: retry   esc: continue without signing in".grey())?;
    } else if let Some(code) = &auth.code {
        write!(out, "go to:      {}", code.verification_url.as_str().cyan())?;
        out.queue(cursor::MoveTo(2, top + 2))?;
        write!(out, "enter code: {}", code.user_code.as_str().yellow().bold())?;
    } else if auth.refreshing {
        write!(out, "{}", "refreshing sign-in...".grey())?;
    } else {
        write!(out, "{}", "requesting device code...".grey())?;
    }
    Ok(())
}

/// Title, channel and transport line below the video area.
pub(super) fn draw_player_info(
    out: &mut dyn Write,
    layout: &Layout,
    top: u16,
    current: Option<&Video>,
    status: &PlayerStatus,
) -> io::Result<()> {
    clear_rows(out, top, layout.status_row())?;
    let width = (layout.cols as usize).saturating_sub(4);
    out.queue(cursor::MoveTo(2, top))?;
    let Some(v) = current else {
        write!(out, "{}", "no video selected".grey())?;
        return Ok(());
    };
    write!(out, "{}", truncate(&v.title, width).white().bold())?;

    if top + 1 < layout.status_row() {
        out.queue(cursor::MoveTo(2, top + 1))?;
        write!(out, "{}", truncate(&v.channel, width).cyan())?;
        if let Some(n) = v.view_count {
            write!(out, "{}", format!(" | {n} views").grey())?;
        }
    }

    if top + 2 < layout.status_row() {
        out.queue(cursor::MoveTo(2, top + 2))?;
        let state = match (status.state, status.paused) {
            (PlaybackState::Loading, _) => "loading",
            (_, true) => "paused ",
            (PlaybackState::Stopped, _) => "stopped",
            _ => "playing",
        };
        let bar_w = (layout.cols as usize).saturating_sub(44).max(10);
        let line = format!(
            "{state}  {} / {}  [{}]  vol: {}%",
            format_clock(status.position),
            format_clock(status.duration),
            progress_bar(status.position, status.duration, bar_w),
            status.volume
        );
        write!(out, "{}", truncate(&line, width).yellow())?;
    }
    Ok(())
}

pub(super) fn check_tty() -> anyhow::Result<()> {
    use std::io::IsTerminal;
    // Only stdout matters. crossterm's `use-dev-tty` reads keyboard from /dev/tty,
    // so stdin being a pipe is always fine.
    if !io::stdout().is_terminal() {
        anyhow::bail!(
            "ytv requires an interactive terminal.\n\
             \n\
             Supported terminals: Kitty, Ghostty, WezTerm (Kitty graphics + shared memory)\n\
             To check a terminal, run: ytv testcard"
        );
    }
    Ok(())
}
