//! Terminal checks that run without the network: `ytv testcard` and
//! `ytv probe`.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use anyhow::Context;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use log::info;

use super::state::Layout;
use super::terminal;
use crate::compositor::geometry::{GeometrySource, RenderGeometry, TerminalGeometry};
use crate::compositor::{self, Compositor};
use crate::config::Config;
use crate::engine::testcard::TestCard;
use crate::engine::{DecodeEngine, PlayerEvent};

const STATUS_INTERVAL: Duration = Duration::from_millis(250);

/// Play colour bars through the compositor for `seconds`, then print the
/// frame count and average rate. `q` or Esc ends early.
pub fn testcard(config: &Config, seconds: u64) -> anyhow::Result<()> {
    terminal::check_tty()?;
    let (cols, rows) = crossterm::terminal::size().context("failed to get terminal size")?;
    let layout = Layout::new(cols, rows);
    let ui = &config.ui;
    let region = layout
        .video_region(ui.info_rows, ui.video_width_pct)
        .context("terminal too small for the test card")?;

    let mut card = TestCard::new(
        30,
        Duration::from_secs(seconds),
        config.channels.player_events,
    );
    let output = compositor::shared_output(io::stdout());
    let mut guard = terminal::RawGuard::enter()?;

    let mut comp = Compositor::init(
        &mut card,
        &TerminalGeometry,
        region,
        output.clone(),
        &config.render.compositor_config(),
    )?;
    card.load("testcard://bars")?;

    let started = Instant::now();
    let mut last_status: Option<Instant> = None;
    'run: loop {
        while let Some(ev) = card.poll_event() {
            if ev == PlayerEvent::EndOfFile {
                break 'run;
            }
        }
        if event::poll(Duration::from_millis(50))?
            && let Event::Key(key) = event::read()?
            && key.kind != KeyEventKind::Release
            && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
        {
            break;
        }
        if last_status.is_none_or(|t| t.elapsed() >= STATUS_INTERVAL) {
            let g = comp.geometry();
            let right = format!("{}x{} {} fps", g.width, g.height, comp.fps());
            let left = format!(
                "testcard {:.0}/{seconds}s | q:quit",
                started.elapsed().as_secs_f64()
            );
            let mut out = compositor::lock_output(&output);
            terminal::draw_status_bar(&mut **out, &layout, &left, Some(&right))?;
            out.flush()?;
            last_status = Some(Instant::now());
        }
    }

    let frames = comp.frames_rendered();
    let elapsed = started.elapsed().as_secs_f64();
    card.stop();
    let teardown = comp.shutdown();
    guard.cleanup();
    teardown?;

    let avg = if elapsed > 0.0 {
        frames as f64 / elapsed
    } else {
        0.0
    };
    info!("testcard: {frames} frames in {elapsed:.1}s");
    eprintln!("testcard: {frames} frames in {elapsed:.1}s ({avg:.1} fps)");
    Ok(())
}

/// Print what the terminal reports and the resolution the player would use.
pub fn probe(config: &Config) -> anyhow::Result<()> {
    let (cols, rows) = crossterm::terminal::size().context("failed to get terminal size")?;
    println!("terminal: {cols}x{rows} cells");
    let cell = match TerminalGeometry.cell_size() {
        Ok(cell) => cell,
        Err(e) => anyhow::bail!("no pixel geometry: {e}"),
    };
    println!("cell: {}x{} px", cell.width, cell.height);

    let ui = &config.ui;
    let region = Layout::new(cols, rows)
        .video_region(ui.info_rows, ui.video_width_pct)
        .context("terminal too small for video")?;
    let g = RenderGeometry::compute(
        cell,
        region,
        config.render.max_width,
        config.render.max_height,
    )?;
    println!(
        "video: {}x{} cells at ({}, {}) -> {}x{} px ({} bytes/frame)",
        region.cols,
        region.rows,
        region.col,
        region.row,
        g.width,
        g.height,
        g.frame_len()
    );
    println!("shm: {}", config.render.shm_dir.display());
    Ok(())
}
