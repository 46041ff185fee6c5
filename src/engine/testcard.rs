//! Synthetic decode engine: scrolling colour bars at a fixed frame rate.
//!
//! Used by `ytv testcard` to check a terminal without network access, and by
//! tests as the compositor's collaborator. Frames are painted as `rgb0` with
//! the padding byte left at zero, like a real software decoder.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info};

use super::{
    BYTES_PER_PIXEL, DecodeEngine, FrameReadyFn, PlaybackState, PlayerEvent, RenderTarget,
    TargetSpec,
};
use crate::error::EngineError;
use crate::spsc::{self, Consumer, SharedProducer};

const BARS: [[u8; 3]; 8] = [
    [192, 192, 192],
    [192, 192, 0],
    [0, 192, 192],
    [0, 192, 0],
    [192, 0, 192],
    [192, 0, 0],
    [0, 0, 192],
    [16, 16, 16],
];

#[derive(Default)]
struct CardShared {
    frame: AtomicU64,
    paused: AtomicBool,
    stop: AtomicBool,
    callback: Mutex<Option<FrameReadyFn>>,
}

pub struct TestCard {
    fps: u32,
    total_frames: u64,
    shared: Arc<CardShared>,
    events_tx: SharedProducer<PlayerEvent>,
    events_rx: Consumer<PlayerEvent>,
    pacer: Option<JoinHandle<()>>,
    volume: u32,
}

impl TestCard {
    /// A card that plays for `duration` at `fps` frames per second, then
    /// reports end of file. Events are buffered up to `event_cap`.
    pub fn new(fps: u32, duration: Duration, event_cap: usize) -> Self {
        let fps = fps.max(1);
        let (tx, rx) = spsc::channel("player-events", event_cap);
        Self {
            fps,
            total_frames: (duration.as_secs_f64() * fps as f64).round() as u64,
            shared: Arc::new(CardShared::default()),
            events_tx: SharedProducer::new(tx),
            events_rx: rx,
            pacer: None,
            volume: 100,
        }
    }

    /// Frames emitted since the last load.
    pub fn frames_emitted(&self) -> u64 {
        self.shared.frame.load(Ordering::Acquire)
    }

    fn position(&self) -> f64 {
        self.frames_emitted() as f64 / self.fps as f64
    }

    fn join_pacer(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.pacer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TestCard {
    fn drop(&mut self) {
        self.join_pacer();
    }
}

fn pace(shared: Arc<CardShared>, events: SharedProducer<PlayerEvent>, fps: u32, total: u64) {
    let period = Duration::from_secs_f64(1.0 / fps as f64);
    let mut next = Instant::now() + period;
    while !shared.stop.load(Ordering::Acquire) {
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        }
        next += period;
        if shared.paused.load(Ordering::Acquire) {
            continue;
        }
        let frame = shared.frame.fetch_add(1, Ordering::AcqRel) + 1;
        let cb = shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(cb) = cb {
            cb();
        }
        if frame % fps as u64 == 0 {
            events.push_or_drop(PlayerEvent::TimePos(frame as f64 / fps as f64));
        }
        if frame >= total {
            debug!("testcard: reached end after {frame} frames");
            events.push_or_drop(PlayerEvent::EndOfFile);
            events.push_or_drop(PlayerEvent::State(PlaybackState::Stopped));
            break;
        }
    }
}

impl DecodeEngine for TestCard {
    fn name(&self) -> &'static str {
        "testcard"
    }

    fn register_render_target(
        &mut self,
        spec: TargetSpec,
    ) -> Result<Box<dyn RenderTarget>, EngineError> {
        spec.validate()?;
        info!("testcard: render target {}x{}", spec.width, spec.height);
        Ok(Box::new(CardTarget {
            shared: Arc::clone(&self.shared),
            spec,
        }))
    }

    fn load(&mut self, url: &str) -> Result<(), EngineError> {
        self.join_pacer();
        let stale = self.discard_events();
        debug!("testcard: load {url} ({stale} stale events dropped)");
        self.shared.frame.store(0, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
        self.shared.stop.store(false, Ordering::Release);

        self.events_tx
            .push_or_drop(PlayerEvent::State(PlaybackState::Loading));
        self.events_tx.push_or_drop(PlayerEvent::Duration(
            self.total_frames as f64 / self.fps as f64,
        ));
        self.events_tx
            .push_or_drop(PlayerEvent::State(PlaybackState::Playing));

        let shared = Arc::clone(&self.shared);
        let events = self.events_tx.clone();
        let (fps, total) = (self.fps, self.total_frames);
        let handle = thread::Builder::new()
            .name("ytview-testcard".into())
            .spawn(move || pace(shared, events, fps, total))
            .map_err(|source| EngineError::Spawn {
                program: "testcard".into(),
                source,
            })?;
        self.pacer = Some(handle);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        if self.pacer.is_none() {
            return Err(EngineError::NotLoaded);
        }
        self.shared.paused.store(true, Ordering::Release);
        self.events_tx.push_or_drop(PlayerEvent::Paused(true));
        Ok(())
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        if self.pacer.is_none() {
            return Err(EngineError::NotLoaded);
        }
        self.shared.paused.store(false, Ordering::Release);
        self.events_tx.push_or_drop(PlayerEvent::Paused(false));
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    fn seek(&mut self, delta_secs: f64) -> Result<(), EngineError> {
        if self.pacer.is_none() {
            return Err(EngineError::NotLoaded);
        }
        let target = (self.position() + delta_secs).max(0.0);
        let frame = ((target * self.fps as f64) as u64).min(self.total_frames.saturating_sub(1));
        self.shared.frame.store(frame, Ordering::Release);
        self.events_tx
            .push_or_drop(PlayerEvent::TimePos(frame as f64 / self.fps as f64));
        Ok(())
    }

    fn stop(&mut self) {
        if self.pacer.is_some() {
            self.join_pacer();
            self.events_tx
                .push_or_drop(PlayerEvent::State(PlaybackState::Stopped));
        }
    }

    fn set_volume(&mut self, pct: u32) {
        self.volume = pct;
    }

    fn poll_event(&mut self) -> Option<PlayerEvent> {
        self.events_rx.pop()
    }
}

struct CardTarget {
    shared: Arc<CardShared>,
    spec: TargetSpec,
}

impl RenderTarget for CardTarget {
    fn set_frame_ready_callback(&mut self, cb: FrameReadyFn) {
        *self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cb);
    }

    fn render_into(&mut self, buf: &mut [u8], stride: usize) -> Result<(), EngineError> {
        let frame = self.shared.frame.load(Ordering::Acquire);
        paint_bars(buf, self.spec.width, self.spec.height, stride, frame)
    }
}

impl Drop for CardTarget {
    fn drop(&mut self) {
        *self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Eight vertical bars scrolling left by 4 px per frame; padding byte zero.
pub(crate) fn paint_bars(
    buf: &mut [u8],
    width: u32,
    height: u32,
    stride: usize,
    frame: u64,
) -> Result<(), EngineError> {
    let w = width as usize;
    let h = height as usize;
    let row = w * BYTES_PER_PIXEL;
    let expected = stride * h.saturating_sub(1) + row;
    if buf.len() < expected || stride < row {
        return Err(EngineError::BufferTooSmall {
            expected,
            actual: buf.len(),
        });
    }
    let bar_w = w.div_ceil(BARS.len()).max(1);
    let shift = (frame as usize * 4) % w.max(1);
    for y in 0..h {
        let line = &mut buf[y * stride..y * stride + row];
        for (x, px) in line.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
            let [r, g, b] = BARS[((x + shift) % w) / bar_w % BARS.len()];
            px.copy_from_slice(&[r, g, b, 0]);
        }
    }
    Ok(())
}
