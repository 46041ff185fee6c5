//! Frame compositor: decoded video to Kitty graphics over shared memory.
//!
//! Lifecycle:
//!   init      geometry -> clamp -> two shm buffers -> engine render target
//!             -> pre-built frame commands -> frame-ready callback -> thread
//!   running   the compositor thread polls the frame-ready flag; on a frame
//!             it blits into the off-screen buffer, forces opacity, writes
//!             that buffer's command under the output lock, then hands off
//!   shutdown  stop + join, delete both images, release the render target,
//!             clear the region, unmap + unlink both buffers
//!
//! The output stream is shared with the UI thread. Every write from either
//! side holds [`SharedOutput`]'s mutex, so escape sequences never interleave.

pub mod fps;
pub mod geometry;
pub mod kitty;
pub mod shm;

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::engine::{DecodeEngine, PixelFormat, RenderTarget, TargetSpec};
use crate::error::{EngineError, RenderError, RenderInitError, ShutdownPartial};

use fps::FpsCounter;
use geometry::{GeometrySource, Region, RenderGeometry};
use kitty::FrameCommands;
use shm::{BufferPair, ImageSlot};

/// Output stream shared by the UI thread and the compositor thread.
pub type SharedOutput = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn shared_output<W: Write + Send + 'static>(w: W) -> SharedOutput {
    Arc::new(Mutex::new(Box::new(w)))
}

/// Hold the output lock for a run of writes.
pub fn lock_output(out: &SharedOutput) -> MutexGuard<'_, Box<dyn Write + Send>> {
    out.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug)]
pub struct CompositorConfig {
    pub max_width: u32,
    pub max_height: u32,
    /// Sleep between frame-ready checks.
    pub poll_interval: Duration,
    /// Directory holding the shared-memory segments (tmpfs).
    pub shm_dir: PathBuf,
    /// Segment file name prefix: `<prefix>_frame_0`, `<prefix>_frame_1`.
    pub shm_prefix: String,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
            poll_interval: Duration::from_micros(500),
            shm_dir: PathBuf::from("/dev/shm"),
            shm_prefix: "ytview".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Renderer: everything one frame needs, owned by the compositor thread
// ---------------------------------------------------------------------------

pub struct Renderer {
    geometry: RenderGeometry,
    buffers: BufferPair,
    commands: FrameCommands,
    target: Box<dyn RenderTarget>,
    output: SharedOutput,
    frame_ready: Arc<AtomicBool>,
    fps: FpsCounter,
}

impl Renderer {
    /// Acquire every resource a compositor needs. On error, whatever was
    /// acquired so far has already been released.
    pub fn new(
        engine: &mut dyn DecodeEngine,
        geometry_source: &dyn GeometrySource,
        region: Region,
        output: SharedOutput,
        cfg: &CompositorConfig,
    ) -> Result<Self, RenderInitError> {
        let cell = geometry_source
            .cell_size()
            .map_err(RenderInitError::Geometry)?;
        let geometry = RenderGeometry::compute(cell, region, cfg.max_width, cfg.max_height)?;
        info!(
            "compositor: region {}x{} cells at ({},{}), {}x{} px/cell -> {}x{}",
            region.cols,
            region.rows,
            region.col,
            region.row,
            cell.width,
            cell.height,
            geometry.width,
            geometry.height
        );

        let buffers = BufferPair::create(&cfg.shm_dir, &cfg.shm_prefix, geometry.frame_len())?;

        let mut target = engine.register_render_target(TargetSpec {
            width: geometry.width,
            height: geometry.height,
            format: PixelFormat::Rgb0,
            stride: geometry.stride,
        })?;

        let commands = FrameCommands::build(&geometry, |slot| buffers.path(slot));

        let frame_ready = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&frame_ready);
        target.set_frame_ready_callback(Arc::new(move || flag.store(true, Ordering::Release)));

        Ok(Self {
            geometry,
            buffers,
            commands,
            target,
            output,
            frame_ready,
            fps: FpsCounter::new(Instant::now()),
        })
    }

    pub fn geometry(&self) -> &RenderGeometry {
        &self.geometry
    }

    /// Clear the frame-ready flag, returning whether it was set.
    pub fn take_frame_ready(&self) -> bool {
        self.frame_ready.swap(false, Ordering::AcqRel)
    }

    /// Composite one frame into the off-screen buffer and announce it.
    ///
    /// Returns the slot now on screen. On error nothing is handed off and
    /// the next call writes the same buffer again.
    pub fn render_frame(&mut self) -> Result<ImageSlot, RenderError> {
        let g = self.geometry;
        let mut guard = self.buffers.begin_write();
        let slot = guard.slot();
        self.target.render_into(guard.buffer(), g.stride)?;
        shm::force_opaque(guard.buffer(), g.width, g.height, g.stride);
        {
            let mut out = lock_output(&self.output);
            out.write_all(self.commands.for_slot(slot))?;
            out.flush()?;
        }
        guard.handoff();
        self.fps.record_frame();
        Ok(slot)
    }

    pub fn poll_fps(&mut self, now: Instant) -> Option<u32> {
        self.fps.poll(now)
    }

    /// Best-effort teardown after the thread has stopped, in order: delete
    /// both images, release the render target, clear the region, unmap and
    /// unlink both buffers.
    fn teardown(self, failures: &mut Vec<String>) {
        let Renderer {
            geometry,
            buffers,
            target,
            output,
            ..
        } = self;

        {
            let mut out = lock_output(&output);
            if let Err(e) = out
                .write_all(kitty::delete_frames_command().as_bytes())
                .and_then(|()| out.flush())
            {
                warn!("compositor: delete images failed: {e}");
                failures.push(format!("delete images: {e}"));
            }
        }

        drop(target);
        debug!("compositor: render target released");

        {
            let mut out = lock_output(&output);
            if let Err(e) = out
                .write_all(kitty::clear_region_command(&geometry).as_bytes())
                .and_then(|()| out.flush())
            {
                warn!("compositor: clear region failed: {e}");
                failures.push(format!("clear region: {e}"));
            }
        }

        for (path, e) in buffers.close() {
            warn!("compositor: unlink {} failed: {e}", path.display());
            failures.push(format!("unlink {}: {e}", path.display()));
        }
    }
}

fn render_loop(
    mut renderer: Renderer,
    stop: &AtomicBool,
    poll_interval: Duration,
    fps_out: &AtomicU32,
    frames_out: &AtomicU64,
) -> Renderer {
    debug!("compositor: thread started");
    while !stop.load(Ordering::Acquire) {
        if renderer.take_frame_ready() {
            match renderer.render_frame() {
                Ok(_) => {
                    frames_out.fetch_add(1, Ordering::Relaxed);
                }
                Err(RenderError::Blit(EngineError::NoFrame)) => {}
                Err(e) => warn!("compositor: frame skipped: {e}"),
            }
        } else {
            thread::sleep(poll_interval);
        }
        if let Some(fps) = renderer.poll_fps(Instant::now()) {
            fps_out.store(fps, Ordering::Relaxed);
        }
    }
    debug!("compositor: thread stopping");
    renderer
}

// ---------------------------------------------------------------------------
// Compositor: the running thread plus its shutdown sequence
// ---------------------------------------------------------------------------

pub struct Compositor {
    geometry: RenderGeometry,
    stop: Arc<AtomicBool>,
    fps: Arc<AtomicU32>,
    frames: Arc<AtomicU64>,
    thread: Option<JoinHandle<Renderer>>,
}

impl Compositor {
    /// Initialize and start compositing `engine`'s frames into `region`.
    pub fn init(
        engine: &mut dyn DecodeEngine,
        geometry_source: &dyn GeometrySource,
        region: Region,
        output: SharedOutput,
        cfg: &CompositorConfig,
    ) -> Result<Self, RenderInitError> {
        let renderer = Renderer::new(engine, geometry_source, region, output, cfg)?;
        Self::start(renderer, cfg.poll_interval)
    }

    /// Move `renderer` onto its own thread.
    pub fn start(renderer: Renderer, poll_interval: Duration) -> Result<Self, RenderInitError> {
        let geometry = *renderer.geometry();
        let stop = Arc::new(AtomicBool::new(false));
        let fps = Arc::new(AtomicU32::new(0));
        let frames = Arc::new(AtomicU64::new(0));

        let (s, f, n) = (Arc::clone(&stop), Arc::clone(&fps), Arc::clone(&frames));
        // If spawning fails the closure, and the renderer with it, is dropped,
        // which unlinks the buffers and releases the target.
        let thread = thread::Builder::new()
            .name("ytview-compositor".into())
            .spawn(move || render_loop(renderer, &s, poll_interval, &f, &n))
            .map_err(RenderInitError::Spawn)?;

        Ok(Self {
            geometry,
            stop,
            fps,
            frames,
            thread: Some(thread),
        })
    }

    pub fn geometry(&self) -> &RenderGeometry {
        &self.geometry
    }

    /// Frames per second over the last completed second.
    pub fn fps(&self) -> u32 {
        self.fps.load(Ordering::Relaxed)
    }

    /// Frames successfully composited since init.
    pub fn frames_rendered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stop the thread and release everything. Every step runs even when an
    /// earlier one fails. Calling it again is a no-op.
    pub fn shutdown(&mut self) -> Result<(), ShutdownPartial> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };
        let mut failures = Vec::new();
        self.stop.store(true, Ordering::Release);
        match handle.join() {
            Ok(renderer) => renderer.teardown(&mut failures),
            Err(_) => {
                error!("compositor: thread panicked; resources dropped during unwind");
                failures.push("join compositor thread: panicked".into());
            }
        }
        info!(
            "compositor: shut down after {} frames",
            self.frames.load(Ordering::Relaxed)
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownPartial { failures })
        }
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("compositor: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testcard::TestCard;
    use geometry::{CellSize, FixedGeometry};

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Accepts writes until `broken` is set, then fails every one.
    #[derive(Clone, Default)]
    struct Breakable {
        broken: Arc<AtomicBool>,
        attempts: Arc<AtomicU64>,
        data: Sink,
    }

    impl Write for Breakable {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("terminal went away"));
            }
            self.data.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn wait_for(what: &str, done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn cfg(dir: &std::path::Path) -> CompositorConfig {
        CompositorConfig {
            shm_dir: dir.to_path_buf(),
            shm_prefix: "test".into(),
            ..CompositorConfig::default()
        }
    }

    fn region() -> Region {
        Region {
            row: 1,
            col: 2,
            rows: 4,
            cols: 8,
        }
    }

    fn geometry_source() -> FixedGeometry {
        FixedGeometry(CellSize {
            width: 4,
            height: 8,
        })
    }

    #[test]
    fn renders_alternate_and_are_opaque() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Sink::default();
        let mut card = TestCard::new(30, Duration::from_secs(60), 16);
        let mut r = Renderer::new(
            &mut card,
            &geometry_source(),
            region(),
            shared_output(sink.clone()),
            &cfg(dir.path()),
        )
        .unwrap();
        assert_eq!((r.geometry().width, r.geometry().height), (32, 32));

        let mut prev = None;
        for _ in 0..10 {
            let slot = r.render_frame().unwrap();
            assert_ne!(Some(slot), prev);
            prev = Some(slot);
        }
        let data = std::fs::read(dir.path().join("test_frame_0")).unwrap();
        assert_eq!(data.len(), 32 * 32 * 4);
        assert!(data.chunks_exact(4).all(|px| px[3] == 0xFF));

        let written = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert_eq!(written.matches("\x1b[?2026h").count(), 10);
        assert!(written.starts_with("\x1b[?2026h\x1b[2;3H\x1b_Ga=T,q=2,f=32,s=32,v=32,i=1,"));
    }

    #[test]
    fn init_failure_leaves_no_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut card = TestCard::new(30, Duration::from_secs(1), 4);
        let bad = Region {
            rows: 0,
            ..region()
        };
        let err = Renderer::new(
            &mut card,
            &geometry_source(),
            bad,
            shared_output(Sink::default()),
            &cfg(dir.path()),
        );
        assert!(matches!(err, Err(RenderInitError::Geometry(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Refuses every render target.
    struct Refusing;

    impl DecodeEngine for Refusing {
        fn name(&self) -> &'static str {
            "refusing"
        }
        fn register_render_target(
            &mut self,
            spec: TargetSpec,
        ) -> Result<Box<dyn RenderTarget>, EngineError> {
            Err(EngineError::UnsupportedTarget {
                width: spec.width,
                height: spec.height,
                stride: spec.stride,
            })
        }
        fn load(&mut self, _url: &str) -> Result<(), EngineError> {
            Ok(())
        }
        fn pause(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
        fn resume(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
        fn is_paused(&self) -> bool {
            false
        }
        fn seek(&mut self, _delta_secs: f64) -> Result<(), EngineError> {
            Ok(())
        }
        fn stop(&mut self) {}
        fn set_volume(&mut self, _pct: u32) {}
        fn poll_event(&mut self) -> Option<crate::engine::PlayerEvent> {
            None
        }
    }

    #[test]
    fn engine_refusal_releases_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let err = Renderer::new(
            &mut Refusing,
            &geometry_source(),
            region(),
            shared_output(Sink::default()),
            &cfg(dir.path()),
        );
        assert!(matches!(err, Err(RenderInitError::Engine(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn shutdown_deletes_images_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Sink::default();
        let mut card = TestCard::new(120, Duration::from_secs(60), 64);
        let mut comp = Compositor::init(
            &mut card,
            &geometry_source(),
            region(),
            shared_output(sink.clone()),
            &cfg(dir.path()),
        )
        .unwrap();
        card.load("testcard://").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while comp.frames_rendered() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(comp.frames_rendered() >= 5);

        comp.shutdown().unwrap();
        assert!(!comp.is_running());
        assert!(comp.shutdown().is_ok());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let written = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(written.contains(&kitty::delete_frames_command()));
    }

    #[test]
    fn failed_write_skips_the_frame_and_reuses_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let out = Breakable::default();
        let mut card = TestCard::new(30, Duration::from_secs(60), 16);
        let mut r = Renderer::new(
            &mut card,
            &geometry_source(),
            region(),
            shared_output(out.clone()),
            &cfg(dir.path()),
        )
        .unwrap();
        let first = r.render_frame().unwrap();

        out.broken.store(true, Ordering::SeqCst);
        assert!(matches!(r.render_frame(), Err(RenderError::Write(_))));
        assert!(matches!(r.render_frame(), Err(RenderError::Write(_))));

        out.broken.store(false, Ordering::SeqCst);
        let next = r.render_frame().unwrap();
        assert_eq!(next, first.other());
        assert_eq!(r.render_frame().unwrap(), first);
    }

    #[test]
    fn render_thread_survives_write_failures() {
        let dir = tempfile::tempdir().unwrap();
        let out = Breakable::default();
        out.broken.store(true, Ordering::SeqCst);
        let mut card = TestCard::new(120, Duration::from_secs(60), 64);
        let mut comp = Compositor::init(
            &mut card,
            &geometry_source(),
            region(),
            shared_output(out.clone()),
            &cfg(dir.path()),
        )
        .unwrap();
        card.load("testcard://").unwrap();

        wait_for("failed writes", || out.attempts.load(Ordering::SeqCst) >= 3);
        assert_eq!(comp.frames_rendered(), 0);
        assert!(comp.is_running());

        out.broken.store(false, Ordering::SeqCst);
        wait_for("frames after recovery", || comp.frames_rendered() >= 3);
        comp.shutdown().unwrap();
    }

    #[test]
    fn teardown_continues_past_failed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let out = Breakable::default();
        let mut card = TestCard::new(120, Duration::from_secs(60), 64);
        let mut comp = Compositor::init(
            &mut card,
            &geometry_source(),
            region(),
            shared_output(out.clone()),
            &cfg(dir.path()),
        )
        .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);

        out.broken.store(true, Ordering::SeqCst);
        let err = comp.shutdown().unwrap_err();
        assert_eq!(err.failures.len(), 2, "{err}");
        assert!(err.failures[0].starts_with("delete images"));
        assert!(err.failures[1].starts_with("clear region"));
        assert!(!comp.is_running());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
