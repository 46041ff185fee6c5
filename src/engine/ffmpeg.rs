//! Decode engine backed by an `ffmpeg` child process.
//!
//! ffmpeg is asked for raw `rgb0` frames already scaled to the render
//! target's size, paced in real time (`-re`). A reader thread pulls whole
//! frames off the pipe, publishes the newest one and fires the frame-ready
//! callback. Pause and resume stop and continue the child with signals;
//! seeking restarts it at the new position and keeps the pause state.
//!
//! Audio plays through a separate `ffplay` child started at the same
//! position, from the audio stream when one was given and from the video URL
//! otherwise. Its gain is an `-af volume=` filter, so a volume change
//! restarts the audio child at the current position. Without `ffplay` the
//! engine plays video only.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, info, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use super::{
    BYTES_PER_PIXEL, DecodeEngine, FrameReadyFn, PlaybackState, PlayerEvent, RenderTarget,
    TargetSpec, blit_rows,
};
use crate::error::EngineError;
use crate::spsc::{self, Consumer, SharedProducer};

/// Audio player started next to the decoder.
pub const DEFAULT_AUDIO_PROGRAM: &str = "ffplay";

/// Wall-clock position tracker: `base` seconds plus time since `since`.
#[derive(Default)]
struct PlayClock {
    base: f64,
    since: Option<Instant>,
}

impl PlayClock {
    fn position(&self) -> f64 {
        self.base + self.since.map_or(0.0, |t| t.elapsed().as_secs_f64())
    }

    fn start_at(&mut self, pos: f64) {
        self.base = pos;
        self.since = Some(Instant::now());
    }

    fn freeze(&mut self) {
        self.base = self.position();
        self.since = None;
    }

    fn run(&mut self) {
        if self.since.is_none() {
            self.since = Some(Instant::now());
        }
    }
}

#[derive(Default)]
struct Latest {
    frame: Vec<u8>,
    width: u32,
    height: u32,
    seq: u64,
}

#[derive(Default)]
struct FfShared {
    latest: Mutex<Latest>,
    callback: Mutex<Option<FrameReadyFn>>,
    clock: Mutex<PlayClock>,
    /// Bumped on every (re)spawn; readers of older children go quiet.
    generation: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FfmpegEngine {
    program: String,
    audio_program: Option<String>,
    shared: Arc<FfShared>,
    events_tx: SharedProducer<PlayerEvent>,
    events_rx: Consumer<PlayerEvent>,
    target: Option<TargetSpec>,
    url: Option<String>,
    audio_url: Option<String>,
    child: Option<Child>,
    audio: Option<Child>,
    readers: Vec<JoinHandle<()>>,
    paused: bool,
    volume: u32,
}

impl FfmpegEngine {
    pub fn new(program: impl Into<String>, event_cap: usize) -> Self {
        let (tx, rx) = spsc::channel("player-events", event_cap);
        Self {
            program: program.into(),
            audio_program: Some(DEFAULT_AUDIO_PROGRAM.into()),
            shared: Arc::new(FfShared::default()),
            events_tx: SharedProducer::new(tx),
            events_rx: rx,
            target: None,
            url: None,
            audio_url: None,
            child: None,
            audio: None,
            readers: Vec::new(),
            paused: false,
            volume: 100,
        }
    }

    /// Replace the audio player; `None` plays video only.
    pub fn with_audio_program(mut self, program: Option<String>) -> Self {
        self.audio_program = program;
        self
    }

    fn position(&self) -> f64 {
        lock(&self.shared.clock).position()
    }

    /// Signal the decoder, and the audio player if there is one. Only a
    /// failure to signal the decoder is an error.
    fn signal_children(&self, sig: Signal) -> Result<(), EngineError> {
        let child = self.child.as_ref().ok_or(EngineError::NotLoaded)?;
        kill(Pid::from_raw(child.id() as i32), sig)
            .map_err(|e| EngineError::Control(format!("{sig:?}: {e}")))?;
        if let Some(audio) = &self.audio
            && let Err(e) = kill(Pid::from_raw(audio.id() as i32), sig)
        {
            debug!("ffmpeg: audio {sig:?} failed: {e}");
        }
        Ok(())
    }

    fn kill_child(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("ffmpeg: kill failed: {e}");
            }
            let _ = child.wait();
        }
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
        self.kill_audio();
    }

    fn kill_audio(&mut self) {
        if let Some(mut audio) = self.audio.take() {
            if let Err(e) = audio.kill() {
                debug!("ffmpeg: audio kill failed: {e}");
            }
            let _ = audio.wait();
        }
    }

    /// (Re)start the audio player at `pos` with the current volume. A player
    /// that cannot be started leaves playback silent.
    fn spawn_audio(&mut self, pos: f64) {
        self.kill_audio();
        let Some(program) = self.audio_program.clone() else {
            return;
        };
        let Some(url) = self.audio_url.clone().or_else(|| self.url.clone()) else {
            return;
        };
        let start = format!("{pos:.3}");
        let gain = format!("volume={:.2}", f64::from(self.volume) / 100.0);
        let spawned = Command::new(&program)
            .args(["-nodisp", "-autoexit", "-vn", "-hide_banner", "-loglevel", "error"])
            .args(["-ss", start.as_str(), "-af", gain.as_str()])
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(audio) => {
                debug!(
                    "ffmpeg: audio pid {} at {pos:.1}s, {}%",
                    audio.id(),
                    self.volume
                );
                self.audio = Some(audio);
            }
            Err(e) => warn!("ffmpeg: no audio, `{program}` failed to start: {e}"),
        }
    }

    /// (Re)start decoding at `pos` if both a URL and a target are present.
    /// A paused engine stays paused on the new children.
    fn spawn_at(&mut self, pos: f64) -> Result<(), EngineError> {
        let keep_paused = self.paused;
        self.kill_child();
        let (Some(url), Some(spec)) = (self.url.clone(), self.target) else {
            return Ok(());
        };

        let start = format!("{pos:.3}");
        let scale = format!("scale={}:{}", spec.width, spec.height);
        let mut child = Command::new(&self.program)
            .args(["-hide_banner", "-nostats", "-nostdin", "-loglevel", "info"])
            .args(["-re", "-ss", start.as_str(), "-i", url.as_str(), "-an"])
            .args(["-vf", scale.as_str()])
            .args(["-pix_fmt", spec.format.ffmpeg_name(), "-f", "rawvideo", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        info!(
            "ffmpeg: pid {} decoding at {pos:.1}s into {}x{}",
            child.id(),
            spec.width,
            spec.height
        );

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        lock(&self.shared.clock).start_at(pos);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        // Owned before the readers spawn; kill_child() reaps it on error.
        self.child = Some(child);

        if let Some(stdout) = stdout {
            let shared = Arc::clone(&self.shared);
            let events = self.events_tx.clone();
            let handle = thread::Builder::new()
                .name("ytview-ffmpeg-video".into())
                .spawn(move || read_frames(stdout, spec, shared, events, generation))
                .map_err(|source| EngineError::Spawn {
                    program: "ffmpeg reader".into(),
                    source,
                })?;
            self.readers.push(handle);
        }
        if let Some(stderr) = stderr {
            let events = self.events_tx.clone();
            let handle = thread::Builder::new()
                .name("ytview-ffmpeg-log".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        if let Some(secs) = parse_duration_line(&line) {
                            events.push_or_drop(PlayerEvent::Duration(secs));
                        } else {
                            debug!("ffmpeg: {line}");
                        }
                    }
                })
                .map_err(|source| EngineError::Spawn {
                    program: "ffmpeg log reader".into(),
                    source,
                })?;
            self.readers.push(handle);
        }
        self.spawn_audio(pos);
        self.events_tx
            .push_or_drop(PlayerEvent::State(PlaybackState::Playing));

        if keep_paused {
            match self.signal_children(Signal::SIGSTOP) {
                Ok(()) => lock(&self.shared.clock).freeze(),
                Err(e) => {
                    warn!("ffmpeg: could not keep new decoder paused: {e}");
                    self.paused = false;
                    self.events_tx.push_or_drop(PlayerEvent::Paused(false));
                }
            }
        }
        Ok(())
    }
}

impl Drop for FfmpegEngine {
    fn drop(&mut self) {
        self.kill_child();
    }
}

fn read_frames(
    mut stdout: ChildStdout,
    spec: TargetSpec,
    shared: Arc<FfShared>,
    events: SharedProducer<PlayerEvent>,
    generation: u64,
) {
    let frame_len = spec.width as usize * spec.height as usize * BYTES_PER_PIXEL;
    let mut buf = vec![0u8; frame_len];
    let mut last_whole_sec = u64::MAX;
    loop {
        if let Err(e) = stdout.read_exact(&mut buf) {
            if shared.generation.load(Ordering::Acquire) == generation {
                debug!("ffmpeg: stream ended ({e})");
                events.push_or_drop(PlayerEvent::EndOfFile);
                events.push_or_drop(PlayerEvent::State(PlaybackState::Stopped));
            }
            return;
        }
        if shared.generation.load(Ordering::Acquire) != generation {
            return;
        }
        {
            let mut latest = lock(&shared.latest);
            std::mem::swap(&mut latest.frame, &mut buf);
            latest.width = spec.width;
            latest.height = spec.height;
            latest.seq += 1;
        }
        if buf.len() != frame_len {
            buf.resize(frame_len, 0);
        }
        let cb = lock(&shared.callback).clone();
        if let Some(cb) = cb {
            cb();
        }
        let pos = lock(&shared.clock).position();
        if pos as u64 != last_whole_sec {
            last_whole_sec = pos as u64;
            events.push_or_drop(PlayerEvent::TimePos(pos));
        }
    }
}

/// Parse ffmpeg's `  Duration: 00:03:33.07, start: ...` input banner line.
fn parse_duration_line(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("Duration:")?.trim_start();
    let stamp = rest.split(',').next()?.trim();
    let mut parts = stamp.split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

impl DecodeEngine for FfmpegEngine {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn register_render_target(
        &mut self,
        spec: TargetSpec,
    ) -> Result<Box<dyn RenderTarget>, EngineError> {
        spec.validate()?;
        let resized = self.target != Some(spec);
        self.target = Some(spec);
        if self.url.is_some() && (resized || self.child.is_none()) {
            let pos = self.position();
            self.spawn_at(pos)?;
        }
        Ok(Box::new(FfTarget {
            shared: Arc::clone(&self.shared),
            spec,
        }))
    }

    fn load(&mut self, url: &str) -> Result<(), EngineError> {
        self.load_with_audio(url, None)
    }

    fn load_with_audio(&mut self, url: &str, audio_url: Option<&str>) -> Result<(), EngineError> {
        self.kill_child();
        let stale = self.discard_events();
        if stale > 0 {
            debug!("ffmpeg: {stale} events of the previous load dropped");
        }
        self.url = Some(url.to_string());
        self.audio_url = audio_url.map(String::from);
        self.paused = false;
        *lock(&self.shared.latest) = Latest::default();
        self.events_tx
            .push_or_drop(PlayerEvent::State(PlaybackState::Loading));
        self.spawn_at(0.0)
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        if self.paused {
            return Ok(());
        }
        self.signal_children(Signal::SIGSTOP)?;
        lock(&self.shared.clock).freeze();
        self.paused = true;
        self.events_tx.push_or_drop(PlayerEvent::Paused(true));
        Ok(())
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        if !self.paused {
            return Ok(());
        }
        self.signal_children(Signal::SIGCONT)?;
        lock(&self.shared.clock).run();
        self.paused = false;
        self.events_tx.push_or_drop(PlayerEvent::Paused(false));
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn seek(&mut self, delta_secs: f64) -> Result<(), EngineError> {
        if self.child.is_none() {
            return Err(EngineError::NotLoaded);
        }
        let pos = (self.position() + delta_secs).max(0.0);
        debug!("ffmpeg: seek to {pos:.1}s");
        self.spawn_at(pos)?;
        self.events_tx.push_or_drop(PlayerEvent::TimePos(pos));
        Ok(())
    }

    fn stop(&mut self) {
        if self.child.is_some() {
            self.kill_child();
            self.events_tx
                .push_or_drop(PlayerEvent::State(PlaybackState::Stopped));
        }
        self.url = None;
        self.audio_url = None;
        self.paused = false;
        *lock(&self.shared.clock) = PlayClock::default();
    }

    fn set_volume(&mut self, pct: u32) {
        if self.volume == pct {
            return;
        }
        self.volume = pct;
        if self.child.is_none() {
            return;
        }
        let pos = self.position();
        self.spawn_audio(pos);
        if self.paused
            && let Some(audio) = &self.audio
            && let Err(e) = kill(Pid::from_raw(audio.id() as i32), Signal::SIGSTOP)
        {
            debug!("ffmpeg: audio SIGSTOP failed: {e}");
        }
    }

    fn poll_event(&mut self) -> Option<PlayerEvent> {
        self.events_rx.pop()
    }
}

struct FfTarget {
    shared: Arc<FfShared>,
    spec: TargetSpec,
}

impl RenderTarget for FfTarget {
    fn set_frame_ready_callback(&mut self, cb: FrameReadyFn) {
        *lock(&self.shared.callback) = Some(cb);
    }

    fn render_into(&mut self, buf: &mut [u8], stride: usize) -> Result<(), EngineError> {
        let latest = lock(&self.shared.latest);
        if latest.seq == 0 || latest.width != self.spec.width || latest.height != self.spec.height
        {
            return Err(EngineError::NoFrame);
        }
        blit_rows(&latest.frame, latest.width, latest.height, buf, stride)
    }
}

impl Drop for FfTarget {
    fn drop(&mut self) {
        *lock(&self.shared.callback) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PixelFormat;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    #[test]
    fn duration_line_parses() {
        assert_eq!(
            parse_duration_line("  Duration: 00:03:33.50, start: 0.000000, bitrate: 1 kb/s"),
            Some(213.5)
        );
        assert_eq!(parse_duration_line("  Duration: N/A, bitrate: N/A"), None);
        assert_eq!(parse_duration_line("Stream #0:0: Video"), None);
    }

    #[test]
    fn controls_without_child_report_not_loaded() {
        let mut engine = FfmpegEngine::new("ffmpeg", 8);
        assert!(matches!(engine.pause(), Err(EngineError::NotLoaded)));
        assert!(matches!(engine.seek(10.0), Err(EngineError::NotLoaded)));
        assert!(!engine.is_paused());
    }

    #[test]
    fn target_without_frame_reports_no_frame() {
        let mut engine = FfmpegEngine::new("ffmpeg", 8);
        let spec = TargetSpec {
            width: 4,
            height: 4,
            format: PixelFormat::Rgb0,
            stride: 16,
        };
        let mut target = engine.register_render_target(spec).unwrap();
        let mut buf = vec![0u8; 64];
        assert!(matches!(
            target.render_into(&mut buf, 16),
            Err(EngineError::NoFrame)
        ));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let mut engine = FfmpegEngine::new("/nonexistent/ffmpeg-binary", 8);
        let spec = TargetSpec {
            width: 4,
            height: 4,
            format: PixelFormat::Rgb0,
            stride: 16,
        };
        let _target = engine.register_render_target(spec).unwrap();
        assert!(matches!(
            engine.load("file:///dev/null"),
            Err(EngineError::Spawn { .. })
        ));
        assert_eq!(
            engine.poll_event(),
            Some(PlayerEvent::State(PlaybackState::Loading))
        );
    }

    /// A stand-in for ffmpeg/ffplay: appends its arguments to
    /// `<name>.args`, then idles until killed.
    fn stand_in(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\necho \"$@\" >> \"$0.args\"\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        // let other test threads' forks drop the write handle before exec
        thread::sleep(Duration::from_millis(50));
        path
    }

    /// Argument lines logged by a stand-in, waiting until there are `n`.
    fn logged_args(program: &Path, n: usize) -> Vec<String> {
        let log = program.with_extension("args");
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let lines: Vec<String> = std::fs::read_to_string(&log)
                .unwrap_or_default()
                .lines()
                .map(String::from)
                .collect();
            if lines.len() >= n {
                return lines;
            }
            assert!(Instant::now() < deadline, "{} logged {lines:?}", log.display());
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Single-letter process state from `/proc/<pid>/stat`.
    fn proc_state(pid: u32) -> char {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap_or_default();
        stat.rsplit(')')
            .next()
            .and_then(|rest| rest.trim_start().chars().next())
            .unwrap_or('?')
    }

    fn engine_with_stand_ins(dir: &Path) -> (FfmpegEngine, PathBuf, PathBuf) {
        let video = stand_in(dir, "video");
        let audio = stand_in(dir, "audio");
        let mut engine = FfmpegEngine::new(video.to_string_lossy(), 32)
            .with_audio_program(Some(audio.to_string_lossy().into_owned()));
        engine
            .register_render_target(TargetSpec {
                width: 4,
                height: 4,
                format: PixelFormat::Rgb0,
                stride: 16,
            })
            .unwrap();
        (engine, video, audio)
    }

    fn events(engine: &mut FfmpegEngine) -> Vec<PlayerEvent> {
        std::iter::from_fn(|| engine.poll_event()).collect()
    }

    #[test]
    fn seek_while_paused_stays_paused() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, video, _audio) = engine_with_stand_ins(dir.path());
        engine.load("file:///clip.webm").unwrap();
        logged_args(&video, 1);
        engine.pause().unwrap();
        engine.seek(5.0).unwrap();

        assert!(engine.is_paused());
        let last_paused = events(&mut engine).iter().rev().find_map(|e| match e {
            PlayerEvent::Paused(p) => Some(*p),
            _ => None,
        });
        assert_eq!(last_paused, Some(true));

        let pid = engine.child.as_ref().map(Child::id).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while proc_state(pid) != 'T' {
            assert!(Instant::now() < deadline, "decoder was not stopped");
            thread::sleep(Duration::from_millis(10));
        }

        engine.toggle_pause().unwrap();
        assert!(!engine.is_paused());
        assert_eq!(events(&mut engine), vec![PlayerEvent::Paused(false)]);
        // the restarted decoder only logs once it runs again
        let lines = logged_args(&video, 2);
        assert!(lines[1].contains("-ss 5."), "{lines:?}");
    }

    #[test]
    fn volume_change_restarts_audio_with_new_gain() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _video, audio) = engine_with_stand_ins(dir.path());
        engine
            .load_with_audio("https://v.invalid/video", Some("https://a.invalid/audio"))
            .unwrap();
        let first = engine.audio.as_ref().map(Child::id);
        assert!(first.is_some());
        logged_args(&audio, 1);

        engine.set_volume(50);
        let lines = logged_args(&audio, 2);
        assert!(lines[0].contains("volume=1.00"), "{lines:?}");
        assert!(lines[0].ends_with("https://a.invalid/audio"), "{lines:?}");
        assert!(lines[1].contains("volume=0.50"), "{lines:?}");
        let second = engine.audio.as_ref().map(Child::id);
        assert_ne!(first, second);

        engine.set_volume(50);
        assert_eq!(engine.audio.as_ref().map(Child::id), second);

        engine.stop();
        assert!(engine.audio.is_none());
    }

    #[test]
    fn audio_falls_back_to_the_video_url() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _video, audio) = engine_with_stand_ins(dir.path());
        engine.load("https://v.invalid/muxed").unwrap();
        let lines = logged_args(&audio, 1);
        assert!(lines[0].ends_with("https://v.invalid/muxed"), "{lines:?}");
    }

    #[test]
    fn load_drops_events_of_the_previous_video() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _video, _audio) = engine_with_stand_ins(dir.path());
        engine.load("https://v.invalid/one").unwrap();
        engine.events_tx.push_or_drop(PlayerEvent::EndOfFile);

        engine.load("https://v.invalid/two").unwrap();
        let evs = events(&mut engine);
        assert!(!evs.contains(&PlayerEvent::EndOfFile), "{evs:?}");
        assert_eq!(evs[0], PlayerEvent::State(PlaybackState::Loading));
    }

    #[test]
    fn play_clock_freezes_and_resumes() {
        let mut clock = PlayClock::default();
        clock.start_at(10.0);
        clock.freeze();
        let frozen = clock.position();
        assert!((10.0..10.5).contains(&frozen));
        assert_eq!(clock.position(), frozen);
        clock.run();
        assert!(clock.position() >= frozen);
    }
}
