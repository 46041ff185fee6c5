//! Decode-engine contract.
//!
//! The core never decodes anything itself. An engine hands out a
//! [`RenderTarget`] sized to the compositor's buffers, fires a frame-ready
//! callback from its own thread, blits on request, and reports playback
//! through [`PlayerEvent`]s.
//!
//! Two engines ship with the client:
//! - [`ffmpeg::FfmpegEngine`] decodes a stream URL through an `ffmpeg` child
//! - [`testcard::TestCard`] paints synthetic colour bars (no network)
//!
//! An `EndOfFile` always belongs to the most recent `load`: loading purges
//! the event queue, so a finished video cannot advance past its successor.

pub mod ffmpeg;
pub mod testcard;

use std::sync::Arc;

use crate::error::EngineError;

/// Bytes per pixel of every software render target.
pub const BYTES_PER_PIXEL: usize = 4;

/// Pixel layout of a software render target.
///
/// `Rgb0` is 8-bit R, G, B followed by an unused byte. Engines are free to
/// leave that byte at zero, so the consumer must force opacity itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb0,
}

impl PixelFormat {
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Rgb0 => "rgb0",
        }
    }
}

/// Shape of the memory a [`RenderTarget`] blits into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetSpec {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: usize,
}

impl TargetSpec {
    pub fn frame_len(&self) -> usize {
        self.stride * self.height as usize
    }

    fn validate(&self) -> Result<(), EngineError> {
        let row = self.width as usize * BYTES_PER_PIXEL;
        if self.width == 0 || self.height == 0 || self.stride < row {
            return Err(EngineError::UnsupportedTarget {
                width: self.width,
                height: self.height,
                stride: self.stride,
            });
        }
        Ok(())
    }
}

/// Called from the engine's thread whenever a new frame can be rendered.
/// Must not block or allocate.
pub type FrameReadyFn = Arc<dyn Fn() + Send + Sync>;

/// A software render target. Dropping it releases it from the engine.
pub trait RenderTarget: Send {
    fn set_frame_ready_callback(&mut self, cb: FrameReadyFn);

    /// Blit the most recent frame into `buf`, `stride` bytes per row.
    fn render_into(&mut self, buf: &mut [u8], stride: usize) -> Result<(), EngineError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Stopped,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlayerEvent {
    State(PlaybackState),
    TimePos(f64),
    Duration(f64),
    Paused(bool),
    EndOfFile,
}

pub trait DecodeEngine: Send {
    fn name(&self) -> &'static str;

    fn register_render_target(
        &mut self,
        spec: TargetSpec,
    ) -> Result<Box<dyn RenderTarget>, EngineError>;

    /// Start playing `url` from the beginning. Events still queued from
    /// whatever played before are discarded first.
    fn load(&mut self, url: &str) -> Result<(), EngineError>;

    /// Like [`load`](Self::load), with audio taken from a separate stream.
    /// Engines without audio play `url` alone.
    fn load_with_audio(&mut self, url: &str, audio_url: Option<&str>) -> Result<(), EngineError> {
        let _ = audio_url;
        self.load(url)
    }

    fn pause(&mut self) -> Result<(), EngineError>;

    fn resume(&mut self) -> Result<(), EngineError>;

    fn toggle_pause(&mut self) -> Result<(), EngineError> {
        if self.is_paused() {
            self.resume()
        } else {
            self.pause()
        }
    }

    fn is_paused(&self) -> bool;

    /// Seek relative to the current position, in seconds.
    fn seek(&mut self, delta_secs: f64) -> Result<(), EngineError>;

    fn stop(&mut self);

    /// Volume in percent. Engines without audio only record it.
    fn set_volume(&mut self, pct: u32);

    fn poll_event(&mut self) -> Option<PlayerEvent>;

    /// Drop every queued event, returning how many there were.
    fn discard_events(&mut self) -> usize {
        let mut n = 0;
        while self.poll_event().is_some() {
            n += 1;
        }
        n
    }
}

/// Copy a tightly packed `width * 4` frame into a strided buffer.
pub(crate) fn blit_rows(
    src: &[u8],
    width: u32,
    height: u32,
    dst: &mut [u8],
    stride: usize,
) -> Result<(), EngineError> {
    let row = width as usize * BYTES_PER_PIXEL;
    let rows = height as usize;
    let expected = stride * rows.saturating_sub(1) + row;
    if dst.len() < expected {
        return Err(EngineError::BufferTooSmall {
            expected,
            actual: dst.len(),
        });
    }
    if src.len() < row * rows {
        return Err(EngineError::NoFrame);
    }
    for (y, line) in src.chunks_exact(row).take(rows).enumerate() {
        let off = y * stride;
        dst[off..off + row].copy_from_slice(line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_spec_rejects_short_stride() {
        let spec = TargetSpec {
            width: 10,
            height: 2,
            format: PixelFormat::Rgb0,
            stride: 39,
        };
        assert!(spec.validate().is_err());
        let spec = TargetSpec { stride: 40, ..spec };
        assert!(spec.validate().is_ok());
        assert_eq!(spec.frame_len(), 80);
    }

    #[test]
    fn blit_honors_stride() {
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = [0u8; 12];
        blit_rows(&src, 1, 2, &mut dst, 6).unwrap();
        assert_eq!(dst, [1, 2, 3, 4, 0, 0, 5, 6, 7, 8, 0, 0]);
    }

    #[test]
    fn blit_rejects_small_buffer() {
        let src = [0u8; 16];
        let mut dst = [0u8; 7];
        assert!(matches!(
            blit_rows(&src, 2, 2, &mut dst, 8),
            Err(EngineError::BufferTooSmall { .. })
        ));
    }
}
