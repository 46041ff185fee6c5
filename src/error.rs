//! Error kinds of the rendering and task-dispatch core.
//!
//! Initialization failures are fatal to their subsystem and bubble up to the
//! caller. Everything that happens per frame or per task is absorbed where it
//! occurs (logged, dropped, skipped) and never takes the UI down.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Compositor initialization failed. Resources acquired before the failing
/// step have already been released when this is returned.
#[derive(Debug, Error)]
pub enum RenderInitError {
    #[error("terminal geometry unavailable: {0}")]
    Geometry(String),

    #[error("shared memory segment {path}: {source}")]
    SharedMemory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("decode engine refused render target: {0}")]
    Engine(#[from] EngineError),

    #[error("failed to spawn compositor thread: {0}")]
    Spawn(#[source] io::Error),
}

/// A single frame could not be composited. The frame is skipped.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("blit failed: {0}")]
    Blit(#[from] EngineError),

    #[error("frame write failed: {0}")]
    Write(#[from] io::Error),
}

/// Teardown finished, but some steps failed along the way.
#[derive(Debug, Error)]
#[error("{} teardown step(s) failed: {}", .failures.len(), .failures.join("; "))]
pub struct ShutdownPartial {
    pub failures: Vec<String>,
}

/// Errors reported by a decode engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("render target {width}x{height} (stride {stride}) is not supported")]
    UnsupportedTarget {
        width: u32,
        height: u32,
        stride: usize,
    },

    #[error("buffer of {actual} bytes is smaller than the {expected} bytes a frame needs")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("no frame decoded yet")]
    NoFrame,

    #[error("nothing is loaded")]
    NotLoaded,

    #[error("failed to start decoder `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("decoder control failed: {0}")]
    Control(String),
}

/// The worker pool did not accept a task; it will not run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker pool is shutting down")]
    ShuttingDown,

    #[error("worker pool submission queue is full")]
    Saturated,
}

/// Failures inside task bodies and their collaborators. These never leave a
/// worker thread; they are logged and reported through the task's result.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),

    #[error("malformed response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("`{program}` exited with {status}: {stderr}")]
    Subprocess {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("authorization timed out after {0}s")]
    AuthTimeout(u64),

    #[error("invalid video id `{0}`")]
    InvalidId(String),
}

impl From<ureq::Error> for FetchError {
    fn from(e: ureq::Error) -> Self {
        FetchError::Http(e.to_string())
    }
}
