//! Shared-memory frame buffers and the double-buffer state machine.
//!
//! Each buffer is a file under a tmpfs directory (normally `/dev/shm`),
//! mapped read-write into this process. The terminal reads the same file by
//! path when told to display it.
//!
//! [`BufferPair`] tracks which slot the terminal was last told to display.
//! Writing goes through a [`WriteGuard`] that always targets the other slot,
//! and only [`WriteGuard::handoff`] moves the displayed slot. The raw mapping
//! never leaves this module.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::MmapMut;

use crate::error::RenderInitError;

/// One of the two registered terminal images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageSlot {
    One,
    Two,
}

impl ImageSlot {
    pub const BOTH: [ImageSlot; 2] = [ImageSlot::One, ImageSlot::Two];

    /// Kitty image id.
    pub fn image_id(self) -> u32 {
        match self {
            ImageSlot::One => 1,
            ImageSlot::Two => 2,
        }
    }

    pub fn other(self) -> Self {
        match self {
            ImageSlot::One => ImageSlot::Two,
            ImageSlot::Two => ImageSlot::One,
        }
    }

    fn index(self) -> usize {
        match self {
            ImageSlot::One => 0,
            ImageSlot::Two => 1,
        }
    }
}

/// A file-backed shared memory segment, unlinked on close or drop.
pub struct SharedFrame {
    path: PathBuf,
    map: Option<MmapMut>,
}

impl SharedFrame {
    pub fn create(path: PathBuf, len: usize) -> Result<Self, RenderInitError> {
        let fail = |path: &Path, source: io::Error| RenderInitError::SharedMemory {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| fail(&path, e))?;
        // From here on the file exists; Drop removes it on any early return.
        let mut frame = Self { path, map: None };
        file.set_len(len as u64)
            .map_err(|e| fail(&frame.path, e))?;
        // SAFETY: we created and truncated the file ourselves with mode 0600.
        // Other processes only ever read it, so the mapping cannot be shrunk
        // underneath us.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| fail(&frame.path, e))?;
        frame.map = Some(map);
        debug!("shm: mapped {} ({len} bytes)", frame.path.display());
        Ok(frame)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.map.as_mut() {
            Some(m) => &mut m[..],
            None => &mut [],
        }
    }

    /// Unmap and unlink.
    pub fn close(mut self) -> io::Result<()> {
        self.map = None;
        let result = fs::remove_file(&self.path);
        // Already unlinked (or failed loudly); keep Drop from retrying.
        self.path = PathBuf::new();
        result
    }
}

impl Drop for SharedFrame {
    fn drop(&mut self) {
        self.map = None;
        if !self.path.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Two equally sized frame buffers plus the displayed-slot state.
pub struct BufferPair {
    frames: [SharedFrame; 2],
    displaying: Option<ImageSlot>,
}

impl BufferPair {
    /// Create `<dir>/<prefix>_frame_0` and `<dir>/<prefix>_frame_1`, each
    /// `len` bytes. On failure nothing is left behind.
    pub fn create(dir: &Path, prefix: &str, len: usize) -> Result<Self, RenderInitError> {
        let one = SharedFrame::create(dir.join(format!("{prefix}_frame_0")), len)?;
        let two = SharedFrame::create(dir.join(format!("{prefix}_frame_1")), len)?;
        Ok(Self {
            frames: [one, two],
            displaying: None,
        })
    }

    pub fn path(&self, slot: ImageSlot) -> &Path {
        self.frames[slot.index()].path()
    }

    pub fn frame_len(&self) -> usize {
        self.frames[0].len()
    }

    /// The slot the terminal was last told to display, if any.
    pub fn displaying(&self) -> Option<ImageSlot> {
        self.displaying
    }

    /// Start writing the slot that is not on screen.
    pub fn begin_write(&mut self) -> WriteGuard<'_> {
        let slot = self.displaying.map_or(ImageSlot::One, ImageSlot::other);
        WriteGuard { pair: self, slot }
    }

    /// Unmap and unlink both segments, continuing past failures.
    pub fn close(self) -> Vec<(PathBuf, io::Error)> {
        let mut failures = Vec::new();
        for frame in self.frames {
            let path = frame.path().to_path_buf();
            if let Err(e) = frame.close() {
                failures.push((path, e));
            }
        }
        failures
    }
}

/// Exclusive write access to the off-screen buffer.
///
/// Dropping the guard without [`handoff`](Self::handoff) leaves the
/// displayed slot unchanged, so the next frame reuses the same buffer.
pub struct WriteGuard<'a> {
    pair: &'a mut BufferPair,
    slot: ImageSlot,
}

impl WriteGuard<'_> {
    pub fn slot(&self) -> ImageSlot {
        self.slot
    }

    pub fn buffer(&mut self) -> &mut [u8] {
        self.pair.frames[self.slot.index()].as_mut_slice()
    }

    /// Mark this slot as the one the terminal now displays.
    pub fn handoff(self) -> ImageSlot {
        self.pair.displaying = Some(self.slot);
        self.slot
    }
}

/// Set the alpha byte of every RGBA pixel in each row to 0xFF.
pub fn force_opaque(buf: &mut [u8], width: u32, height: u32, stride: usize) {
    let row = width as usize * 4;
    for y in 0..height as usize {
        let start = y * stride;
        let Some(line) = buf.get_mut(start..start + row) else {
            break;
        };
        for px in line.chunks_exact_mut(4) {
            px[3] = 0xFF;
        }
    }
}
