//! Thumbnail cache and fetcher.
//!
//! [`ThumbCache`] is a fixed-capacity store keyed by [`VideoId`] with
//! least-recently-used eviction by timestamp. Eviction is a linear scan for
//! the smallest last-access time; ties go to the lowest slot index. A burst
//! of hits inside one clock tick therefore does not reorder ties.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use image::RgbaImage;
use log::debug;

use crate::error::FetchError;
use crate::model::VideoId;

/// Longest side of a cached thumbnail after decode.
const THUMB_MAX_W: u32 = 320;
const THUMB_MAX_H: u32 = 180;
/// Thumbnails larger than this are refused.
const THUMB_MAX_BYTES: u64 = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of last-access timestamps.
pub trait Clock {
    fn now(&self) -> u64;
}

/// Milliseconds since the clock was created.
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn set(&self, t: u64) {
        self.0.store(t, Ordering::Relaxed);
    }

    pub fn advance(&self, dt: u64) {
        self.0.fetch_add(dt, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// ThumbCache
// ---------------------------------------------------------------------------

struct Slot<H> {
    key: VideoId,
    handle: H,
    last_access: u64,
}

pub struct ThumbCache<H, C = MonotonicClock> {
    slots: Vec<Slot<H>>,
    capacity: usize,
    clock: C,
}

impl<H> ThumbCache<H, MonotonicClock> {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, MonotonicClock::default())
    }
}

impl<H, C: Clock> ThumbCache<H, C> {
    /// Cache of at most `capacity` entries (at least 1).
    pub fn with_clock(capacity: usize, clock: C) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            clock,
        }
    }

    /// Look up `key`, refreshing its last-access time on a hit.
    pub fn get(&mut self, key: &VideoId) -> Option<&H> {
        let now = self.clock.now();
        let slot = self.slots.iter_mut().find(|s| &s.key == key)?;
        slot.last_access = now;
        Some(&slot.handle)
    }

    /// Presence check that does not touch recency.
    pub fn contains(&self, key: &VideoId) -> bool {
        self.slots.iter().any(|s| &s.key == key)
    }

    /// Insert `handle` under `key`.
    ///
    /// Returns the handle that left the cache: the previous handle for the
    /// same key, or the least-recently-used entry when the cache was full.
    pub fn put(&mut self, key: VideoId, handle: H) -> Option<H> {
        let now = self.clock.now();

        if let Some(slot) = self.slots.iter_mut().find(|s| s.key == key) {
            slot.last_access = now;
            return Some(std::mem::replace(&mut slot.handle, handle));
        }

        let fresh = Slot {
            key,
            handle,
            last_access: now,
        };
        if self.slots.len() < self.capacity {
            self.slots.push(fresh);
            return None;
        }

        let victim = self.lru_index()?;
        let old = std::mem::replace(&mut self.slots[victim], fresh);
        debug!("thumb: evicted {} (last access {})", old.key, old.last_access);
        Some(old.handle)
    }

    /// Index of the entry with the smallest last-access time (lowest index
    /// on ties).
    fn lru_index(&self) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (i, s) in self.slots.iter().enumerate() {
            if best.is_none_or(|(_, t)| s.last_access < t) {
                best = Some((i, s.last_access));
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Release every handle.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// A decoded, downscaled thumbnail.
#[derive(Clone, Debug)]
pub struct Thumbnail {
    image: RgbaImage,
}

impl Thumbnail {
    pub fn from_rgba(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn rgba(&self) -> &[u8] {
        self.image.as_raw()
    }
}

/// Download `url` and decode it through a staging file in `cache_dir`.
pub fn fetch_thumbnail(url: &str, id: &VideoId, cache_dir: &Path) -> Result<Thumbnail, FetchError> {
    let mut resp = ureq::get(url).call()?;
    let bytes = resp
        .body_mut()
        .with_config()
        .limit(THUMB_MAX_BYTES)
        .read_to_vec()?;
    let thumb = stage_and_decode(&bytes, id, cache_dir)?;
    debug!(
        "thumb: {id} fetched ({} bytes, {}x{})",
        bytes.len(),
        thumb.width(),
        thumb.height()
    );
    Ok(thumb)
}

/// Write `bytes` to a uniquely named `thumb_<id>_*` file in `cache_dir`,
/// decode it, and remove the file whether or not decoding succeeded.
/// Concurrent fetches of the same id never share a file.
pub fn stage_and_decode(
    bytes: &[u8],
    id: &VideoId,
    cache_dir: &Path,
) -> Result<Thumbnail, FetchError> {
    let mut staged = tempfile::Builder::new()
        .prefix(&format!("thumb_{id}_"))
        .tempfile_in(cache_dir)?;
    staged.write_all(bytes)?;
    staged.flush()?;
    let decoded = decode_file(staged.path());
    if let Err(e) = staged.close() {
        debug!("thumb: failed to remove staging file for {id}: {e}");
    }
    decoded
}

/// Decode an image file and shrink it to thumbnail size.
pub fn decode_file(path: &Path) -> Result<Thumbnail, FetchError> {
    let img = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;
    let img = if img.width() > THUMB_MAX_W || img.height() > THUMB_MAX_H {
        img.thumbnail(THUMB_MAX_W, THUMB_MAX_H)
    } else {
        img
    };
    Ok(Thumbnail::from_rgba(img.to_rgba8()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> VideoId {
        VideoId::new(s).unwrap()
    }

    fn cache(cap: usize) -> (ThumbCache<u32, ManualClock>, ManualClock) {
        let clock = ManualClock::default();
        (ThumbCache::with_clock(cap, clock.clone()), clock)
    }

    #[test]
    fn append_below_capacity() {
        let (mut c, clock) = cache(3);
        assert!(c.put(id("a"), 1).is_none());
        clock.advance(1);
        assert!(c.put(id("b"), 2).is_none());
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&id("a")), Some(&1));
        assert_eq!(c.get(&id("zz")), None);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let (mut c, clock) = cache(3);
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            clock.set(i as u64 * 10);
            c.put(id(k), i as u32);
        }
        clock.set(100);
        assert_eq!(c.put(id("d"), 3), Some(0));
        assert!(!c.contains(&id("a")));
        assert!(c.contains(&id("d")));
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn get_refreshes_recency() {
        let (mut c, clock) = cache(3);
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            clock.set(i as u64 * 10);
            c.put(id(k), i as u32);
        }
        clock.set(50);
        assert!(c.get(&id("a")).is_some());
        clock.set(60);
        // "b" is now the oldest.
        assert_eq!(c.put(id("d"), 3), Some(1));
        assert!(c.contains(&id("a")));
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let (mut c, _clock) = cache(3);
        c.put(id("a"), 1);
        c.put(id("b"), 2);
        c.put(id("c"), 3);
        // All share timestamp 0; a hit inside the same tick changes nothing.
        c.get(&id("a"));
        assert_eq!(c.put(id("d"), 4), Some(1));
        assert_eq!(c.put(id("e"), 5), Some(2));
    }

    #[test]
    fn put_existing_key_replaces_in_place() {
        let (mut c, _clock) = cache(2);
        c.put(id("a"), 1);
        assert_eq!(c.put(id("a"), 9), Some(1));
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(&id("a")), Some(&9));
    }

    #[test]
    fn clear_releases_handles() {
        let marker = Arc::new(());
        let mut c: ThumbCache<Arc<()>> = ThumbCache::new(4);
        c.put(id("a"), Arc::clone(&marker));
        c.put(id("b"), Arc::clone(&marker));
        assert_eq!(Arc::strong_count(&marker), 3);
        c.clear();
        assert_eq!(Arc::strong_count(&marker), 1);
        assert!(c.is_empty());
    }

    #[test]
    fn decode_shrinks_large_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.png");
        RgbaImage::from_pixel(640, 360, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();
        let t = decode_file(&path).unwrap();
        assert_eq!((t.width(), t.height()), (320, 180));
        assert_eq!(&t.rgba()[..4], &[10, 20, 30, 255]);
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        RgbaImage::from_pixel(w, h, image::Rgba([1, 2, 3, 255]))
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn concurrent_staging_of_one_id_never_collides() {
        let dir = tempfile::tempdir().unwrap();
        let png = Arc::new(png_bytes(16, 9));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let png = Arc::clone(&png);
                let path = dir.path().to_path_buf();
                std::thread::spawn(move || stage_and_decode(&png, &id("same"), &path))
            })
            .collect();
        for h in handles {
            let t = h.join().unwrap().unwrap();
            assert_eq!((t.width(), t.height()), (16, 9));
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn staging_file_is_removed_when_decode_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(stage_and_decode(b"not an image", &id("bad"), dir.path()).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn decode_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thumb_x.jpg");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(decode_file(&path).is_err());
    }
}
