use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Frames-per-second over fixed one-second windows on the monotonic clock.
pub struct FpsCounter {
    frames: u32,
    window_start: Instant,
    reported: u32,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
            reported: 0,
        }
    }

    pub fn record_frame(&mut self) {
        self.frames = self.frames.saturating_add(1);
    }

    /// Close the window if at least a second has passed since it opened.
    /// Returns the new reading when it does.
    pub fn poll(&mut self, now: Instant) -> Option<u32> {
        if now.saturating_duration_since(self.window_start) < WINDOW {
            return None;
        }
        self.reported = self.frames;
        self.frames = 0;
        self.window_start = now;
        Some(self.reported)
    }

    /// Last completed reading.
    pub fn fps(&self) -> u32 {
        self.reported
    }

    /// Frames counted in the open window.
    pub fn pending(&self) -> u32 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thirty_frames_in_one_second() {
        let t0 = Instant::now();
        let mut fps = FpsCounter::new(t0);
        for i in 0..30u64 {
            fps.record_frame();
            assert_eq!(fps.poll(t0 + Duration::from_millis(i * 30)), None);
        }
        assert_eq!(fps.pending(), 30);
        assert_eq!(fps.poll(t0 + Duration::from_secs(1)), Some(30));
        assert_eq!(fps.fps(), 30);
        assert_eq!(fps.pending(), 0);

        // A silent second reads zero.
        assert_eq!(fps.poll(t0 + Duration::from_millis(1500)), None);
        assert_eq!(fps.poll(t0 + Duration::from_secs(2)), Some(0));
    }
}
