//! Render geometry: cell-to-pixel ratio, drawable region, clamped resolution.

use crossterm::terminal;

use crate::engine::BYTES_PER_PIXEL;
use crate::error::RenderInitError;

/// Pixels per terminal cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellSize {
    pub width: u32,
    pub height: u32,
}

/// A rectangle of terminal cells, 0-indexed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub row: u16,
    pub col: u16,
    pub rows: u16,
    pub cols: u16,
}

/// Anything that can report the terminal's cell size in pixels.
pub trait GeometrySource {
    fn cell_size(&self) -> Result<CellSize, String>;
}

/// Queries the controlling terminal (TIOCGWINSZ via crossterm).
pub struct TerminalGeometry;

impl GeometrySource for TerminalGeometry {
    fn cell_size(&self) -> Result<CellSize, String> {
        let ws = terminal::window_size().map_err(|e| e.to_string())?;
        if ws.columns == 0 || ws.rows == 0 || ws.width == 0 || ws.height == 0 {
            return Err(format!(
                "terminal reports {}x{} cells / {}x{} px; pixel size is required",
                ws.columns, ws.rows, ws.width, ws.height
            ));
        }
        Ok(CellSize {
            width: (ws.width / ws.columns) as u32,
            height: (ws.height / ws.rows) as u32,
        })
    }
}

/// A fixed cell size, for tests and headless runs.
pub struct FixedGeometry(pub CellSize);

impl GeometrySource for FixedGeometry {
    fn cell_size(&self) -> Result<CellSize, String> {
        Ok(self.0)
    }
}

/// Negotiated pixel resolution for one drawable region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderGeometry {
    pub cell: CellSize,
    pub region: Region,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
}

impl RenderGeometry {
    pub fn compute(
        cell: CellSize,
        region: Region,
        max_width: u32,
        max_height: u32,
    ) -> Result<Self, RenderInitError> {
        let native_w = region.cols as u32 * cell.width;
        let native_h = region.rows as u32 * cell.height;
        if native_w == 0 || native_h == 0 {
            return Err(RenderInitError::Geometry(format!(
                "empty render area: {}x{} cells at {}x{} px/cell",
                region.cols, region.rows, cell.width, cell.height
            )));
        }
        let (width, height) = clamp_resolution(native_w, native_h, max_width, max_height);
        Ok(Self {
            cell,
            region,
            width,
            height,
            stride: width as usize * BYTES_PER_PIXEL,
        })
    }

    pub fn frame_len(&self) -> usize {
        self.stride * self.height as usize
    }
}

/// Scale `(w, h)` down to fit `max_w` x `max_h`, keeping the aspect ratio.
/// The longer relative side lands exactly on its limit.
pub fn clamp_resolution(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if w <= max_w && h <= max_h {
        return (w, h);
    }
    let (w64, h64) = (w as u64, h as u64);
    let (mw, mh) = (max_w as u64, max_h as u64);
    if w64 * mh > h64 * mw {
        (max_w, ((h64 * mw / w64) as u32).max(1))
    } else {
        (((w64 * mh / h64) as u32).max(1), max_h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(rows: u16, cols: u16) -> Region {
        Region {
            row: 0,
            col: 0,
            rows,
            cols,
        }
    }

    #[test]
    fn clamp_4k_to_1080p() {
        assert_eq!(clamp_resolution(3840, 2160, 1920, 1080), (1920, 1080));
    }

    #[test]
    fn clamp_wide_and_tall() {
        assert_eq!(clamp_resolution(4000, 1000, 1920, 1080), (1920, 480));
        assert_eq!(clamp_resolution(1000, 3000, 1920, 1080), (360, 1080));
    }

    #[test]
    fn clamp_keeps_small_sizes() {
        assert_eq!(clamp_resolution(800, 600, 1920, 1080), (800, 600));
        assert_eq!(clamp_resolution(1920, 1080, 1920, 1080), (1920, 1080));
    }

    #[test]
    fn clamp_preserves_aspect_within_rounding() {
        let (w, h) = clamp_resolution(2559, 1439, 1920, 1080);
        assert!(w <= 1920 && h <= 1080);
        let src = 2559.0 / 1439.0;
        let dst = w as f64 / h as f64;
        assert!((src - dst).abs() < 0.01, "{src} vs {dst}");
    }

    #[test]
    fn compute_from_cells() {
        let cell = CellSize {
            width: 10,
            height: 20,
        };
        let g = RenderGeometry::compute(cell, region(30, 120), 1920, 1080).unwrap();
        assert_eq!((g.width, g.height), (1200, 600));
        assert_eq!(g.stride, 4800);
        assert_eq!(g.frame_len(), 4800 * 600);

        let g = RenderGeometry::compute(cell, region(100, 400), 1920, 1080).unwrap();
        assert_eq!((g.width, g.height), (1920, 960));
    }

    #[test]
    fn compute_rejects_empty_area() {
        let cell = CellSize {
            width: 10,
            height: 20,
        };
        assert!(matches!(
            RenderGeometry::compute(cell, region(0, 80), 1920, 1080),
            Err(RenderInitError::Geometry(_))
        ));
    }
}
