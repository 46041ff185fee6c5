//! Kitty graphics protocol commands for shared-memory frames.
//!
//! Every command carries `q=2` so the terminal never answers: a reply would
//! arrive on stdin as an APC sequence and be misread as key input.

use std::path::Path;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use super::geometry::RenderGeometry;
use super::shm::ImageSlot;

/// Begin/end synchronized update (DEC private mode 2026).
const SYNC_BEGIN: &str = "\x1b[?2026h";
const SYNC_END: &str = "\x1b[?2026l";

/// Pre-built frame announcements, one per slot.
pub struct FrameCommands {
    commands: [Vec<u8>; 2],
}

impl FrameCommands {
    /// Build both commands once. `path_of` gives each slot's segment path.
    pub fn build<'a>(geom: &RenderGeometry, path_of: impl Fn(ImageSlot) -> &'a Path) -> Self {
        let [one, two] =
            ImageSlot::BOTH.map(|slot| frame_command(geom, slot, path_of(slot)).into_bytes());
        Self {
            commands: [one, two],
        }
    }

    pub fn for_slot(&self, slot: ImageSlot) -> &[u8] {
        match slot {
            ImageSlot::One => &self.commands[0],
            ImageSlot::Two => &self.commands[1],
        }
    }
}

/// One atomic frame announcement: move to the region, transmit-and-display
/// `slot` from its file, then delete the other image.
pub fn frame_command(geom: &RenderGeometry, slot: ImageSlot, path: &Path) -> String {
    let b64 = BASE64.encode(path.as_os_str().as_encoded_bytes());
    let r = geom.region;
    format!(
        "{SYNC_BEGIN}\x1b[{row};{col}H\
         \x1b_Ga=T,q=2,f=32,s={w},v={h},i={id},t=f,c={cols},r={rows};{b64}\x1b\\\
         \x1b_Ga=d,d=I,i={other},q=2;\x1b\\\
         {SYNC_END}",
        row = r.row as u32 + 1,
        col = r.col as u32 + 1,
        w = geom.width,
        h = geom.height,
        id = slot.image_id(),
        cols = r.cols,
        rows = r.rows,
        other = slot.other().image_id(),
    )
}

/// Delete both frame images and their placements.
pub fn delete_frames_command() -> String {
    ImageSlot::BOTH
        .iter()
        .map(|s| format!("\x1b_Ga=d,d=I,i={},q=2;\x1b\\", s.image_id()))
        .collect()
}

/// Blank the cells of the region (text layer) row by row.
pub fn clear_region_command(geom: &RenderGeometry) -> String {
    let r = geom.region;
    (0..r.rows)
        .map(|i| {
            format!(
                "\x1b[{};{}H\x1b[{}X",
                r.row as u32 + i as u32 + 1,
                r.col as u32 + 1,
                r.cols
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::geometry::{CellSize, Region};

    fn geom() -> RenderGeometry {
        RenderGeometry {
            cell: CellSize {
                width: 10,
                height: 20,
            },
            region: Region {
                row: 2,
                col: 3,
                rows: 30,
                cols: 80,
            },
            width: 800,
            height: 600,
            stride: 3200,
        }
    }

    #[test]
    fn frame_command_is_bit_exact() {
        let cmd = frame_command(&geom(), ImageSlot::One, Path::new("/dev/shm/x"));
        let b64 = BASE64.encode("/dev/shm/x");
        let expected = format!(
            "\x1b[?2026h\x1b[3;4H\x1b_Ga=T,q=2,f=32,s=800,v=600,i=1,t=f,c=80,r=30;{b64}\x1b\\\x1b_Ga=d,d=I,i=2,q=2;\x1b\\\x1b[?2026l"
        );
        assert_eq!(cmd, expected);
    }

    #[test]
    fn each_slot_deletes_the_other() {
        let g = geom();
        let cmds = FrameCommands::build(&g, |_| Path::new("/tmp/f"));
        let one = String::from_utf8(cmds.for_slot(ImageSlot::One).to_vec()).unwrap();
        let two = String::from_utf8(cmds.for_slot(ImageSlot::Two).to_vec()).unwrap();
        assert!(one.contains(",i=1,t=f") && one.contains("d=I,i=2,"));
        assert!(two.contains(",i=2,t=f") && two.contains("d=I,i=1,"));
    }

    #[test]
    fn delete_both() {
        assert_eq!(
            delete_frames_command(),
            "\x1b_Ga=d,d=I,i=1,q=2;\x1b\\\x1b_Ga=d,d=I,i=2,q=2;\x1b\\"
        );
    }

    #[test]
    fn clear_region_covers_every_row() {
        let s = clear_region_command(&geom());
        assert_eq!(s.matches("X").count(), 30);
        assert!(s.starts_with("\x1b[3;4H\x1b[80X"));
    }
}
