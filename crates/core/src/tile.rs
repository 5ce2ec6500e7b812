//! Tile geometry.
//!
//! Images are processed one row of tiles at a time. Each row uploads a strip
//! of input rows extended by `prepadding` above and below (clamped to the
//! image), and every tile in the row is cropped out of that strip with
//! `prepadding` context on each side. Context that falls outside the image is
//! synthesized by reflection in the preprocess kernel, so the network always
//! sees a `(nopad + 2 * prepadding)` square-edged input.

use crate::error::{Result, SrError};

/// Tile edge picked from the device heap budget (MiB) when none is configured.
pub fn auto_tile_size(heap_budget_mb: u64) -> usize {
    match heap_budget_mb {
        b if b > 1900 => 200,
        b if b > 550 => 100,
        b if b > 190 => 64,
        _ => 32,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TilePlan {
    width: usize,
    height: usize,
    tile_size: usize,
    prepadding: usize,
    xtiles: usize,
    ytiles: usize,
}

/// One row of tiles and the input strip it reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRow {
    pub index: usize,
    /// Output rows `[y0, y1)` in input-image coordinates.
    pub y0: usize,
    pub y1: usize,
    /// Input rows `[in_y0, in_y1)` uploaded for this row.
    pub in_y0: usize,
    pub in_y1: usize,
}

impl TileRow {
    pub fn height_nopad(&self) -> usize {
        self.y1 - self.y0
    }

    pub fn strip_height(&self) -> usize {
        self.in_y1 - self.in_y0
    }

    /// Offset of the row's first output line inside the uploaded strip.
    pub fn crop_y(&self) -> usize {
        self.y0 - self.in_y0
    }
}

/// Geometry of one tile. Padded bounds are clamped to the image; the network
/// input is always `input_width() x input_height()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileDescriptor {
    pub xi: usize,
    pub yi: usize,
    pub x0: usize,
    pub y0: usize,
    pub width_nopad: usize,
    pub height_nopad: usize,
    pub padded_x0: usize,
    pub padded_x1: usize,
    pub padded_y0: usize,
    pub padded_y1: usize,
    pub prepadding: usize,
}

impl TileDescriptor {
    pub fn input_width(&self) -> usize {
        self.width_nopad + 2 * self.prepadding
    }

    pub fn input_height(&self) -> usize {
        self.height_nopad + 2 * self.prepadding
    }
}

impl TilePlan {
    /// `tile_size == 0` plans a single tile covering the whole image.
    pub fn new(width: usize, height: usize, tile_size: usize, prepadding: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(SrError::unsupported(format!(
                "cannot tile an empty {width}x{height} image"
            )));
        }

        let tile_size = if tile_size == 0 {
            width.max(height)
        } else {
            tile_size
        };

        Ok(Self {
            width,
            height,
            tile_size,
            prepadding,
            xtiles: width.div_ceil(tile_size),
            ytiles: height.div_ceil(tile_size),
        })
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn prepadding(&self) -> usize {
        self.prepadding
    }

    pub fn xtiles(&self) -> usize {
        self.xtiles
    }

    pub fn ytiles(&self) -> usize {
        self.ytiles
    }

    pub fn tile_count(&self) -> usize {
        self.xtiles * self.ytiles
    }

    pub fn row(&self, yi: usize) -> TileRow {
        debug_assert!(yi < self.ytiles);
        let y0 = yi * self.tile_size;
        let y1 = ((yi + 1) * self.tile_size).min(self.height);
        TileRow {
            index: yi,
            y0,
            y1,
            in_y0: y0.saturating_sub(self.prepadding),
            in_y1: (y1 + self.prepadding).min(self.height),
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = TileRow> + '_ {
        (0..self.ytiles).map(|yi| self.row(yi))
    }

    pub fn tile(&self, row: &TileRow, xi: usize) -> TileDescriptor {
        debug_assert!(xi < self.xtiles);
        let x0 = xi * self.tile_size;
        let x1 = ((xi + 1) * self.tile_size).min(self.width);
        TileDescriptor {
            xi,
            yi: row.index,
            x0,
            y0: row.y0,
            width_nopad: x1 - x0,
            height_nopad: row.height_nopad(),
            padded_x0: x0.saturating_sub(self.prepadding),
            padded_x1: (x1 + self.prepadding).min(self.width),
            padded_y0: row.in_y0,
            padded_y1: row.in_y1,
            prepadding: self.prepadding,
        }
    }

    pub fn tiles<'a>(&'a self, row: &'a TileRow) -> impl Iterator<Item = TileDescriptor> + 'a {
        (0..self.xtiles).map(move |xi| self.tile(row, xi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tile_size_covers_the_whole_image() {
        let plan = TilePlan::new(8, 6, 0, 10).unwrap();
        assert_eq!(plan.tile_count(), 1);
        let row = plan.row(0);
        assert_eq!((row.in_y0, row.in_y1), (0, 6));
        let tile = plan.tile(&row, 0);
        assert_eq!((tile.width_nopad, tile.height_nopad), (8, 6));
        assert_eq!((tile.input_width(), tile.input_height()), (28, 26));
        assert_eq!((tile.padded_x0, tile.padded_x1), (0, 8));
    }

    #[test]
    fn interior_tiles_get_full_context_and_edges_are_clamped() {
        let plan = TilePlan::new(100, 70, 32, 4).unwrap();
        assert_eq!((plan.xtiles(), plan.ytiles()), (4, 3));

        let row = plan.row(1);
        assert_eq!((row.y0, row.y1), (32, 64));
        assert_eq!((row.in_y0, row.in_y1), (28, 68));
        assert_eq!(row.crop_y(), 4);

        let last = plan.row(2);
        assert_eq!((last.y0, last.y1), (64, 70));
        assert_eq!((last.in_y0, last.in_y1), (60, 70));

        let tile = plan.tile(&row, 3);
        assert_eq!(tile.x0, 96);
        assert_eq!(tile.width_nopad, 4);
        assert_eq!((tile.padded_x0, tile.padded_x1), (92, 100));
        assert_eq!(tile.input_width(), 12);

        let first = plan.tile(&plan.row(0), 0);
        assert_eq!((first.padded_x0, first.padded_y0), (0, 0));
        assert_eq!(plan.row(0).crop_y(), 0);
    }

    #[test]
    fn tiles_partition_the_image_without_overlap() {
        let plan = TilePlan::new(37, 23, 10, 3).unwrap();
        let mut covered = vec![0u8; 37 * 23];
        for row in plan.rows() {
            for tile in plan.tiles(&row) {
                for y in tile.y0..tile.y0 + tile.height_nopad {
                    for x in tile.x0..tile.x0 + tile.width_nopad {
                        covered[y * 37 + x] += 1;
                    }
                }
            }
        }
        assert!(covered.iter().all(|&n| n == 1));
    }

    #[test]
    fn empty_image_is_rejected() {
        assert!(TilePlan::new(0, 4, 0, 0).is_err());
    }

    #[test]
    fn auto_tile_size_thresholds() {
        assert_eq!(auto_tile_size(8192), 200);
        assert_eq!(auto_tile_size(1900), 100);
        assert_eq!(auto_tile_size(551), 100);
        assert_eq!(auto_tile_size(550), 64);
        assert_eq!(auto_tile_size(191), 64);
        assert_eq!(auto_tile_size(190), 32);
        assert_eq!(auto_tile_size(0), 32);
    }
}
