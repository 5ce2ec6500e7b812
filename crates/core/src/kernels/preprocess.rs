//! Crop a padded tile out of the uploaded strip, normalize it to `[0, 1]`, and
//! write one tensor per orientation. Alpha is copied raw into its own tensor,
//! once, covering the unpadded tile.

use anyhow::{ensure, Result};

use super::{Pipeline, Stage};
use crate::tensor::GpuTensor;
use crate::tile::{TileDescriptor, TileRow};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreprocessConstants {
    pub pad_top: usize,
    pub pad_left: usize,
    /// Column of the tile's first unpadded pixel in the strip.
    pub crop_x: usize,
    /// Row of the tile's first unpadded pixel in the strip.
    pub crop_y: usize,
    pub channels: usize,
}

impl PreprocessConstants {
    pub fn for_tile(tile: &TileDescriptor, row: &TileRow, channels: usize) -> Self {
        Self {
            pad_top: tile.prepadding,
            pad_left: tile.prepadding,
            crop_x: tile.x0,
            crop_y: row.crop_y(),
            channels,
        }
    }
}

/// Mirror `i` into `[0, n)` without repeating the edge sample.
#[inline]
pub(crate) fn reflect(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let m = i.rem_euclid(period);
    let last = n as isize - 1;
    (last - (m - last).abs()) as usize
}

pub(crate) fn dispatch(
    pipeline: &Pipeline,
    src: &GpuTensor,
    tiles: &mut [GpuTensor],
    mut alpha: Option<&mut GpuTensor>,
    k: &PreprocessConstants,
) -> Result<()> {
    ensure!(pipeline.stage() == Stage::Preprocess, "{} is not a preprocess kernel", pipeline.name());
    let transforms = pipeline.transforms();
    ensure!(
        tiles.len() == transforms.len(),
        "{} expects {} tile tensors, got {}",
        pipeline.name(),
        transforms.len(),
        tiles.len()
    );
    ensure!(
        src.channels() == k.channels,
        "source has {} channels, constants say {}",
        src.channels(),
        k.channels
    );
    pipeline.check_image(src, "source")?;

    let (w, h) = (tiles[0].width(), tiles[0].height());
    for (tile, t) in tiles.iter().zip(transforms) {
        pipeline.check_tile(tile, "tile")?;
        ensure!(
            (tile.width(), tile.height()) == t.extent(w, h) && tile.channels() == 3,
            "{:?} tile {:?} does not fit a {w}x{h} crop",
            t,
            tile
        );
    }

    let (alpha_w, alpha_h) = match (k.channels, alpha.as_deref()) {
        (3, _) => (0, 0),
        (4, Some(a)) => {
            pipeline.check_tile(a, "alpha")?;
            ensure!(
                k.pad_left + a.width() <= w && k.pad_top + a.height() <= h,
                "alpha tile {:?} exceeds {w}x{h} crop",
                a
            );
            (a.width(), a.height())
        }
        (4, None) => anyhow::bail!("four-channel source without an alpha tensor"),
        (c, _) => anyhow::bail!("unsupported channel count {c}"),
    };

    let (src_w, src_h) = (src.width(), src.height());
    for gy in 0..h {
        let sy = reflect(gy as isize + k.crop_y as isize - k.pad_top as isize, src_h);
        for gx in 0..w {
            let sx = reflect(gx as isize + k.crop_x as isize - k.pad_left as isize, src_w);

            for c in 0..3 {
                let v = src.load(pipeline.host_channel(c), sy, sx) / 255.0;
                for (tile, t) in tiles.iter_mut().zip(transforms) {
                    let (vx, vy) = t.apply(gx, gy, w, h);
                    tile.store(c, vy, vx, v);
                }
            }

            if let Some(a) = alpha.as_deref_mut() {
                let (ax, ay) = (gx.wrapping_sub(k.pad_left), gy.wrapping_sub(k.pad_top));
                if ax < alpha_w && ay < alpha_h {
                    a.store(0, ay, ax, src.load(3, sy, sx));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocation;
    use crate::kernels::{ChannelOrder, KernelKey, Transform};
    use crate::tensor::{ElementType, StorageTier, TensorShape};

    fn tensor(shape: TensorShape, element: ElementType) -> GpuTensor {
        GpuTensor::zeroed(shape, element, Allocation::detached())
    }

    fn pipeline(tta: bool, order: ChannelOrder) -> Pipeline {
        Pipeline::create(
            Stage::Preprocess,
            KernelKey {
                tta,
                tier: StorageTier::Full,
            },
            order,
        )
        .unwrap()
    }

    /// 3x2 RGBA strip where red encodes the column and green the row.
    fn gradient_source() -> GpuTensor {
        let mut src = tensor(TensorShape::planar(3, 2, 4), ElementType::F32);
        for y in 0..2 {
            for x in 0..3 {
                src.store(0, y, x, x as f32 * 51.0);
                src.store(1, y, x, y as f32 * 255.0);
                src.store(2, y, x, 0.0);
                src.store(3, y, x, 100.0 + (y * 3 + x) as f32);
            }
        }
        src
    }

    #[test]
    fn reflect_mirrors_without_repeating_edges() {
        let mirrored: Vec<usize> = (-4..8).map(|i| reflect(i, 4)).collect();
        assert_eq!(mirrored, [2, 3, 2, 1, 0, 1, 2, 3, 2, 1, 0, 1]);
        assert_eq!(reflect(-3, 1), 0);
        assert_eq!(reflect(25, 2), 1);
    }

    #[test]
    fn padded_crop_reflects_and_normalizes() {
        let src = gradient_source();
        let k = PreprocessConstants {
            pad_top: 1,
            pad_left: 1,
            crop_x: 0,
            crop_y: 0,
            channels: 4,
        };
        let mut tiles = [tensor(TensorShape::planar(5, 4, 3), ElementType::F32)];
        let mut alpha = tensor(TensorShape::planar(3, 2, 1), ElementType::F32);
        dispatch(&pipeline(false, ChannelOrder::Rgb), &src, &mut tiles, Some(&mut alpha), &k).unwrap();

        // Column -1 reflects to column 1, column 3 reflects to column 1.
        let red_row: Vec<f32> = (0..5).map(|x| tiles[0].load(0, 1, x)).collect();
        assert_eq!(red_row, [0.2, 0.0, 0.2, 0.4, 0.2]);
        assert_eq!(tiles[0].load(1, 0, 1), 1.0);
        assert_eq!(tiles[0].load(1, 1, 1), 0.0);

        assert_eq!(alpha.channel_to_vec(0), [100.0, 101.0, 102.0, 103.0, 104.0, 105.0]);
    }

    #[test]
    fn tta_writes_every_orientation() {
        let src = gradient_source();
        let k = PreprocessConstants {
            pad_top: 0,
            pad_left: 0,
            crop_x: 0,
            crop_y: 0,
            channels: 4,
        };
        let mut tiles: Vec<GpuTensor> = Transform::ALL
            .iter()
            .map(|t| {
                let (w, h) = t.extent(3, 2);
                tensor(TensorShape::planar(w, h, 3), ElementType::F32)
            })
            .collect();
        let mut alpha = tensor(TensorShape::planar(3, 2, 1), ElementType::F32);
        dispatch(&pipeline(true, ChannelOrder::Rgb), &src, &mut tiles, Some(&mut alpha), &k).unwrap();

        // Source pixel (2, 0) has red 102/255.
        for (tile, t) in tiles.iter().zip(Transform::ALL) {
            let (vx, vy) = t.apply(2, 0, 3, 2);
            assert_eq!(tile.load(0, vy, vx), 0.4, "{t:?}");
        }
        assert_eq!((tiles[5].width(), tiles[5].height()), (2, 3));
    }

    #[test]
    fn bgr_order_swaps_color_channels() {
        let mut src = tensor(TensorShape::planar(1, 1, 3), ElementType::F32);
        src.store(0, 0, 0, 255.0);
        let k = PreprocessConstants {
            pad_top: 0,
            pad_left: 0,
            crop_x: 0,
            crop_y: 0,
            channels: 3,
        };
        let mut tiles = [tensor(TensorShape::planar(1, 1, 3), ElementType::F32)];
        dispatch(&pipeline(false, ChannelOrder::Bgr), &src, &mut tiles, None, &k).unwrap();
        assert_eq!(tiles[0].load(0, 0, 0), 0.0);
        assert_eq!(tiles[0].load(2, 0, 0), 1.0);
    }

    #[test]
    fn mismatched_tile_count_is_rejected() {
        let src = gradient_source();
        let k = PreprocessConstants {
            pad_top: 0,
            pad_left: 0,
            crop_x: 0,
            crop_y: 0,
            channels: 4,
        };
        let mut tiles = [tensor(TensorShape::planar(3, 2, 3), ElementType::F32)];
        let mut alpha = tensor(TensorShape::planar(3, 2, 1), ElementType::F32);
        assert!(dispatch(&pipeline(true, ChannelOrder::Rgb), &src, &mut tiles, Some(&mut alpha), &k).is_err());
    }
}
