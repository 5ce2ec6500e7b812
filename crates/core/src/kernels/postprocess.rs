//! Undo the orientations, average them, scale back to `[0, 255]` and write the
//! unpadded part of the tile into the output strip alongside the alpha tile.

use anyhow::{ensure, Result};

use super::{Pipeline, Stage};
use crate::tensor::GpuTensor;
use crate::tile::TileDescriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostprocessConstants {
    /// First output column written by this tile.
    pub offset_x: usize,
    /// Output columns written, clamped to what remains of the strip.
    pub width: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub channels: usize,
}

impl PostprocessConstants {
    pub fn for_tile(tile: &TileDescriptor, scale: usize, out_width: usize, channels: usize) -> Self {
        let offset_x = tile.x0 * scale;
        Self {
            offset_x,
            width: (tile.width_nopad * scale).min(out_width.saturating_sub(offset_x)),
            pad_top: tile.prepadding * scale,
            pad_left: tile.prepadding * scale,
            channels,
        }
    }
}

pub(crate) fn dispatch(
    pipeline: &Pipeline,
    tiles: &[&GpuTensor],
    alpha: Option<&GpuTensor>,
    dst: &mut GpuTensor,
    k: &PostprocessConstants,
) -> Result<()> {
    ensure!(pipeline.stage() == Stage::Postprocess, "{} is not a postprocess kernel", pipeline.name());
    let transforms = pipeline.transforms();
    ensure!(
        tiles.len() == transforms.len(),
        "{} expects {} tile tensors, got {}",
        pipeline.name(),
        transforms.len(),
        tiles.len()
    );
    ensure!(
        dst.channels() == k.channels,
        "destination has {} channels, constants say {}",
        dst.channels(),
        k.channels
    );
    pipeline.check_image(dst, "destination")?;

    let (w, h) = (tiles[0].width(), tiles[0].height());
    let out_h = dst.height();
    ensure!(
        k.pad_left + k.width <= w && k.pad_top + out_h <= h,
        "{w}x{h} tile cannot supply {}x{out_h} pixels at pad {}",
        k.width,
        k.pad_left
    );
    ensure!(
        k.offset_x + k.width <= dst.width(),
        "tile writes past the strip: {} + {} > {}",
        k.offset_x,
        k.width,
        dst.width()
    );
    for (tile, t) in tiles.iter().zip(transforms) {
        pipeline.check_tile(tile, "tile")?;
        ensure!(
            (tile.width(), tile.height()) == t.extent(w, h),
            "{:?} tile {:?} is not a {w}x{h} variant",
            t,
            tile
        );
    }

    let alpha = match (k.channels, alpha) {
        (3, _) => None,
        (4, Some(a)) => {
            pipeline.check_tile(a, "alpha")?;
            ensure!(
                a.width() >= k.width && a.height() >= out_h,
                "alpha tile {:?} smaller than {}x{out_h}",
                a,
                k.width
            );
            Some(a)
        }
        (4, None) => anyhow::bail!("four-channel destination without an alpha tensor"),
        (c, _) => anyhow::bail!("unsupported channel count {c}"),
    };

    let variants = tiles.len() as f32;
    for gy in 0..out_h {
        let sy = gy + k.pad_top;
        for gx in 0..k.width {
            let sx = gx + k.pad_left;
            let ox = gx + k.offset_x;

            for c in 0..3 {
                let sum: f32 = tiles
                    .iter()
                    .zip(transforms)
                    .map(|(tile, t)| {
                        let (vx, vy) = t.apply(sx, sy, w, h);
                        tile.load(c, vy, vx)
                    })
                    .sum();
                let v = (sum / variants * 255.0).clamp(0.0, 255.0);
                dst.store(pipeline.host_channel(c), gy, ox, v);
            }

            if let Some(a) = alpha {
                dst.store(3, gy, ox, a.load(0, gy, gx).clamp(0.0, 255.0));
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

    fn pipeline(tta: bool, tier: StorageTier) -> Pipeline {
        Pipeline::create(Stage::Postprocess, KernelKey { tta, tier }, ChannelOrder::Rgb).unwrap()
    }

    fn constants(width: usize, channels: usize) -> PostprocessConstants {
        PostprocessConstants {
            offset_x: 0,
            width,
            pad_top: 1,
            pad_left: 1,
            channels,
        }
    }

    #[test]
    fn discards_padding_and_denormalizes() {
        let mut tile = tensor(TensorShape::planar(4, 3, 3), ElementType::F32);
        tile.store(0, 1, 1, 0.5);
        tile.store(1, 1, 2, 2.0);
        tile.store(2, 0, 0, 1.0);
        let mut dst = tensor(TensorShape::planar(2, 1, 3), ElementType::F32);
        dispatch(&pipeline(false, StorageTier::Full), &[&tile], None, &mut dst, &constants(2, 3)).unwrap();

        assert_eq!(dst.channel_to_vec(0), [127.5, 0.0]);
        // clamped
        assert_eq!(dst.channel_to_vec(1), [0.0, 255.0]);
        // padding is never read
        assert_eq!(dst.channel_to_vec(2), [0.0, 0.0]);
    }

    #[test]
    fn tta_averages_inverse_transformed_variants() {
        let (w, h) = (3, 3);
        let tiles: Vec<GpuTensor> = Transform::ALL
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let (vw, vh) = t.extent(w, h);
                let mut tile = tensor(TensorShape::planar(vw, vh, 3), ElementType::F32);
                // Variant i stores i/28 at the position source pixel (1, 1) maps to.
                let (vx, vy) = t.apply(1, 1, w, h);
                tile.store(0, vy, vx, i as f32 / 28.0);
                tile
            })
            .collect();
        let refs: Vec<&GpuTensor> = tiles.iter().collect();
        let mut dst = tensor(TensorShape::planar(1, 1, 3), ElementType::F32);
        dispatch(&pipeline(true, StorageTier::Full), &refs, None, &mut dst, &constants(1, 3)).unwrap();

        // (0 + 1 + ... + 7) / 28 / 8 * 255
        let expected = 255.0 / 8.0;
        assert!((dst.load(0, 0, 0) - expected).abs() < 1e-4);
    }

    #[test]
    fn writes_alpha_at_tile_offset_into_packed_bytes() {
        let mut tile = tensor(TensorShape::planar(3, 3, 3), ElementType::F16);
        tile.store(1, 1, 1, 1.0);
        let mut alpha = tensor(TensorShape::planar(1, 1, 1), ElementType::F16);
        alpha.store(0, 0, 0, 300.0);
        let mut dst = tensor(TensorShape::packed(2, 1, 4), ElementType::U8);
        let k = PostprocessConstants {
            offset_x: 1,
            ..constants(1, 4)
        };
        dispatch(&pipeline(false, StorageTier::Reduced), &[&tile], Some(&alpha), &mut dst, &k).unwrap();
        assert_eq!(dst.as_bytes().unwrap(), &[0, 0, 0, 0, 0, 255, 0, 255]);
    }

    #[test]
    fn refuses_to_write_past_the_strip() {
        let tile = tensor(TensorShape::planar(4, 3, 3), ElementType::F32);
        let mut dst = tensor(TensorShape::planar(2, 1, 3), ElementType::F32);
        let k = PostprocessConstants {
            offset_x: 1,
            ..constants(2, 3)
        };
        assert!(dispatch(&pipeline(false, StorageTier::Full), &[&tile], None, &mut dst, &k).is_err());
    }
}
