//! Alpha channel upscaling. The network only sees color, so alpha is resized
//! separately with a fixed filter chosen by the model's scale factor.

use anyhow::{ensure, Result};

use crate::error::SrError;
use crate::tensor::GpuTensor;

/// Keys cubic convolution coefficient.
const CUBIC_A: f32 = -0.75;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlphaFilter {
    /// The alpha tile is reused as-is.
    Identity,
    Bicubic { factor: usize },
}

impl AlphaFilter {
    pub fn for_scale(scale: usize) -> crate::error::Result<Self> {
        match scale {
            1 => Ok(Self::Identity),
            4 => Ok(Self::Bicubic { factor: 4 }),
            other => Err(SrError::unsupported(format!(
                "no alpha upscale policy for scale {other}"
            ))),
        }
    }

    pub fn factor(&self) -> usize {
        match self {
            Self::Identity => 1,
            Self::Bicubic { factor } => *factor,
        }
    }

    pub fn output_extent(&self, width: usize, height: usize) -> (usize, usize) {
        (width * self.factor(), height * self.factor())
    }

    pub(crate) fn resize(&self, src: &GpuTensor, dst: &mut GpuTensor) -> Result<()> {
        let (ow, oh) = self.output_extent(src.width(), src.height());
        ensure!(
            (dst.width(), dst.height(), dst.channels()) == (ow, oh, src.channels()),
            "alpha destination {:?} is not {ow}x{oh}",
            dst
        );

        match self {
            Self::Identity => dst.copy_from(src),
            Self::Bicubic { factor } => {
                bicubic(src, dst, *factor);
                Ok(())
            }
        }
    }
}

fn cubic_coeffs(t: f32) -> [f32; 4] {
    let a = CUBIC_A;
    let t1 = t + 1.0;
    let c0 = ((a * t1 - 5.0 * a) * t1 + 8.0 * a) * t1 - 4.0 * a;
    let c1 = ((a + 2.0) * t - (a + 3.0)) * t * t + 1.0;
    let u = 1.0 - t;
    let c2 = ((a + 2.0) * u - (a + 3.0)) * u * u + 1.0;
    [c0, c1, c2, 1.0 - c0 - c1 - c2]
}

/// Source index and weights for each destination index, half-pixel centers.
fn taps(dst_len: usize, src_len: usize, factor: usize) -> Vec<([usize; 4], [f32; 4])> {
    let last = src_len as isize - 1;
    (0..dst_len)
        .map(|d| {
            let f = (d as f32 + 0.5) / factor as f32 - 0.5;
            let s = f.floor();
            let base = s as isize;
            let idx = [-1, 0, 1, 2].map(|o| (base + o).clamp(0, last) as usize);
            (idx, cubic_coeffs(f - s))
        })
        .collect()
}

fn bicubic(src: &GpuTensor, dst: &mut GpuTensor, factor: usize) {
    let xs = taps(dst.width(), src.width(), factor);
    let ys = taps(dst.height(), src.height(), factor);

    for c in 0..src.channels() {
        for (dy, (yi, yw)) in ys.iter().enumerate() {
            for (dx, (xi, xw)) in xs.iter().enumerate() {
                let mut acc = 0.0;
                for (sy, wy) in yi.iter().zip(yw) {
                    let row: f32 = xi.iter().zip(xw).map(|(sx, wx)| src.load(c, *sy, *sx) * wx).sum();
                    acc += row * wy;
                }
                dst.store(c, dy, dx, acc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocation;
    use crate::tensor::{ElementType, TensorShape};

    fn tensor(w: usize, h: usize) -> GpuTensor {
        GpuTensor::zeroed(TensorShape::planar(w, h, 1), ElementType::F32, Allocation::detached())
    }

    #[test]
    fn policy_by_scale() {
        assert_eq!(AlphaFilter::for_scale(1).unwrap(), AlphaFilter::Identity);
        assert_eq!(AlphaFilter::for_scale(4).unwrap(), AlphaFilter::Bicubic { factor: 4 });
        assert!(matches!(
            AlphaFilter::for_scale(2),
            Err(SrError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn coefficients_sum_to_one() {
        for t in [0.0, 0.125, 0.375, 0.625, 0.875] {
            let sum: f32 = cubic_coeffs(t).iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert_eq!(cubic_coeffs(0.0), [0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn bicubic_preserves_flat_alpha() {
        let mut src = tensor(3, 2);
        for y in 0..2 {
            for x in 0..3 {
                src.store(0, y, x, 200.0);
            }
        }
        let filter = AlphaFilter::Bicubic { factor: 4 };
        let mut dst = tensor(12, 8);
        filter.resize(&src, &mut dst).unwrap();
        assert!(dst.channel_to_vec(0).iter().all(|v| (v - 200.0).abs() < 1e-3));
    }

    #[test]
    fn bicubic_step_is_monotonic_between_samples() {
        let mut src = tensor(2, 1);
        src.store(0, 0, 1, 255.0);
        let mut dst = tensor(8, 4);
        AlphaFilter::Bicubic { factor: 4 }.resize(&src, &mut dst).unwrap();
        let row = &dst.channel_to_vec(0)[..8];
        assert!(row[2..6].windows(2).all(|pair| pair[0] < pair[1]));
        // Symmetric about the step, ringing included.
        for i in 0..4 {
            assert!((row[i] + row[7 - i] - 255.0).abs() < 1e-2, "{row:?}");
        }
        assert!(row[0] < 0.0);
    }

    #[test]
    fn identity_copies_exactly() {
        let mut src = tensor(2, 2);
        src.store(0, 1, 0, 17.0);
        let mut dst = tensor(2, 2);
        AlphaFilter::Identity.resize(&src, &mut dst).unwrap();
        assert_eq!(dst.channel_to_vec(0), [0.0, 0.0, 17.0, 0.0]);
    }

    #[test]
    fn wrong_destination_extent_is_rejected() {
        let src = tensor(2, 2);
        let mut dst = tensor(4, 4);
        assert!(AlphaFilter::Bicubic { factor: 4 }.resize(&src, &mut dst).is_err());
    }
}
