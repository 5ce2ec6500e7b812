//! Deterministic networks and fixtures shared by the integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use vksr_core::allocator::DeviceAllocator;
use vksr_core::session::{SessionConfig, SrSession};
use vksr_core::tensor::{GpuTensor, StorageCapabilities};
use vksr_core::{DeviceInfo, DeviceRegistry, Network};

/// Repeats every input pixel `scale` times in both directions.
pub struct Nearest {
    pub scale: usize,
    pub caps: StorageCapabilities,
}

impl Nearest {
    pub fn new(scale: usize) -> Self {
        Self {
            scale,
            caps: StorageCapabilities::FULL,
        }
    }
}

impl Network for Nearest {
    fn capabilities(&self) -> StorageCapabilities {
        self.caps
    }

    fn forward(&self, input: &GpuTensor, allocator: &DeviceAllocator) -> Result<GpuTensor> {
        let s = self.scale;
        let mut out = allocator.create_planar(input.width() * s, input.height() * s, 3, input.element())?;
        for c in 0..3 {
            for y in 0..out.height() {
                for x in 0..out.width() {
                    out.store(c, y, x, input.load(c, y / s, x / s));
                }
            }
        }
        Ok(out)
    }
}

/// Box blur of radius `radius` (clamped at the tile border), then nearest
/// upscaling. Every output pixel depends on a neighbourhood, so tile seams
/// show up unless the context padding covers the radius.
pub struct BoxBlur {
    pub scale: usize,
    pub radius: usize,
}

impl Network for BoxBlur {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::FULL
    }

    fn forward(&self, input: &GpuTensor, allocator: &DeviceAllocator) -> Result<GpuTensor> {
        let (w, h, s, r) = (input.width(), input.height(), self.scale, self.radius as isize);
        let mut out = allocator.create_planar(w * s, h * s, 3, input.element())?;
        for c in 0..3 {
            for y in 0..h {
                for x in 0..w {
                    let mut sum = 0.0f32;
                    let mut count = 0.0f32;
                    for dy in -r..=r {
                        for dx in -r..=r {
                            let sy = (y as isize + dy).clamp(0, h as isize - 1) as usize;
                            let sx = (x as isize + dx).clamp(0, w as isize - 1) as usize;
                            sum += input.load(c, sy, sx);
                            count += 1.0;
                        }
                    }
                    let v = sum / count;
                    for oy in 0..s {
                        for ox in 0..s {
                            out.store(c, y * s + oy, x * s + ox, v);
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Fails on the `fail_at`-th forward call (0-based).
pub struct Failing {
    pub scale: usize,
    pub fail_at: usize,
    pub calls: std::sync::atomic::AtomicUsize,
}

impl Failing {
    pub fn new(scale: usize, fail_at: usize) -> Self {
        Self {
            scale,
            fail_at,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

impl Network for Failing {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::FULL
    }

    fn forward(&self, input: &GpuTensor, allocator: &DeviceAllocator) -> Result<GpuTensor> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if call == self.fail_at {
            bail!("malformed input tensor {}x{}", input.width(), input.height());
        }
        Nearest::new(self.scale).forward(input, allocator)
    }
}

pub fn registry() -> DeviceRegistry {
    DeviceRegistry::initialize(vec![DeviceInfo {
        ordinal: 0,
        name: "test-device".into(),
        heap_budget_mb: 256,
    }])
    .expect("registry")
}

pub fn session_with(
    registry: &DeviceRegistry,
    config: SessionConfig,
    network: impl Network + 'static,
) -> SrSession {
    let mut session = SrSession::new(registry, config).expect("session");
    session.load_network(Box::new(network)).expect("load network");
    session
}

/// Row-major interleaved pixels from `f(x, y) -> [u8; C]`.
pub fn image<const C: usize>(w: usize, h: usize, f: impl Fn(usize, usize) -> [u8; C]) -> Vec<u8> {
    let mut data = Vec::with_capacity(w * h * C);
    for y in 0..h {
        for x in 0..w {
            data.extend_from_slice(&f(x, y));
        }
    }
    data
}

pub fn pixel(data: &[u8], w: usize, c: usize, x: usize, y: usize) -> &[u8] {
    let at = (y * w + x) * c;
    &data[at..at + c]
}
