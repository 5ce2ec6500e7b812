//! Device-resident tensors and the storage precision they are kept in.

use half::f16;
use serde::{Deserialize, Serialize};

use crate::allocator::Allocation;

/// Plane strides are rounded up to this many bytes.
const CSTEP_ALIGN: usize = 16;

/// Storage features a network can run with, negotiated at load time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StorageCapabilities {
    pub fp16_storage: bool,
    pub int8_storage: bool,
}

impl StorageCapabilities {
    pub const FULL: Self = Self {
        fp16_storage: false,
        int8_storage: false,
    };

    /// Drop whatever the session policy does not allow.
    pub fn restrict(self, allow_fp16: bool, allow_int8: bool) -> Self {
        let fp16_storage = self.fp16_storage && allow_fp16;
        Self {
            fp16_storage,
            // int8 image buffers only exist alongside fp16 tile tensors
            int8_storage: fp16_storage && self.int8_storage && allow_int8,
        }
    }
}

/// Numeric representation of on-device tensors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageTier {
    /// fp32 everywhere.
    Full,
    /// fp16 tile tensors and image buffers.
    Half,
    /// fp16 tile tensors, u8 packed image buffers.
    Reduced,
}

impl StorageTier {
    pub fn negotiate(caps: StorageCapabilities) -> Self {
        match (caps.fp16_storage, caps.int8_storage) {
            (true, true) => Self::Reduced,
            (true, false) => Self::Half,
            _ => Self::Full,
        }
    }

    /// Element type of the tensors the network reads and writes.
    pub fn tile_element(self) -> ElementType {
        match self {
            Self::Full => ElementType::F32,
            Self::Half | Self::Reduced => ElementType::F16,
        }
    }

    /// Element type of the device copies of the host input and output image.
    pub fn image_element(self) -> ElementType {
        match self {
            Self::Full => ElementType::F32,
            Self::Half => ElementType::F16,
            Self::Reduced => ElementType::U8,
        }
    }

    /// Whether image buffers keep the host's interleaved byte layout.
    pub fn packs_pixels(self) -> bool {
        self == Self::Reduced
    }

    /// Layout of a device image buffer of the given extent.
    pub fn image_shape(self, width: usize, height: usize, channels: usize) -> TensorShape {
        if self.packs_pixels() {
            TensorShape::packed(width, height, channels)
        } else {
            TensorShape::planar(width, height, channels)
        }
    }

    pub fn kernel_suffix(self) -> &'static str {
        match self {
            Self::Full => "",
            Self::Half => "_fp16s",
            Self::Reduced => "_int8s",
        }
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "fp32"),
            Self::Half => write!(f, "fp16"),
            Self::Reduced => write!(f, "int8"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    F16,
    U8,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::U8 => 1,
        }
    }
}

/// How channels are laid out in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    /// One plane per channel, each padded to [`CSTEP_ALIGN`] bytes.
    Planar,
    /// All channels of a pixel stored next to each other in a single dense plane.
    Packed,
}

/// Logical extent of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorShape {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub layout: Layout,
}

impl TensorShape {
    pub fn planar(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            layout: Layout::Planar,
        }
    }

    pub fn packed(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            layout: Layout::Packed,
        }
    }

    pub fn is_packed(&self) -> bool {
        self.layout == Layout::Packed
    }

    /// Channels stored per pixel within one plane.
    pub fn elempack(&self) -> usize {
        match self.layout {
            Layout::Planar => 1,
            Layout::Packed => self.channels.max(1),
        }
    }

    fn planes(&self) -> usize {
        self.channels / self.elempack()
    }

    fn plane_len(&self) -> usize {
        self.width * self.height * self.elempack()
    }

    /// Elements between consecutive planes, padded to [`CSTEP_ALIGN`] bytes.
    fn cstep(&self, element: ElementType) -> usize {
        let elemsize = element.size() * self.elempack();
        let bytes = self.width * self.height * elemsize;
        bytes.div_ceil(CSTEP_ALIGN) * CSTEP_ALIGN / elemsize
    }
}

enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    U8(Vec<u8>),
}

impl Storage {
    fn zeroed(element: ElementType, len: usize) -> Self {
        match element {
            ElementType::F32 => Self::F32(vec![0.0; len]),
            ElementType::F16 => Self::F16(vec![f16::ZERO; len]),
            ElementType::U8 => Self::U8(vec![0; len]),
        }
    }
}

/// A buffer owned by a device allocator. Freed (and returned to its
/// allocator's accounting) on drop.
pub struct GpuTensor {
    shape: TensorShape,
    element: ElementType,
    cstep: usize,
    storage: Storage,
    _allocation: Allocation,
}

impl GpuTensor {
    pub(crate) fn zeroed(shape: TensorShape, element: ElementType, allocation: Allocation) -> Self {
        let cstep = shape.cstep(element);
        let len = if shape.is_packed() {
            shape.plane_len()
        } else {
            cstep * shape.planes()
        };
        Self {
            shape,
            element,
            cstep,
            storage: Storage::zeroed(element, len),
            _allocation: allocation,
        }
    }

    /// Bytes a tensor of this shape occupies on the device.
    pub fn required_bytes(shape: TensorShape, element: ElementType) -> usize {
        let elems = if shape.is_packed() {
            shape.plane_len()
        } else {
            shape.cstep(element) * shape.planes()
        };
        elems * element.size()
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn width(&self) -> usize {
        self.shape.width
    }

    pub fn height(&self) -> usize {
        self.shape.height
    }

    pub fn channels(&self) -> usize {
        self.shape.channels
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn cstep(&self) -> usize {
        self.cstep
    }

    pub fn byte_len(&self) -> usize {
        Self::required_bytes(self.shape, self.element)
    }

    #[inline]
    fn offset(&self, c: usize, y: usize, x: usize) -> usize {
        debug_assert!(c < self.shape.channels && y < self.shape.height && x < self.shape.width);
        if self.shape.is_packed() {
            (y * self.shape.width + x) * self.shape.elempack() + c
        } else {
            c * self.cstep + y * self.shape.width + x
        }
    }

    #[inline]
    pub fn load(&self, c: usize, y: usize, x: usize) -> f32 {
        let i = self.offset(c, y, x);
        match &self.storage {
            Storage::F32(data) => data[i],
            Storage::F16(data) => data[i].to_f32(),
            Storage::U8(data) => data[i] as f32,
        }
    }

    /// Writes `value` converted to the storage type; u8 storage rounds and saturates.
    #[inline]
    pub fn store(&mut self, c: usize, y: usize, x: usize, value: f32) {
        let i = self.offset(c, y, x);
        match &mut self.storage {
            Storage::F32(data) => data[i] = value,
            Storage::F16(data) => data[i] = f16::from_f32(value),
            Storage::U8(data) => data[i] = value.round().clamp(0.0, 255.0) as u8,
        }
    }

    /// Element-wise copy from a tensor of identical logical extent, converting
    /// element type and layout as needed.
    pub fn copy_from(&mut self, src: &GpuTensor) -> anyhow::Result<()> {
        let (dst_shape, src_shape) = (self.shape, src.shape);
        if (dst_shape.width, dst_shape.height, dst_shape.channels)
            != (src_shape.width, src_shape.height, src_shape.channels)
        {
            anyhow::bail!(
                "copy between mismatched tensors: {}x{}x{} <- {}x{}x{}",
                dst_shape.width,
                dst_shape.height,
                dst_shape.channels,
                src_shape.width,
                src_shape.height,
                src_shape.channels
            );
        }

        let same_layout = dst_shape == src_shape && self.cstep == src.cstep;
        let copied = match (&mut self.storage, &src.storage) {
            (Storage::U8(dst), Storage::U8(from)) if same_layout => {
                dst.copy_from_slice(from);
                true
            }
            (Storage::F32(dst), Storage::F32(from)) if same_layout => {
                dst.copy_from_slice(from);
                true
            }
            _ => false,
        };

        if !copied {
            for c in 0..dst_shape.channels {
                for y in 0..dst_shape.height {
                    for x in 0..dst_shape.width {
                        let v = src.load(c, y, x);
                        self.store(c, y, x, v);
                    }
                }
            }
        }
        Ok(())
    }

    /// Raw bytes of a u8 tensor, `None` for float storage.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::U8(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.storage {
            Storage::U8(data) => Some(data),
            _ => None,
        }
    }

    /// One channel as a dense row-major `f32` vector.
    pub fn channel_to_vec(&self, c: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.shape.width * self.shape.height);
        for y in 0..self.shape.height {
            for x in 0..self.shape.width {
                out.push(self.load(c, y, x));
            }
        }
        out
    }
}

impl std::fmt::Debug for GpuTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuTensor")
            .field("width", &self.shape.width)
            .field("height", &self.shape.height)
            .field("channels", &self.shape.channels)
            .field("layout", &self.shape.layout)
            .field("element", &self.element)
            .field("cstep", &self.cstep)
            .finish()
    }
}
