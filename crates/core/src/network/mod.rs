//! The network collaborator: anything that can turn a `3 x H x W` tile into a
//! `3 x sH x sW` tile. The tiling and TTA logic never depends on which
//! inference runtime sits behind it.

pub mod backend;
pub mod onnx;

use std::path::Path;

use anyhow::Result;

use crate::allocator::DeviceAllocator;
use crate::tensor::{GpuTensor, StorageCapabilities};

pub use backend::InferenceBackend;
pub use onnx::{OrtLoader, OrtNetwork};

/// Input blob name the networks are exported with.
pub const INPUT_BLOB: &str = "data";
/// Output blob name the networks are exported with.
pub const OUTPUT_BLOB: &str = "output";

pub trait Network: Send + Sync {
    /// Storage precisions the network can run with.
    fn capabilities(&self) -> StorageCapabilities;

    /// Fixed upscale factor, when the network knows it before running.
    fn scale(&self) -> Option<usize> {
        None
    }

    /// Run one forward pass. `input` is a planar 3-channel tile normalized to
    /// `[0, 1]`; the result must be allocated from `allocator` with the same
    /// element type, scaled by the model factor in both dimensions.
    fn forward(&self, input: &GpuTensor, allocator: &DeviceAllocator) -> Result<GpuTensor>;
}

pub trait NetworkLoader: Send + Sync {
    fn load(&self, param_path: &Path, weight_path: &Path) -> Result<Box<dyn Network>>;
}
