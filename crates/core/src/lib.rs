//! Tiled GPU super-resolution: tile planning, TTA pre/post kernels, alpha
//! handling and scoped device allocators around a pluggable network.

pub mod alpha;
pub mod allocator;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod image;
pub mod kernels;
pub mod logging;
pub mod model;
pub mod network;
pub mod runtime;
pub mod session;
pub mod tensor;
pub mod tile;

pub use device::{DeviceInfo, DeviceRegistry, GpuDevice};
pub use error::{Result, SrError};
pub use image::{HostImage, HostImageMut};
pub use network::{Network, NetworkLoader};
pub use session::{SessionConfig, SrSession, TtaSubmission};
