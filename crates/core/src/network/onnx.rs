//! ONNX Runtime backed network.
//!
//! The graph file is the "param" path; its weights either live inside it or
//! in an external-data file next to it that the runtime opens by itself.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use half::f16;
use ndarray::{Array4, ArrayView4, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info};

use super::backend::{build_session, BackendConfig};
use super::{Network, NetworkLoader, INPUT_BLOB, OUTPUT_BLOB};
use crate::allocator::DeviceAllocator;
use crate::tensor::{GpuTensor, StorageCapabilities};

pub struct OrtNetwork {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16_model: bool,
    scale: Option<usize>,
}

impl OrtNetwork {
    pub fn load(param_path: &Path, weight_path: &Path, config: &BackendConfig) -> Result<Self> {
        if weight_path != param_path && weight_path.parent() != param_path.parent() {
            bail!(
                "external weights {} must sit next to {}",
                weight_path.display(),
                param_path.display()
            );
        }

        debug!(
            model = %param_path.display(),
            weights = %weight_path.display(),
            backend = %config.backend,
            "Loading ONNX super-resolution model"
        );
        let session = build_session(param_path, config)?;

        let input_name = pick_blob(session.inputs().iter().map(|i| i.name()), INPUT_BLOB)
            .context("model has no inputs")?;
        let output_name = pick_blob(session.outputs().iter().map(|o| o.name()), OUTPUT_BLOB)
            .context("model has no outputs")?;
        let is_fp16_model = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        let dims = |value_type: &ort::value::ValueType| match value_type {
            ort::value::ValueType::Tensor { shape, .. } => shape.iter().copied().collect::<Vec<i64>>(),
            _ => Vec::new(),
        };
        let scale = static_scale(&dims(session.inputs()[0].dtype()), &dims(session.outputs()[0].dtype()));

        info!(%input_name, %output_name, is_fp16_model, ?scale, "Model loaded");
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16_model,
            scale,
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16_model
    }
}

/// Upscale factor implied by static NCHW input and output shapes. Dynamic
/// (non-positive) or non-integral spatial dims give `None`.
fn static_scale(input: &[i64], output: &[i64]) -> Option<usize> {
    let [.., ih, iw] = *input else {
        return None;
    };
    let [.., oh, ow] = *output else {
        return None;
    };
    if input.len() != 4 || output.len() != 4 || [ih, iw, oh, ow].iter().any(|&d| d <= 0) {
        return None;
    }
    if oh % ih != 0 || ow % iw != 0 || oh / ih != ow / iw {
        return None;
    }
    usize::try_from(oh / ih).ok()
}

/// The conventional blob name when the graph has it, its first blob otherwise.
fn pick_blob<'a>(mut names: impl Iterator<Item = &'a str> + Clone, preferred: &str) -> Option<String> {
    if names.clone().any(|name| name == preferred) {
        return Some(preferred.to_string());
    }
    names.next().map(str::to_string)
}

fn tile_to_nchw(input: &GpuTensor) -> Array4<f32> {
    Array4::from_shape_fn((1, 3, input.height(), input.width()), |(_, c, y, x)| {
        input.load(c, y, x)
    })
}

fn nchw_to_tile(output: ArrayView4<'_, f32>, dst: &mut GpuTensor) {
    for c in 0..3 {
        for y in 0..dst.height() {
            for x in 0..dst.width() {
                dst.store(c, y, x, output[[0, c, y, x]]);
            }
        }
    }
}

impl Network for OrtNetwork {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            fp16_storage: self.is_fp16_model,
            int8_storage: self.is_fp16_model,
        }
    }

    fn scale(&self) -> Option<usize> {
        self.scale
    }

    fn forward(&self, input: &GpuTensor, allocator: &DeviceAllocator) -> Result<GpuTensor> {
        let nchw = tile_to_nchw(input);
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;

        let output = if self.is_fp16_model {
            let tensor = Tensor::from_array(nchw.mapv(f16::from_f32))?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &tensor])?;
            outputs[self.output_name.as_str()]
                .try_extract_array::<f16>()?
                .mapv(f16::to_f32)
        } else {
            let tensor = Tensor::from_array(nchw)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &tensor])?;
            outputs[self.output_name.as_str()]
                .try_extract_array::<f32>()?
                .to_owned()
        };
        drop(session);

        let output = output
            .into_dimensionality::<Ix4>()
            .context("network output is not NCHW")?;
        let (n, c, h, w) = output.dim();
        if n != 1 || c != 3 {
            bail!("unexpected network output shape {:?}", output.shape());
        }
        let mut dst = allocator.create_planar(w, h, 3, input.element())?;
        nchw_to_tile(output.view(), &mut dst);
        Ok(dst)
    }
}

/// Loads graphs through ONNX Runtime with a fixed provider configuration.
#[derive(Clone, Debug, Default)]
pub struct OrtLoader {
    pub config: BackendConfig,
}

impl NetworkLoader for OrtLoader {
    fn load(&self, param_path: &Path, weight_path: &Path) -> Result<Box<dyn Network>> {
        Ok(Box::new(OrtNetwork::load(param_path, weight_path, &self.config)?))
    }
}
