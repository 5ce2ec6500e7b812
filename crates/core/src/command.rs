//! Deferred command recording.
//!
//! A [`CommandBatch`] owns every tensor it creates. Commands are recorded in
//! order and only run on [`CommandBatch::submit_and_wait`]; tensors written
//! by a pending command (inference outputs) have no storage until then.

use tracing::trace;

use crate::alpha::AlphaFilter;
use crate::allocator::DeviceAllocator;
use crate::error::{Result, SrError};
use crate::image::{HostImage, HostImageMut};
use crate::kernels::{postprocess, preprocess, Pipeline, PostprocessConstants, PreprocessConstants};
use crate::network::Network;
use crate::tensor::{ElementType, GpuTensor, StorageTier, TensorShape};

/// Handle to a tensor owned by a [`CommandBatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TensorId(usize);

/// Tensors and constants bound to a kernel dispatch.
#[derive(Clone, Debug)]
pub enum Bindings {
    Preprocess {
        src: TensorId,
        tiles: Vec<TensorId>,
        alpha: Option<TensorId>,
        constants: PreprocessConstants,
    },
    Postprocess {
        tiles: Vec<TensorId>,
        alpha: Option<TensorId>,
        dst: TensorId,
        constants: PostprocessConstants,
    },
}

#[derive(Debug)]
enum Command {
    Upload { staging: TensorId, dst: TensorId },
    Dispatch { pipeline: Pipeline, bindings: Bindings },
    Infer { src: TensorId, dst: TensorId },
    Interp { filter: AlphaFilter, src: TensorId, dst: TensorId },
    Download { src: TensorId, staging: TensorId },
}

pub struct CommandBatch<'a> {
    blob: &'a DeviceAllocator,
    staging: &'a DeviceAllocator,
    network: &'a dyn Network,
    scale: usize,
    tensors: Vec<Option<GpuTensor>>,
    pending: Vec<Command>,
    submissions: usize,
}

impl<'a> CommandBatch<'a> {
    pub fn new(
        blob: &'a DeviceAllocator,
        staging: &'a DeviceAllocator,
        network: &'a dyn Network,
        scale: usize,
    ) -> Self {
        Self {
            blob,
            staging,
            network,
            scale,
            tensors: Vec::new(),
            pending: Vec::new(),
            submissions: 0,
        }
    }

    /// Number of completed `submit_and_wait` calls.
    pub fn submissions(&self) -> usize {
        self.submissions
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn push(&mut self, tensor: Option<GpuTensor>) -> TensorId {
        self.tensors.push(tensor);
        TensorId(self.tensors.len() - 1)
    }

    /// Allocate a blob tensor owned by the batch.
    pub fn create(&mut self, shape: TensorShape, element: ElementType) -> Result<TensorId> {
        let tensor = self.blob.create(shape, element)?;
        Ok(self.push(Some(tensor)))
    }

    pub fn tensor(&self, id: TensorId) -> Result<&GpuTensor> {
        self.tensors
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| SrError::InvalidState(format!("tensor {} has no storage", id.0)))
    }

    fn take(&mut self, id: TensorId) -> Result<GpuTensor> {
        self.tensors
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| SrError::InvalidState(format!("tensor {} has no storage", id.0)))
    }

    fn put(&mut self, id: TensorId, tensor: GpuTensor) {
        self.tensors[id.0] = Some(tensor);
    }

    /// Copy rows `[y0, y1)` of `image` into staging memory now and record the
    /// transfer into a device image buffer of the given tier.
    pub fn record_upload(
        &mut self,
        image: &HostImage<'_>,
        y0: usize,
        y1: usize,
        tier: StorageTier,
    ) -> Result<TensorId> {
        let (width, channels) = (image.width(), image.channels());
        let mut staging = self
            .staging
            .create(TensorShape::packed(width, y1 - y0, channels), ElementType::U8)?;
        staging
            .as_bytes_mut()
            .ok_or_else(|| SrError::InvalidState("staging buffer is not byte storage".into()))?
            .copy_from_slice(image.rows(y0, y1));
        let staging = self.push(Some(staging));

        let dst = self.create(tier.image_shape(width, y1 - y0, channels), tier.image_element())?;
        self.pending.push(Command::Upload { staging, dst });
        Ok(dst)
    }

    pub fn record_pipeline(&mut self, pipeline: &Pipeline, bindings: Bindings) {
        self.pending.push(Command::Dispatch {
            pipeline: pipeline.clone(),
            bindings,
        });
    }

    /// The returned tensor is filled by the network when the batch runs.
    pub fn record_inference(&mut self, src: TensorId) -> TensorId {
        let dst = self.push(None);
        self.pending.push(Command::Infer { src, dst });
        dst
    }

    /// Identity filters hand back `src` itself.
    pub fn record_interp(&mut self, filter: AlphaFilter, src: TensorId) -> Result<TensorId> {
        if filter == AlphaFilter::Identity {
            return Ok(src);
        }
        let input = self.tensor(src)?;
        let (width, height) = filter.output_extent(input.width(), input.height());
        let shape = TensorShape::planar(width, height, input.channels());
        let element = input.element();
        let dst = self.create(shape, element)?;
        self.pending.push(Command::Interp { filter, src, dst });
        Ok(dst)
    }

    /// Record a readback of `src` into packed 8-bit staging memory.
    pub fn record_download(&mut self, src: TensorId) -> Result<TensorId> {
        let source = self.tensor(src)?;
        let shape = TensorShape::packed(source.width(), source.height(), source.channels());
        let staging = self.staging.create(shape, ElementType::U8)?;
        let staging = self.push(Some(staging));
        self.pending.push(Command::Download { src, staging });
        Ok(staging)
    }

    /// Run every pending command in recording order. On failure the remaining
    /// commands are discarded.
    pub fn submit_and_wait(&mut self) -> Result<()> {
        let commands = std::mem::take(&mut self.pending);
        let count = commands.len();
        for command in commands {
            self.execute(command)?;
        }
        self.submissions += 1;
        trace!(commands = count, submission = self.submissions, "Batch submitted");
        Ok(())
    }

    /// Free tensors no later command reads.
    pub fn release(&mut self, ids: impl IntoIterator<Item = TensorId>) {
        for id in ids {
            if let Some(slot) = self.tensors.get_mut(id.0) {
                *slot = None;
            }
        }
    }

    /// Copy a completed download into rows starting at `y0` of `out`.
    pub fn download_into(&self, staging: TensorId, out: &mut HostImageMut<'_>, y0: usize) -> Result<()> {
        if !self.pending.is_empty() {
            return Err(SrError::InvalidState(
                "download read before the batch was submitted".into(),
            ));
        }
        let tensor = self.tensor(staging)?;
        let bytes = tensor
            .as_bytes()
            .ok_or_else(|| SrError::InvalidState("download target is not byte storage".into()))?;
        if tensor.width() != out.width() || tensor.channels() != out.channels() {
            return Err(SrError::InvalidState(format!(
                "{tensor:?} does not fit a {}-wide {}-channel image",
                out.width(),
                out.channels()
            )));
        }
        let y1 = y0 + tensor.height();
        if y1 > out.height() {
            return Err(SrError::InvalidState(format!(
                "rows {y0}..{y1} exceed image height {}",
                out.height()
            )));
        }
        out.rows_mut(y0, y1).copy_from_slice(bytes);
        Ok(())
    }

    fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Upload { staging: from, dst: to } | Command::Download { src: from, staging: to } => {
                let mut target = self.take(to)?;
                let result = self
                    .tensor(from)
                    .and_then(|source| target.copy_from(source).map_err(SrError::device));
                self.put(to, target);
                result
            }
            Command::Dispatch { pipeline, bindings } => self.dispatch(&pipeline, bindings),
            Command::Infer { src, dst } => {
                let input = self.tensor(src)?;
                let output = self.network.forward(input, self.blob).map_err(SrError::device)?;
                let expected = (input.width() * self.scale, input.height() * self.scale, 3);
                if (output.width(), output.height(), output.channels()) != expected
                    || output.element() != input.element()
                {
                    return Err(SrError::device(anyhow::anyhow!(
                        "network produced {output:?} for {input:?}, expected {}x{}x{} at scale {}",
                        expected.0,
                        expected.1,
                        expected.2,
                        self.scale
                    )));
                }
                self.put(dst, output);
                Ok(())
            }
            Command::Interp { filter, src, dst } => {
                let mut target = self.take(dst)?;
                let result = self
                    .tensor(src)
                    .and_then(|source| filter.resize(source, &mut target).map_err(SrError::device));
                self.put(dst, target);
                result
            }
        }
    }

    fn dispatch(&mut self, pipeline: &Pipeline, bindings: Bindings) -> Result<()> {
        match bindings {
            Bindings::Preprocess {
                src,
                tiles,
                alpha,
                constants,
            } => {
                let mut outputs = tiles.iter().map(|id| self.take(*id)).collect::<Result<Vec<_>>>()?;
                let mut alpha_out = alpha.map(|id| self.take(id)).transpose()?;
                let result = self.tensor(src).and_then(|source| {
                    preprocess::dispatch(pipeline, source, &mut outputs, alpha_out.as_mut(), &constants)
                        .map_err(SrError::device)
                });
                for (id, tensor) in tiles.iter().zip(outputs) {
                    self.put(*id, tensor);
                }
                if let (Some(id), Some(tensor)) = (alpha, alpha_out) {
                    self.put(id, tensor);
                }
                result
            }
            Bindings::Postprocess {
                tiles,
                alpha,
                dst,
                constants,
            } => {
                let mut target = self.take(dst)?;
                let result = (|| -> Result<()> {
                    let inputs = tiles.iter().map(|id| self.tensor(*id)).collect::<Result<Vec<_>>>()?;
                    let alpha_in = alpha.map(|id| self.tensor(id)).transpose()?;
                    postprocess::dispatch(pipeline, &inputs, alpha_in, &mut target, &constants)
                        .map_err(SrError::device)
                })();
                self.put(dst, target);
                result
            }
        }
    }
}
