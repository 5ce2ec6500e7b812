//! The device session: owns a loaded network and its kernels, and drives the
//! tiled pre / inference / alpha / post pipeline for each `process()` call.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::alpha::AlphaFilter;
use crate::allocator::DeviceAllocator;
use crate::command::{Bindings, CommandBatch, TensorId};
use crate::device::{DeviceRegistry, GpuDevice};
use crate::error::{Result, SrError};
use crate::image::{HostImage, HostImageMut};
use crate::kernels::{
    ChannelOrder, KernelKey, Pipeline, PostprocessConstants, PreprocessConstants, Stage,
};
use crate::network::{Network, NetworkLoader};
use crate::tensor::{StorageTier, TensorShape};
use crate::tile::{auto_tile_size, TileDescriptor, TilePlan, TileRow};

/// When TTA inference results are synchronized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TtaSubmission {
    /// Wait for each variant before recording the next.
    #[default]
    PerVariant,
    /// Queue all eight variants and wait once.
    Batched,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Device ordinal; `None` picks the default device.
    pub gpu_id: Option<u32>,
    pub tta_mode: bool,
    pub scale: usize,
    /// Tile edge in input pixels; 0 derives it from the device heap budget.
    pub tile_size: usize,
    pub prepadding: usize,
    pub channel_order: ChannelOrder,
    pub tta_submission: TtaSubmission,
    pub allow_fp16_storage: bool,
    pub allow_int8_storage: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gpu_id: None,
            tta_mode: false,
            scale: 4,
            tile_size: 0,
            prepadding: 10,
            channel_order: ChannelOrder::Rgb,
            tta_submission: TtaSubmission::PerVariant,
            allow_fp16_storage: true,
            allow_int8_storage: true,
        }
    }
}

struct LoadedModel {
    network: Box<dyn Network>,
    tier: StorageTier,
    preprocess: Pipeline,
    postprocess: Pipeline,
    alpha: AlphaFilter,
}

pub struct SrSession {
    device: Arc<GpuDevice>,
    config: SessionConfig,
    loaded: Option<LoadedModel>,
}

fn check_cancel(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        Err(SrError::Cancelled)
    } else {
        Ok(())
    }
}

impl SrSession {
    pub fn new(registry: &DeviceRegistry, config: SessionConfig) -> Result<Self> {
        if config.scale == 0 {
            return Err(SrError::unsupported("scale must be at least 1"));
        }
        let device = registry.device(config.gpu_id)?;
        info!(
            gpu = device.ordinal(),
            tta = config.tta_mode,
            scale = config.scale,
            tile_size = config.tile_size,
            prepadding = config.prepadding,
            "Created super-resolution session"
        );
        Ok(Self {
            device,
            config,
            loaded: None,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<GpuDevice> {
        &self.device
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn storage_tier(&self) -> Option<StorageTier> {
        self.loaded.as_ref().map(|model| model.tier)
    }

    /// Names of the preprocess and postprocess kernels in use.
    pub fn kernel_names(&self) -> Option<(&'static str, &'static str)> {
        self.loaded
            .as_ref()
            .map(|model| (model.preprocess.name(), model.postprocess.name()))
    }

    /// Tile edge used by `process()`.
    pub fn tile_size(&self) -> usize {
        match self.config.tile_size {
            0 => auto_tile_size(self.device.heap_budget_mb()),
            n => n,
        }
    }

    /// Open both files, load the network through `loader`, and select kernels.
    /// A failed load leaves the session unloaded.
    pub fn load(
        &mut self,
        loader: &dyn NetworkLoader,
        param_path: &Path,
        weight_path: &Path,
    ) -> Result<()> {
        self.loaded = None;
        for path in [param_path, weight_path] {
            std::fs::File::open(path).map_err(|e| SrError::load(path, e))?;
        }
        AlphaFilter::for_scale(self.config.scale)?;

        let network = loader
            .load(param_path, weight_path)
            .map_err(|e| SrError::load(param_path, e))?;
        self.load_network(network)?;
        info!(model = %param_path.display(), "Loaded network");
        Ok(())
    }

    /// Adopt an already constructed network.
    pub fn load_network(&mut self, network: Box<dyn Network>) -> Result<()> {
        self.loaded = None;
        let alpha = AlphaFilter::for_scale(self.config.scale)?;
        if let Some(model_scale) = network.scale() {
            if model_scale != self.config.scale {
                return Err(SrError::unsupported(format!(
                    "network upscales by {model_scale} but the session scale is {}",
                    self.config.scale
                )));
            }
        }
        let caps = network
            .capabilities()
            .restrict(self.config.allow_fp16_storage, self.config.allow_int8_storage);
        let tier = StorageTier::negotiate(caps);
        let key = KernelKey {
            tta: self.config.tta_mode,
            tier,
        };
        let order = self.config.channel_order;
        let preprocess = Pipeline::create(Stage::Preprocess, key, order)?;
        let postprocess = Pipeline::create(Stage::Postprocess, key, order)?;
        debug!(
            tier = %tier,
            preprocess = preprocess.name(),
            postprocess = postprocess.name(),
            "Selected kernels"
        );

        self.loaded = Some(LoadedModel {
            network,
            tier,
            preprocess,
            postprocess,
            alpha,
        });
        Ok(())
    }

    pub fn process(&self, input: &HostImage<'_>, output: &mut HostImageMut<'_>) -> Result<()> {
        self.process_with_cancel(input, output, &AtomicBool::new(false))
    }

    /// Like [`process`](Self::process), checking `cancel` between tiles and
    /// between TTA variants.
    pub fn process_with_cancel(
        &self,
        input: &HostImage<'_>,
        output: &mut HostImageMut<'_>,
        cancel: &AtomicBool,
    ) -> Result<()> {
        let model = self.loaded.as_ref().ok_or(SrError::NotLoaded)?;
        self.device.ensure_alive()?;

        let scale = self.config.scale;
        let (w, h, c) = (input.width(), input.height(), input.channels());
        if output.channels() != c || output.width() != w * scale || output.height() != h * scale {
            return Err(SrError::unsupported(format!(
                "output {}x{}x{} does not match {w}x{h}x{c} at scale {scale}",
                output.width(),
                output.height(),
                output.channels()
            )));
        }

        let plan = TilePlan::new(w, h, self.tile_size(), self.config.prepadding)?;
        let started = Instant::now();

        let blob = self.device.acquire_blob_allocator();
        let staging = self.device.acquire_staging_allocator();
        for row in plan.rows() {
            self.process_row(model, &plan, &row, input, output, &blob, &staging, cancel)?;
        }

        debug!(
            width = w,
            height = h,
            channels = c,
            tiles = plan.tile_count(),
            peak_blob_bytes = blob.peak_bytes(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Processed image"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_row(
        &self,
        model: &LoadedModel,
        plan: &TilePlan,
        row: &TileRow,
        input: &HostImage<'_>,
        output: &mut HostImageMut<'_>,
        blob: &DeviceAllocator,
        staging: &DeviceAllocator,
        cancel: &AtomicBool,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let scale = self.config.scale;
        let channels = input.channels();
        let out_width = input.width() * scale;
        let multi_tile = plan.xtiles() > 1;

        let mut batch = CommandBatch::new(blob, staging, model.network.as_ref(), scale);
        let strip = batch.record_upload(input, row.in_y0, row.in_y1, model.tier)?;
        if multi_tile {
            batch.submit_and_wait()?;
        }

        let out_strip = batch.create(
            model
                .tier
                .image_shape(out_width, row.height_nopad() * scale, channels),
            model.tier.image_element(),
        )?;

        for tile in plan.tiles(row) {
            check_cancel(cancel)?;
            debug!(xi = tile.xi, yi = tile.yi, "Recording tile");
            let temporaries =
                self.record_tile(model, &mut batch, strip, out_strip, &tile, row, channels, cancel)?;
            if multi_tile {
                batch.submit_and_wait()?;
                batch.release(temporaries);
            }
        }

        let readback = batch.record_download(out_strip)?;
        batch.submit_and_wait()?;
        batch.download_into(readback, output, row.y0 * scale)
    }

    /// Record one tile; returns the tensors that are dead once it has run.
    #[allow(clippy::too_many_arguments)]
    fn record_tile(
        &self,
        model: &LoadedModel,
        batch: &mut CommandBatch<'_>,
        strip: TensorId,
        out_strip: TensorId,
        tile: &TileDescriptor,
        row: &TileRow,
        channels: usize,
        cancel: &AtomicBool,
    ) -> Result<Vec<TensorId>> {
        let element = model.tier.tile_element();
        let (width, height) = (tile.input_width(), tile.input_height());

        let inputs = model
            .preprocess
            .transforms()
            .iter()
            .map(|t| {
                let (w, h) = t.extent(width, height);
                batch.create(TensorShape::planar(w, h, 3), element)
            })
            .collect::<Result<Vec<_>>>()?;
        let alpha_in = if channels == 4 {
            Some(batch.create(
                TensorShape::planar(tile.width_nopad, tile.height_nopad, 1),
                element,
            )?)
        } else {
            None
        };

        batch.record_pipeline(
            &model.preprocess,
            Bindings::Preprocess {
                src: strip,
                tiles: inputs.clone(),
                alpha: alpha_in,
                constants: PreprocessConstants::for_tile(tile, row, channels),
            },
        );

        let sync_each_variant =
            self.config.tta_mode && self.config.tta_submission == TtaSubmission::PerVariant;
        let mut outputs = Vec::with_capacity(inputs.len());
        for &variant in &inputs {
            check_cancel(cancel)?;
            outputs.push(batch.record_inference(variant));
            if sync_each_variant {
                batch.submit_and_wait()?;
            }
        }

        let alpha_out = alpha_in
            .map(|alpha| batch.record_interp(model.alpha, alpha))
            .transpose()?;

        let out_width = batch.tensor(out_strip)?.width();
        batch.record_pipeline(
            &model.postprocess,
            Bindings::Postprocess {
                tiles: outputs.clone(),
                alpha: alpha_out,
                dst: out_strip,
                constants: PostprocessConstants::for_tile(
                    tile,
                    self.config.scale,
                    out_width,
                    channels,
                ),
            },
        );

        let mut temporaries = inputs;
        temporaries.extend(outputs);
        temporaries.extend(alpha_in);
        temporaries.extend(alpha_out);
        Ok(temporaries)
    }
}

impl std::fmt::Debug for SrSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrSession")
            .field("gpu", &self.device.ordinal())
            .field("config", &self.config)
            .field("tier", &self.storage_tier())
            .finish()
    }
}
