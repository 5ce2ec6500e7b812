//! Compute kernels and the table that selects their variants.
//!
//! Each kernel exists in one variant per `(tta, storage tier)` pair. Sessions
//! resolve both stages once at load time through [`Pipeline::create`].

pub mod postprocess;
pub mod preprocess;
mod transform;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::error::SrError;
use crate::tensor::{GpuTensor, StorageTier};

pub use postprocess::PostprocessConstants;
pub use preprocess::PreprocessConstants;
pub use transform::Transform;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Preprocess,
    Postprocess,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub tta: bool,
    pub tier: StorageTier,
}

/// Channel order of the host pixel buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

struct KernelEntry {
    stage: Stage,
    tta: bool,
    tier: StorageTier,
    name: &'static str,
}

const fn entry(stage: Stage, tta: bool, tier: StorageTier, name: &'static str) -> KernelEntry {
    KernelEntry {
        stage,
        tta,
        tier,
        name,
    }
}

use Stage::{Postprocess, Preprocess};
use StorageTier::{Full, Half, Reduced};

const KERNELS: &[KernelEntry] = &[
    entry(Preprocess, false, Full, "sr_preproc"),
    entry(Preprocess, false, Half, "sr_preproc_fp16s"),
    entry(Preprocess, false, Reduced, "sr_preproc_int8s"),
    entry(Preprocess, true, Full, "sr_preproc_tta"),
    entry(Preprocess, true, Half, "sr_preproc_tta_fp16s"),
    entry(Preprocess, true, Reduced, "sr_preproc_tta_int8s"),
    entry(Postprocess, false, Full, "sr_postproc"),
    entry(Postprocess, false, Half, "sr_postproc_fp16s"),
    entry(Postprocess, false, Reduced, "sr_postproc_int8s"),
    entry(Postprocess, true, Full, "sr_postproc_tta"),
    entry(Postprocess, true, Half, "sr_postproc_tta_fp16s"),
    entry(Postprocess, true, Reduced, "sr_postproc_tta_int8s"),
];

pub fn kernel_name(stage: Stage, key: KernelKey) -> Option<&'static str> {
    KERNELS
        .iter()
        .find(|k| k.stage == stage && k.tta == key.tta && k.tier == key.tier)
        .map(|k| k.name)
}

/// A kernel variant bound to its specialization constants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pipeline {
    name: &'static str,
    stage: Stage,
    key: KernelKey,
    channel_order: ChannelOrder,
}

impl Pipeline {
    pub fn create(
        stage: Stage,
        key: KernelKey,
        channel_order: ChannelOrder,
    ) -> crate::error::Result<Self> {
        let name = kernel_name(stage, key).ok_or_else(|| {
            SrError::unsupported(format!(
                "no {stage:?} kernel for tta={} tier={}",
                key.tta, key.tier
            ))
        })?;
        Ok(Self {
            name,
            stage,
            key,
            channel_order,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn key(&self) -> KernelKey {
        self.key
    }

    pub fn channel_order(&self) -> ChannelOrder {
        self.channel_order
    }

    pub fn transforms(&self) -> &'static [Transform] {
        if self.key.tta {
            &Transform::ALL
        } else {
            &Transform::ALL[..1]
        }
    }

    /// Host channel holding network color channel `k`.
    #[inline]
    fn host_channel(&self, k: usize) -> usize {
        match self.channel_order {
            ChannelOrder::Rgb => k,
            ChannelOrder::Bgr => 2 - k,
        }
    }

    fn check_image(&self, tensor: &GpuTensor, role: &str) -> Result<()> {
        let tier = self.key.tier;
        ensure!(
            tensor.element() == tier.image_element() && tensor.shape().is_packed() == tier.packs_pixels(),
            "{}: {role} tensor {:?} does not match {tier} storage",
            self.name,
            tensor
        );
        Ok(())
    }

    fn check_tile(&self, tensor: &GpuTensor, role: &str) -> Result<()> {
        ensure!(
            tensor.element() == self.key.tier.tile_element(),
            "{}: {role} tensor {:?} does not match {} storage",
            self.name,
            tensor,
            self.key.tier
        );
        Ok(())
    }
}
