//! A deterministic in-memory backend for exercising the policy layer without weights.

use std::collections::HashSet;

use anyhow::bail;
use image::{DynamicImage, Rgb, RgbImage};

use crate::{
    mode::{Mode, ModeParams},
    pipeline::{DiffusionBackend, PipelineCall, PipelineOutput},
    sampler::{Integrator, NoiseSchedule, Sampler},
};

/// What the stub saw for one `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub mode: Mode,
    pub sampler: Sampler,
    pub schedule: NoiseSchedule,
    pub prompts: Option<Vec<String>>,
    pub negative_prompts: Option<Vec<String>>,
    pub guidance_scale: f64,
    pub steps: usize,
    pub seed: u64,
    pub attention_scale: Option<f64>,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default)]
enum Flagging {
    #[default]
    NoChecker,
    All,
    Outputs(HashSet<usize>),
}

/// Produces solid-color images whose color depends only on the seed and the sample
/// index, and records every call for later assertions.
#[derive(Debug, Clone)]
pub struct StubBackend {
    pub calls: Vec<RecordedCall>,
    /// Adapters successfully loaded, in order.
    pub adapter_loads: Vec<String>,
    integrator: Integrator,
    flagging: Flagging,
    missing_adapters: HashSet<String>,
    failing: bool,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::with_schedule(NoiseSchedule::default())
    }
}

impl StubBackend {
    pub fn with_schedule(schedule: NoiseSchedule) -> Self {
        Self {
            calls: Vec::new(),
            adapter_loads: Vec::new(),
            integrator: Sampler::Pndm.configure(&schedule),
            flagging: Flagging::NoChecker,
            missing_adapters: HashSet::new(),
            failing: false,
        }
    }

    /// Flag every output as unsafe.
    pub fn flag_all(mut self) -> Self {
        self.flagging = Flagging::All;
        self
    }

    pub fn flag_outputs(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.flagging = Flagging::Outputs(indices.into_iter().collect());
        self
    }

    /// Make `load_adapter` fail for `reference`.
    pub fn with_missing_adapter(mut self, reference: &str) -> Self {
        self.missing_adapters.insert(reference.to_string());
        self
    }

    /// Make every `generate` call fail.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    fn dimensions(params: &ModeParams) -> (u32, u32) {
        match params {
            ModeParams::TextToImage { width, height } => (*width as u32, *height as u32),
            ModeParams::ImageToImage { image, .. } | ModeParams::Inpaint { image, .. } => {
                (image.width(), image.height())
            }
        }
    }

    fn sample(seed: u64, index: usize, width: u32, height: u32) -> DynamicImage {
        let value = seed.wrapping_mul(31).wrapping_add(index as u64);
        let pixel = Rgb([
            (value & 0xff) as u8,
            ((value >> 8) & 0xff) as u8,
            ((value >> 16) & 0xff) as u8,
        ]);
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, pixel))
    }
}

impl DiffusionBackend for StubBackend {
    fn default_integrator(&self) -> Integrator {
        self.integrator
    }

    fn load_adapter(&mut self, reference: &str) -> anyhow::Result<()> {
        if self.missing_adapters.contains(reference) {
            bail!("adapter `{reference}` not found");
        }
        self.adapter_loads.push(reference.to_string());
        Ok(())
    }

    fn generate(&mut self, call: PipelineCall<'_>) -> anyhow::Result<PipelineOutput> {
        if self.failing {
            bail!("stub backend configured to fail");
        }
        let batch_size = call.batch_size;
        self.calls.push(RecordedCall {
            mode: call.params.mode(),
            sampler: call.integrator.sampler,
            schedule: call.integrator.schedule,
            prompts: call.prompts.clone(),
            negative_prompts: call.negative_prompts.clone(),
            guidance_scale: call.guidance_scale,
            steps: call.steps,
            seed: call.seed,
            attention_scale: call.attention_scale,
            batch_size,
        });

        let (width, height) = Self::dimensions(call.params);
        let images = (0..batch_size)
            .map(|index| Self::sample(call.seed, index, width, height))
            .collect();
        let nsfw_content_detected = match &self.flagging {
            Flagging::NoChecker => None,
            Flagging::All => Some(vec![true; batch_size]),
            Flagging::Outputs(flagged) => {
                Some((0..batch_size).map(|i| flagged.contains(&i)).collect())
            }
        };
        Ok(PipelineOutput {
            images,
            nsfw_content_detected,
        })
    }
}
