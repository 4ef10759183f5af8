use image::DynamicImage;

use crate::{mode::ModeParams, sampler::Integrator};

/// Arguments for one invocation of the generative primitive.
#[derive(Debug, Clone)]
pub struct PipelineCall<'a> {
    /// One entry per requested output. `None` when the request carried no prompt.
    pub prompts: Option<Vec<String>>,
    pub negative_prompts: Option<Vec<String>>,
    pub guidance_scale: f64,
    pub steps: usize,
    /// Seed for the call's random generator, applied once per call.
    pub seed: u64,
    pub integrator: &'a Integrator,
    pub params: &'a ModeParams,
    /// Scale applied to a merged adapter overlay. `None` leaves the backend default.
    pub attention_scale: Option<f64>,
    /// Number of samples to produce, set even when no prompt is given.
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    pub images: Vec<DynamicImage>,
    /// Per-image safety verdicts, absent when no safety checker is loaded.
    pub nsfw_content_detected: Option<Vec<bool>>,
}

impl PipelineOutput {
    pub fn is_flagged(&self, index: usize) -> bool {
        self.nsfw_content_detected
            .as_ref()
            .and_then(|flags| flags.get(index).copied())
            .unwrap_or(false)
    }
}

/// The pretrained text/image-to-image model: three pipelines over shared weights.
///
/// Implementations are not expected to be reentrant; [`crate::ModelState`] owns the
/// backend and hands out `&mut` access one request at a time.
pub trait DiffusionBackend: Send {
    /// The integrator the pipelines were loaded with. Its noise schedule is the base
    /// every requested sampler is configured from.
    fn default_integrator(&self) -> Integrator;

    /// Merge the adapter identified by `reference` into the shared weights, replacing
    /// any adapter merged earlier.
    fn load_adapter(&mut self, reference: &str) -> anyhow::Result<()>;

    fn generate(&mut self, call: PipelineCall<'_>) -> anyhow::Result<PipelineOutput>;
}
