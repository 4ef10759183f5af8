pub mod adapter;
pub mod device_map;
pub mod error;
pub mod invoker;
pub mod loader;
mod loader_factory;
pub mod mode;
mod model_state;
pub mod pipeline;
pub mod sampler;
mod util;

mod stable_diffusion;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use device_map::*;
pub use error::{GenerationError, Result};
use image::DynamicImage;
pub use invoker::{generate, GeneratedImage, GenerationResult};
pub use loader::*;
pub use loader_factory::*;
pub use mode::{Mode, ModeParams};
pub use model_state::ModelState;
pub use pipeline::{DiffusionBackend, PipelineCall, PipelineOutput};
pub use sampler::{Integrator, NoiseSchedule, Sampler};
pub use stable_diffusion::{StableDiffusionBackend, StableDiffusionLoader};
pub(crate) use util::*;

/// Largest `width * height` a request may ask for (1024x768).
pub const MAX_PIXELS: usize = 786_432;

/// One generation request, after the job payload has been validated and any remote
/// images fetched and decoded.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub seed_image: Option<DynamicImage>,
    /// Requires `seed_image`.
    pub mask_image: Option<DynamicImage>,
    /// How far a seed image may drift, in `[0, 1]`. Ignored without a seed image.
    pub strength: f64,
    pub output_count: usize,
    pub step_count: usize,
    pub guidance_scale: f64,
    pub sampler_name: String,
    /// Generated when absent.
    pub seed: Option<u64>,
    pub adapter: Option<String>,
    pub adapter_scale: f64,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: None,
            negative_prompt: None,
            width: 512,
            height: 512,
            seed_image: None,
            mask_image: None,
            strength: 0.8,
            output_count: 1,
            step_count: 30,
            guidance_scale: 7.5,
            sampler_name: Sampler::default().to_string(),
            seed: None,
            adapter: None,
            adapter_scale: 1.0,
        }
    }
}
