//! Generation invoker: turns a [`GenerationRequest`] into a call on the shared
//! backend and post-filters what comes back.

use image::DynamicImage;
use rand::{rngs::OsRng, Rng};
use tracing::{info, instrument, warn};

use crate::{
    error::{GenerationError, Result},
    mode::{self, ModeInputs},
    pipeline::{DiffusionBackend, PipelineCall, PipelineOutput},
    sampler, GenerationRequest, ModelState, MAX_PIXELS,
};

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image: DynamicImage,
    /// Reported seed: the request seed plus the sample's position in the batch. The
    /// whole batch shares one generator seeded with the request seed, so this labels
    /// the sample rather than reproducing it on its own.
    pub seed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationResult {
    pub images: Vec<GeneratedImage>,
}

/// A seed for requests that did not bring one: 16 bits from the OS random source.
pub fn random_seed() -> u64 {
    u64::from(OsRng.gen::<u16>())
}

#[instrument(skip_all, fields(sampler = %request.sampler_name, outputs = request.output_count))]
pub fn generate<B: DiffusionBackend>(
    request: &GenerationRequest,
    state: &mut ModelState<B>,
) -> Result<GenerationResult> {
    let too_large = request
        .width
        .checked_mul(request.height)
        .map_or(true, |pixels| pixels > MAX_PIXELS);
    if too_large {
        return Err(GenerationError::SizeLimit {
            width: request.width,
            height: request.height,
        });
    }

    let seed = request.seed.unwrap_or_else(random_seed);

    let params = mode::select(ModeInputs {
        seed_image: request.seed_image.as_ref(),
        mask_image: request.mask_image.as_ref(),
        width: request.width,
        height: request.height,
        strength: request.strength,
    })?;
    let mode = params.mode();

    let integrator = sampler::resolve(&request.sampler_name, state.integrator(mode))?;
    state.set_integrator(mode, integrator);

    let attention_scale =
        state.prepare_adapter(request.adapter.as_deref(), request.adapter_scale)?;

    info!(?mode, seed, ?attention_scale, "running pipeline");
    let replicate = |text: &String| vec![text.clone(); request.output_count];
    let output = state.backend_mut().generate(PipelineCall {
        prompts: request.prompt.as_ref().map(replicate),
        negative_prompts: request.negative_prompt.as_ref().map(replicate),
        guidance_scale: request.guidance_scale,
        steps: request.step_count,
        seed,
        integrator: &integrator,
        params: &params,
        attention_scale,
        batch_size: request.output_count,
    })?;

    let images = screen(output, seed, state.nsfw_filter_enabled());
    if images.is_empty() {
        return Err(GenerationError::AllContentFiltered);
    }
    Ok(GenerationResult { images })
}

fn screen(output: PipelineOutput, seed: u64, filter: bool) -> Vec<GeneratedImage> {
    let flags = output.nsfw_content_detected.unwrap_or_default();
    output
        .images
        .into_iter()
        .enumerate()
        .filter_map(|(index, image)| {
            if filter && flags.get(index).copied().unwrap_or(false) {
                warn!(index, "dropping sample flagged by the safety checker");
                return None;
            }
            Some(GeneratedImage {
                image,
                seed: seed.wrapping_add(index as u64),
            })
        })
        .collect()
}
