use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self as sd, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

mod lora;
mod scheduler;

use crate::{
    image_to_tensor, mask_to_latent_tensor, select_best_device, tensor_to_image, DeviceMap,
    DiffusionBackend, Integrator, LoadOptions, Loader, ModeParams, ModelVariant, NoiseSchedule,
    PipelineCall, PipelineOutput, Sampler, StableDiffusionVersion,
};
use lora::LoraWeights;

const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;
const LORA_WEIGHTS_FILE: &str = "pytorch_lora_weights.safetensors";

struct Adapter {
    reference: String,
    weights: LoraWeights,
}

/// What the live UNet was built from.
#[derive(Debug, Clone, PartialEq)]
enum UnetWeights {
    Base,
    Merged { adapter: String, scale: f64 },
}

pub struct StableDiffusionBackend {
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    clip_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
    unet_file: PathBuf,
    unet_weights: UnetWeights,
    use_flash_attn: bool,
    adapter: Option<Adapter>,
    integrator: Integrator,
}

impl StableDiffusionBackend {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.sd_config.clip.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            warn!(tokens = tokens.len(), max_len, "prompt truncated");
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&tokens)?.to_dtype(self.dtype)?)
    }

    /// Conditioning for a batch: `[uncond; batch] ++ [cond; batch]` under guidance,
    /// otherwise `[cond; batch]`.
    fn text_embeddings(&self, call: &PipelineCall<'_>, use_guidance: bool) -> Result<Tensor> {
        let batch = call.batch_size;
        let prompt = first_or_empty(&call.prompts);
        let cond = self.encode_prompt(prompt)?.repeat((batch, 1, 1))?;
        if !use_guidance {
            return Ok(cond);
        }
        let negative = first_or_empty(&call.negative_prompts);
        let uncond = self.encode_prompt(negative)?.repeat((batch, 1, 1))?;
        Ok(Tensor::cat(&[uncond, cond], 0)?)
    }

    /// The UNet weights a call asks for.
    fn wanted_weights(&self, attention_scale: Option<f64>) -> UnetWeights {
        match (&self.adapter, attention_scale.unwrap_or(1.0)) {
            (Some(adapter), scale) if scale != 0.0 => UnetWeights::Merged {
                adapter: adapter.reference.clone(),
                scale,
            },
            _ => UnetWeights::Base,
        }
    }

    fn rebuild_unet(&mut self, wanted: UnetWeights) -> Result<()> {
        let unet = match &wanted {
            UnetWeights::Base => self.sd_config.build_unet(
                &self.unet_file,
                &self.device,
                LATENT_CHANNELS,
                self.use_flash_attn,
                self.dtype,
            )?,
            UnetWeights::Merged { scale, .. } => {
                let adapter = self.adapter.as_ref().context("no adapter loaded")?;
                let mut tensors = candle_core::safetensors::load(&self.unet_file, &self.device)
                    .context("failed to read UNet weights")?;
                adapter.weights.merge_into(&mut tensors, *scale)?;
                let merged = tempfile::Builder::new()
                    .suffix(".safetensors")
                    .tempfile()
                    .context("failed to create merged weights file")?;
                candle_core::safetensors::save(&tensors, merged.path())?;
                drop(tensors);
                self.sd_config.build_unet(
                    merged.path(),
                    &self.device,
                    LATENT_CHANNELS,
                    self.use_flash_attn,
                    self.dtype,
                )?
            }
        };
        info!(weights = ?wanted, "rebuilt UNet");
        self.unet = unet;
        self.unet_weights = wanted;
        Ok(())
    }

    fn resolve_adapter(reference: &str) -> Result<PathBuf> {
        let path = Path::new(reference);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        if path.is_dir() {
            return Ok(path.join(LORA_WEIGHTS_FILE));
        }
        let api = hf_hub::api::sync::Api::new().context("failed to create hub client")?;
        api.model(reference.to_string())
            .get(LORA_WEIGHTS_FILE)
            .with_context(|| format!("failed to fetch adapter {reference}"))
    }

    fn noise(&self, rng: &mut StdRng, shape: (usize, usize, usize, usize)) -> Result<Tensor> {
        let (b, c, h, w) = shape;
        let values: Vec<f32> = (0..b * c * h * w)
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(values, shape, &self.device)?.to_dtype(self.dtype)?)
    }

    fn encode_image(&self, image: &image::DynamicImage, batch: usize) -> Result<Tensor> {
        let image = image_to_tensor(image, &self.device, self.dtype)?;
        let latents = (self.vae.encode(&image)?.sample()? * VAE_SCALE)?;
        Ok(latents.repeat((batch, 1, 1, 1))?)
    }
}

fn first_or_empty(prompts: &Option<Vec<String>>) -> &str {
    prompts
        .as_ref()
        .and_then(|prompts| prompts.first())
        .map_or("", String::as_str)
}

/// Timestep index to start denoising from for a seed image kept at `strength`.
fn start_step(steps: usize, strength: f64) -> usize {
    steps - ((steps as f64 * strength) as usize).min(steps)
}

impl DiffusionBackend for StableDiffusionBackend {
    fn default_integrator(&self) -> Integrator {
        self.integrator
    }

    fn load_adapter(&mut self, reference: &str) -> Result<()> {
        let path = Self::resolve_adapter(reference)?;
        let weights = LoraWeights::from_file(&path)?;
        info!(adapter = reference, layers = weights.len(), "loaded adapter");
        self.adapter = Some(Adapter {
            reference: reference.to_string(),
            weights,
        });
        Ok(())
    }

    fn generate(&mut self, call: PipelineCall<'_>) -> Result<PipelineOutput> {
        if let Err(err) = self.device.set_seed(call.seed) {
            debug!("device rng not seeded: {err}");
        }
        let mut rng = StdRng::seed_from_u64(call.seed);

        let wanted = self.wanted_weights(call.attention_scale);
        if wanted != self.unet_weights {
            self.rebuild_unet(wanted)?;
        }

        let mut scheduler = scheduler::build(call.integrator, call.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let batch = call.batch_size;
        let use_guidance = call.guidance_scale > 1.0;
        let text_embeddings = self.text_embeddings(&call, use_guidance)?;

        // Initial latents, the step to start at, and for inpainting what to keep.
        let (mut latents, t_start, inpaint) = match call.params {
            ModeParams::TextToImage { width, height } => {
                let shape = (batch, LATENT_CHANNELS, height / 8, width / 8);
                let latents = (self.noise(&mut rng, shape)? * scheduler.init_noise_sigma())?;
                (latents, 0, None)
            }
            ModeParams::ImageToImage { image, strength } => {
                let init = self.encode_image(image, batch)?;
                let t_start = start_step(timesteps.len(), *strength);
                let noise = self.noise(&mut rng, init.dims4()?)?;
                let latents = match timesteps.get(t_start) {
                    Some(&t) => scheduler.add_noise(&init, noise, t)?,
                    None => init,
                };
                (latents, t_start, None)
            }
            ModeParams::Inpaint {
                image,
                mask,
                strength,
            } => {
                let init = self.encode_image(image, batch)?;
                let mask = mask_to_latent_tensor(mask, &self.device, self.dtype)?;
                let t_start = start_step(timesteps.len(), *strength);
                let noise = self.noise(&mut rng, init.dims4()?)?;
                let latents = match timesteps.get(t_start) {
                    Some(&t) => scheduler.add_noise(&init, noise.clone(), t)?,
                    None => init.clone(),
                };
                (latents, t_start, Some((init, mask, noise)))
            }
        };

        debug!(mode = ?call.params.mode(), steps = timesteps.len(), t_start, batch, "denoising");
        for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            let latent_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * call.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;

            // Outside the mask, pin the latents to the seed image at this noise level.
            if let Some((init, mask, noise)) = &inpaint {
                let kept = scheduler.add_noise(init, noise.clone(), timestep)?;
                let keep_mask = mask.affine(-1., 1.)?;
                latents = (kept.broadcast_mul(&keep_mask)? + latents.broadcast_mul(mask)?)?;
            }
            debug!(step = index + 1, of = timesteps.len(), "denoising step");
        }

        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let decoded = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let decoded = (decoded.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        let images = (0..decoded.dim(0)?)
            .map(|i| tensor_to_image(&decoded.i(i)?))
            .collect::<Result<Vec<_>>>()?;

        Ok(PipelineOutput {
            images,
            nsfw_content_detected: None,
        })
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Backend = StableDiffusionBackend;

    async fn load(
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
        options: LoadOptions,
    ) -> Result<Self::Backend> {
        // Configure device.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = if options.use_f16 { DType::F16 } else { DType::F32 };

        let (sd_config, tokenizer_repo) = match variant.version {
            StableDiffusionVersion::V1_5 => (
                StableDiffusionConfig::v1_5(None, None, None),
                "openai/clip-vit-base-patch32",
            ),
            StableDiffusionVersion::V2_1 => (
                StableDiffusionConfig::v2_1(None, None, None),
                "laion/CLIP-ViT-H-14-laion2B-s32B-b79K",
            ),
            StableDiffusionVersion::Xl => {
                anyhow::bail!("{} needs the XL pipeline", variant.repo)
            }
        };
        let repo = api.model(variant.repo.clone());
        let weights_file = |component: &str, stem: &str| {
            if options.use_f16 {
                format!("{component}/{stem}.fp16.safetensors")
            } else {
                format!("{component}/{stem}.safetensors")
            }
        };

        // --- Tokenizer ---
        let tokenizer_file = api
            .model(tokenizer_repo.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file).map_err(Error::msg)?;
        let pad_token = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no {pad_token} token"))?;

        // --- Text encoder ---
        let clip_file = repo
            .get(&weights_file("text_encoder", "model"))
            .await
            .context("failed to get text encoder weights")?;
        let clip_model = sd::build_clip_transformer(&sd_config.clip, clip_file, &device, DType::F32)
            .context("failed to load text encoder")?;

        // --- Autoencoder ---
        let vae_file = repo
            .get(&weights_file("vae", "diffusion_pytorch_model"))
            .await
            .context("failed to get VAE weights")?;
        let vae = sd_config
            .build_vae(vae_file, &device, dtype)
            .context("failed to load VAE")?;

        // --- UNet ---
        let unet_file = repo
            .get(&weights_file("unet", "diffusion_pytorch_model"))
            .await
            .context("failed to get UNet weights")?;
        let use_flash_attn = options.use_flash_attn();
        let unet = sd_config
            .build_unet(&unet_file, &device, LATENT_CHANNELS, use_flash_attn, dtype)
            .context("failed to load UNet")?;

        // --- Scheduler ---
        let integrator = match repo.get("scheduler/scheduler_config.json").await {
            Ok(path) => Integrator::from_config_file(path)?,
            Err(err) => {
                warn!("no scheduler config, using v1 defaults: {err}");
                Sampler::Pndm.configure(&NoiseSchedule::default())
            }
        };

        info!(repo = %variant.repo, ?dtype, sampler = %integrator.sampler, "model loaded");
        Ok(StableDiffusionBackend {
            device,
            dtype,
            sd_config,
            tokenizer,
            pad_id,
            clip_model,
            vae,
            unet,
            unet_file,
            unet_weights: UnetWeights::Base,
            use_flash_attn,
            adapter: None,
            integrator,
        })
    }
}
