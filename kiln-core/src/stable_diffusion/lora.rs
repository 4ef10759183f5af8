//! Low-rank adapter weights and their merge into UNet weights.
//!
//! Two on-disk layouts are understood:
//! - diffusers attention processors, `...attn1.processor.to_q_lora.down.weight`
//! - PEFT, `...attn1.to_q.lora_A.weight`
//!
//! Both may carry a leading `unet.` prefix and a per-layer `alpha` scalar. Text
//! encoder layers are skipped.

use std::{collections::HashMap, path::Path};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Down,
    Up,
    /// Training-time alpha. The delta is scaled by `alpha / rank`.
    Alpha,
}

/// Normalize a diffusers attention-processor layer name to the UNet module it wraps.
fn processor_layer(layer: &str) -> String {
    let layer = layer.replace(".processor.", ".");
    match layer.strip_suffix(".to_out") {
        Some(prefix) => format!("{prefix}.to_out.0"),
        None => layer,
    }
}

/// Map an adapter tensor name to the UNet weight it patches.
fn parse_key(name: &str) -> Option<(String, Part)> {
    let name = name.strip_prefix("unet.").unwrap_or(name);

    let (layer, part) = if let Some(layer) = name.strip_suffix(".lora_A.weight") {
        (layer.to_string(), Part::Down)
    } else if let Some(layer) = name.strip_suffix(".lora_B.weight") {
        (layer.to_string(), Part::Up)
    } else if let Some(layer) = name.strip_suffix("_lora.down.weight") {
        (processor_layer(layer), Part::Down)
    } else if let Some(layer) = name.strip_suffix("_lora.up.weight") {
        (processor_layer(layer), Part::Up)
    } else if let Some(layer) = name.strip_suffix("_lora.alpha") {
        (processor_layer(layer), Part::Alpha)
    } else if let Some(layer) = name.strip_suffix(".alpha") {
        (layer.to_string(), Part::Alpha)
    } else {
        return None;
    };

    if layer.starts_with("text_encoder") {
        return None;
    }
    Some((format!("{layer}.weight"), part))
}

fn to_tensor(view: &safetensors::tensor::TensorView<'_>) -> Result<Tensor> {
    let dtype = match view.dtype() {
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F32 => DType::F32,
        safetensors::Dtype::F64 => DType::F64,
        other => bail!("unsupported adapter dtype {other:?}"),
    };
    Ok(Tensor::from_raw_buffer(view.data(), dtype, view.shape(), &Device::Cpu)?)
}

#[derive(Debug)]
struct LoraLayer {
    down: Tensor,
    up: Tensor,
    alpha: Option<f64>,
}

impl LoraLayer {
    /// `up @ down`, reshaped to the patched weight. Works for linear layers and
    /// convolutions alike since the kernel dimensions ride along with `down`.
    fn delta(&self, shape: &[usize]) -> Result<Tensor> {
        let up = self.up.to_dtype(DType::F32)?.flatten_from(1)?;
        let down = self.down.to_dtype(DType::F32)?.flatten_from(1)?;
        Ok(up.matmul(&down)?.reshape(shape)?)
    }

    /// `alpha / rank` when the adapter recorded an alpha, otherwise 1.
    fn alpha_scale(&self) -> Result<f64> {
        let rank = self.down.dim(0)?;
        Ok(match self.alpha {
            Some(alpha) if rank > 0 => alpha / rank as f64,
            _ => 1.0,
        })
    }
}

fn scalar(tensor: &Tensor) -> Result<f64> {
    let values = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    match values.as_slice() {
        [value] => Ok(*value),
        _ => bail!("expected a scalar, got shape {:?}", tensor.dims()),
    }
}

/// Adapter weights, held on the CPU until merged.
#[derive(Debug)]
pub(crate) struct LoraWeights {
    layers: HashMap<String, LoraLayer>,
}

impl LoraWeights {
    pub(crate) fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read adapter weights {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("failed to parse adapter weights {}", path.display()))?;

        let mut downs = HashMap::new();
        let mut ups = HashMap::new();
        let mut alphas = HashMap::new();
        for (name, view) in tensors.tensors() {
            let Some((target, part)) = parse_key(&name) else {
                debug!(tensor = %name, "skipping adapter tensor");
                continue;
            };
            let tensor = to_tensor(&view).with_context(|| format!("bad adapter tensor {name}"))?;
            match part {
                Part::Down => {
                    downs.insert(target, tensor);
                }
                Part::Up => {
                    ups.insert(target, tensor);
                }
                Part::Alpha => {
                    let alpha =
                        scalar(&tensor).with_context(|| format!("bad adapter alpha {name}"))?;
                    alphas.insert(target, alpha);
                }
            }
        }

        let mut layers = HashMap::new();
        for (target, down) in downs {
            let up = ups
                .remove(&target)
                .with_context(|| format!("adapter has no up projection for {target}"))?;
            let alpha = alphas.remove(&target);
            layers.insert(target, LoraLayer { down, up, alpha });
        }
        if let Some(target) = ups.keys().next() {
            bail!("adapter has no down projection for {target}");
        }
        if layers.is_empty() {
            bail!("no UNet layers found in {}", path.display());
        }
        Ok(Self { layers })
    }

    pub(crate) fn len(&self) -> usize {
        self.layers.len()
    }

    /// Add `scale * alpha / rank * up @ down` to every patched weight in `weights`.
    pub(crate) fn merge_into(&self, weights: &mut HashMap<String, Tensor>, scale: f64) -> Result<()> {
        for (target, layer) in &self.layers {
            let base = weights
                .get(target)
                .with_context(|| format!("adapter patches unknown UNet weight {target}"))?;
            let factor = scale * layer.alpha_scale()?;
            let delta = (layer.delta(base.dims())?.to_device(base.device())? * factor)?;
            let merged = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
            weights.insert(target.clone(), merged);
        }
        Ok(())
    }
}
