use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{DeviceMap, LoadOptions, Loader, StableDiffusionBackend, StableDiffusionLoader};

/// Stable Diffusion generations, distinguished by architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    V1_5,
    V2_1,
    Xl,
}

impl StableDiffusionVersion {
    /// Detect the architecture from a hub repository name.
    ///
    /// Community fine-tunes rarely carry a version in their name and are v1.x based,
    /// so anything else with "diffusion" in it is treated as v1.5.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("XL") {
            Some(Self::Xl)
        } else if name_upper.contains("2-1") || name_upper.contains("2.1") {
            Some(Self::V2_1)
        } else if name_upper.contains("1-5")
            || name_upper.contains("1.5")
            || name_upper.contains("DIFFUSION")
        {
            Some(Self::V1_5)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelVariant {
    pub repo: String,
    pub version: StableDiffusionVersion,
}

impl ModelVariant {
    pub fn from_name(model_name: &str) -> Option<Self> {
        StableDiffusionVersion::from_name(model_name).map(|version| Self {
            repo: model_name.to_string(),
            version,
        })
    }
}

/// Load a model based on its name, detecting the architecture from it.
pub async fn load_model(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
    options: LoadOptions,
) -> Result<StableDiffusionBackend> {
    let variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model: {}", model_name))?;

    info!(model = model_name, version = ?variant.version, "loading model");

    match variant.version {
        StableDiffusionVersion::V1_5 | StableDiffusionVersion::V2_1 => {
            StableDiffusionLoader::load(variant, api, device_map, options).await
        }
        StableDiffusionVersion::Xl => Err(anyhow!(
            "Model {} ({:?}) is recognized but not yet implemented",
            model_name,
            variant.version
        )),
    }
}
