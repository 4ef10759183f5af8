use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{loader_factory::ModelVariant, DeviceMap, DiffusionBackend};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Load half-precision weights and run in f16.
    pub use_f16: bool,
}

impl LoadOptions {
    /// Flash attention is a build-time choice.
    pub fn use_flash_attn(&self) -> bool {
        cfg!(feature = "flash-attn")
    }
}

pub trait Loader {
    type Backend: DiffusionBackend;

    fn load(
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
        options: LoadOptions,
    ) -> impl Future<Output = Result<Self::Backend>>
    where
        Self: Sized;
}
