//! Sampler registry.
//!
//! A sampler name from the job payload resolves to an [`Integrator`]: the sampler kind
//! bound to the noise schedule the model was trained with. The schedule always comes
//! from the pipeline's current integrator, never from defaults, so every sampler sees
//! the same beta range and prediction type as the checkpoint.

use std::{path::Path, str::FromStr};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{GenerationError, Result};

/// Sampler identifiers accepted in job payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sampler {
    #[serde(rename = "DDIM")]
    Ddim,
    #[serde(rename = "DDPM")]
    Ddpm,
    #[serde(rename = "DPM-M")]
    DpmMultistep,
    #[serde(rename = "DPM-S")]
    DpmSinglestep,
    #[serde(rename = "EULER-A")]
    EulerAncestral,
    #[serde(rename = "EULER-D")]
    EulerDiscrete,
    #[serde(rename = "HEUN")]
    Heun,
    #[serde(rename = "IPNDM")]
    Ipndm,
    #[serde(rename = "KDPM2-A")]
    Kdpm2Ancestral,
    #[serde(rename = "KDPM2-D")]
    Kdpm2Discrete,
    #[serde(rename = "PNDM")]
    Pndm,
    #[serde(rename = "K-LMS", alias = "KLMS")]
    Lms,
}

serde_plain::derive_display_from_serialize!(Sampler);

impl FromStr for Sampler {
    type Err = GenerationError;

    fn from_str(name: &str) -> Result<Self> {
        serde_plain::from_str(name).map_err(|_| GenerationError::UnknownSampler(name.to_string()))
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::Lms
    }
}

impl Sampler {
    pub const ALL: [Sampler; 12] = [
        Sampler::Ddim,
        Sampler::Ddpm,
        Sampler::DpmMultistep,
        Sampler::DpmSinglestep,
        Sampler::EulerAncestral,
        Sampler::EulerDiscrete,
        Sampler::Heun,
        Sampler::Ipndm,
        Sampler::Kdpm2Ancestral,
        Sampler::Kdpm2Discrete,
        Sampler::Pndm,
        Sampler::Lms,
    ];

    /// Whether the sampler injects fresh noise at every step.
    pub fn is_stochastic(self) -> bool {
        matches!(
            self,
            Sampler::Ddpm | Sampler::EulerAncestral | Sampler::Kdpm2Ancestral
        )
    }

    /// Map a diffusers scheduler class name to its sampler.
    pub fn from_scheduler_class(class_name: &str) -> Option<Self> {
        let sampler = match class_name {
            "DDIMScheduler" => Sampler::Ddim,
            "DDPMScheduler" => Sampler::Ddpm,
            "DPMSolverMultistepScheduler" => Sampler::DpmMultistep,
            "DPMSolverSinglestepScheduler" => Sampler::DpmSinglestep,
            "EulerAncestralDiscreteScheduler" => Sampler::EulerAncestral,
            "EulerDiscreteScheduler" => Sampler::EulerDiscrete,
            "HeunDiscreteScheduler" => Sampler::Heun,
            "IPNDMScheduler" => Sampler::Ipndm,
            "KDPM2AncestralDiscreteScheduler" => Sampler::Kdpm2Ancestral,
            "KDPM2DiscreteScheduler" => Sampler::Kdpm2Discrete,
            "PNDMScheduler" => Sampler::Pndm,
            "LMSDiscreteScheduler" => Sampler::Lms,
            _ => return None,
        };
        Some(sampler)
    }

    /// Bind this sampler to a trained noise schedule.
    pub fn configure(self, schedule: &NoiseSchedule) -> Integrator {
        Integrator {
            sampler: self,
            schedule: *schedule,
        }
    }
}

/// How beta evolves from `beta_start` to `beta_end` during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredcosCapV2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    Leading,
    Linspace,
    Trailing,
}

/// Noise schedule parameters a checkpoint was trained with.
///
/// Deserializes from a diffusers `scheduler_config.json`; keys that only matter to a
/// particular scheduler class (`skip_prk_steps`, `clip_sample`, ...) are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSchedule {
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    #[serde(rename = "num_train_timesteps")]
    pub train_timesteps: usize,
    pub steps_offset: usize,
    pub prediction_type: PredictionType,
    pub timestep_spacing: TimestepSpacing,
}

impl Default for NoiseSchedule {
    // Stable Diffusion v1.x
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            train_timesteps: 1000,
            steps_offset: 1,
            prediction_type: PredictionType::Epsilon,
            timestep_spacing: TimestepSpacing::Leading,
        }
    }
}

/// A sampler bound to a noise schedule. Backends build their stateful scheduler from
/// this for every call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Integrator {
    pub sampler: Sampler,
    pub schedule: NoiseSchedule,
}

#[derive(Deserialize)]
struct SchedulerConfigFile {
    #[serde(rename = "_class_name")]
    class_name: Option<String>,
    #[serde(flatten)]
    schedule: NoiseSchedule,
}

impl Integrator {
    /// Read a diffusers `scheduler_config.json`. The sampler comes from `_class_name`,
    /// falling back to PNDM, which Stable Diffusion checkpoints ship with.
    pub fn from_config_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scheduler config {}", path.display()))?;
        let file: SchedulerConfigFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse scheduler config {}", path.display()))?;
        let sampler = file
            .class_name
            .as_deref()
            .and_then(Sampler::from_scheduler_class)
            .unwrap_or(Sampler::Pndm);
        Ok(sampler.configure(&file.schedule))
    }
}

/// Resolve `name` into a fresh integrator that keeps `base`'s noise schedule.
pub fn resolve(name: &str, base: &Integrator) -> Result<Integrator> {
    let sampler: Sampler = name.parse()?;
    Ok(sampler.configure(&base.schedule))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained_schedule() -> NoiseSchedule {
        NoiseSchedule {
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::Linear,
            train_timesteps: 500,
            steps_offset: 0,
            prediction_type: PredictionType::VPrediction,
            timestep_spacing: TimestepSpacing::Trailing,
        }
    }

    #[test]
    fn test_every_name_round_trips() {
        for sampler in Sampler::ALL {
            let name = sampler.to_string();
            assert_eq!(name.parse::<Sampler>().unwrap(), sampler);
        }
    }

    #[test]
    fn test_klms_alias() {
        assert_eq!("KLMS".parse::<Sampler>().unwrap(), Sampler::Lms);
        assert_eq!("K-LMS".parse::<Sampler>().unwrap(), Sampler::Lms);
        assert_eq!(Sampler::Lms.to_string(), "K-LMS");
        assert_eq!(Sampler::default(), Sampler::Lms);
    }

    #[test]
    fn test_unknown_name() {
        let err = "NOT-A-SAMPLER".parse::<Sampler>().unwrap_err();
        assert!(matches!(err, GenerationError::UnknownSampler(ref name) if name == "NOT-A-SAMPLER"));
        // names are case sensitive
        assert!("ddim".parse::<Sampler>().is_err());
    }

    #[test]
    fn test_resolve_keeps_base_schedule() {
        let base = Sampler::Pndm.configure(&trained_schedule());

        let resolved = resolve("EULER-A", &base).unwrap();

        assert_eq!(resolved.sampler, Sampler::EulerAncestral);
        assert_eq!(resolved.schedule, trained_schedule());
        assert_ne!(resolved.schedule, NoiseSchedule::default());
    }

    #[test]
    fn test_resolve_unknown() {
        let base = Sampler::Pndm.configure(&NoiseSchedule::default());
        assert!(matches!(
            resolve("NOT-A-SAMPLER", &base),
            Err(GenerationError::UnknownSampler(_))
        ));
    }

    #[test]
    fn test_stochastic_samplers() {
        assert!(Sampler::EulerAncestral.is_stochastic());
        assert!(Sampler::Kdpm2Ancestral.is_stochastic());
        assert!(!Sampler::Ddim.is_stochastic());
        assert!(!Sampler::Lms.is_stochastic());
    }

    #[test]
    fn test_integrator_from_diffusers_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("scheduler_config.json");
        std::fs::write(
            &path,
            r#"{
                "_class_name": "PNDMScheduler",
                "_diffusers_version": "0.8.0",
                "beta_end": 0.012,
                "beta_schedule": "scaled_linear",
                "beta_start": 0.00085,
                "num_train_timesteps": 1000,
                "set_alpha_to_one": false,
                "skip_prk_steps": true,
                "steps_offset": 1,
                "prediction_type": "v_prediction"
            }"#,
        )
        .unwrap();

        let integrator = Integrator::from_config_file(&path).unwrap();
        let schedule = integrator.schedule;

        assert_eq!(integrator.sampler, Sampler::Pndm);
        assert_eq!(schedule.beta_schedule, BetaSchedule::ScaledLinear);
        assert_eq!(schedule.train_timesteps, 1000);
        assert_eq!(schedule.prediction_type, PredictionType::VPrediction);
        // absent keys fall back to the v1.x values
        assert_eq!(schedule.timestep_spacing, TimestepSpacing::Leading);
    }

    #[test]
    fn test_unknown_scheduler_class_defaults_to_pndm() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("scheduler_config.json");
        std::fs::write(&path, r#"{"_class_name": "UniPCMultistepScheduler"}"#).unwrap();

        let integrator = Integrator::from_config_file(&path).unwrap();

        assert_eq!(integrator.sampler, Sampler::Pndm);
        assert_eq!(integrator.schedule, NoiseSchedule::default());
        assert_eq!(
            Sampler::from_scheduler_class("EulerAncestralDiscreteScheduler"),
            Some(Sampler::EulerAncestral)
        );
    }
}
