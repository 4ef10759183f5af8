use anyhow::Result;
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{self, Scheduler, SchedulerConfig},
};
use tracing::warn;

use crate::sampler::{BetaSchedule, Integrator, NoiseSchedule, PredictionType, Sampler, TimestepSpacing};

/// The step functions candle implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepKind {
    Ddim,
    EulerAncestral,
}

impl StepKind {
    /// Samplers without a candle step function run on the closest one: ancestral
    /// samplers keep injecting noise, deterministic ones stay deterministic.
    pub(crate) fn for_sampler(sampler: Sampler) -> Self {
        match sampler {
            Sampler::Ddim => Self::Ddim,
            Sampler::EulerAncestral => Self::EulerAncestral,
            other if other.is_stochastic() => Self::EulerAncestral,
            _ => Self::Ddim,
        }
    }

    fn sampler(self) -> Sampler {
        match self {
            Self::Ddim => Sampler::Ddim,
            Self::EulerAncestral => Sampler::EulerAncestral,
        }
    }
}

fn beta_schedule(schedule: BetaSchedule) -> schedulers::BetaSchedule {
    match schedule {
        BetaSchedule::Linear => schedulers::BetaSchedule::Linear,
        BetaSchedule::ScaledLinear => schedulers::BetaSchedule::ScaledLinear,
        BetaSchedule::SquaredcosCapV2 => schedulers::BetaSchedule::SquaredcosCapV2,
    }
}

fn prediction_type(prediction: PredictionType) -> schedulers::PredictionType {
    match prediction {
        PredictionType::Epsilon => schedulers::PredictionType::Epsilon,
        PredictionType::VPrediction => schedulers::PredictionType::VPrediction,
        PredictionType::Sample => schedulers::PredictionType::Sample,
    }
}

fn timestep_spacing(spacing: TimestepSpacing) -> schedulers::TimestepSpacing {
    match spacing {
        TimestepSpacing::Leading => schedulers::TimestepSpacing::Leading,
        TimestepSpacing::Linspace => schedulers::TimestepSpacing::Linspace,
        TimestepSpacing::Trailing => schedulers::TimestepSpacing::Trailing,
    }
}

fn ddim_config(schedule: &NoiseSchedule) -> DDIMSchedulerConfig {
    DDIMSchedulerConfig {
        beta_start: schedule.beta_start,
        beta_end: schedule.beta_end,
        beta_schedule: beta_schedule(schedule.beta_schedule),
        eta: 0.,
        steps_offset: schedule.steps_offset,
        prediction_type: prediction_type(schedule.prediction_type),
        train_timesteps: schedule.train_timesteps,
        timestep_spacing: timestep_spacing(schedule.timestep_spacing),
    }
}

fn euler_ancestral_config(schedule: &NoiseSchedule) -> EulerAncestralDiscreteSchedulerConfig {
    EulerAncestralDiscreteSchedulerConfig {
        beta_start: schedule.beta_start,
        beta_end: schedule.beta_end,
        beta_schedule: beta_schedule(schedule.beta_schedule),
        steps_offset: schedule.steps_offset,
        prediction_type: prediction_type(schedule.prediction_type),
        train_timesteps: schedule.train_timesteps,
        timestep_spacing: timestep_spacing(schedule.timestep_spacing),
    }
}

/// Build a fresh scheduler for one call.
pub(crate) fn build(integrator: &Integrator, steps: usize) -> Result<Box<dyn Scheduler>> {
    let kind = StepKind::for_sampler(integrator.sampler);
    if kind.sampler() != integrator.sampler {
        warn!(
            requested = %integrator.sampler,
            using = %kind.sampler(),
            "sampler has no candle implementation"
        );
    }
    let scheduler = match kind {
        StepKind::Ddim => ddim_config(&integrator.schedule).build(steps)?,
        StepKind::EulerAncestral => euler_ancestral_config(&integrator.schedule).build(steps)?,
    };
    Ok(scheduler)
}
