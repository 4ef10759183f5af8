use thiserror::Error;

/// Failures of a single generation request.
///
/// None of these are fatal to the worker: the orchestrator turns each one into a
/// job-level error and keeps serving.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// A mask was supplied without the image it applies to.
    #[error("mask was provided without init_image")]
    InvalidCombination,

    /// `width * height` is over [`crate::MAX_PIXELS`].
    #[error("Maximum size is 1024x768 or 768x1024 pixels, because of memory limits (got {width}x{height})")]
    SizeLimit { width: usize, height: usize },

    #[error("unknown scheduler `{0}`")]
    UnknownSampler(String),

    /// Every sample was flagged by the safety checker while filtering was enabled.
    #[error("NSFW content detected. Try running it again, or try a different prompt.")]
    AllContentFiltered,

    /// The generative backend itself failed (weights, tensors, device).
    #[error("generation failed: {0:#}")]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GenerationError>;
