use kiln_core::GenerationError;
use thiserror::Error;

/// Everything that can end a job early. Each variant becomes the `error` field of
/// the job output; none of them stop the worker.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job input broke one or more schema rules.
    #[error("invalid job input: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Failed to download image from {source_url}: {reason}")]
    Fetch { source_url: String, reason: String },

    #[error("{name} is not a readable image: {source}")]
    Decode {
        name: &'static str,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("failed to upload result: {0}")]
    Upload(String),

    #[error("job scratch space: {0}")]
    Io(#[from] std::io::Error),
}
