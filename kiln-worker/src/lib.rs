pub mod error;
pub mod fetch;
pub mod orchestrator;
pub mod schema;
pub mod server;
pub mod store;

pub use error::JobError;
pub use fetch::{HttpFetcher, ImageFetcher};
pub use orchestrator::{ErrorMessage, Job, JobImage, JobOutput, Worker};
pub use schema::{validate, JobInput};
pub use server::router;
pub use store::{BucketStore, ImageStore, InlineStore};
