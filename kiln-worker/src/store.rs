use std::io::Cursor;

use async_trait::async_trait;
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use tracing::info;
use uuid::Uuid;

use crate::error::JobError;

/// Where finished images go. Returns what the job output reports in `image`.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn store(&self, job_id: &str, image: &DynamicImage) -> Result<String, JobError>;
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, JobError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|err| JobError::Upload(format!("failed to encode PNG: {err}")))?;
    Ok(bytes)
}

/// Returns the PNG inline, base64 encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineStore;

#[async_trait]
impl ImageStore for InlineStore {
    async fn store(&self, _job_id: &str, image: &DynamicImage) -> Result<String, JobError> {
        Ok(BASE64_STANDARD.encode(encode_png(image)?))
    }
}

/// Uploads each PNG with an HTTP PUT to `{endpoint}/{job_id}/{uuid}.png` and returns
/// that URL.
#[derive(Debug, Clone)]
pub struct BucketStore {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl BucketStore {
    pub fn new(client: reqwest::Client, endpoint: &str, access_token: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn object_url(&self, job_id: &str) -> String {
        let name = Uuid::new_v4().simple();
        if job_id.is_empty() {
            format!("{}/{name}.png", self.endpoint)
        } else {
            format!("{}/{job_id}/{name}.png", self.endpoint)
        }
    }
}

#[async_trait]
impl ImageStore for BucketStore {
    async fn store(&self, job_id: &str, image: &DynamicImage) -> Result<String, JobError> {
        let bytes = encode_png(image)?;
        let url = self.object_url(job_id);

        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(bytes);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| JobError::Upload(err.to_string()))?;
        if !response.status().is_success() {
            return Err(JobError::Upload(format!("{url}: {}", response.status())));
        }
        info!(url = %url, "uploaded image");
        Ok(url)
    }
}
