//! Runs one job end to end: validate, fetch inputs, generate, deliver.

use std::{path::Path, sync::Arc};

use anyhow::anyhow;
use image::DynamicImage;
use kiln_core::{DiffusionBackend, GenerationError, ModelState};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    error::JobError,
    fetch::ImageFetcher,
    schema::{self, JobInput},
    store::ImageStore,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobImage {
    pub image: String,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorMessage {
    One(String),
    Many(Vec<String>),
}

/// What a job answers: the images in generation order, or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Images(Vec<JobImage>),
    Error { error: ErrorMessage },
}

impl From<JobError> for JobOutput {
    fn from(err: JobError) -> Self {
        let error = match err {
            JobError::Validation(errors) => ErrorMessage::Many(errors),
            other => ErrorMessage::One(other.to_string()),
        };
        JobOutput::Error { error }
    }
}

pub struct Worker<B> {
    state: Arc<Mutex<ModelState<B>>>,
    fetcher: Arc<dyn ImageFetcher>,
    store: Arc<dyn ImageStore>,
}

impl<B: DiffusionBackend + 'static> Worker<B> {
    pub fn new(
        state: ModelState<B>,
        fetcher: Arc<dyn ImageFetcher>,
        store: Arc<dyn ImageStore>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            fetcher,
            store,
        }
    }

    pub fn state(&self) -> Arc<Mutex<ModelState<B>>> {
        self.state.clone()
    }

    #[instrument(skip_all, fields(job = %job.id))]
    pub async fn handle(&self, job: Job) -> JobOutput {
        match self.run(&job).await {
            Ok(images) => {
                info!(images = images.len(), "job done");
                JobOutput::Images(images)
            }
            Err(err) => {
                warn!("job failed: {err}");
                err.into()
            }
        }
    }

    async fn run(&self, job: &Job) -> Result<Vec<JobImage>, JobError> {
        let input = schema::validate(&job.input).map_err(JobError::Validation)?;

        // One job at a time: the lock is held until the last image is delivered.
        let mut guard = self.state.clone().lock_owned().await;

        let workdir = tempfile::TempDir::new()?;
        let (seed_image, mask_image) = self.load_inputs(&input, workdir.path()).await?;
        let nsfw = input.nsfw;
        let request = input.into_request(seed_image, mask_image);

        let (guard, result) = tokio::task::spawn_blocking(move || {
            guard.set_nsfw_filter(nsfw);
            let result = kiln_core::generate(&request, &mut *guard);
            (guard, result)
        })
        .await
        .map_err(|err| GenerationError::Backend(anyhow!("generation thread failed: {err}")))?;
        let result = result?;

        let mut images = Vec::with_capacity(result.images.len());
        for generated in &result.images {
            let image = self.store.store(&job.id, &generated.image).await?;
            images.push(JobImage {
                image,
                seed: generated.seed,
            });
        }
        drop(guard);
        Ok(images)
    }

    async fn load_inputs(
        &self,
        input: &JobInput,
        workdir: &Path,
    ) -> Result<(Option<DynamicImage>, Option<DynamicImage>), JobError> {
        let seed_image = match &input.init_image {
            Some(source) => Some(self.load_image("init_image", source, workdir, false).await?),
            None => None,
        };
        let mask_image = match &input.mask {
            Some(source) => Some(self.load_image("mask", source, workdir, true).await?),
            None => None,
        };
        Ok((seed_image, mask_image))
    }

    async fn load_image(
        &self,
        name: &'static str,
        source: &str,
        workdir: &Path,
        allow_local: bool,
    ) -> Result<DynamicImage, JobError> {
        let path = self
            .fetcher
            .fetch(source, &workdir.join(name), allow_local)
            .await?;
        let decode = |source| JobError::Decode { name, source };
        image::ImageReader::open(&path)?
            .with_guessed_format()?
            .decode()
            .map_err(decode)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        path::PathBuf,
        sync::Mutex as StdMutex,
    };

    use async_trait::async_trait;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use kiln_core::{testing::StubBackend, Mode};
    use serde_json::json;

    use super::*;
    use crate::store::InlineStore;

    /// Serves in-memory files by URL and remembers where it wrote them.
    #[derive(Default)]
    struct FakeFetcher {
        files: HashMap<String, Vec<u8>>,
        written: StdMutex<Vec<PathBuf>>,
    }

    impl FakeFetcher {
        fn with_image(mut self, url: &str, image: DynamicImage) -> Self {
            let bytes = crate::store::encode_png(&image).unwrap();
            self.files.insert(url.to_string(), bytes);
            self
        }

        fn with_bytes(mut self, url: &str, bytes: &[u8]) -> Self {
            self.files.insert(url.to_string(), bytes.to_vec());
            self
        }
    }

    #[async_trait]
    impl ImageFetcher for FakeFetcher {
        async fn fetch(
            &self,
            source: &str,
            dest: &Path,
            _allow_local: bool,
        ) -> Result<PathBuf, JobError> {
            let bytes = self.files.get(source).ok_or_else(|| JobError::Fetch {
                source_url: source.to_string(),
                reason: "404 Not Found".to_string(),
            })?;
            std::fs::write(dest, bytes)?;
            self.written.lock().unwrap().push(dest.to_path_buf());
            Ok(dest.to_path_buf())
        }
    }

    fn worker(backend: StubBackend, fetcher: FakeFetcher) -> (Worker<StubBackend>, Arc<FakeFetcher>) {
        let fetcher = Arc::new(fetcher);
        let worker = Worker::new(
            ModelState::new(backend),
            fetcher.clone(),
            Arc::new(InlineStore),
        );
        (worker, fetcher)
    }

    fn job(input: serde_json::Value) -> Job {
        Job {
            id: "job-1".to_string(),
            input,
        }
    }

    fn photo() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb([10, 20, 30])))
    }

    #[tokio::test]
    async fn test_text_to_image_job() {
        let (worker, _) = worker(StubBackend::default(), FakeFetcher::default());

        let output = worker
            .handle(job(json!({
                "prompt": "a fox",
                "num_outputs": 3,
                "seed": 7,
                "guidance_scale": 7.5,
                "width": 256,
                "height": 128
            })))
            .await;

        let images = match output {
            JobOutput::Images(images) => images,
            other => panic!("expected images, got {other:?}"),
        };
        assert_eq!(images.iter().map(|i| i.seed).collect::<Vec<_>>(), [7, 8, 9]);
        let state = worker.state();
        let state = state.lock().await;
        let call = &state.backend().calls[0];
        assert_eq!(call.mode, Mode::TextToImage);
        assert_eq!(call.prompts.as_ref().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn test_validation_errors_skip_generation() {
        let (worker, _) = worker(StubBackend::default(), FakeFetcher::default());

        let output = worker
            .handle(job(json!({"prompt": "a fox", "width": 100, "colour": "red"})))
            .await;

        let errors = match output {
            JobOutput::Error {
                error: ErrorMessage::Many(errors),
            } => errors,
            other => panic!("expected a list of errors, got {other:?}"),
        };
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(worker.state().lock().await.backend().calls.is_empty());
    }

    #[tokio::test]
    async fn test_image_to_image_job_cleans_up() {
        let fetcher = FakeFetcher::default().with_image("https://img/fox.png", photo());
        let (worker, fetcher) = worker(StubBackend::default(), fetcher);

        let output = worker
            .handle(job(json!({
                "prompt": "a fox",
                "init_image": "https://img/fox.png",
                "prompt_strength": 0.5,
                "guidance_scale": 7.5,
                "seed": 1
            })))
            .await;

        assert!(matches!(output, JobOutput::Images(ref images) if images.len() == 1));
        assert_eq!(
            worker.state().lock().await.backend().calls[0].mode,
            Mode::ImageToImage
        );
        let written = fetcher.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert!(!written[0].exists(), "scratch files outlive the job");
    }

    #[tokio::test]
    async fn test_inpaint_job() {
        let mask = DynamicImage::ImageLuma8(GrayImage::from_pixel(32, 24, Luma([255])));
        let fetcher = FakeFetcher::default()
            .with_image("https://img/fox.png", photo())
            .with_image("https://img/mask.png", mask);
        let (worker, _) = worker(StubBackend::default(), fetcher);

        let output = worker
            .handle(job(json!({
                "prompt": "a fox",
                "init_image": "https://img/fox.png",
                "mask": "https://img/mask.png",
                "prompt_strength": 0.8,
                "guidance_scale": 7.5
            })))
            .await;

        assert!(matches!(output, JobOutput::Images(_)), "{output:?}");
        assert_eq!(
            worker.state().lock().await.backend().calls[0].mode,
            Mode::Inpaint
        );
    }

    #[tokio::test]
    async fn test_local_seed_image_is_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = dir.path().join("fox.png");
        photo().save(&local).unwrap();
        let worker = Worker::new(
            ModelState::new(StubBackend::default()),
            Arc::new(crate::fetch::HttpFetcher::default()),
            Arc::new(InlineStore),
        );

        let output = worker
            .handle(job(json!({
                "prompt": "a fox",
                "init_image": local.display().to_string(),
                "prompt_strength": 0.5,
                "guidance_scale": 7.5
            })))
            .await;

        let message = match output {
            JobOutput::Error {
                error: ErrorMessage::One(message),
            } => message,
            other => panic!("expected an error, got {other:?}"),
        };
        assert!(message.contains("only http(s) URLs are accepted"), "{message}");
        assert!(worker.state().lock().await.backend().calls.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_a_job_error() {
        let (worker, _) = worker(StubBackend::default(), FakeFetcher::default());

        let output = worker
            .handle(job(json!({
                "prompt": "a fox",
                "init_image": "https://img/missing.png",
                "prompt_strength": 0.5,
                "guidance_scale": 7.5
            })))
            .await;

        let message = match output {
            JobOutput::Error {
                error: ErrorMessage::One(message),
            } => message,
            other => panic!("expected an error, got {other:?}"),
        };
        assert!(message.contains("404"), "{message}");
        assert!(worker.state().lock().await.backend().calls.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_image() {
        let fetcher = FakeFetcher::default().with_bytes("https://img/fox.png", b"not an image");
        let (worker, _) = worker(StubBackend::default(), fetcher);

        let output = worker
            .handle(job(json!({
                "prompt": "a fox",
                "init_image": "https://img/fox.png",
                "prompt_strength": 0.5,
                "guidance_scale": 7.5
            })))
            .await;

        assert!(
            matches!(output, JobOutput::Error { error: ErrorMessage::One(ref m) } if m.contains("init_image")),
            "{output:?}"
        );
    }

    #[tokio::test]
    async fn test_nsfw_flag_controls_filtering() {
        let input = json!({"prompt": "a fox", "guidance_scale": 7.5, "num_outputs": 2});
        let (worker, _) = worker(StubBackend::default().flag_all(), FakeFetcher::default());

        let output = worker.handle(job(input.clone())).await;
        assert_eq!(
            output,
            JobOutput::Error {
                error: ErrorMessage::One(GenerationError::AllContentFiltered.to_string())
            }
        );

        let mut unfiltered = input;
        unfiltered["nsfw"] = json!(false);
        let output = worker.handle(job(unfiltered)).await;
        assert!(matches!(output, JobOutput::Images(ref images) if images.len() == 2));
        assert!(!worker.state().lock().await.nsfw_filter_enabled());
    }

    #[tokio::test]
    async fn test_oversized_job_is_rejected() {
        let (worker, _) = worker(StubBackend::default(), FakeFetcher::default());

        let output = worker
            .handle(job(json!({
                "prompt": "a fox",
                "guidance_scale": 7.5,
                "width": 1024,
                "height": 1024
            })))
            .await;

        assert!(
            matches!(output, JobOutput::Error { error: ErrorMessage::One(ref m) } if m.starts_with("Maximum size")),
            "{output:?}"
        );
        assert!(worker.state().lock().await.backend().calls.is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_worker_alive() {
        let (worker, _) = worker(StubBackend::default().failing(), FakeFetcher::default());
        let input = json!({"prompt": "a fox", "guidance_scale": 7.5});

        for _ in 0..2 {
            let output = worker.handle(job(input.clone())).await;
            assert!(matches!(output, JobOutput::Error { .. }), "{output:?}");
        }
    }

    #[test]
    fn test_output_shapes() {
        let images = JobOutput::Images(vec![JobImage {
            image: "aGk=".to_string(),
            seed: 42,
        }]);
        assert_eq!(
            serde_json::to_value(&images).unwrap(),
            json!([{"image": "aGk=", "seed": 42}])
        );

        let error: JobOutput = JobError::Validation(vec!["a".into(), "b".into()]).into();
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"error": ["a", "b"]})
        );

        let error: JobOutput = JobError::Upload("denied".into()).into();
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"error": "failed to upload result: denied"})
        );
    }
}
