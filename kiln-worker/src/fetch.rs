use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::JobError;

/// Brings a job's input image onto local disk.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Make `source` available locally, writing downloads to `dest`. Returns the path
    /// to decode. Local paths are only read when `allow_local` is set.
    async fn fetch(
        &self,
        source: &str,
        dest: &Path,
        allow_local: bool,
    ) -> Result<PathBuf, JobError>;
}

/// Downloads `http(s)` URLs with a single GET. Other sources are read as local paths
/// when the caller allows it and rejected otherwise.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn fetch_error(source: &str, reason: impl ToString) -> JobError {
    JobError::Fetch {
        source_url: source.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        source: &str,
        dest: &Path,
        allow_local: bool,
    ) -> Result<PathBuf, JobError> {
        if !(source.starts_with("http://") || source.starts_with("https://")) {
            if !allow_local {
                return Err(fetch_error(source, "only http(s) URLs are accepted"));
            }
            let path = PathBuf::from(source.strip_prefix("file://").unwrap_or(source));
            if !path.is_file() {
                return Err(fetch_error(source, "no such file"));
            }
            return Ok(path);
        }

        let response = self
            .client
            .get(source)
            .send()
            .await
            .map_err(|err| fetch_error(source, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(source, status));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| fetch_error(source, err))?;
        tokio::fs::write(dest, &bytes).await?;
        debug!(source, bytes = bytes.len(), dest = %dest.display(), "downloaded image");
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, routing::get, Router};
    use tokio::net::TcpListener;

    use super::*;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_downloads_into_dest() {
        let base = serve(Router::new().route("/fox.png", get(|| async { "png bytes" }))).await;
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("init_image");

        let path = HttpFetcher::default()
            .fetch(&format!("{base}/fox.png"), &dest, false)
            .await
            .unwrap();

        assert_eq!(path, dest);
        assert_eq!(std::fs::read(&path).unwrap(), b"png bytes");
    }

    #[tokio::test]
    async fn test_error_status() {
        let base = serve(Router::new().route(
            "/gone.png",
            get(|| async { (StatusCode::NOT_FOUND, "missing") }),
        ))
        .await;
        let dir = tempfile::TempDir::new().unwrap();

        let err = HttpFetcher::default()
            .fetch(
                &format!("{base}/gone.png"),
                &dir.path().join("init_image"),
                false,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Fetch { ref reason, .. } if reason.contains("404")));
        assert!(!dir.path().join("init_image").exists());
    }

    #[tokio::test]
    async fn test_local_paths_pass_through() {
        let dir = tempfile::TempDir::new().unwrap();
        let mask = dir.path().join("mask.png");
        std::fs::write(&mask, b"mask").unwrap();
        let fetcher = HttpFetcher::default();

        let path = fetcher
            .fetch(mask.to_str().unwrap(), &dir.path().join("unused"), true)
            .await
            .unwrap();
        assert_eq!(path, mask);

        let missing = dir.path().join("missing.png");
        assert!(fetcher
            .fetch(missing.to_str().unwrap(), &dir.path().join("unused"), true)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_local_paths_need_permission() {
        let dir = tempfile::TempDir::new().unwrap();
        let secret = dir.path().join("hostname");
        std::fs::write(&secret, b"worker-7").unwrap();
        let dest = dir.path().join("init_image");
        let fetcher = HttpFetcher::default();

        for source in [
            secret.display().to_string(),
            format!("file://{}", secret.display()),
            "/etc/hostname".to_string(),
            "file:///etc/hostname".to_string(),
        ] {
            let err = fetcher.fetch(&source, &dest, false).await.unwrap_err();
            assert!(
                matches!(err, JobError::Fetch { ref reason, .. } if reason.contains("http(s)")),
                "{source}: {err}"
            );
        }
        assert!(!dest.exists());
    }
}
