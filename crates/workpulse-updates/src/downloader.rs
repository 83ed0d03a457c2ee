//! Resumable artifact download

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use workpulse_http::header::{HeaderMap, HeaderValue, CONTENT_RANGE, RANGE};
use workpulse_http::{HttpClientTrait, HttpError, Response, StatusCode};

use crate::error::{Result, UpdateError};

/// Progress sink: `(downloaded_bytes, total_bytes)`; total is 0 when unknown
pub type ProgressCallback<'a> = &'a mut (dyn FnMut(u64, u64) + Send);

/// Result of a completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Final artifact location
    pub path: PathBuf,
    /// Size on disk
    pub bytes: u64,
    /// Whether an earlier partial download was continued
    pub resumed: bool,
}

/// Streams artifacts to disk, resuming from `<dest>.partial` when the server
/// honours byte ranges.
pub struct ArtifactDownloader {
    client: Arc<dyn HttpClientTrait>,
    idle_timeout: Duration,
    overall_timeout: Duration,
}

impl ArtifactDownloader {
    /// Create a downloader.
    ///
    /// `idle_timeout` bounds the wait for each chunk, `overall_timeout` the
    /// whole transfer.
    pub fn new(
        client: Arc<dyn HttpClientTrait>,
        idle_timeout: Duration,
        overall_timeout: Duration,
    ) -> Self {
        Self {
            client,
            idle_timeout,
            overall_timeout,
        }
    }

    /// Where an in-flight download for `destination` is kept
    pub fn partial_path(destination: &Path) -> PathBuf {
        let mut name = destination.as_os_str().to_owned();
        name.push(".partial");
        PathBuf::from(name)
    }

    /// Download `url` to `destination`.
    ///
    /// `expected_size` of 0 disables the size check. A size mismatch deletes
    /// the partial file before failing. Every download failure is transient
    /// so the caller retries it up to its retry ceiling.
    pub async fn download(
        &self,
        url: &str,
        expected_size: u64,
        destination: &Path,
        cancel: &CancellationToken,
        progress: ProgressCallback<'_>,
    ) -> Result<DownloadOutcome> {
        let transfer = self.transfer(url, expected_size, destination, cancel, progress);
        match tokio::time::timeout(self.overall_timeout, transfer).await {
            Ok(result) => result,
            Err(_) => Err(UpdateError::download(format!(
                "download did not finish within {:?}",
                self.overall_timeout
            ))),
        }
    }

    async fn transfer(
        &self,
        url: &str,
        expected_size: u64,
        destination: &Path,
        cancel: &CancellationToken,
        progress: ProgressCallback<'_>,
    ) -> Result<DownloadOutcome> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = Self::partial_path(destination);

        let mut existing = match fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if expected_size > 0 && existing > expected_size {
            warn!(path = %partial.display(), existing, expected_size, "Partial download larger than artifact, restarting");
            remove_if_exists(&partial).await;
            existing = 0;
        }

        if expected_size > 0 && existing == expected_size {
            debug!(path = %partial.display(), "Partial download already complete");
            progress(existing, expected_size);
            return finish(&partial, destination, existing, true).await;
        }

        let mut headers = HeaderMap::new();
        if existing > 0 {
            let range = HeaderValue::from_str(&format!("bytes={existing}-"))
                .map_err(|e| UpdateError::download(e.to_string()))?;
            headers.insert(RANGE, range);
        }

        let request = self.client.get_with_headers(url, headers);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            response = request => response,
        };
        let mut response = match response {
            Ok(response) => response,
            Err(e) if e.status() == Some(StatusCode::RANGE_NOT_SATISFIABLE) => {
                warn!(url, "Server rejected resume range, discarding partial download");
                remove_if_exists(&partial).await;
                return Err(UpdateError::download("resume range not satisfiable"));
            }
            Err(e) => return Err(UpdateError::download_from_http(e)),
        };

        let resumed = existing > 0
            && response.status() == StatusCode::PARTIAL_CONTENT
            && content_range_start(&response) == Some(existing);

        let (mut file, mut downloaded) = if resumed {
            info!(url, offset = existing, "Resuming download");
            let file = OpenOptions::new().append(true).open(&partial).await?;
            (file, existing)
        } else {
            if existing > 0 {
                debug!(url, status = %response.status(), "Server ignored range, restarting download");
            }
            (fs::File::create(&partial).await?, 0)
        };

        let total = if expected_size > 0 {
            expected_size
        } else {
            response.content_length().map_or(0, |len| len + downloaded)
        };
        progress(downloaded, total);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    debug!(path = %partial.display(), downloaded, "Download cancelled, keeping partial file");
                    return Err(UpdateError::Cancelled);
                }
                next = tokio::time::timeout(self.idle_timeout, response.chunk()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    file.flush().await?;
                    return Err(UpdateError::download(format!(
                        "no data received for {:?}",
                        self.idle_timeout
                    )));
                }
                Ok(Err(e)) => {
                    file.flush().await?;
                    return Err(UpdateError::download_from_http(HttpError::RequestFailed(e)));
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(chunk))) => chunk,
            };

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if expected_size > 0 && downloaded > expected_size {
                drop(file);
                remove_if_exists(&partial).await;
                return Err(size_mismatch(expected_size, downloaded));
            }
            progress(downloaded, total);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if expected_size > 0 && downloaded != expected_size {
            remove_if_exists(&partial).await;
            return Err(size_mismatch(expected_size, downloaded));
        }

        finish(&partial, destination, downloaded, resumed).await
    }
}

async fn finish(
    partial: &Path,
    destination: &Path,
    bytes: u64,
    resumed: bool,
) -> Result<DownloadOutcome> {
    fs::rename(partial, destination).await?;
    info!(path = %destination.display(), bytes, resumed, "Download complete");
    Ok(DownloadOutcome {
        path: destination.to_path_buf(),
        bytes,
        resumed,
    })
}

fn size_mismatch(expected: u64, actual: u64) -> UpdateError {
    UpdateError::download(format!(
        "size mismatch: expected {expected} bytes, received {actual}"
    ))
}

/// First byte offset of a `Content-Range: bytes START-END/TOTAL` header
fn content_range_start(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial download");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use workpulse_http::{HttpClient, HttpConfig};

    const BODY: &[u8] = b"0123456789abcdefghij";

    fn downloader() -> ArtifactDownloader {
        let client = HttpClient::new(HttpConfig::default().for_transfers()).unwrap();
        ArtifactDownloader::new(Arc::new(client), Duration::from_secs(5), Duration::from_secs(10))
    }

    async fn run(
        downloader: &ArtifactDownloader,
        url: &str,
        expected: u64,
        dest: &Path,
    ) -> (Result<DownloadOutcome>, Vec<(u64, u64)>) {
        let mut seen = Vec::new();
        let mut progress = |done: u64, total: u64| seen.push((done, total));
        let result = downloader
            .download(url, expected, dest, &CancellationToken::new(), &mut progress)
            .await;
        (result, seen)
    }

    #[tokio::test]
    async fn test_full_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/agent.msi"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("agent.msi");
        let url = format!("{}/agent.msi", server.uri());

        let (result, seen) = run(&downloader(), &url, BODY.len() as u64, &dest).await;
        let outcome = result.unwrap();

        assert_eq!(outcome.bytes, BODY.len() as u64);
        assert!(!outcome.resumed);
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
        assert!(!ArtifactDownloader::partial_path(&dest).exists());
        assert_eq!(seen.last(), Some(&(20, 20)));
    }

    #[tokio::test]
    async fn test_resume_with_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=8-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 8-19/20")
                    .set_body_bytes(&BODY[8..]),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("agent.msi");
        std::fs::write(ArtifactDownloader::partial_path(&dest), &BODY[..8]).unwrap();
        let url = format!("{}/agent.msi", server.uri());

        let (result, seen) = run(&downloader(), &url, 20, &dest).await;
        let outcome = result.unwrap();

        assert!(outcome.resumed);
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
        assert_eq!(seen.first(), Some(&(8, 20)));
    }

    #[tokio::test]
    async fn test_server_without_range_support_restarts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("agent.msi");
        std::fs::write(ArtifactDownloader::partial_path(&dest), b"stale!!").unwrap();
        let url = format!("{}/agent.msi", server.uri());

        let (result, _) = run(&downloader(), &url, 20, &dest).await;
        assert!(!result.unwrap().resumed);
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
    }

    #[tokio::test]
    async fn test_unsatisfiable_range_discards_partial() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("agent.msi");
        let partial = ArtifactDownloader::partial_path(&dest);
        std::fs::write(&partial, b"0123").unwrap();
        let url = format!("{}/agent.msi", server.uri());

        let (result, _) = run(&downloader(), &url, 20, &dest).await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn test_size_mismatch_discards_and_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("agent.msi");
        let url = format!("{}/agent.msi", server.uri());

        let (result, _) = run(&downloader(), &url, 50, &dest).await;
        let err = result.unwrap_err();
        assert!(matches!(err, UpdateError::Download { .. }));
        assert!(err.is_transient());
        assert!(!dest.exists());
        assert!(!ArtifactDownloader::partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_http_status_failures_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.msi"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy.msi"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("agent.msi");
        let d = downloader();

        let (missing, _) = run(&d, &format!("{}/missing.msi", server.uri()), 20, &dest).await;
        assert!(missing.unwrap_err().is_transient());

        let (busy, _) = run(&d, &format!("{}/busy.msi", server.uri()), 20, &dest).await;
        assert!(busy.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_overall_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(BODY)
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let client = HttpClient::new(HttpConfig::default().for_transfers()).unwrap();
        let d = ArtifactDownloader::new(
            Arc::new(client),
            Duration::from_secs(5),
            Duration::from_millis(200),
        );
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("agent.msi");

        let (result, _) = run(&d, &format!("{}/agent.msi", server.uri()), 20, &dest).await;
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_cancelled_before_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("agent.msi");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut progress = |_: u64, _: u64| {};
        let result = downloader()
            .download(&format!("{}/agent.msi", server.uri()), 20, &dest, &cancel, &mut progress)
            .await;
        assert!(matches!(result, Err(UpdateError::Cancelled)));
        assert!(!dest.exists());
    }
}
