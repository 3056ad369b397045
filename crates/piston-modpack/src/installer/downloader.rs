use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::config::InstallerConfig;
use crate::error::{InstallError, InstallResult, IoResultExt};
use crate::installer::progress::{CancelToken, ProgressSender};
use crate::utils::hash::{digests_match, hash_file_async, ExpectedHash, StreamingHasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded,
    /// Destination already present and valid, no network I/O
    Skipped,
}

/// Removes a partially written file unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("[Downloader] Failed to remove temp file {:?}: {}", self.path, e);
                }
            }
        }
    }
}

/// Downloads artifacts to their destination with hash/size verification and retry.
#[derive(Clone)]
pub struct VerifiedDownloader {
    client: Client,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl VerifiedDownloader {
    pub fn new(client: Client, config: &InstallerConfig) -> Self {
        Self {
            client,
            max_retries: config.max_retries.max(1),
            retry_delay_ms: config.retry_delay_ms,
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms * attempt as u64)
    }

    /// Download the first working URL of `urls` to `destination`.
    ///
    /// Transport failures are retried with linear backoff. Integrity failures move on to
    /// the next URL. When every URL fails, the last error is returned.
    pub async fn download(
        &self,
        urls: &[String],
        destination: &Path,
        expected: Option<&ExpectedHash>,
        expected_size: Option<u64>,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<DownloadOutcome> {
        cancel.check()?;

        if destination.exists() {
            match expected {
                Some(expected) => {
                    let actual = hash_file_async(destination.to_path_buf(), expected.algorithm).await?;
                    if digests_match(&actual, &expected.hex) {
                        log::debug!("[Downloader] File exists and hash matches, skipping: {:?}", destination);
                        return Ok(DownloadOutcome::Skipped);
                    }
                    log::info!(
                        "[Downloader] File exists but hash mismatches ({} != {}), re-downloading: {:?}",
                        actual,
                        expected.hex,
                        destination
                    );
                }
                None => {
                    log::debug!(
                        "[Downloader] File exists and no hash provided, assuming valid and skipping: {:?}",
                        destination
                    );
                    return Ok(DownloadOutcome::Skipped);
                }
            }
        }

        if urls.is_empty() {
            return Err(InstallError::download(
                destination.display().to_string(),
                "no download URLs",
            ));
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| {
                InstallError::DirectoryCreationFailed {
                    path: parent.to_path_buf(),
                    source,
                }
            })?;
        }

        let mut last_err = None;
        for url in urls {
            for attempt in 1..=self.max_retries {
                cancel.check()?;
                match self
                    .fetch(url, destination, expected, expected_size, progress, cancel)
                    .await
                {
                    Ok(()) => return Ok(DownloadOutcome::Downloaded),
                    Err(e @ InstallError::DownloadFailed { .. }) => {
                        if attempt < self.max_retries {
                            log::warn!(
                                "[Downloader] Download failed (attempt {}/{}) : {}. Retrying...",
                                attempt,
                                self.max_retries,
                                e
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(self.retry_delay(attempt)) => {}
                                _ = cancel.cancelled() => return Err(InstallError::Cancelled),
                            }
                        } else {
                            log::warn!("[Downloader] Giving up on {} after {} attempts: {}", url, attempt, e);
                        }
                        last_err = Some(e);
                    }
                    Err(e @ InstallError::IntegrityMismatch { .. }) => {
                        log::warn!("[Downloader] Rejected content from {}, trying the next URL", url);
                        last_err = Some(e);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let err = last_err.unwrap_or_else(|| {
            InstallError::download(destination.display().to_string(), "no download URLs")
        });
        log::error!("[Downloader] {}", err);
        Err(err)
    }

    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        expected: Option<&ExpectedHash>,
        expected_size: Option<u64>,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<()> {
        let start = Instant::now();
        log::debug!("[Downloader] Downloading: {} -> {:?}", url, destination);

        let response = tokio::select! {
            r = self.client.get(url).send() => r.map_err(|e| InstallError::download(url, e))?,
            _ = cancel.cancelled() => return Err(InstallError::Cancelled),
        };

        if !response.status().is_success() {
            return Err(InstallError::download(url, format!("HTTP {}", response.status())));
        }

        // Content-Length is best effort
        let total_size = response.content_length().or(expected_size.filter(|s| *s > 0));

        let file_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        let tmp_path = destination.with_file_name(format!("{}.{}.part", file_name, uuid::Uuid::new_v4()));
        let mut guard = TempFileGuard::new(tmp_path.clone());

        let mut file = File::create(&tmp_path).await.at_path(&tmp_path)?;
        let mut hasher = expected.map(|e| StreamingHasher::new(e.algorithm));
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => {
                    log::warn!("[Downloader] Download cancelled: {:?}", destination);
                    return Err(InstallError::Cancelled);
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| InstallError::download(url, e))?;

            file.write_all(&chunk).await.at_path(&tmp_path)?;
            if let Some(h) = hasher.as_mut() {
                h.update(&chunk);
            }
            downloaded += chunk.len() as u64;
            progress.bytes(&file_name, downloaded, total_size);
        }
        file.flush().await.at_path(&tmp_path)?;
        file.sync_all().await.at_path(&tmp_path)?;
        drop(file);

        if let Some(size) = expected_size.filter(|s| *s > 0) {
            if downloaded != size {
                return Err(InstallError::download(
                    url,
                    format!("size mismatch: expected {} bytes, got {}", size, downloaded),
                ));
            }
        }

        if let (Some(expected), Some(hasher)) = (expected, hasher) {
            let actual = hasher.finalize_hex();
            if !digests_match(&actual, &expected.hex) {
                log::error!(
                    "[Downloader] {} mismatch for {}: expected {}, got {}",
                    expected.algorithm,
                    url,
                    expected.hex,
                    actual
                );
                return Err(InstallError::IntegrityMismatch {
                    path: destination.to_path_buf(),
                    algorithm: expected.algorithm.to_string(),
                    expected: expected.hex.clone(),
                    actual,
                });
            }
        }

        // Atomic move into place
        tokio::fs::rename(&tmp_path, destination)
            .await
            .at_path(destination)?;
        guard.disarm();

        let secs = start.elapsed().as_secs_f64();
        log::debug!(
            "[Downloader] Download stats: url={}, size={} bytes, time={:.2}s, throughput={:.2} MB/s",
            url,
            downloaded,
            secs,
            (downloaded as f64 / 1024.0 / 1024.0) / secs.max(0.001)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hash::HashAlgorithm;
    use sha1::{Digest, Sha1};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &[u8] = b"mod jar bytes";

    fn sha1_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha1::digest(bytes))
    }

    fn downloader() -> VerifiedDownloader {
        let config = InstallerConfig {
            retry_delay_ms: 1,
            ..InstallerConfig::default()
        };
        VerifiedDownloader::new(Client::new(), &config)
    }

    fn leftover_parts(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .count()
    }

    #[tokio::test]
    async fn second_download_is_a_verified_skip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("mods/a.jar");
        let urls = vec![format!("{}/a.jar", server.uri())];
        let expected = ExpectedHash::sha1(sha1_hex(BODY));
        let d = downloader();
        let progress = ProgressSender::disconnected();
        let cancel = CancelToken::new();

        let first = d
            .download(&urls, &dest, Some(&expected), Some(BODY.len() as u64), &progress, &cancel)
            .await
            .unwrap();
        let second = d
            .download(&urls, &dest, Some(&expected), Some(BODY.len() as u64), &progress, &cancel)
            .await
            .unwrap();

        assert_eq!(first, DownloadOutcome::Downloaded);
        assert_eq!(second, DownloadOutcome::Skipped);
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
    }

    #[tokio::test]
    async fn corrupted_body_never_reaches_destination() {
        let server = MockServer::start().await;
        let mut corrupted = BODY.to_vec();
        corrupted[0] ^= 0xff;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(corrupted))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.jar");
        let urls = vec![format!("{}/a.jar", server.uri())];
        let expected = ExpectedHash::sha1(sha1_hex(BODY));

        let err = downloader()
            .download(&urls, &dest, Some(&expected), None, &ProgressSender::disconnected(), &CancelToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::IntegrityMismatch { .. }));
        assert!(!dest.exists());
        assert_eq!(leftover_parts(dir.path()), 0);
    }

    #[tokio::test]
    async fn falls_back_to_next_mirror() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken.jar"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mirror.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.jar");
        let urls = vec![
            format!("{}/broken.jar", server.uri()),
            format!("{}/mirror.jar", server.uri()),
        ];

        let outcome = downloader()
            .download(&urls, &dest, None, None, &ProgressSender::disconnected(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Downloaded);
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
    }

    #[tokio::test]
    async fn corrupted_mirror_falls_through_to_the_next() {
        let server = MockServer::start().await;
        let mut corrupted = BODY.to_vec();
        corrupted[0] ^= 0xff;
        Mock::given(method("GET"))
            .and(path("/corrupt.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(corrupted))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/good.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.jar");
        let urls = vec![
            format!("{}/corrupt.jar", server.uri()),
            format!("{}/good.jar", server.uri()),
        ];
        let expected = ExpectedHash::sha1(sha1_hex(BODY));

        let outcome = downloader()
            .download(&urls, &dest, Some(&expected), None, &ProgressSender::disconnected(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Downloaded);
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
        assert_eq!(leftover_parts(dir.path()), 0);
    }

    #[tokio::test]
    async fn last_failure_is_reported_when_every_url_fails() {
        let server = MockServer::start().await;
        let mut corrupted = BODY.to_vec();
        corrupted[0] ^= 0xff;
        Mock::given(method("GET"))
            .and(path("/corrupt.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(corrupted))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone.jar"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let gone = format!("{}/gone.jar", server.uri());
        let urls = vec![format!("{}/corrupt.jar", server.uri()), gone.clone()];
        let expected = ExpectedHash::sha1(sha1_hex(BODY));

        let err = downloader()
            .download(
                &urls,
                &dir.path().join("a.jar"),
                Some(&expected),
                None,
                &ProgressSender::disconnected(),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            InstallError::DownloadFailed { url, .. } => assert_eq!(url, gone),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_errors_surface_the_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(3)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let url = format!("{}/missing.jar", server.uri());
        let err = downloader()
            .download(
                &[url.clone()],
                &dir.path().join("missing.jar"),
                None,
                None,
                &ProgressSender::disconnected(),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            InstallError::DownloadFailed { url: failed, .. } => assert_eq!(failed, url),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn size_mismatch_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.jar");
        let err = downloader()
            .download(
                &[format!("{}/a.jar", server.uri())],
                &dest,
                None,
                Some(BODY.len() as u64 + 1),
                &ProgressSender::disconnected(),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::DownloadFailed { .. }));
        assert!(!dest.exists());
        assert_eq!(leftover_parts(dir.path()), 0);
    }

    #[tokio::test]
    async fn cancelled_download_leaves_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(BODY)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("slow.jar");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let d = downloader();
        let urls = vec![format!("{}/slow.jar", server.uri())];
        let result = d
            .download(&urls, &dest, None, None, &ProgressSender::disconnected(), &cancel)
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert!(!dest.exists());
        assert_eq!(leftover_parts(dir.path()), 0);
    }

    #[tokio::test]
    async fn mismatching_existing_file_is_replaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.jar");
        std::fs::write(&dest, b"stale").unwrap();

        let expected = ExpectedHash {
            algorithm: HashAlgorithm::Sha1,
            hex: sha1_hex(BODY).to_uppercase(),
        };
        let outcome = downloader()
            .download(
                &[format!("{}/a.jar", server.uri())],
                &dest,
                Some(&expected),
                None,
                &ProgressSender::disconnected(),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Downloaded);
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
    }
}
