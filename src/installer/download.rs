use futures::StreamExt;
use log::{debug, info, warn};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::catalog::cache::encode_file_stem;
use crate::config::{DownloadConfig, SettingsStore};
use crate::error::{AuthorizedError, InstallError, RemoteError};
use crate::remote::{ByteStream, ContentManifest, ContentService};
use crate::session::SessionManager;

/// Streams artifacts into resumable partial files
pub struct Downloader {
    content: Arc<dyn ContentService>,
    session: Arc<SessionManager>,
    settings: Arc<SettingsStore>,
    /// Directory of partial downloads
    temp_dir: PathBuf,
}

impl Downloader {
    /// Create a new downloader
    ///
    /// The partial file directory is fixed here; download settings are read
    /// again for every job.
    pub fn new(
        content: Arc<dyn ContentService>,
        session: Arc<SessionManager>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        let temp_dir = settings.get().paths.temp_dir;
        Self {
            content,
            session,
            settings,
            temp_dir,
        }
    }

    /// Partial file of a title
    pub fn partial_path(&self, title_id: &str) -> PathBuf {
        self.temp_dir.join(format!("{}.part", encode_file_stem(title_id)))
    }

    /// Download settings for a job starting now
    pub fn job_config(&self) -> DownloadConfig {
        self.settings.get().downloads
    }

    /// Download the artifact of `manifest` into the title's partial file
    ///
    /// Transient failures are retried with exponential backoff, resuming
    /// from the bytes already on disk. `on_progress` receives the byte count
    /// after every written chunk.
    pub async fn download<F>(
        &self,
        title_id: &str,
        manifest: &ContentManifest,
        config: &DownloadConfig,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<PathBuf, InstallError>
    where
        F: FnMut(u64) + Send,
    {
        fs::create_dir_all(&self.temp_dir).await?;
        let path = self.partial_path(title_id);

        let mut downloaded = match fs::metadata(&path).await {
            Ok(meta) if config.resume_partial => meta.len(),
            Ok(_) => {
                fs::remove_file(&path).await?;
                0
            }
            Err(_) => 0,
        };

        if manifest.size_bytes > 0 && downloaded > manifest.size_bytes {
            warn!("Partial file of {} is larger than the artifact, restarting", title_id);
            downloaded = 0;
        }
        if downloaded > 0 {
            info!("Resuming download of {} at {} bytes", title_id, downloaded);
        }
        if manifest.size_bytes > 0 && downloaded == manifest.size_bytes {
            on_progress(downloaded);
            return Ok(path);
        }

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }

            let result = self
                .fetch(&path, manifest, config, &mut downloaded, cancel, &mut on_progress)
                .await;

            match result {
                Ok(()) => break,
                Err(InstallError::NetworkUnavailable) if attempt < config.max_retries => {
                    attempt += 1;
                    let delay = retry_delay(config, attempt);
                    warn!(
                        "Download of {} interrupted, retry {}/{} in {:?}",
                        title_id, attempt, config.max_retries, delay
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(InstallError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        info!("Downloaded {} bytes for {}", downloaded, title_id);
        Ok(path)
    }

    /// Open the artifact stream at `start`
    ///
    /// Returns `None` when cancelled first. A stalled open ends as a timeout.
    async fn open(
        &self,
        url: &str,
        start: u64,
        read_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<Result<ByteStream, AuthorizedError>> {
        let content = &self.content;
        let opening = self
            .session
            .authorized(|token| async move { content.stream_bytes(&token, url, start).await });

        tokio::select! {
            _ = cancel.cancelled() => None,
            opened = tokio::time::timeout(read_timeout, opening) => Some(opened.unwrap_or_else(|_| {
                warn!("Opening the download stream took longer than {:?}", read_timeout);
                Err(AuthorizedError::Remote(RemoteError::Timeout))
            })),
        }
    }

    /// One attempt: open the stream at `downloaded` and append until it ends
    async fn fetch<F>(
        &self,
        path: &PathBuf,
        manifest: &ContentManifest,
        config: &DownloadConfig,
        downloaded: &mut u64,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> Result<(), InstallError>
    where
        F: FnMut(u64) + Send,
    {
        let url = manifest.download_url.as_str();
        let start = *downloaded;
        let read_timeout = Duration::from_secs(config.request_timeout_secs);

        let opened = self
            .open(url, start, read_timeout, cancel)
            .await
            .ok_or(InstallError::Cancelled)?;

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(AuthorizedError::Remote(RemoteError::RangeNotSatisfiable)) if start > 0 => {
                warn!("Server rejected resume offset {}, restarting", start);
                *downloaded = 0;
                self.open(url, 0, read_timeout, cancel)
                    .await
                    .ok_or(InstallError::Cancelled)??
            }
            Err(e) => return Err(e.into()),
        };

        if stream.offset > start {
            return Err(InstallError::ServiceError(format!(
                "server resumed at {} instead of {}",
                stream.offset, start
            )));
        }
        if stream.offset < start {
            debug!("Server resumed at {} instead of {}", stream.offset, start);
        }
        *downloaded = stream.offset;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .await?;
        file.set_len(*downloaded).await?;
        file.seek(SeekFrom::Start(*downloaded)).await?;
        on_progress(*downloaded);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(InstallError::Cancelled),
                next = tokio::time::timeout(read_timeout, stream.chunks.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    warn!("No data received for {:?}", read_timeout);
                    return Err(InstallError::NetworkUnavailable);
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            // The chunk is fully on disk before cancellation is looked at
            file.write_all(&chunk).await?;
            file.flush().await?;
            *downloaded += chunk.len() as u64;
            on_progress(*downloaded);

            if cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
        }

        file.sync_all().await?;

        if manifest.size_bytes > 0 && *downloaded < manifest.size_bytes {
            warn!(
                "Stream ended at {} of {} bytes",
                *downloaded, manifest.size_bytes
            );
            return Err(InstallError::NetworkUnavailable);
        }

        Ok(())
    }
}

/// Delay before retry number `attempt` (1-based)
fn retry_delay(config: &DownloadConfig, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(config.retry_base_delay_ms.saturating_mul(factor))
}
