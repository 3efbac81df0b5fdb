//! `file://` backend: copy, hard-link, or symlink.
//!
//! Grounded on `nectar/downloaders/local.py`'s `LocalFileDownloader`. Shares
//! the same request/report/event contract as [`crate::http::HttpDownloader`]
//! but with a much smaller state machine: no network round trip, no retry,
//! no throttle interaction beyond the copy path's own chunking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::config::{DownloaderConfig, LinkMode};
use crate::listener::{EventListener, NullListener};
use crate::report::{Report, State};
use crate::request::{Destination, Request};
use crate::stream::RequestStream;

/// A link-mode request whose destination cannot be linked to, because it is
/// not a filesystem path (e.g. a caller-supplied sink). Mirrors
/// `UnlinkableDestination` in the original.
#[derive(Debug, Error)]
#[error("destination for {url} is not linkable: link modes require a path destination")]
pub struct UnlinkableDestination {
    url: String,
}

/// Downloader for `file://` requests.
pub struct LocalDownloader<D = ()> {
    config: DownloaderConfig,
    listener: Arc<dyn EventListener<D>>,
    is_canceled: AtomicBool,
    emission_lock: AsyncMutex<()>,
}

impl<D: Clone + Send + Sync + 'static> LocalDownloader<D> {
    /// Builds a downloader with no event listener.
    #[must_use]
    pub fn new(config: DownloaderConfig) -> Self {
        Self::with_listener(config, Arc::new(NullListener))
    }

    /// Builds a downloader that fires events to `listener`.
    #[must_use]
    pub fn with_listener(config: DownloaderConfig, listener: Arc<dyn EventListener<D>>) -> Self {
        Self {
            config,
            listener,
            is_canceled: AtomicBool::new(false),
            emission_lock: AsyncMutex::new(()),
        }
    }

    /// Requests downloader-wide cancellation.
    pub fn cancel(&self) {
        self.is_canceled.store(true, Ordering::SeqCst);
    }

    /// Runs every request in `stream` sequentially. Local I/O is cheap enough
    /// relative to network fetches that a worker pool isn't warranted; the
    /// original downloader gives local requests the same threaded treatment
    /// as HTTP ones, but nothing in this backend benefits from concurrency.
    pub async fn download(&self, stream: &RequestStream<D>) {
        while !self.is_canceled.load(Ordering::SeqCst) {
            match stream.next() {
                Some(request) => {
                    self.fetch(request, true).await;
                }
                None => break,
            }
        }
    }

    /// Runs a single request to completion.
    pub async fn download_one(&self, request: Request<D>, events: bool) -> Report<D> {
        self.fetch(request, events).await
    }

    async fn emit_progress(&self, fire: bool, report: &Report<D>) {
        if fire {
            let _guard = self.emission_lock.lock().await;
            self.listener.download_progress(report);
        }
    }

    async fn emit_terminal(&self, fire: bool, report: &Report<D>) {
        if !fire {
            return;
        }
        let _guard = self.emission_lock.lock().await;
        if report.state == State::Succeeded {
            self.listener.download_succeeded(report);
        } else {
            self.listener.download_failed(report);
        }
    }

    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn fetch(&self, request: Request<D>, fire_events: bool) -> Report<D> {
        let mut report: Report<D> = Report::new(
            request.url.clone(),
            request.destination.label(),
            request.data.clone(),
        );
        report.download_started();
        if fire_events {
            let _guard = self.emission_lock.lock().await;
            self.listener.download_started(&report);
        }

        if self.is_canceled.load(Ordering::SeqCst) || request.is_canceled() {
            report.download_canceled();
            self.emit_terminal(fire_events, &report).await;
            return report;
        }

        let Ok(parsed) = url::Url::parse(&request.url) else {
            report.download_failed(format!("invalid URL: {}", request.url));
            self.emit_terminal(fire_events, &report).await;
            return report;
        };
        if parsed.scheme() != "file" {
            report.download_failed(format!("unsupported scheme for local downloader: {}", parsed.scheme()));
            self.emit_terminal(fire_events, &report).await;
            return report;
        }
        let source = parsed.to_file_path().unwrap_or_else(|()| parsed.path().into());

        let result = match self.config.link_mode {
            LinkMode::SymLink => self.link(&source, &request, true),
            LinkMode::HardLink => self.link(&source, &request, false),
            LinkMode::Copy => self.copy(&source, &request, &mut report, fire_events).await,
        };

        match result {
            Ok(bytes) => {
                if bytes > 0 {
                    report.bytes_downloaded = bytes;
                }
                if report.state != State::Canceled {
                    report.download_succeeded();
                }
            }
            Err(e) => report.download_failed(e.to_string()),
        }

        self.emit_terminal(fire_events, &report).await;
        report
    }

    fn link(
        &self,
        source: &std::path::Path,
        request: &Request<D>,
        symbolic: bool,
    ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let Destination::Path(dest) = &request.destination else {
            return Err(Box::new(UnlinkableDestination {
                url: request.url.clone(),
            }));
        };
        if symbolic {
            #[cfg(unix)]
            std::os::unix::fs::symlink(source, dest)?;
            #[cfg(not(unix))]
            std::os::windows::fs::symlink_file(source, dest)?;
        } else {
            std::fs::hard_link(source, dest)?;
        }
        Ok(std::fs::metadata(dest)?.len())
    }

    /// Copies `source` to the request's destination in `local_buffer_size`
    /// chunks, emitting `progress` with the same cadence as the HTTP
    /// backend's body pump: once before the loop starts, then every
    /// `progress_interval`, then once more after the last chunk.
    async fn copy(
        &self,
        source: &std::path::Path,
        request: &Request<D>,
        report: &mut Report<D>,
        fire_events: bool,
    ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let mut src_file = tokio::fs::File::open(source).await?;
        let mut buf = vec![0u8; self.config.local_buffer_size];
        let mut total = 0u64;

        self.emit_progress(fire_events, report).await;
        let mut last_progress = Instant::now();

        match &request.destination {
            Destination::Path(dest) => {
                let mut dest_file = tokio::fs::File::create(dest).await?;
                loop {
                    if self.is_canceled.load(Ordering::SeqCst) || request.is_canceled() {
                        report.download_canceled();
                        break;
                    }
                    let n = src_file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    dest_file.write_all(&buf[..n]).await?;
                    total += n as u64;
                    report.bytes_downloaded = total;

                    if last_progress.elapsed() >= self.config.progress_interval {
                        self.emit_progress(fire_events, report).await;
                        last_progress = Instant::now();
                    }
                }
            }
            Destination::Sink(sink) => loop {
                if self.is_canceled.load(Ordering::SeqCst) || request.is_canceled() {
                    report.download_canceled();
                    break;
                }
                let n = src_file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let chunk = buf[..n].to_vec();
                let sink = Arc::clone(sink);
                tokio::task::spawn_blocking(move || {
                    use std::io::Write;
                    #[allow(clippy::unwrap_used)]
                    sink.lock().unwrap().write_all(&chunk)
                })
                .await??;
                total += n as u64;
                report.bytes_downloaded = total;

                if last_progress.elapsed() >= self.config.progress_interval {
                    self.emit_progress(fire_events, report).await;
                    last_progress = Instant::now();
                }
            },
        }

        if report.state != State::Canceled {
            self.emit_progress(fire_events, report).await;
        }
        Ok(total)
    }
}
