//! The concurrent HTTP download engine.
//!
//! Grounded on `HTTPThreadedDownloader`/`_fetch` in
//! `nectar/downloaders/threaded.py`: a worker pool pulling from a shared
//! [`RequestStream`], a per-request state machine driving a [`Report`], a
//! global [`Throttle`], and a per-origin failure set that short-circuits
//! requests to hosts already known to be unreachable.

use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dashmap::DashSet;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT_ENCODING, HeaderMap, HeaderName, HeaderValue};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::config::DownloaderConfig;
use crate::error::SessionError;
use crate::hooks::PreFetchHook;
use crate::listener::{EventListener, NullListener};
use crate::report::{Report, State};
use crate::request::{Destination, Request};
use crate::session::{Session, build_session};
use crate::stream::RequestStream;
use crate::throttle::Throttle;

/// Returns `scheme://host[:port]` for `url`, or `"unknown"` if it does not
/// parse, matching the leniency of the original's `extract_domain`.
fn origin(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(u) => {
            let host = u.host_str().unwrap_or("unknown");
            match u.port() {
                Some(port) => format!("{}://{}:{}", u.scheme(), host, port),
                None => format!("{}://{}", u.scheme(), host),
            }
        }
        Err(_) => "unknown".to_string(),
    }
}

/// Concurrent downloader for `http`/`https` requests.
pub struct HttpDownloader<D = ()> {
    config: DownloaderConfig,
    listener: Arc<dyn EventListener<D>>,
    session: Session,
    is_canceled: AtomicBool,
    failed_netlocs: DashSet<String>,
    throttle: Throttle,
    emission_lock: AsyncMutex<()>,
    hooks: Vec<Arc<dyn PreFetchHook<D>>>,
}

impl<D: Clone + Send + Sync + 'static> HttpDownloader<D> {
    /// Builds a downloader with no event listener.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the session cannot be built from `config`.
    pub fn new(config: DownloaderConfig) -> Result<Self, SessionError> {
        Self::with_listener(config, Arc::new(NullListener))
    }

    /// Builds a downloader that fires events to `listener`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the session cannot be built from `config`.
    pub fn with_listener(
        config: DownloaderConfig,
        listener: Arc<dyn EventListener<D>>,
    ) -> Result<Self, SessionError> {
        let session = build_session(&config)?;
        let throttle = Throttle::new(config.max_speed, config.http_buffer_size);
        Ok(Self {
            config,
            listener,
            session,
            is_canceled: AtomicBool::new(false),
            failed_netlocs: DashSet::new(),
            throttle,
            emission_lock: AsyncMutex::new(()),
            hooks: Vec::new(),
        })
    }

    /// Registers a pre-fetch hook, run in registration order immediately
    /// before each request's header merge.
    pub fn add_hook(&mut self, hook: Arc<dyn PreFetchHook<D>>) {
        self.hooks.push(hook);
    }

    /// Requests downloader-wide cancellation. Observed cooperatively between
    /// requests and at chunk boundaries; does not interrupt in-flight I/O.
    pub fn cancel(&self) {
        self.is_canceled.store(true, Ordering::SeqCst);
    }

    /// Drains `stream` across `config.max_concurrent` concurrent workers,
    /// firing events to the configured listener for every request.
    #[instrument(skip(self, stream))]
    pub async fn download(self: &Arc<Self>, stream: Arc<RequestStream<D>>) {
        info!(workers = self.config.max_concurrent, "starting download batch");
        let mut handles = Vec::with_capacity(self.config.max_concurrent as usize);
        for _ in 0..self.config.max_concurrent {
            let this = Arc::clone(self);
            let stream = Arc::clone(&stream);
            handles.push(tokio::spawn(async move {
                loop {
                    if this.is_canceled.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream.next() {
                        Some(request) => {
                            this.fetch(request, true).await;
                        }
                        None => break,
                    }
                }
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task panicked, continuing batch");
                self.is_canceled.store(true, Ordering::SeqCst);
            }
        }
        info!("download batch finished");
    }

    /// Runs a single request to completion on the calling task.
    /// `events = false` suppresses all listener callbacks for this call only.
    pub async fn download_one(&self, request: Request<D>, events: bool) -> Report<D> {
        self.fetch(request, events).await
    }

    async fn emit_started(&self, fire: bool, report: &Report<D>) {
        if fire {
            let _guard = self.emission_lock.lock().await;
            self.listener.download_started(report);
        }
    }

    async fn emit_headers(&self, fire: bool, report: &Report<D>) {
        if fire {
            let _guard = self.emission_lock.lock().await;
            self.listener.download_headers(report);
        }
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
            // Canceled reports are emitted as failed for the listener's
            // purposes, matching the original's event contract.
            self.listener.download_failed(report);
        }
    }

    fn effective_headers(&self, request: &Request<D>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in &request.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                headers.insert(name, value);
            }
        }
        // RFC 2616 workaround: origins that mislabel a raw .gz payload with a
        // content-encoding would otherwise have it transparently (and
        // destructively) decompressed. The header alone doesn't stop
        // reqwest's decoder — it decides from the response, not what we
        // asked for — so `fetch` also routes .gz requests through
        // `session.raw_client`, which never decompresses.
        if request.url.ends_with(".gz") {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(""));
        }
        headers
    }

    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn fetch(&self, request: Request<D>, fire_events: bool) -> Report<D> {
        let mut request = request;
        for hook in &self.hooks {
            request = hook.before_fetch(request);
        }

        let mut report: Report<D> = Report::new(
            request.url.clone(),
            request.destination.label(),
            request.data.clone(),
        );
        report.download_started();
        self.emit_started(fire_events, &report).await;

        if self.is_canceled.load(Ordering::SeqCst) || request.is_canceled() {
            report.download_canceled();
            self.emit_terminal(fire_events, &report).await;
            return report;
        }

        let origin = origin(&request.url);
        if self.failed_netlocs.contains(&origin) {
            debug!(%origin, "origin previously failed, skipping");
            report.download_skipped();
            self.emit_terminal(fire_events, &report).await;
            return report;
        }

        let headers = self.effective_headers(&request);
        // .gz URLs go through the raw client: reqwest's decoder decides
        // whether to decompress from the response's Content-Encoding and the
        // client's build-time feature flags, not from Accept-Encoding, so an
        // origin that mislabels a raw payload as gzip would otherwise still
        // get silently decompressed.
        let client = if request.url.ends_with(".gz") {
            &self.session.raw_client
        } else {
            &self.session.client
        };
        let mut builder = client.get(&request.url).headers(headers);
        if let Some((user, pass)) = &self.session.basic_auth {
            builder = builder.basic_auth(user, Some(pass));
        }

        let response = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let msg = e.to_string();
                if e.is_timeout() {
                    report.download_connection_error(format!("timeout: {msg}"));
                } else {
                    report.download_connection_error(msg);
                    if e.is_connect() || e.is_request() {
                        self.failed_netlocs.insert(origin);
                    }
                }
                self.emit_terminal(fire_events, &report).await;
                return report;
            }
        };

        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                report
                    .headers
                    .insert(name.as_str().to_string(), value.to_string());
            }
        }
        self.emit_headers(fire_events, &report).await;

        let status = response.status();
        if status.as_u16() != 200 {
            report
                .error_report
                .insert("response_code".to_string(), status.as_u16().to_string());
            report.error_report.insert(
                "response_msg".to_string(),
                status.canonical_reason().unwrap_or("").to_string(),
            );
            report.download_failed(format!("HTTP {status}"));
            self.emit_terminal(fire_events, &report).await;
            return report;
        }

        report.total_bytes = response.content_length();

        if let Err(e) = self.pump_body(&request, &mut report, response, fire_events).await {
            report.download_failed(e);
        }

        if report.state == State::Downloading {
            report.download_succeeded();
        }
        self.emit_terminal(fire_events, &report).await;
        report
    }

    /// Writes one re-chunked piece to `file` (path destination) or the
    /// caller-owned sink, mirroring the two destination kinds `Request`
    /// supports.
    async fn write_chunk(
        &self,
        destination: &Destination,
        file: &mut Option<tokio::fs::File>,
        bytes: &[u8],
    ) -> Result<(), String> {
        match destination {
            Destination::Path(_) => {
                #[allow(clippy::unwrap_used)]
                file.as_mut()
                    .unwrap()
                    .write_all(bytes)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            Destination::Sink(sink) => {
                let sink = Arc::clone(sink);
                let bytes = bytes.to_vec();
                tokio::task::spawn_blocking(move || {
                    #[allow(clippy::unwrap_used)]
                    sink.lock().unwrap().write_all(&bytes)
                })
                .await
                .map_err(|e| e.to_string())?
                .map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    /// Reads the response body in fixed-size pieces of `config.http_buffer_size`
    /// bytes regardless of how the underlying stream actually chunks it, so
    /// cancellation/progress checkpoints never let more than one buffer's
    /// worth of bytes through after a cancel is observed.
    async fn pump_body(
        &self,
        request: &Request<D>,
        report: &mut Report<D>,
        response: reqwest::Response,
        fire_events: bool,
    ) -> Result<(), String> {
        let mut file = match &request.destination {
            Destination::Path(path) => Some(
                tokio::fs::File::create(path)
                    .await
                    .map_err(|e| format!("could not create {}: {e}", path.display()))?,
            ),
            Destination::Sink(_) => None,
        };

        self.emit_progress(fire_events, report).await;
        let mut last_progress = Instant::now();
        let mut stream = response.bytes_stream();
        let buffer_size = self.config.http_buffer_size.max(1);
        let mut buffer: Vec<u8> = Vec::with_capacity(buffer_size);
        let mut canceled = false;

        'outer: while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| e.to_string())?;
            buffer.extend_from_slice(&bytes);

            while buffer.len() >= buffer_size {
                if self.is_canceled.load(Ordering::SeqCst) || request.is_canceled() {
                    report.download_canceled();
                    canceled = true;
                    break 'outer;
                }
                let piece: Vec<u8> = buffer.drain(..buffer_size).collect();
                self.write_chunk(&request.destination, &mut file, &piece).await?;
                report.bytes_downloaded += piece.len() as u64;
                self.throttle.acquire(piece.len() as u64).await;

                if last_progress.elapsed() >= self.config.progress_interval {
                    self.emit_progress(fire_events, report).await;
                    last_progress = Instant::now();
                }
            }
        }

        if !canceled && !buffer.is_empty() {
            if self.is_canceled.load(Ordering::SeqCst) || request.is_canceled() {
                report.download_canceled();
            } else {
                self.write_chunk(&request.destination, &mut file, &buffer).await?;
                report.bytes_downloaded += buffer.len() as u64;
                self.throttle.acquire(buffer.len() as u64).await;
            }
        }

        if report.state == State::Downloading {
            self.emit_progress(fire_events, report).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloaderConfig;
    use crate::listener::AggregatingEventListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn downloader(
        listener: Arc<AggregatingEventListener>,
    ) -> Arc<HttpDownloader> {
        let config = DownloaderConfig::builder()
            .max_concurrent(2)
            .build()
            .unwrap_or_else(|e| panic!("config should build: {e}"));
        Arc::new(
            HttpDownloader::with_listener(config, listener)
                .unwrap_or_else(|e| panic!("session should build: {e}")),
        )
    }

    #[tokio::test]
    async fn happy_path_single_file() {
        let server = MockServer::start().await;
        let body = vec![7u8; 102_400];
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let dest = tmp.path().join("out.bin");
        let listener = Arc::new(AggregatingEventListener::new());
        let dl = downloader(Arc::clone(&listener)).await;

        let req = Request::to_path(format!("{}/file.bin", server.uri()), dest.clone(), ());
        let report = dl.download_one(req, true).await;

        assert_eq!(report.state, State::Succeeded);
        assert_eq!(report.bytes_downloaded, 102_400);
        let written = std::fs::read(&dest).unwrap_or_else(|e| panic!("read dest: {e}"));
        assert_eq!(written, body);
        assert_eq!(listener.succeeded().len(), 1);
    }

    #[tokio::test]
    async fn mixed_batch_counts_successes_and_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"a".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ok2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"b".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ok3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"c".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let listener = Arc::new(AggregatingEventListener::new());
        let dl = downloader(Arc::clone(&listener)).await;

        let urls = ["ok1", "ok2", "ok3", "missing1", "missing2"];
        let requests: Vec<Request> = urls
            .iter()
            .map(|u| Request::to_path(format!("{}/{u}", server.uri()), tmp.path().join(u), ()))
            .collect();
        let stream = Arc::new(RequestStream::from_vec(requests));
        dl.download(stream).await;

        assert_eq!(listener.succeeded().len(), 3);
        assert_eq!(listener.failed().len(), 2);
        assert!(!tmp.path().join("missing1").exists());
    }

    #[tokio::test]
    async fn origin_short_circuits_after_first_failure() {
        // Point at a port nothing listens on so every attempt connect-fails.
        let config = DownloaderConfig::builder()
            .max_concurrent(1)
            .connect_timeout(std::time::Duration::from_millis(200))
            .retry_tries(0)
            .build()
            .unwrap_or_else(|e| panic!("config: {e}"));
        let listener = Arc::new(AggregatingEventListener::new());
        let dl = Arc::new(
            HttpDownloader::with_listener(config, Arc::clone(&listener))
                .unwrap_or_else(|e| panic!("session: {e}")),
        );

        let bad_url = "http://127.0.0.1:1";
        let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));

        let first = Request::to_path(format!("{bad_url}/a"), tmp.path().join("a"), ());
        let r1 = dl.download_one(first, true).await;
        assert_eq!(r1.state, State::Failed);

        let second = Request::to_path(format!("{bad_url}/b"), tmp.path().join("b"), ());
        let r2 = dl.download_one(second, true).await;
        assert_eq!(r2.state, State::Failed);
        assert_eq!(r2.error_msg.as_deref(), Some("Download skipped"));
    }

    #[tokio::test]
    async fn gz_url_sets_empty_accept_encoding() {
        let config = DownloaderConfig::builder()
            .build()
            .unwrap_or_else(|e| panic!("config: {e}"));
        let dl: HttpDownloader = HttpDownloader::new(config).unwrap_or_else(|e| panic!("{e}"));
        let req: Request = Request::to_path("http://example.com/archive.tar.gz", "/tmp/x", ());
        let headers = dl.effective_headers(&req);
        assert_eq!(headers.get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok()), Some(""));
    }

    #[tokio::test]
    async fn gz_url_bypasses_mislabeled_content_encoding() {
        // Origin mislabels a raw (not actually gzipped) payload as
        // Content-Encoding: gzip. The normal client would try to gunzip it
        // and fail or corrupt it; the raw client used for .gz URLs must
        // store it byte-for-byte.
        let server = MockServer::start().await;
        let raw_body = b"not actually gzipped data".to_vec();
        Mock::given(method("GET"))
            .and(path("/archive.tar.gz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-encoding", "gzip")
                    .set_body_bytes(raw_body.clone()),
            )
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let dest = tmp.path().join("archive.tar.gz");
        let listener = Arc::new(AggregatingEventListener::new());
        let dl = downloader(Arc::clone(&listener)).await;

        let req = Request::to_path(format!("{}/archive.tar.gz", server.uri()), dest.clone(), ());
        let report = dl.download_one(req, true).await;

        assert_eq!(report.state, State::Succeeded);
        let written = std::fs::read(&dest).unwrap_or_else(|e| panic!("read dest: {e}"));
        assert_eq!(written, raw_body, "raw .gz bytes must survive untouched");
    }

    #[tokio::test]
    async fn body_is_rechunked_to_configured_buffer_size() {
        let server = MockServer::start().await;
        let body = vec![9u8; 10_000];
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let dest = tmp.path().join("out.bin");
        let listener = Arc::new(AggregatingEventListener::new());
        let config = DownloaderConfig::builder()
            .max_concurrent(1)
            .http_buffer_size(1024)
            .build()
            .unwrap_or_else(|e| panic!("config: {e}"));
        let dl: Arc<HttpDownloader> = Arc::new(
            HttpDownloader::with_listener(config, Arc::clone(&listener) as Arc<dyn EventListener<()>>)
                .unwrap_or_else(|e| panic!("session: {e}")),
        );

        let req = Request::to_path(format!("{}/file.bin", server.uri()), dest.clone(), ());
        let report = dl.download_one(req, true).await;

        assert_eq!(report.state, State::Succeeded);
        assert_eq!(report.bytes_downloaded, 10_000);
        let written = std::fs::read(&dest).unwrap_or_else(|e| panic!("read dest: {e}"));
        assert_eq!(written, body);
    }

    #[tokio::test]
    async fn cancel_mid_stream_terminates_quickly() {
        let server = MockServer::start().await;
        let body = vec![1u8; 5_000_000];
        Mock::given(method("GET"))
            .and(path("/big.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let listener = Arc::new(AggregatingEventListener::new());
        let dl = downloader(Arc::clone(&listener)).await;
        let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let dest = tmp.path().join("big.bin");
        let req = Request::to_path(format!("{}/big.bin", server.uri()), dest, ());

        dl.cancel();
        let report = dl.download_one(req, true).await;
        assert_eq!(report.state, State::Canceled);
    }
}
