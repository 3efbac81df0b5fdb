//! Request description.
//!
//! Grounded on `nectar/request.py`'s `DownloadRequest`: an immutable
//! url/destination/data/headers bundle plus a cooperative per-request cancel
//! flag, with a destination that may be either a path the engine owns or a
//! caller-supplied writable sink the engine must not close.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Where a request's bytes are written.
pub enum Destination {
    /// A filesystem path; the engine creates/truncates and owns the handle.
    Path(PathBuf),
    /// A caller-supplied sink; the engine writes to it but never closes it.
    Sink(Arc<Mutex<dyn Write + Send>>),
}

impl Destination {
    /// Human-readable label used in [`crate::report::Report::destination`].
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Destination::Path(p) => p.display().to_string(),
            Destination::Sink(_) => "<sink>".to_string(),
        }
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Destination::Sink(_) => f.write_str("Sink(..)"),
        }
    }
}

/// A single download to perform.
///
/// `D` is an opaque payload echoed back on the corresponding
/// [`crate::report::Report`] for the caller's own correlation; defaults to
/// `()` for callers who don't need it.
#[derive(Debug)]
pub struct Request<D = ()> {
    /// Absolute URL. Scheme selects the backend (`http`, `https`, `file`).
    pub url: String,
    /// Where to write the response body.
    pub destination: Destination,
    /// Per-request header overrides, applied on top of session defaults.
    pub headers: HashMap<String, String>,
    /// Opaque payload, copied onto the report.
    pub data: D,
    canceled: Arc<AtomicBool>,
}

impl<D> Request<D> {
    /// Builds a request targeting a filesystem path.
    pub fn to_path(url: impl Into<String>, path: impl Into<PathBuf>, data: D) -> Self {
        Self {
            url: url.into(),
            destination: Destination::Path(path.into()),
            headers: HashMap::new(),
            data,
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds a request targeting a caller-owned sink, left open after the
    /// fetch completes.
    pub fn to_sink(url: impl Into<String>, sink: Arc<Mutex<dyn Write + Send>>, data: D) -> Self {
        Self {
            url: url.into(),
            destination: Destination::Sink(sink),
            headers: HashMap::new(),
            data,
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attaches per-request header overrides.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// A cloneable handle to this request's cancel flag. Calling
    /// [`CancelToken::cancel`] on any clone cancels this one request only,
    /// independent of the downloader-wide cancellation in
    /// [`crate::http::HttpDownloader::cancel`].
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            flag: Arc::clone(&self.canceled),
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

/// A cloneable cancel switch for one request.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Requests cancellation of the associated fetch. Observed cooperatively
    /// at chunk boundaries and before dispatch, not an active interrupt.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_observed_on_request() {
        let req: Request = Request::to_path("http://x", "/tmp/x", ());
        let token = req.cancel_token();
        assert!(!req.is_canceled());
        token.cancel();
        assert!(req.is_canceled());
    }

    #[test]
    fn destination_label() {
        let req: Request = Request::to_path("http://x", "/tmp/out.bin", ());
        assert_eq!(req.destination.label(), "/tmp/out.bin");
    }
}
