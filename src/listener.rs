//! Event listener contract.
//!
//! Grounded on `nectar/listener.py`: a no-op-by-default trait so callers only
//! implement the callbacks they care about, plus a ready-made
//! `AggregatingEventListener` for tests and simple callers.

use std::sync::Mutex;

use crate::report::Report;

/// Sink for a request's lifecycle callbacks.
///
/// All methods have no-op default implementations. The engine invokes these
/// under a single emission lock (see [`crate::http::HttpDownloader`]), so
/// implementations may assume exclusive access across concurrent workers, but
/// must not call back into the downloader from within a callback.
pub trait EventListener<D = ()>: Send + Sync {
    /// Fired once a request moves from `Waiting` to `Downloading`.
    fn download_started(&self, _report: &Report<D>) {}

    /// Fired once response headers are available.
    fn download_headers(&self, _report: &Report<D>) {}

    /// Fired periodically while the body is being streamed.
    fn download_progress(&self, _report: &Report<D>) {}

    /// Fired exactly once, when a request finishes successfully.
    fn download_succeeded(&self, _report: &Report<D>) {}

    /// Fired exactly once, when a request finishes unsuccessfully
    /// (including cancellation).
    fn download_failed(&self, _report: &Report<D>) {}
}

/// A listener that does nothing, used when the caller has no interest in
/// events at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl<D> EventListener<D> for NullListener {}

/// Buckets terminal reports into `succeeded` / `failed` vectors.
///
/// Mirrors `nectar/listener.py`'s `AggregatingEventListener`: a drop-in
/// listener for callers and tests that just want the final set of reports
/// rather than writing their own `EventListener`.
#[derive(Debug, Default)]
pub struct AggregatingEventListener<D = ()> {
    succeeded: Mutex<Vec<Report<D>>>,
    failed: Mutex<Vec<Report<D>>>,
}

impl<D> AggregatingEventListener<D> {
    /// Builds an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            succeeded: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of reports that finished as `Succeeded`, in completion order.
    #[must_use]
    pub fn succeeded(&self) -> Vec<Report<D>>
    where
        D: Clone,
    {
        #[allow(clippy::unwrap_used)]
        self.succeeded.lock().unwrap().clone()
    }

    /// Snapshot of reports that finished as `Failed` or `Canceled`, in
    /// completion order.
    #[must_use]
    pub fn failed(&self) -> Vec<Report<D>>
    where
        D: Clone,
    {
        #[allow(clippy::unwrap_used)]
        self.failed.lock().unwrap().clone()
    }
}

impl<D: Clone + Send + Sync> EventListener<D> for AggregatingEventListener<D> {
    fn download_succeeded(&self, report: &Report<D>) {
        #[allow(clippy::unwrap_used)]
        self.succeeded.lock().unwrap().push(report.clone());
    }

    fn download_failed(&self, report: &Report<D>) {
        #[allow(clippy::unwrap_used)]
        self.failed.lock().unwrap().push(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_succeeded_and_failed() {
        let listener: AggregatingEventListener = AggregatingEventListener::new();
        let mut ok: Report = Report::new("http://a", "/tmp/a", ());
        ok.download_started();
        ok.download_succeeded();
        let mut bad: Report = Report::new("http://b", "/tmp/b", ());
        bad.download_started();
        bad.download_failed("boom");

        listener.download_succeeded(&ok);
        listener.download_failed(&bad);

        assert_eq!(listener.succeeded().len(), 1);
        assert_eq!(listener.failed().len(), 1);
    }
}
