//! Thread-safe adapter over a lazy request sequence.
//!
//! Grounded on `WorkerQueue` in `nectar/downloaders/threaded.py`: a single
//! mutex serializes `next()` across every worker so a possibly-infinite
//! iterator is never materialized and is consumed exactly once per item.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::request::Request;

/// Thread-safe wrapper around a boxed iterator of requests.
pub struct RequestStream<D = ()> {
    inner: Mutex<Box<dyn Iterator<Item = Request<D>> + Send>>,
    finished: AtomicBool,
}

impl<D> RequestStream<D> {
    /// Wraps any iterator of requests, including an unbounded one.
    pub fn new(iter: impl Iterator<Item = Request<D>> + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Box::new(iter)),
            finished: AtomicBool::new(false),
        }
    }

    /// Builds a stream over an already-materialized vector, most common in
    /// tests and simple callers.
    pub fn from_vec(requests: Vec<Request<D>>) -> Self {
        Self::new(requests.into_iter())
    }

    /// Atomically advances the stream. Returns `None` once exhausted, and
    /// keeps returning `None` on every subsequent call.
    pub fn next(&self) -> Option<Request<D>> {
        if self.finished.load(Ordering::Acquire) {
            return None;
        }
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.lock().unwrap();
        match guard.next() {
            Some(req) => Some(req),
            None => {
                self.finished.store(true, Ordering::Release);
                None
            }
        }
    }

    /// Whether the stream has been observed to be exhausted. Does not itself
    /// advance the stream.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_items_then_none_forever() {
        let stream: RequestStream = RequestStream::from_vec(vec![
            Request::to_path("http://a", "/tmp/a", ()),
            Request::to_path("http://b", "/tmp/b", ()),
        ]);
        assert!(!stream.is_finished());
        assert_eq!(stream.next().map(|r| r.url), Some("http://a".to_string()));
        assert_eq!(stream.next().map(|r| r.url), Some("http://b".to_string()));
        assert!(stream.next().is_none());
        assert!(stream.is_finished());
        assert!(stream.next().is_none());
    }

    #[test]
    fn empty_stream_is_immediately_finished() {
        let stream: RequestStream = RequestStream::from_vec(vec![]);
        assert!(stream.next().is_none());
        assert!(stream.is_finished());
    }
}
