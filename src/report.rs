//! Per-request lifecycle report.
//!
//! Grounded on `nectar/report.py`'s `DownloadReport`: a mutable record created
//! when a fetch begins and driven through a small re-entrant state machine.
//! Transitions from an already-terminal state are no-ops, matching the
//! original's `_download_finished` guard.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Created, not yet dispatched.
    Waiting,
    /// A fetch is in progress.
    Downloading,
    /// Completed successfully.
    Succeeded,
    /// Completed with an error.
    Failed,
    /// Canceled before completion.
    Canceled,
}

impl State {
    /// True for any of `Succeeded`, `Failed`, `Canceled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Failed | State::Canceled)
    }
}

/// Lifecycle record for one request, shared between the engine and the caller.
///
/// `D` is the opaque correlation payload copied from the originating
/// [`crate::request::Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report<D = ()> {
    /// URL that was requested.
    pub url: String,
    /// Destination the bytes were (or would have been) written to, as a
    /// human-readable label — a path string, or `"<sink>"` for an
    /// in-memory/caller-owned destination.
    pub destination: String,
    /// Opaque payload copied from the request, for the caller's own correlation.
    pub data: D,
    /// Current lifecycle state.
    pub state: State,
    /// Bytes written so far.
    pub bytes_downloaded: u64,
    /// `Content-Length` if the server supplied one.
    pub total_bytes: Option<u64>,
    /// Set on the `Waiting -> Downloading` transition.
    pub start_time: Option<SystemTime>,
    /// Set on the first transition into a terminal state.
    pub finish_time: Option<SystemTime>,
    /// Human-readable error message; non-empty whenever `state == Failed`.
    pub error_msg: Option<String>,
    /// Diagnostic key/value pairs, e.g. `response_code` / `response_msg`.
    pub error_report: HashMap<String, String>,
    /// Response headers, once received.
    pub headers: HashMap<String, String>,
}

impl<D> Report<D> {
    /// Builds a fresh `Waiting` report for `url`/`destination`, copying `data`
    /// from the originating request.
    pub fn new(url: impl Into<String>, destination: impl Into<String>, data: D) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            data,
            state: State::Waiting,
            bytes_downloaded: 0,
            total_bytes: None,
            start_time: None,
            finish_time: None,
            error_msg: None,
            error_report: HashMap::new(),
            headers: HashMap::new(),
        }
    }

    /// `Waiting -> Downloading`. No-op if already past `Waiting`.
    pub fn download_started(&mut self) {
        if self.state != State::Waiting {
            return;
        }
        self.state = State::Downloading;
        self.start_time = Some(SystemTime::now());
    }

    /// Re-entrant transition into a terminal state, only from `Downloading`.
    /// Matches `_download_finished`: states other than `Downloading` are left
    /// untouched (e.g. a cancel that raced a started/failed transition).
    ///
    /// Enforces on its own, rather than trusting every caller: whenever the
    /// transition lands in `Failed`, `error_msg` ends up `Some`. This is the
    /// one place that guard needs to live, since `finish` is also reachable
    /// directly (privately) without a message.
    fn finish(&mut self, state: State) {
        if self.state != State::Downloading {
            return;
        }
        self.state = state;
        self.finish_time = Some(SystemTime::now());
        if state == State::Failed && self.error_msg.is_none() {
            self.error_msg = Some("Download Failed".to_string());
        }
    }

    /// `Downloading -> Succeeded`.
    pub fn download_succeeded(&mut self) {
        self.finish(State::Succeeded);
    }

    /// `Downloading -> Failed`, recording `msg`.
    pub fn download_failed(&mut self, msg: impl Into<String>) {
        self.error_msg = Some(msg.into());
        self.finish(State::Failed);
    }

    /// `Downloading -> Canceled`.
    pub fn download_canceled(&mut self) {
        self.finish(State::Canceled);
    }

    /// Marks the request as failed because its origin was already known-bad.
    /// Sets state directly rather than through [`Report::finish`], mirroring
    /// `download_skipped()` in the original, which bypasses the
    /// `Downloading`-only guard since the request never actually started.
    pub fn download_skipped(&mut self) {
        self.state = State::Failed;
        self.error_msg = Some("Download skipped".to_string());
        self.finish_time = Some(SystemTime::now());
    }

    /// Marks the request as failed due to a connect/timeout error. Also sets
    /// state directly, mirroring `download_connection_error()`.
    pub fn download_connection_error(&mut self, msg: impl Into<String>) {
        self.state = State::Failed;
        self.error_msg = Some(msg.into());
        self.finish_time = Some(SystemTime::now());
    }
}
