//! Error types for configuration and session construction.
//!
//! Per-fetch failures are not modeled here: they live on [`crate::report::Report`]
//! as data, per the downloader's contract that `download()` never raises for a
//! single request's failure. This module only covers the handful of places that
//! fail synchronously, before any request is ever dispatched.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while validating or building a [`crate::config::DownloaderConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `max_concurrent` must be greater than zero.
    #[error("max_concurrent must be greater than 0, got {0}")]
    InvalidConcurrency(u32),

    /// A configured certificate/key path could not be read.
    #[error("could not read {field} at {path}: {source}")]
    UnreadableCertPath {
        /// Which config field the path belongs to.
        field: &'static str,
        /// The path that failed to read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Both the inline and path variant of a TLS field were supplied.
    #[error("{field} was given both inline and as a path; only one may be set")]
    ConflictingTlsField {
        /// Which config field has the conflict.
        field: &'static str,
    },

    /// Failed to materialize inline TLS material to a scoped temp file.
    #[error("failed to write temp file for {field}: {source}")]
    TempFileWrite {
        /// Which config field was being materialized.
        field: &'static str,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while constructing an HTTP session from a validated config.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The underlying HTTP client builder rejected the configuration.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    /// The configured proxy URL could not be parsed/applied.
    #[error("invalid proxy configuration: {0}")]
    InvalidProxy(#[source] reqwest::Error),
}
