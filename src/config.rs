//! Downloader configuration.
//!
//! Grounded on `nectar/config.py`'s `DownloaderConfig`. The original exposes
//! options through dynamic attribute lookup; per the accompanying design note
//! this is re-architected as an explicit struct with enumerated fields and a
//! `get(name, default)` helper retained only for the handful of call sites
//! (header lookups) that genuinely want dictionary semantics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::instrument;

use crate::error::ConfigError;

const DEFAULT_MAX_CONCURRENT: u32 = 5;
const DEFAULT_HTTP_BUFFER_SIZE: usize = 8 * 1024;
const DEFAULT_LOCAL_BUFFER_SIZE: usize = 1024 * 1024;
const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 6050;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 27;
const DEFAULT_RETRY_TRIES: u32 = 5;

/// Either inline bytes or a filesystem path for a piece of TLS material.
///
/// Only one variant may be supplied per logical field; [`DownloaderConfig::build`]
/// rejects both being set. `Inline` is materialized to a scoped temp file the
/// first time a session is built from the config (see [`crate::session`]).
#[derive(Debug, Clone)]
pub enum TlsMaterial {
    /// PEM bytes supplied directly.
    Inline(Vec<u8>),
    /// Path to an existing file on disk.
    Path(PathBuf),
}

/// A TLS field materialized to a concrete path, holding onto a temp file if
/// one was created so it is removed when the config is dropped.
#[derive(Debug, Default)]
pub(crate) struct MaterializedTls {
    pub(crate) path: Option<PathBuf>,
    // Keeping the NamedTempFile alive ties its lifetime (and deletion) to the
    // config's own lifetime.
    _temp: Option<NamedTempFile>,
}

fn materialize(
    field: &'static str,
    material: &Option<TlsMaterial>,
) -> Result<MaterializedTls, ConfigError> {
    match material {
        None => Ok(MaterializedTls::default()),
        Some(TlsMaterial::Path(path)) => {
            std::fs::metadata(path).map_err(|source| ConfigError::UnreadableCertPath {
                field,
                path: path.clone(),
                source,
            })?;
            Ok(MaterializedTls {
                path: Some(path.clone()),
                _temp: None,
            })
        }
        Some(TlsMaterial::Inline(bytes)) => {
            use std::io::Write;
            let mut tmp = tempfile::Builder::new()
                .prefix(&format!("nectar-{field}-"))
                .tempfile()
                .map_err(|source| ConfigError::TempFileWrite { field, source })?;
            tmp.write_all(bytes)
                .map_err(|source| ConfigError::TempFileWrite { field, source })?;
            let path = tmp.path().to_path_buf();
            Ok(MaterializedTls {
                path: Some(path),
                _temp: Some(tmp),
            })
        }
    }
}

/// Proxy credentials and location, split out so [`crate::session`] can decide
/// between proxy-only and combined basic+proxy auth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host or URL (scheme optional; `http` assumed if absent).
    pub url: String,
    /// Proxy port.
    pub port: u16,
    /// Proxy username, if the proxy requires auth.
    pub username: Option<String>,
    /// Proxy password, if the proxy requires auth.
    pub password: Option<String>,
}

/// Link mode for the local-file backend. `SymLink` wins over `HardLink` if
/// both are requested, matching the property-evaluation order in
/// `nectar/downloaders/local.py`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkMode {
    /// Stream-copy the file (default).
    #[default]
    Copy,
    /// `std::fs::hard_link`.
    HardLink,
    /// `std::os::unix::fs::symlink`.
    SymLink,
}

/// Validated configuration for an [`crate::http::HttpDownloader`] or
/// [`crate::local::LocalDownloader`].
///
/// Built exclusively through [`DownloaderConfigBuilder`]; construction-time
/// invariants (positive concurrency, non-conflicting TLS fields, readable
/// cert paths) are enforced once in [`DownloaderConfig::build`], never inside
/// `download()`.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub max_concurrent: u32,
    pub basic_auth_username: Option<String>,
    pub basic_auth_password: Option<String>,
    pub ssl_validation: bool,
    pub ssl_ca_cert: Option<TlsMaterial>,
    pub ssl_client_cert: Option<TlsMaterial>,
    pub ssl_client_key: Option<TlsMaterial>,
    pub proxy: Option<ProxyConfig>,
    pub max_speed: Option<u64>,
    pub http_buffer_size: usize,
    pub local_buffer_size: usize,
    pub progress_interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub headers: HashMap<String, String>,
    pub link_mode: LinkMode,
    pub retry_tries: u32,

    pub(crate) ca_cert_resolved: MaterializedTls,
    pub(crate) client_cert_resolved: MaterializedTls,
    pub(crate) client_key_resolved: MaterializedTls,
}

impl DownloaderConfig {
    /// Starts building a config with every field at its default.
    #[must_use]
    pub fn builder() -> DownloaderConfigBuilder {
        DownloaderConfigBuilder::default()
    }

    /// Dictionary-style accessor retained for call sites that want `Option`
    /// semantics over a header lookup rather than matching on a field.
    #[must_use]
    pub fn get<'a>(&'a self, name: &str, default: Option<&'a str>) -> Option<&'a str> {
        self.headers.get(name).map(String::as_str).or(default)
    }

    /// Resolved path to the CA bundle, if one was configured.
    #[must_use]
    pub fn ca_cert_path(&self) -> Option<&Path> {
        self.ca_cert_resolved.path.as_deref()
    }

    /// Resolved path to the client certificate, if one was configured.
    #[must_use]
    pub fn client_cert_path(&self) -> Option<&Path> {
        self.client_cert_resolved.path.as_deref()
    }

    /// Resolved path to the client key, if one was configured.
    #[must_use]
    pub fn client_key_path(&self) -> Option<&Path> {
        self.client_key_resolved.path.as_deref()
    }
}

/// Builder for [`DownloaderConfig`]. Mirrors the original's
/// `_process_concurrency_kwargs`/`_process_ssl_file_kwargs` validation split.
#[derive(Debug, Default)]
pub struct DownloaderConfigBuilder {
    max_concurrent: Option<u32>,
    basic_auth_username: Option<String>,
    basic_auth_password: Option<String>,
    ssl_validation: Option<bool>,
    ssl_ca_cert_inline: Option<Vec<u8>>,
    ssl_ca_cert_path: Option<PathBuf>,
    ssl_client_cert_inline: Option<Vec<u8>>,
    ssl_client_cert_path: Option<PathBuf>,
    ssl_client_key_inline: Option<Vec<u8>>,
    ssl_client_key_path: Option<PathBuf>,
    proxy: Option<ProxyConfig>,
    max_speed: Option<u64>,
    http_buffer_size: Option<usize>,
    local_buffer_size: Option<usize>,
    progress_interval: Option<Duration>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    headers: HashMap<String, String>,
    use_hard_links: bool,
    use_sym_links: bool,
    retry_tries: Option<u32>,
}

impl DownloaderConfigBuilder {
    #[must_use]
    pub fn max_concurrent(mut self, n: u32) -> Self {
        self.max_concurrent = Some(n);
        self
    }

    #[must_use]
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth_username = Some(username.into());
        self.basic_auth_password = Some(password.into());
        self
    }

    #[must_use]
    pub fn ssl_validation(mut self, enabled: bool) -> Self {
        self.ssl_validation = Some(enabled);
        self
    }

    #[must_use]
    pub fn ssl_ca_cert_inline(mut self, pem: Vec<u8>) -> Self {
        self.ssl_ca_cert_inline = Some(pem);
        self
    }

    #[must_use]
    pub fn ssl_ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl_ca_cert_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn ssl_client_cert_inline(mut self, pem: Vec<u8>) -> Self {
        self.ssl_client_cert_inline = Some(pem);
        self
    }

    #[must_use]
    pub fn ssl_client_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl_client_cert_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn ssl_client_key_inline(mut self, pem: Vec<u8>) -> Self {
        self.ssl_client_key_inline = Some(pem);
        self
    }

    #[must_use]
    pub fn ssl_client_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl_client_key_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    #[must_use]
    pub fn max_speed(mut self, bytes_per_sec: u64) -> Self {
        self.max_speed = Some(bytes_per_sec);
        self
    }

    #[must_use]
    pub fn http_buffer_size(mut self, bytes: usize) -> Self {
        self.http_buffer_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn local_buffer_size(mut self, bytes: usize) -> Self {
        self.local_buffer_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn use_hard_links(mut self, enabled: bool) -> Self {
        self.use_hard_links = enabled;
        self
    }

    #[must_use]
    pub fn use_sym_links(mut self, enabled: bool) -> Self {
        self.use_sym_links = enabled;
        self
    }

    #[must_use]
    pub fn retry_tries(mut self, tries: u32) -> Self {
        self.retry_tries = Some(tries);
        self
    }

    fn pair_to_material(
        field: &'static str,
        inline: Option<Vec<u8>>,
        path: Option<PathBuf>,
    ) -> Result<Option<TlsMaterial>, ConfigError> {
        match (inline, path) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingTlsField { field }),
            (Some(bytes), None) => Ok(Some(TlsMaterial::Inline(bytes))),
            (None, Some(path)) => Ok(Some(TlsMaterial::Path(path))),
            (None, None) => Ok(None),
        }
    }

    /// Validates and finalizes the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_concurrent` is zero, a TLS field was
    /// given both inline and as a path, or a configured cert path cannot be
    /// read.
    #[instrument(skip(self))]
    pub fn build(self) -> Result<DownloaderConfig, ConfigError> {
        let max_concurrent = self.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT);
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidConcurrency(max_concurrent));
        }

        let ssl_ca_cert =
            Self::pair_to_material("ssl_ca_cert", self.ssl_ca_cert_inline, self.ssl_ca_cert_path)?;
        let ssl_client_cert = Self::pair_to_material(
            "ssl_client_cert",
            self.ssl_client_cert_inline,
            self.ssl_client_cert_path,
        )?;
        let ssl_client_key = Self::pair_to_material(
            "ssl_client_key",
            self.ssl_client_key_inline,
            self.ssl_client_key_path,
        )?;

        let ca_cert_resolved = materialize("ssl_ca_cert", &ssl_ca_cert)?;
        let client_cert_resolved = materialize("ssl_client_cert", &ssl_client_cert)?;
        let client_key_resolved = materialize("ssl_client_key", &ssl_client_key)?;

        let link_mode = if self.use_sym_links {
            LinkMode::SymLink
        } else if self.use_hard_links {
            LinkMode::HardLink
        } else {
            LinkMode::Copy
        };

        Ok(DownloaderConfig {
            max_concurrent,
            basic_auth_username: self.basic_auth_username,
            basic_auth_password: self.basic_auth_password,
            ssl_validation: self.ssl_validation.unwrap_or(true),
            ssl_ca_cert,
            ssl_client_cert,
            ssl_client_key,
            proxy: self.proxy,
            max_speed: self.max_speed,
            http_buffer_size: self.http_buffer_size.unwrap_or(DEFAULT_HTTP_BUFFER_SIZE),
            local_buffer_size: self.local_buffer_size.unwrap_or(DEFAULT_LOCAL_BUFFER_SIZE),
            progress_interval: self.progress_interval.unwrap_or(DEFAULT_PROGRESS_INTERVAL),
            connect_timeout: self
                .connect_timeout
                .unwrap_or(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)),
            read_timeout: self
                .read_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS)),
            headers: self.headers,
            link_mode,
            retry_tries: self.retry_tries.unwrap_or(DEFAULT_RETRY_TRIES),
            ca_cert_resolved,
            client_cert_resolved,
            client_key_resolved,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DownloaderConfig::builder().build().unwrap();
        assert_eq!(cfg.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert!(cfg.ssl_validation);
        assert_eq!(cfg.link_mode, LinkMode::Copy);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = DownloaderConfig::builder()
            .max_concurrent(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConcurrency(0)));
    }

    #[test]
    fn conflicting_ca_cert_rejected() {
        let err = DownloaderConfig::builder()
            .ssl_ca_cert_inline(b"pem".to_vec())
            .ssl_ca_cert_path("/tmp/ca.pem")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingTlsField { .. }));
    }

    #[test]
    fn inline_ca_cert_materializes_to_temp_file() {
        let cfg = DownloaderConfig::builder()
            .ssl_ca_cert_inline(b"-----BEGIN CERTIFICATE-----".to_vec())
            .build()
            .unwrap();
        let path = cfg.ca_cert_path().unwrap();
        assert!(path.exists());
        let contents = std::fs::read(path).unwrap();
        assert_eq!(contents, b"-----BEGIN CERTIFICATE-----");
    }

    #[test]
    fn unreadable_cert_path_rejected() {
        let err = DownloaderConfig::builder()
            .ssl_client_cert_path("/nonexistent/path/cert.pem")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnreadableCertPath { .. }));
    }

    #[test]
    fn sym_link_wins_over_hard_link() {
        let cfg = DownloaderConfig::builder()
            .use_hard_links(true)
            .use_sym_links(true)
            .build()
            .unwrap();
        assert_eq!(cfg.link_mode, LinkMode::SymLink);
    }

    #[test]
    fn get_falls_back_to_default() {
        let cfg = DownloaderConfig::builder()
            .header("X-Foo", "bar")
            .build()
            .unwrap();
        assert_eq!(cfg.get("X-Foo", None), Some("bar"));
        assert_eq!(cfg.get("X-Missing", Some("fallback")), Some("fallback"));
    }
}
