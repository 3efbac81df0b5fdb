//! Pre-fetch request hooks.
//!
//! Grounded on `nectar/downloaders/ulnthreaded.py`'s `ULNHTTPThreadedDownloader`,
//! which overrides `_fetch` purely to rewrite the request URL and inject an
//! API-key header before delegating to the base fetch. Modeled generically so
//! other front-ends can do the same without subclassing the engine.

use crate::request::Request;

/// Mutates a request immediately before it is dispatched, given the active
/// config. Implementations should be cheap and infallible; a hook that needs
/// to fail a request should leave it unchanged and let the normal fetch path
/// fail it (e.g. by pointing at an invalid URL).
pub trait PreFetchHook<D = ()>: Send + Sync {
    /// Called once per request, immediately before step 1 of the fetch
    /// procedure (header merge).
    fn before_fetch(&self, request: Request<D>) -> Request<D>;
}

/// Rewrites a request to go through ULN's GET-proxy and attaches the
/// `X-ULN-Api-User-Key` header, mirroring `ULNHTTPThreadedDownloader._fetch`.
///
/// The XML-RPC login call that originally produced the API key is an
/// external collaborator and out of scope here; callers obtain the key
/// themselves and hand it to the constructor.
pub struct UlnHook {
    api_key: String,
    get_proxy_base: String,
}

impl UlnHook {
    /// `get_proxy_base` is the ULN GET-proxy endpoint prefix; request URLs
    /// are appended to it as a `url=` query parameter.
    #[must_use]
    pub fn new(api_key: impl Into<String>, get_proxy_base: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            get_proxy_base: get_proxy_base.into(),
        }
    }
}

impl<D> PreFetchHook<D> for UlnHook {
    fn before_fetch(&self, mut request: Request<D>) -> Request<D> {
        let encoded = urlencoding::encode(&request.url);
        request.url = format!("{}?url={}", self.get_proxy_base, encoded);
        request
            .headers
            .insert("X-ULN-Api-User-Key".to_string(), self.api_key.clone());
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_url_and_injects_header() {
        let hook = UlnHook::new("secret-key", "https://linux.oracle.com/rpc/api/get");
        let req: Request = Request::to_path("https://example.com/file.rpm", "/tmp/out", ());
        let req = hook.before_fetch(req);
        assert!(req.url.starts_with("https://linux.oracle.com/rpc/api/get?url="));
        assert_eq!(
            req.headers.get("X-ULN-Api-User-Key").map(String::as_str),
            Some("secret-key")
        );
    }
}
