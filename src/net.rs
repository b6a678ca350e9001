//! HTTP access for manifests, keys and media segments.
//!
//! Redirects are followed manually so that caller-supplied request headers
//! are preserved across hops and the *final* URL can be handed back to the
//! parsers for base-URL resolution. Transparent gzip decoding is delegated
//! to reqwest (which also advertises `Accept-Encoding: gzip, deflate`; do
//! not set that header manually or decoding is disabled).
//!
//! Every network operation in the pipeline runs through [`retry`], an
//! exponential-backoff loop that refuses to retry the status codes servers
//! use to mean "go away": 401, 403, 404, 429, 500, 502, 503.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Client, Method, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::AbrError;

/// Body returned by [`HttpFetcher::get_string`] when the URL serves a raw
/// MPEG-TS stream instead of a manifest. Callers treat this as a
/// single-segment live track.
pub const LIVE_TS_SENTINEL: &str = "Live TS Stream detected";

const MAX_REDIRECTS: usize = 10;

/// Status codes that break out of the retry loop immediately.
pub fn is_non_retryable_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 404 | 429 | 500 | 502 | 503)
}

/// Exponential backoff parameters for retried operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_retries: 3, base_delay: Duration::from_secs(1), backoff: 2.0 }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, ..Default::default() }
    }
}

/// Run `op` until it succeeds, the error is non-retryable, or the attempt
/// budget is exhausted.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, AbrError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AbrError>>,
{
    let mut delay = policy.base_delay;
    let mut last_err = None;
    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            warn!("retry {attempt}/{} after {delay:?}", policy.max_retries);
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(policy.backoff);
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                warn!("attempt failed: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| AbrError::Network("retries exhausted".into())))
}

/// HTTP client wrapper shared by the parsers and the segment downloader.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, proxy: Option<&str>) -> Result<HttpFetcher, AbrError> {
        let mut builder = Client::builder()
            .gzip(true)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none());
        if let Some(p) = proxy {
            let proxy = reqwest::Proxy::all(p)
                .map_err(|e| AbrError::Network(format!("invalid proxy {p}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| AbrError::Network(format!("building HTTP client: {e}")))?;
        Ok(HttpFetcher { client })
    }

    fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            let name = match HeaderName::from_bytes(k.as_bytes()) {
                Ok(n) => n,
                Err(_) => {
                    warn!("ignoring invalid header name {k:?}");
                    continue;
                }
            };
            match HeaderValue::from_str(v) {
                Ok(value) => {
                    map.insert(name, value);
                }
                Err(_) => warn!("ignoring invalid header value for {k:?}"),
            }
        }
        map
    }

    /// Issue a GET (following redirects manually, re-sending `headers` on
    /// each hop) and return the response together with the final URL.
    /// Non-2xx terminal statuses become errors, classified for the retry
    /// policy.
    pub async fn send_get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        range: Option<(i64, Option<i64>)>,
    ) -> Result<(Response, Url), AbrError> {
        let mut current = Url::parse(url)
            .map_err(|e| AbrError::Network(format!("invalid URL {url}: {e}")))?;
        let mut header_map = Self::header_map(headers);
        if let Some((start, end)) = range {
            let value = match end {
                Some(end) => format!("bytes={start}-{end}"),
                None => format!("bytes={start}-"),
            };
            header_map.insert(RANGE, HeaderValue::from_str(&value).unwrap());
        }
        for _ in 0..MAX_REDIRECTS {
            debug!("GET {current}");
            let resp = self
                .client
                .request(Method::GET, current.clone())
                .headers(header_map.clone())
                .send()
                .await
                .map_err(|e| AbrError::Network(format!("requesting {current}: {e}")))?;
            let status = resp.status();
            if status.is_redirection() {
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        AbrError::Network(format!("redirect from {current} without Location"))
                    })?;
                let next = current
                    .join(location)
                    .map_err(|e| AbrError::Network(format!("resolving redirect {location}: {e}")))?;
                debug!("redirected to {next}");
                current = next;
                continue;
            }
            if is_non_retryable_status(status.as_u16()) {
                return Err(AbrError::NetworkStatus(status.as_u16()));
            }
            if !(status.is_success() || status == StatusCode::PARTIAL_CONTENT) {
                return Err(AbrError::Network(format!("HTTP {status} from {current}")));
            }
            return Ok((resp, current));
        }
        Err(AbrError::Network(format!("too many redirects from {url}")))
    }

    /// GET the body bytes.
    pub async fn get_bytes(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Vec<u8>, AbrError> {
        let (resp, _) = self.send_get(url, headers, None).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AbrError::Network(format!("reading body from {url}: {e}")))?;
        Ok(bytes.to_vec())
    }

    /// GET a manifest and return `(body, final_url)`. Raw MPEG-TS responses
    /// (`Content-Type: video/ts|video/mp2t|video/mpeg`) yield the
    /// [`LIVE_TS_SENTINEL`] body instead of the (endless) payload.
    pub async fn get_string(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<(String, String), AbrError> {
        let (resp, final_url) = self.send_get(url, headers, None).await?;
        if let Some(ct) = resp.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            let ct = ct.to_lowercase();
            if ct == "video/ts" || ct == "video/mp2t" || ct == "video/mpeg" {
                return Ok((LIVE_TS_SENTINEL.to_string(), final_url.to_string()));
            }
        }
        let body = resp
            .text()
            .await
            .map_err(|e| AbrError::Network(format!("reading body from {url}: {e}")))?;
        Ok((body, final_url.to_string()))
    }

    /// GET a byte range; `end == None` means open-ended.
    pub async fn get_range(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        start: i64,
        end: Option<i64>,
    ) -> Result<Vec<u8>, AbrError> {
        let (resp, _) = self.send_get(url, headers, Some((start, end))).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AbrError::Network(format!("reading range body from {url}: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn send_head(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Response, AbrError> {
        let resp = self
            .client
            .request(Method::HEAD, url)
            .headers(Self::header_map(headers))
            .send()
            .await
            .map_err(|e| AbrError::Network(format!("HEAD {url}: {e}")))?;
        Ok(resp)
    }

    /// Does the server advertise `Accept-Ranges: bytes` for this URL?
    pub async fn supports_ranges(&self, url: &str, headers: &HashMap<String, String>) -> bool {
        match self.send_head(url, headers).await {
            Ok(resp) => resp
                .headers()
                .get("Accept-Ranges")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes")),
            Err(_) => false,
        }
    }

    /// Advertised Content-Length, `-1` when absent.
    pub async fn content_length(&self, url: &str, headers: &HashMap<String, String>) -> i64 {
        match self.send_head(url, headers).await {
            Ok(resp) => resp
                .headers()
                .get("Content-Length")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1),
            Err(_) => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        for status in [401u16, 403, 404, 429, 500, 502, 503] {
            assert!(is_non_retryable_status(status), "{status} must not be retried");
        }
        for status in [408u16, 410, 418, 501, 504] {
            assert!(!is_non_retryable_status(status), "{status} is retryable");
        }
        assert!(!AbrError::NetworkStatus(404).is_retryable());
        assert!(AbrError::Network("connection reset".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let mut calls = 0u32;
        let policy = RetryPolicy { base_delay: Duration::from_millis(1), ..Default::default() };
        let result: Result<(), AbrError> = retry(&policy, || {
            calls += 1;
            async { Err(AbrError::NetworkStatus(403)) }
        })
        .await;
        assert!(matches!(result, Err(AbrError::NetworkStatus(403))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let mut calls = 0u32;
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            backoff: 1.0,
        };
        let result: Result<(), AbrError> = retry(&policy, || {
            calls += 1;
            async { Err(AbrError::Network("flaky".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_retry_eventually_succeeds() {
        let mut calls = 0u32;
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            backoff: 1.0,
        };
        let result = retry(&policy, || {
            calls += 1;
            let ok = calls == 2;
            async move {
                if ok {
                    Ok(42)
                } else {
                    Err(AbrError::Network("flaky".into()))
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 2);
    }
}
