use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use crate::classifier::{charset_from_content_type, classify_fetch_error, decode_body};
use crate::proxies::{ProxyHandle, ProxyPool};
use crate::types::{Error, FeedError, Result};

/// Fetches feed bodies through the proxy rotation with a global cap on
/// outstanding HTTP requests.
pub struct Fetcher {
    proxies: Arc<ProxyPool>,
    semaphore: Arc<Semaphore>,
}

impl Fetcher {
    pub fn new(proxies: Arc<ProxyPool>, max_concurrent_requests: usize) -> Self {
        Self {
            proxies,
            semaphore: Arc::new(Semaphore::new(max_concurrent_requests)),
        }
    }

    /// One GET through one proxy. Classifies transport failures into the
    /// `FeedError` taxonomy; a non-200 response is itself an error.
    pub async fn load_content(&self, proxy: &ProxyHandle, url: &str) -> Result<String> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::General("fetcher semaphore closed".to_string()))?;

        debug!(url, proxy = %proxy.name, "loading_feed");

        let response = proxy
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::load(classify_fetch_error(&e)))?;

        if response.status() != reqwest::StatusCode::OK {
            warn!(url, status = %response.status(), "network_non_200_status_code");
            return Err(Error::load(FeedError::NetworkNon200StatusCode));
        }

        let charset = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(charset_from_content_type);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::load(classify_fetch_error(&e)))?;

        let body = decode_body(&bytes, charset.as_deref()).map_err(Error::load)?;

        info!(url, proxy = %proxy.name, bytes = bytes.len(), "feed_loaded");

        Ok(body)
    }

    /// Iterates `{https, http} x available proxies` in order and returns the
    /// first successful body. When every combination fails, the FIRST error
    /// is reported: the primary protocol/proxy failure is the most
    /// diagnostic one.
    pub async fn fetch_feed(&self, feed_url: &str) -> Result<String> {
        let proxies = self.proxies.available().await;

        if proxies.is_empty() {
            return Err(Error::AllProxiesSuspended);
        }

        let mut first_error: Option<Error> = None;

        for url in protocol_variants(feed_url)? {
            for proxy in &proxies {
                match self.load_content(proxy, &url).await {
                    Ok(body) => return Ok(body),
                    Err(error) => {
                        debug!(url = %url, proxy = %proxy.name, %error, "feed_fetch_attempt_failed");

                        if first_error.is_none() {
                            first_error = Some(error);
                        }
                    }
                }
            }
        }

        Err(first_error.unwrap_or(Error::load(FeedError::NetworkUnknown)))
    }
}

/// The url as https first, then http. A feed registered with either scheme
/// is tried over both, since misconfigured feeds frequently answer on only
/// one of them.
pub fn protocol_variants(feed_url: &str) -> Result<Vec<String>> {
    let parsed = Url::parse(feed_url)?;

    let mut variants = Vec::new();

    for scheme in ["https", "http"] {
        let mut candidate = parsed.clone();
        if candidate.set_scheme(scheme).is_ok() {
            let candidate = candidate.to_string();
            if !variants.contains(&candidate) {
                variants.push(candidate);
            }
        }
    }

    if variants.is_empty() {
        variants.push(feed_url.to_string());
    }

    Ok(variants)
}
