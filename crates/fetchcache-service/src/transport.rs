//! The network side of the cache.
//!
//! The [`FetchCoordinator`](crate::coordinator::FetchCoordinator) talks to the network only
//! through the [`Transport`] trait. [`HttpTransport`] is the production implementation on top of
//! [`reqwest`].

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header;

use crate::caching::{CacheContents, CacheError, ResourceKey};
use crate::config::{CachePolicy, Config};

/// A single fetch handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub key: ResourceKey,
    pub cache_policy: CachePolicy,
    pub timeout: Duration,
}

/// A successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub payload: Bytes,
    pub status: u16,
    /// Response headers with lowercase names. Repeated headers are joined with `", "`.
    pub headers: BTreeMap<String, String>,
}

impl FetchResponse {
    /// A `200 OK` response without headers.
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            status: 200,
            headers: BTreeMap::new(),
        }
    }
}

/// Transport-wide defaults, applied on [`Transport::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub timeout: Duration,
    pub cache_policy: CachePolicy,
}

/// Performs network fetches.
///
/// A fetch resolves to the response for a 2xx status, and to a [`CacheError`] otherwise.
pub trait Transport: Send + Sync + fmt::Debug {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, CacheContents<FetchResponse>>;

    /// Applies new defaults. Fetches already in flight keep the old ones.
    fn configure(&self, options: &TransportOptions) {
        let _ = options;
    }
}

/// Creates a [`reqwest::Client`] for fetching resources.
pub fn create_client(
    options: &TransportOptions,
    user_agent: &str,
) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .user_agent(user_agent)
        .connect_timeout(options.timeout)
        .timeout(options.timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// A [`Transport`] that fetches over HTTP(S).
#[derive(Debug)]
pub struct HttpTransport {
    client: RwLock<reqwest::Client>,
    accept: String,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(config: &Config) -> reqwest::Result<Self> {
        let options = TransportOptions {
            timeout: config.caches.request_timeout,
            cache_policy: config.caches.cache_policy,
        };
        let client = create_client(&options, &config.user_agent)?;
        Ok(Self {
            client: RwLock::new(client),
            accept: config.accept.clone(),
            user_agent: config.user_agent.clone(),
        })
    }

    fn client(&self) -> reqwest::Client {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, CacheContents<FetchResponse>> {
        let client = self.client();
        let accept = self.accept.clone();
        Box::pin(async move {
            if request.cache_policy == CachePolicy::ReturnCacheOnly {
                tracing::debug!(key = %request.key, "Not fetching, only cached data allowed");
                return Err(CacheError::DownloadError(
                    "resource is not cached and the policy forbids loading it".into(),
                ));
            }

            let url = request.key.url()?;
            tracing::debug!("Fetching resource from `{}`", url);

            let result = async {
                let response = client
                    .get(url)
                    .header(header::ACCEPT, accept)
                    .timeout(request.timeout)
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    tracing::debug!("Unexpected status code from `{}`: {}", request.key, status);
                    return Err(FetchError::Cache(CacheError::DownloadError(
                        status.to_string(),
                    )));
                }

                let headers = fold_headers(response.headers());
                let payload = response.bytes().await?;
                tracing::trace!("Success hitting `{}`", request.key);

                Ok::<_, FetchError>(FetchResponse {
                    payload,
                    status: status.as_u16(),
                    headers,
                })
            }
            .await;

            result.map_err(|err| match err {
                FetchError::Cache(err) => err,
                FetchError::Reqwest(err) if err.is_timeout() => {
                    CacheError::Timeout(request.timeout)
                }
                FetchError::Reqwest(err) => download_error(&err),
            })
        })
    }

    fn configure(&self, options: &TransportOptions) {
        match create_client(options, &self.user_agent) {
            Ok(client) => {
                *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
                tracing::debug!(?options, "Rebuilt HTTP client");
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn Error,
                    "Failed to rebuild HTTP client, keeping the previous one"
                );
            }
        }
    }
}

/// Internal error of a single fetch, before it is mapped onto a [`CacheError`].
enum FetchError {
    Cache(CacheError),
    Reqwest(reqwest::Error),
}

impl From<CacheError> for FetchError {
    fn from(err: CacheError) -> Self {
        Self::Cache(err)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Reqwest(err)
    }
}

/// Describes a transport error by its innermost cause.
fn download_error(mut error: &dyn Error) -> CacheError {
    while let Some(src) = error.source() {
        error = src;
    }

    let mut error_string = error.to_string();

    // Special-case a few error strings
    if error_string.contains("certificate verify failed") {
        error_string = "certificate verify failed".to_string();
    }

    CacheError::DownloadError(error_string)
}

fn fold_headers(headers: &header::HeaderMap) -> BTreeMap<String, String> {
    let mut folded = BTreeMap::<String, String>::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        folded
            .entry(name.as_str().to_owned())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_owned());
    }
    folded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_headers() {
        let mut headers = header::HeaderMap::new();
        headers.append(header::CONTENT_TYPE, "image/png".parse().unwrap());
        headers.append(header::VARY, "accept".parse().unwrap());
        headers.append(header::VARY, "accept-encoding".parse().unwrap());

        let folded = fold_headers(&headers);
        assert_eq!(folded["content-type"], "image/png");
        assert_eq!(folded["vary"], "accept, accept-encoding");
    }

    #[tokio::test]
    async fn test_cache_only_never_fetches() {
        let transport = HttpTransport::new(&Config::default()).unwrap();
        let request = FetchRequest {
            // nothing listens here
            key: ResourceKey::parse("http://127.0.0.1:1/a.png").unwrap(),
            cache_policy: CachePolicy::ReturnCacheOnly,
            timeout: Duration::from_secs(1),
        };

        let err = transport.fetch(request).await.unwrap_err();
        assert!(matches!(err, CacheError::DownloadError(_)));
    }
}
