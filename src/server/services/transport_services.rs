use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mockall::automock;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, LOCATION, ORIGIN, REFERER};
use tracing::{debug, warn};
use url::Url;

pub type DynTransportService = Arc<dyn TransportServiceTrait + Send + Sync>;

/// redirects followed by hand before giving up on a hop
pub const MAX_REDIRECTS: usize = 5;

/// per request header context, carried forward hop to hop by the navigator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub referer: Option<String>,
    pub origin: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl FetchOptions {
    /// browser style navigation from `referer`, origin is derived from it
    pub fn navigation(referer: Option<String>) -> Self {
        let origin = referer.as_deref().and_then(origin_of);
        Self {
            referer,
            origin,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// scheme://host[:port] of a url, None for anything opaque
pub fn origin_of(url: &str) -> Option<String> {
    let origin = Url::parse(url).ok()?.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    /// final url after redirects
    pub url: String,
    pub status: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("more than {0} redirects")]
    TooManyRedirects(usize),

    #[error("invalid url {0}")]
    InvalidUrl(String),

    #[error("{0}")]
    Network(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// one GET with redirect following, no retries, those are the navigator's call
#[automock]
#[async_trait]
pub trait TransportServiceTrait {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResult, TransportError>;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:144.0) Gecko/20100101 Firefox/144.0".to_string(),
            timeout: Duration::from_secs(15),
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> anyhow::Result<Self> {
        // redirects are followed by hand so relative locations and the hop limit stay ours
        let http_client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build transport http client")?;

        Ok(Self {
            http_client,
            config,
        })
    }

    async fn read_capped(&self, mut response: reqwest::Response) -> Result<String, TransportError> {
        let limit = self.config.max_body_bytes;
        let mut body: Vec<u8> = Vec::new();

        while let Some(chunk) = response.chunk().await? {
            let remaining = limit.saturating_sub(body.len());
            if chunk.len() > remaining {
                body.extend_from_slice(&chunk[..remaining]);
                warn!(
                    "body from {} exceeded {} bytes, truncating",
                    response.url(),
                    limit
                );
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl TransportServiceTrait for HttpTransport {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResult, TransportError> {
        let mut current = Url::parse(url).map_err(|_| TransportError::InvalidUrl(url.to_string()))?;

        for followed in 0..=MAX_REDIRECTS {
            let mut request = self
                .http_client
                .get(current.clone())
                .header(
                    ACCEPT,
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                )
                .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9");

            if let Some(referer) = &options.referer {
                request = request.header(REFERER, referer);
            }
            if let Some(origin) = &options.origin {
                request = request.header(ORIGIN, origin);
            }
            for (name, value) in &options.headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);

                if let Some(location) = location {
                    if followed == MAX_REDIRECTS {
                        return Err(TransportError::TooManyRedirects(MAX_REDIRECTS));
                    }
                    let next = current
                        .join(&location)
                        .map_err(|_| TransportError::InvalidUrl(location.clone()))?;
                    debug!("{} redirected ({}) to {}", current, status, next);
                    current = next;
                    continue;
                }
            }

            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            let body = self.read_capped(response).await?;

            return Ok(FetchResult {
                url: current.to_string(),
                status: status.as_u16(),
                body,
                headers,
            });
        }

        Err(TransportError::TooManyRedirects(MAX_REDIRECTS))
    }
}
