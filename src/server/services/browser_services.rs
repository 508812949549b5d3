use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::database::provider::EncodedPayload;
use crate::server::utils::decode_utils::{DecodeContext, DecodeStrategy};

#[derive(Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    element_id: &'a str,
}

#[derive(Deserialize)]
struct RenderResponse {
    result: Option<String>,
}

/// last resort, hands the terminal page to an external headless browser and reads back whatever
/// the page's own scripts put under the element id
pub struct BrowserFallbackStrategy {
    http: reqwest::Client,
    render_url: String,
}

impl BrowserFallbackStrategy {
    pub fn new(service_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build browser service http client")?;

        Ok(Self {
            http,
            render_url: format!("{}/render", service_url.trim_end_matches('/')),
        })
    }

    async fn render(&self, page_url: &str, element_id: &str) -> Result<Option<String>, reqwest::Error> {
        let response = self
            .http
            .post(&self.render_url)
            .json(&RenderRequest {
                url: page_url,
                element_id,
            })
            .send()
            .await?
            .error_for_status()?;

        let body: RenderResponse = response.json().await?;
        Ok(body.result.filter(|r| !r.trim().is_empty()))
    }
}

#[async_trait]
impl DecodeStrategy for BrowserFallbackStrategy {
    fn name(&self) -> &str {
        "browser"
    }

    async fn attempt(&self, payload: &EncodedPayload, ctx: &DecodeContext) -> Option<String> {
        if ctx.page_url.is_empty() {
            return None;
        }

        match self.render(&ctx.page_url, &payload.element_id).await {
            Ok(result) => {
                debug!(
                    "browser service rendered {} for {}: {}",
                    ctx.page_url,
                    ctx.provider_id,
                    if result.is_some() { "output" } else { "nothing" }
                );
                result
            }
            Err(e) => {
                warn!("browser service failed for {}: {}", ctx.page_url, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_url_is_normalized() {
        let strategy =
            BrowserFallbackStrategy::new("http://browser.local:9000/", Duration::from_secs(5)).unwrap();

        assert_eq!(strategy.render_url, "http://browser.local:9000/render");
    }

    #[tokio::test]
    async fn no_page_url_is_a_miss_without_a_request() {
        // nothing listens on this port, a request would fail anyway but it must not be made
        let strategy =
            BrowserFallbackStrategy::new("http://127.0.0.1:9", Duration::from_millis(100)).unwrap();

        let out = strategy
            .attempt(&EncodedPayload::new("xk9", "blob"), &DecodeContext::default())
            .await;
        assert_eq!(out, None);
    }
}
