use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use mockall::automock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::database::provider::{
    EncodedPayload, ExtractorKind, ProviderDescriptor, ProviderRegistry, ProviderStatus,
    ResolutionRequest, ResolvedStream,
};
use crate::server::error::{PipelineFailure, Stage};
use crate::server::services::event_services::{DynEventService, ResolutionEvent};
use crate::server::services::transport_services::{
    DynTransportService, FetchOptions, FetchResult, TransportError, origin_of,
};
use crate::server::utils::decode_utils::{DecodeCascade, DecodeContext};
use crate::server::utils::markup_utils::{self, DecoderScriptRef};
use crate::server::utils::placeholder_utils;

pub type DynResolverService = Arc<dyn ResolverServiceTrait + Send + Sync>;

/// how one provider in the fallback order went
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderAttempt {
    pub provider: String,
    /// none when this provider produced the stream
    pub failure: Option<PipelineFailure>,
}

/// single discriminated result handed back to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub requested: String,
    /// provider that produced the result, or the last one tried
    pub source: String,
    pub result: Result<ResolvedStream, PipelineFailure>,
    pub attempts: Vec<ProviderAttempt>,
    pub elapsed: Duration,
}

impl ResolveOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn failure(&self) -> Option<&PipelineFailure> {
        self.result.as_ref().err()
    }
}

#[automock]
#[async_trait]
pub trait ResolverServiceTrait {
    /// walks the requested provider and its alternates until one yields a playable url
    async fn resolve(&self, request: &ResolutionRequest, cancel: &CancellationToken) -> ResolveOutcome;
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// extra attempts for a hop that failed transiently
    pub hop_retries: u32,
    pub retry_backoff: Duration,
    /// forwarded to the player as part of the required headers
    pub user_agent: String,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            hop_retries: 1,
            retry_backoff: Duration::from_millis(250),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:144.0) Gecko/20100101 Firefox/144.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkState {
    Start,
    Hop(usize),
    PayloadFound,
    Decoding,
    Resolved,
    Failed,
}

/// per provider walk, only lives for one attempt
struct Walk<'a> {
    provider: &'a str,
    state: WalkState,
}

impl<'a> Walk<'a> {
    fn new(provider: &'a str) -> Self {
        Self {
            provider,
            state: WalkState::Start,
        }
    }

    fn advance(&mut self, next: WalkState) {
        debug!("{} walk {:?} -> {:?}", self.provider, self.state, next);
        self.state = next;
    }
}

/// values a hop template can reference
struct TemplateVars<'a> {
    request: &'a ResolutionRequest,
    artifact: Option<&'a str>,
    previous_url: Option<&'a str>,
}

impl TemplateVars<'_> {
    fn render(&self, template: &str) -> String {
        let (season, episode, episode_path) = match (self.request.season, self.request.episode) {
            (Some(s), Some(e)) => (s.to_string(), e.to_string(), format!("/{}/{}", s, e)),
            _ => (String::new(), String::new(), String::new()),
        };

        template
            .replace("{kind}", self.request.content_kind.path_segment())
            .replace("{id}", &urlencoding::encode(&self.request.external_id))
            .replace("{season}", &season)
            .replace("{episode_path}", &episode_path)
            .replace("{episode}", &episode)
            .replace("{artifact}", self.artifact.unwrap_or_default())
            .replace("{previous_url}", self.previous_url.unwrap_or_default())
    }
}

pub struct ResolverService {
    registry: Arc<ProviderRegistry>,
    transport: DynTransportService,
    cascade: Arc<DecodeCascade>,
    events: DynEventService,
    settings: ResolverSettings,
}

impl ResolverService {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        transport: DynTransportService,
        cascade: Arc<DecodeCascade>,
        events: DynEventService,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            registry,
            transport,
            cascade,
            events,
            settings,
        }
    }

    async fn walk_provider(
        &self,
        provider: &ProviderDescriptor,
        request: &ResolutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ResolvedStream, PipelineFailure> {
        let mut walk = Walk::new(&provider.id);
        let result = self.walk_hops(&mut walk, provider, request, cancel).await;

        walk.advance(match result {
            Ok(_) => WalkState::Resolved,
            Err(_) => WalkState::Failed,
        });
        result
    }

    async fn walk_hops(
        &self,
        walk: &mut Walk<'_>,
        provider: &ProviderDescriptor,
        request: &ResolutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ResolvedStream, PipelineFailure> {
        let mut artifact: Option<String> = None;
        let mut previous_url: Option<String> = None;

        for (index, hop) in provider.hops.iter().enumerate() {
            let stage = Stage::Hop(index + 1);
            if cancel.is_cancelled() {
                return Err(PipelineFailure::Cancelled { stage });
            }
            walk.advance(WalkState::Hop(index + 1));

            let vars = TemplateVars {
                request,
                artifact: artifact.as_deref(),
                previous_url: previous_url.as_deref(),
            };
            let url = vars.render(&hop.url_template);
            let referer = hop
                .referer_template
                .as_deref()
                .map(|t| vars.render(t))
                .filter(|r| !r.is_empty());

            let fetched = self
                .fetch_with_retry(&url, &FetchOptions::navigation(referer), stage, cancel)
                .await?;

            match &hop.extractor {
                ExtractorKind::DataHash => {
                    let hash = markup_utils::extract_data_hash(&fetched.body)
                        .ok_or(PipelineFailure::MarkupShapeChanged { stage })?;
                    artifact = Some(hash);
                }
                ExtractorKind::NextHopUrl { pattern } => {
                    let next = markup_utils::extract_next_hop_url(&fetched.body, pattern, &fetched.url)
                        .ok_or(PipelineFailure::MarkupShapeChanged { stage })?;
                    artifact = Some(next);
                }
                ExtractorKind::HiddenPayload => {
                    let payload = markup_utils::extract_hidden_payload(&fetched.body)
                        .ok_or(PipelineFailure::PayloadNotFound { stage })?;
                    walk.advance(WalkState::PayloadFound);

                    let payload = self.attach_decoder_script(payload, &fetched, cancel).await;
                    walk.advance(WalkState::Decoding);
                    return self.decode_and_finish(provider, &payload, &fetched.url).await;
                }
            }

            debug!(
                "{} hop {} -> {}",
                provider.id,
                index + 1,
                artifact.as_deref().unwrap_or_default()
            );
            previous_url = Some(fetched.url);
        }

        // every hop ran and none of them was a payload hop
        Err(PipelineFailure::PayloadNotFound {
            stage: Stage::Hop(provider.hops.len()),
        })
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        options: &FetchOptions,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, PipelineFailure> {
        let mut retries = 0;

        loop {
            let result = match self.transport.fetch(url, options).await {
                Ok(fetched) if fetched.is_success() => Ok(fetched),
                Ok(fetched) => Err(PipelineFailure::UpstreamStatus {
                    stage,
                    status: fetched.status,
                }),
                Err(e) => Err(transport_failure(e, stage)),
            };

            match result {
                Err(failure) if failure.is_transient() && retries < self.settings.hop_retries => {
                    retries += 1;
                    warn!(
                        "{} at {} failed ({}), retry {}/{}",
                        url, stage, failure, retries, self.settings.hop_retries
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PipelineFailure::Cancelled { stage }),
                        _ = tokio::time::sleep(self.settings.retry_backoff * retries) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// inline decoders are used as is, external candidates are fetched in document order and the
    /// first one carrying the decoder signals wins. a missing script is not a failure here, the
    /// cascade decides
    async fn attach_decoder_script(
        &self,
        payload: EncodedPayload,
        page: &FetchResult,
        cancel: &CancellationToken,
    ) -> EncodedPayload {
        let candidates = match markup_utils::extract_decoder_script(&page.body, &page.url) {
            Some(DecoderScriptRef::Inline(source)) => return payload.with_decoder_script(source),
            Some(DecoderScriptRef::External(urls)) => urls,
            None => return payload,
        };

        let options = FetchOptions::navigation(Some(page.url.clone()));
        for script_url in candidates {
            if cancel.is_cancelled() {
                break;
            }
            match self.transport.fetch(&script_url, &options).await {
                Ok(script) if script.is_success() && markup_utils::is_decoder_source(&script.body) => {
                    return payload.with_decoder_script(script.body);
                }
                Ok(script) => {
                    debug!(
                        "external script {} ({}) isn't a decoder",
                        script_url, script.status
                    );
                }
                Err(e) => {
                    warn!("failed to fetch decoder script {}: {}", script_url, e);
                }
            }
        }
        payload
    }

    async fn decode_and_finish(
        &self,
        provider: &ProviderDescriptor,
        payload: &EncodedPayload,
        page_url: &str,
    ) -> Result<ResolvedStream, PipelineFailure> {
        let ctx = DecodeContext {
            provider_id: provider.id.clone(),
            page_url: page_url.to_string(),
        };
        let report = self.cascade.decode(payload, &ctx).await;

        let Some(output) = report.output else {
            return Err(if payload.decoder_script_source.is_none() {
                PipelineFailure::DecoderScriptNotFound
            } else {
                PipelineFailure::AllDecodeStrategiesExhausted {
                    attempts: report.tried(),
                }
            });
        };

        debug!(
            "{} payload decoded by {}",
            provider.id,
            report.winner.as_deref().unwrap_or("unknown")
        );

        let stream_url = select_stream_url(&output, &provider.placeholders)?;
        Ok(ResolvedStream {
            stream_url,
            required_headers: self.required_headers(page_url),
            source: provider.id.clone(),
        })
    }

    fn required_headers(&self, page_url: &str) -> HashMap<String, String> {
        let mut headers = HashMap::from([
            ("Referer".to_string(), page_url.to_string()),
            ("User-Agent".to_string(), self.settings.user_agent.clone()),
        ]);
        if let Some(origin) = origin_of(page_url) {
            headers.insert("Origin".to_string(), origin);
        }
        headers
    }

    async fn conclude(
        &self,
        request: &ResolutionRequest,
        source: String,
        result: Result<ResolvedStream, PipelineFailure>,
        attempts: Vec<ProviderAttempt>,
        started: Instant,
    ) -> ResolveOutcome {
        let elapsed = started.elapsed();
        let failure = result.as_ref().err();

        self.events
            .emit(ResolutionEvent {
                provider_id: request.provider_id.clone(),
                success: result.is_ok(),
                source: result.as_ref().ok().map(|s| s.source.clone()),
                failed_stage: failure.map(|f| f.stage().to_string()),
                failure_kind: failure.map(|f| f.kind().to_string()),
                elapsed_ms: elapsed.as_millis() as u64,
                timestamp: Utc::now(),
            })
            .await;

        ResolveOutcome {
            requested: request.provider_id.clone(),
            source,
            result,
            attempts,
            elapsed,
        }
    }
}

#[async_trait]
impl ResolverServiceTrait for ResolverService {
    async fn resolve(&self, request: &ResolutionRequest, cancel: &CancellationToken) -> ResolveOutcome {
        let started = Instant::now();

        let order = match self.registry.fallback_order(&request.provider_id) {
            Ok(order) => order,
            Err(failure) => {
                warn!("no provider registered as {}", request.provider_id);
                return self
                    .conclude(request, request.provider_id.clone(), Err(failure), Vec::new(), started)
                    .await;
            }
        };

        let mut attempts = Vec::with_capacity(order.len());
        let mut last: Option<(String, PipelineFailure)> = None;

        for provider in order {
            if cancel.is_cancelled() {
                last = Some((
                    provider.id.clone(),
                    PipelineFailure::Cancelled {
                        stage: Stage::Registry,
                    },
                ));
                break;
            }

            if provider.status == ProviderStatus::Experimental {
                warn!("{} is experimental, skipping", provider.id);
                let failure = PipelineFailure::ProviderUnsupported {
                    provider: provider.id.clone(),
                };
                attempts.push(ProviderAttempt {
                    provider: provider.id.clone(),
                    failure: Some(failure.clone()),
                });
                last = Some((provider.id.clone(), failure));
                continue;
            }

            let walk_request = request.retarget(&provider.id);
            match self.walk_provider(provider, &walk_request, cancel).await {
                Ok(stream) => {
                    info!("{} resolved via {}", request.provider_id, provider.id);
                    attempts.push(ProviderAttempt {
                        provider: provider.id.clone(),
                        failure: None,
                    });
                    return self
                        .conclude(request, provider.id.clone(), Ok(stream), attempts, started)
                        .await;
                }
                Err(failure) => {
                    warn!("{} failed at {}: {}", provider.id, failure.stage(), failure);
                    attempts.push(ProviderAttempt {
                        provider: provider.id.clone(),
                        failure: Some(failure.clone()),
                    });
                    let cancelled = matches!(failure, PipelineFailure::Cancelled { .. });
                    last = Some((provider.id.clone(), failure));
                    if cancelled {
                        break;
                    }
                }
            }
        }

        let (source, failure) = last.unwrap_or_else(|| {
            (
                request.provider_id.clone(),
                PipelineFailure::UnknownProvider {
                    provider: request.provider_id.clone(),
                },
            )
        });
        self.conclude(request, source, Err(failure), attempts, started)
            .await
    }
}

fn transport_failure(error: TransportError, stage: Stage) -> PipelineFailure {
    match error {
        TransportError::Timeout => PipelineFailure::NetworkTimeout { stage },
        TransportError::TooManyRedirects(_) => PipelineFailure::TooManyRedirects { stage },
        // the url was built from something a previous hop handed over
        TransportError::InvalidUrl(_) => PipelineFailure::MarkupShapeChanged { stage },
        TransportError::Network(reason) => PipelineFailure::NetworkError { stage, reason },
    }
}

/// absolute http(s) url with a host
pub fn is_playable_url(candidate: &str) -> bool {
    Url::parse(candidate)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}

/// decoded output may list alternatives joined by " or ", the first one that resolves every
/// placeholder and parses as a playable url wins
pub fn select_stream_url(
    output: &str,
    placeholders: &HashMap<String, String>,
) -> Result<String, PipelineFailure> {
    let mut first_failure = None;

    for candidate in output.split(" or ").map(str::trim).filter(|c| !c.is_empty()) {
        let resolved = placeholder_utils::resolve(candidate, placeholders);

        if let Some(token) = placeholder_utils::unresolved_tokens(&resolved).into_iter().next() {
            first_failure.get_or_insert(PipelineFailure::PlaceholderUnresolved { token });
            continue;
        }
        if !is_playable_url(&resolved) {
            first_failure.get_or_insert(PipelineFailure::InvalidFinalUrl { url: resolved });
            continue;
        }
        return Ok(resolved);
    }

    Err(first_failure.unwrap_or_else(|| PipelineFailure::InvalidFinalUrl {
        url: output.trim().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::provider::ContentKind;

    fn hosts() -> HashMap<String, String> {
        HashMap::from([
            ("{v1}".to_string(), "media1.example".to_string()),
            ("{v2}".to_string(), "media2.example".to_string()),
        ])
    }

    #[test]
    fn templates_render_episode_paths() {
        let request = ResolutionRequest::episode("vidsrc", "tt 1", 2, 5);
        let vars = TemplateVars {
            request: &request,
            artifact: Some("abc123"),
            previous_url: Some("https://embed.test/tv/tt1/2/5"),
        };

        assert_eq!(
            vars.render("https://embed.test/embed/{kind}/{id}{episode_path}?s={season}&e={episode}"),
            "https://embed.test/embed/tv/tt%201/2/5?s=2&e=5"
        );
        assert_eq!(vars.render("https://rcp.test/rcp/{artifact}"), "https://rcp.test/rcp/abc123");
        assert_eq!(vars.render("{previous_url}"), "https://embed.test/tv/tt1/2/5");
    }

    #[test]
    fn movie_templates_have_no_episode_path() {
        let request = ResolutionRequest::movie("vidsrc", "tt1");
        assert_eq!(request.content_kind, ContentKind::Movie);

        let vars = TemplateVars {
            request: &request,
            artifact: None,
            previous_url: None,
        };
        assert_eq!(
            vars.render("https://embed.test/embed/{kind}/{id}{episode_path}"),
            "https://embed.test/embed/movie/tt1"
        );
    }

    #[test]
    fn first_valid_alternative_wins() {
        let output = "https://{v9}/a.m3u8 or https://{v2}/b.m3u8 or https://{v1}/c.m3u8";

        assert_eq!(
            select_stream_url(output, &hosts()).unwrap(),
            "https://media2.example/b.m3u8"
        );
    }

    #[test]
    fn unresolved_placeholder_is_never_returned() {
        assert_eq!(
            select_stream_url("https://{v7}/stream.m3u8", &hosts()).unwrap_err(),
            PipelineFailure::PlaceholderUnresolved {
                token: "{v7}".to_string()
            }
        );
    }

    #[test]
    fn non_http_output_is_invalid() {
        assert!(matches!(
            select_stream_url("stream.m3u8", &hosts()).unwrap_err(),
            PipelineFailure::InvalidFinalUrl { .. }
        ));
        assert!(!is_playable_url("ftp://media1.example/a.m3u8"));
        assert!(is_playable_url("http://media1.example/a.m3u8"));
    }

    #[test]
    fn transport_errors_map_to_hop_failures() {
        let stage = Stage::Hop(2);

        assert_eq!(
            transport_failure(TransportError::Timeout, stage),
            PipelineFailure::NetworkTimeout { stage }
        );
        assert_eq!(
            transport_failure(TransportError::TooManyRedirects(5), stage),
            PipelineFailure::TooManyRedirects { stage }
        );
        assert_eq!(
            transport_failure(TransportError::InvalidUrl("::".to_string()), stage),
            PipelineFailure::MarkupShapeChanged { stage }
        );
    }
}
