use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::{Compression, write::GzEncoder};
use tokio_util::sync::CancellationToken;

use resolver::database::provider::{
    ExtractorKind, HopDescriptor, ProviderDescriptor, ProviderRegistry, ProviderStatus,
    ResolutionRequest,
};
use resolver::server::error::{PipelineFailure, Stage};
use resolver::server::services::event_services::{DynEventService, MockEventServiceTrait};
use resolver::server::services::resolver_services::{
    ResolveOutcome, ResolverService, ResolverServiceTrait, ResolverSettings,
};
use resolver::server::services::sandbox_services::{SandboxConfig, SandboxService, SandboxStrategy};
use resolver::server::services::transport_services::{
    DynTransportService, FetchOptions, FetchResult, MockTransportServiceTrait, TransportError,
    TransportServiceTrait,
};
use resolver::server::utils::decode_utils::{DecodeCascade, static_transforms};

const PRORCP: &str = r#"src:\s*['"](?P<url>/prorcp/[^'"]+)['"]"#;
const TEMPLATE_URL: &str = "https://cdn.example/{v1}/stream.m3u8";
const RESOLVED_URL: &str = "https://cdn.example/media1.example/stream.m3u8";
// base64 of text that holds no link, every static transform misses on it
const BOGUS_BLOB: &str = "Ym9ndXMgcGF5bG9hZCB3aXRob3V0IGFueSBsaW5rIGluIGl0";

/// canned pages keyed by url, anything else is a 404
#[derive(Default)]
struct FixtureTransport {
    pages: HashMap<String, (u16, String)>,
    requests: Mutex<Vec<(String, Option<String>, Option<String>)>>,
    cancel_on: Option<(String, CancellationToken)>,
}

impl FixtureTransport {
    fn page(mut self, url: &str, body: impl Into<String>) -> Self {
        self.pages.insert(url.to_string(), (200, body.into()));
        self
    }

    fn status(mut self, url: &str, status: u16) -> Self {
        self.pages.insert(url.to_string(), (status, String::new()));
        self
    }

    fn cancel_after(mut self, url: &str, token: CancellationToken) -> Self {
        self.cancel_on = Some((url.to_string(), token));
        self
    }

    fn requested(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|r| r.0.clone()).collect()
    }

    fn headers_for(&self, url: &str) -> Option<(Option<String>, Option<String>)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.0 == url)
            .map(|r| (r.1.clone(), r.2.clone()))
    }
}

#[async_trait]
impl TransportServiceTrait for FixtureTransport {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResult, TransportError> {
        self.requests.lock().unwrap().push((
            url.to_string(),
            options.referer.clone(),
            options.origin.clone(),
        ));

        if let Some((trigger, token)) = &self.cancel_on {
            if trigger == url {
                token.cancel();
            }
        }

        let (status, body) = self
            .pages
            .get(url)
            .cloned()
            .unwrap_or((404, "not found".to_string()));

        Ok(FetchResult {
            url: url.to_string(),
            status,
            body,
            headers: HashMap::new(),
        })
    }
}

fn gzip_base64(input: &str) -> String {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input.as_bytes()).unwrap();
    STANDARD.encode(encoder.finish().unwrap())
}

fn chain(id: &str, embed_base: &str, rcp_base: &str, alternates: &[&str]) -> ProviderDescriptor {
    ProviderDescriptor {
        id: id.to_string(),
        status: ProviderStatus::Supported,
        hops: vec![
            HopDescriptor::new(
                format!("{embed_base}/embed/{{kind}}/{{id}}{{episode_path}}"),
                None,
                ExtractorKind::DataHash,
            ),
            HopDescriptor::new(
                format!("{rcp_base}/rcp/{{artifact}}"),
                Some("{previous_url}"),
                ExtractorKind::NextHopUrl {
                    pattern: PRORCP.to_string(),
                },
            ),
            HopDescriptor::new("{artifact}", Some("{previous_url}"), ExtractorKind::HiddenPayload),
        ],
        alternates: alternates.iter().map(|a| a.to_string()).collect(),
        placeholders: HashMap::from([("{v1}".to_string(), "media1.example".to_string())]),
    }
}

fn registry() -> Arc<ProviderRegistry> {
    Arc::new(ProviderRegistry::new(vec![
        chain("alpha", "https://embed.test", "https://rcp.test", &["beta"]),
        chain("beta", "https://embed2.test", "https://rcp2.test", &[]),
        ProviderDescriptor {
            id: "gamma".to_string(),
            status: ProviderStatus::Experimental,
            hops: vec![HopDescriptor::new(
                "https://gamma.test/{kind}/{id}",
                None,
                ExtractorKind::HiddenPayload,
            )],
            alternates: vec!["alpha".to_string(), "missing".to_string()],
            placeholders: HashMap::new(),
        },
    ]))
}

fn hidden(element_id: &str, blob: &str) -> String {
    format!(
        r#"<html><body><div id="player"></div><div id="{element_id}" style="display:none">{blob}</div></body></html>"#
    )
}

fn embed_page(hash: &str) -> String {
    format!(r#"<html><body><div class="server" data-hash="{hash}">Server 1</div></body></html>"#)
}

fn rcp_page(path: &str) -> String {
    format!(r#"<html><script>$('#pl').load({{ src: "{path}" }});</script></html>"#)
}

/// the alpha chain for tt0111161 with the terminal page supplied by the caller
fn alpha_fixture(terminal: String) -> FixtureTransport {
    FixtureTransport::default()
        .page("https://embed.test/embed/movie/tt0111161", embed_page("abc123"))
        .page("https://rcp.test/rcp/abc123", rcp_page("/prorcp/def456"))
        .page("https://rcp.test/prorcp/def456", terminal)
}

fn silent_events() -> DynEventService {
    let mut events = MockEventServiceTrait::new();
    events.expect_emit().returning(|_| ());
    Arc::new(events)
}

fn settings() -> ResolverSettings {
    ResolverSettings {
        hop_retries: 1,
        retry_backoff: Duration::from_millis(1),
        user_agent: "resolver-test/1.0".to_string(),
    }
}

fn service_with(transport: DynTransportService, sandbox_timeout: Duration) -> ResolverService {
    let sandbox = Arc::new(SandboxService::new(SandboxConfig {
        timeout: sandbox_timeout,
        ..SandboxConfig::default()
    }));
    let cascade = DecodeCascade::new(static_transforms()).with_strategy(Arc::new(SandboxStrategy::new(sandbox)));

    ResolverService::new(registry(), transport, Arc::new(cascade), silent_events(), settings())
}

fn service(transport: Arc<FixtureTransport>) -> ResolverService {
    service_with(transport, Duration::from_secs(2))
}

async fn resolve_movie(service: &ResolverService, provider: &str) -> ResolveOutcome {
    service
        .resolve(
            &ResolutionRequest::movie(provider, "tt0111161"),
            &CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn resolve_the_three_hop_chain_end_to_end() {
    let transport = Arc::new(alpha_fixture(hidden("xk9", &gzip_base64(TEMPLATE_URL))));
    let service = service(transport.clone());

    let outcome = resolve_movie(&service, "alpha").await;

    let stream = outcome.result.as_ref().unwrap();
    assert_eq!(stream.stream_url, RESOLVED_URL);
    assert_eq!(stream.source, "alpha");
    assert_eq!(outcome.source, "alpha");
    assert_eq!(
        stream.required_headers.get("Referer").map(String::as_str),
        Some("https://rcp.test/prorcp/def456")
    );
    assert_eq!(
        stream.required_headers.get("Origin").map(String::as_str),
        Some("https://rcp.test")
    );
    assert_eq!(
        stream.required_headers.get("User-Agent").map(String::as_str),
        Some("resolver-test/1.0")
    );

    assert_eq!(
        transport.requested(),
        vec![
            "https://embed.test/embed/movie/tt0111161".to_string(),
            "https://rcp.test/rcp/abc123".to_string(),
            "https://rcp.test/prorcp/def456".to_string(),
        ]
    );
}

#[tokio::test]
async fn carry_referer_and_origin_from_hop_to_hop() {
    let transport = Arc::new(alpha_fixture(hidden("xk9", &gzip_base64(TEMPLATE_URL))));
    let service = service(transport.clone());

    resolve_movie(&service, "alpha").await;

    assert_eq!(
        transport.headers_for("https://embed.test/embed/movie/tt0111161"),
        Some((None, None))
    );
    assert_eq!(
        transport.headers_for("https://rcp.test/rcp/abc123"),
        Some((
            Some("https://embed.test/embed/movie/tt0111161".to_string()),
            Some("https://embed.test".to_string())
        ))
    );
    assert_eq!(
        transport.headers_for("https://rcp.test/prorcp/def456"),
        Some((
            Some("https://rcp.test/rcp/abc123".to_string()),
            Some("https://rcp.test".to_string())
        ))
    );
}

#[tokio::test]
async fn walk_episode_paths() {
    let transport = Arc::new(
        FixtureTransport::default()
            .page("https://embed.test/embed/tv/tt0944947/1/2", embed_page("ep12"))
            .page("https://rcp.test/rcp/ep12", rcp_page("/prorcp/ep12x"))
            .page("https://rcp.test/prorcp/ep12x", hidden("xk9", &gzip_base64(TEMPLATE_URL))),
    );
    let service = service(transport);

    let outcome = service
        .resolve(
            &ResolutionRequest::episode("alpha", "tt0944947", 1, 2),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.result.unwrap().stream_url, RESOLVED_URL);
}

#[tokio::test]
async fn produce_the_same_result_for_the_same_pages() {
    let transport = Arc::new(alpha_fixture(hidden("xk9", &gzip_base64(TEMPLATE_URL))));
    let service = service(transport);

    let first = resolve_movie(&service, "alpha").await;
    let second = resolve_movie(&service, "alpha").await;

    assert_eq!(first.result, second.result);
    assert_eq!(first.attempts, second.attempts);
}

#[tokio::test]
async fn fall_back_to_the_next_provider() {
    let transport = Arc::new(
        FixtureTransport::default()
            .page("https://embed.test/embed/movie/tt0111161", embed_page("abc123"))
            .status("https://rcp.test/rcp/abc123", 404)
            .page("https://embed2.test/embed/movie/tt0111161", embed_page("b-hash"))
            .page("https://rcp2.test/rcp/b-hash", rcp_page("/prorcp/b-final"))
            .page("https://rcp2.test/prorcp/b-final", hidden("zz1", &gzip_base64(TEMPLATE_URL))),
    );
    let service = service(transport);

    let outcome = resolve_movie(&service, "alpha").await;

    let stream = outcome.result.as_ref().unwrap();
    assert_eq!(stream.stream_url, RESOLVED_URL);
    assert_eq!(stream.source, "beta");
    assert_eq!(outcome.requested, "alpha");
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(
        outcome.attempts[0].failure,
        Some(PipelineFailure::UpstreamStatus {
            stage: Stage::Hop(2),
            status: 404
        })
    );
    assert_eq!(outcome.attempts[1].failure, None);
}

#[tokio::test]
async fn report_the_last_failure_when_every_provider_fails() {
    let transport = Arc::new(
        FixtureTransport::default().page("https://embed.test/embed/movie/tt0111161", "<html>redesigned</html>"),
    );
    let service = service(transport);

    let outcome = resolve_movie(&service, "alpha").await;

    assert_eq!(
        outcome.attempts[0].failure,
        Some(PipelineFailure::MarkupShapeChanged { stage: Stage::Hop(1) })
    );
    assert_eq!(
        outcome.result.unwrap_err(),
        PipelineFailure::UpstreamStatus {
            stage: Stage::Hop(1),
            status: 404
        }
    );
    assert_eq!(outcome.source, "beta");
}

#[tokio::test]
async fn never_return_unresolved_placeholders() {
    let transport = Arc::new(alpha_fixture(hidden(
        "xk9",
        &gzip_base64("https://cdn.example/{v9}/stream.m3u8"),
    )));
    let service = service(transport);

    let outcome = resolve_movie(&service, "alpha").await;

    assert_eq!(
        outcome.attempts[0].failure,
        Some(PipelineFailure::PlaceholderUnresolved {
            token: "{v9}".to_string()
        })
    );
    assert!(outcome.result.is_err());
}

#[tokio::test]
async fn pick_the_first_valid_alternative() {
    let transport = Arc::new(alpha_fixture(hidden(
        "xk9",
        &gzip_base64("https://{v7}/a.m3u8 or https://cdn.example/{v1}/stream.m3u8"),
    )));
    let service = service(transport);

    let outcome = resolve_movie(&service, "alpha").await;

    assert_eq!(outcome.result.unwrap().stream_url, RESOLVED_URL);
}

#[tokio::test]
async fn decode_with_an_inline_decoder_script() {
    // reversed text defeats every static transform, only the page's own script undoes it
    let reversed: String = TEMPLATE_URL.chars().rev().collect();
    let terminal = format!(
        r#"<html><body>
            <div id="xk9" style="display:none">{reversed}</div>
            <script>
                var el = document.getElementById("xk9");
                window.xk9 = el.textContent.split("").reverse().map(function (c) {{
                    return String.fromCharCode(c.charCodeAt(0));
                }}).join("");
            </script>
        </body></html>"#
    );
    let transport = Arc::new(alpha_fixture(terminal));
    let service = service(transport);

    let outcome = resolve_movie(&service, "alpha").await;

    assert_eq!(outcome.result.unwrap().stream_url, RESOLVED_URL);
}

#[tokio::test]
async fn fetch_external_decoder_scripts() {
    let reversed: String = TEMPLATE_URL.chars().rev().collect();
    let terminal = format!(
        r#"<html><body>
            <div id="xk9" style="display:none">{reversed}</div>
            <script src="/js/jquery.min.js"></script>
            <script src="/sV05kUlN/decoder.js"></script>
        </body></html>"#
    );
    let decoder = r#"
        var t = document.getElementById("xk9").textContent;
        var out = "";
        for (var i = t.length - 1; i >= 0; i--) { out += String.fromCharCode(t.charCodeAt(i)); }
        window.xk9 = out;
    "#;
    let transport = Arc::new(
        alpha_fixture(terminal).page("https://rcp.test/sV05kUlN/decoder.js", decoder),
    );
    let service = service(transport.clone());

    let outcome = resolve_movie(&service, "alpha").await;

    assert_eq!(outcome.result.unwrap().stream_url, RESOLVED_URL);
    assert!(transport
        .requested()
        .contains(&"https://rcp.test/sV05kUlN/decoder.js".to_string()));
}

#[tokio::test]
async fn try_every_external_script_until_one_decodes() {
    let reversed: String = TEMPLATE_URL.chars().rev().collect();
    let terminal = format!(
        r#"<html><body>
            <div id="xk9" style="display:none">{reversed}</div>
            <script src="/sV05/decoder.js"></script>
            <script src="/assets/player-config.js"></script>
        </body></html>"#
    );
    let decoder = r#"
        var t = document.getElementById("xk9").textContent;
        var out = "";
        for (var i = t.length - 1; i >= 0; i--) { out += String.fromCharCode(t.charCodeAt(i)); }
        window.xk9 = out;
    "#;
    let transport = Arc::new(
        alpha_fixture(terminal)
            .page("https://rcp.test/sV05/decoder.js", decoder)
            .page("https://rcp.test/assets/player-config.js", "window.playerConfig = { autoplay: true };"),
    );
    let service = service(transport.clone());

    let outcome = resolve_movie(&service, "alpha").await;

    assert_eq!(outcome.result.unwrap().stream_url, RESOLVED_URL);
    assert!(!transport
        .requested()
        .contains(&"https://rcp.test/assets/player-config.js".to_string()));
}

#[tokio::test]
async fn skip_external_scripts_that_are_not_decoders() {
    let reversed: String = TEMPLATE_URL.chars().rev().collect();
    let terminal = format!(
        r#"<html><body>
            <div id="xk9" style="display:none">{reversed}</div>
            <script src="/assets/player-config.js"></script>
            <script src="/sV05/missing.js"></script>
        </body></html>"#
    );
    let transport = Arc::new(
        alpha_fixture(terminal)
            .page("https://rcp.test/assets/player-config.js", "window.playerConfig = { autoplay: true };"),
    );
    let service = service(transport.clone());

    let outcome = resolve_movie(&service, "alpha").await;

    assert_eq!(
        outcome.attempts[0].failure,
        Some(PipelineFailure::DecoderScriptNotFound)
    );
    let requested = transport.requested();
    assert!(requested.contains(&"https://rcp.test/assets/player-config.js".to_string()));
    assert!(requested.contains(&"https://rcp.test/sV05/missing.js".to_string()));
}

#[tokio::test]
async fn report_a_missing_decoder_script() {
    let transport = Arc::new(alpha_fixture(hidden("xk9", BOGUS_BLOB)));
    let service = service(transport);

    let outcome = resolve_movie(&service, "alpha").await;

    assert_eq!(
        outcome.attempts[0].failure,
        Some(PipelineFailure::DecoderScriptNotFound)
    );
}

#[tokio::test]
async fn survive_a_hanging_decoder_script() {
    let terminal = format!(
        r#"<div id="xk9" style="display:none">{}</div>
           <script>var e = document.getElementById("xk9"); String.fromCharCode(1); while (true) {{}}</script>"#,
        BOGUS_BLOB
    );
    let transport = Arc::new(alpha_fixture(terminal));
    let service = service_with(transport, Duration::from_millis(200));

    let started = Instant::now();
    let outcome = resolve_movie(&service, "alpha").await;

    assert!(started.elapsed() < Duration::from_secs(3));
    match &outcome.attempts[0].failure {
        Some(PipelineFailure::AllDecodeStrategiesExhausted { attempts }) => {
            assert_eq!(attempts.last().map(String::as_str), Some("sandbox"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn stop_between_hops_when_cancelled() {
    let token = CancellationToken::new();
    let transport = Arc::new(
        alpha_fixture(hidden("xk9", &gzip_base64(TEMPLATE_URL)))
            .cancel_after("https://embed.test/embed/movie/tt0111161", token.clone()),
    );
    let service = service(transport.clone());

    let outcome = service
        .resolve(&ResolutionRequest::movie("alpha", "tt0111161"), &token)
        .await;

    assert_eq!(
        outcome.result.unwrap_err(),
        PipelineFailure::Cancelled { stage: Stage::Hop(2) }
    );
    // no fallback after a cancel
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(transport.requested().len(), 1);
}

#[tokio::test]
async fn fail_fast_on_an_unknown_provider() {
    let transport = Arc::new(FixtureTransport::default());
    let mut events = MockEventServiceTrait::new();
    events
        .expect_emit()
        .withf(|event| !event.success && event.failure_kind.as_deref() == Some("unknown_provider"))
        .times(1)
        .returning(|_| ());

    let service = ResolverService::new(
        registry(),
        transport.clone(),
        Arc::new(DecodeCascade::new(static_transforms())),
        Arc::new(events),
        settings(),
    );

    let outcome = resolve_movie(&service, "nope").await;

    assert_eq!(
        outcome.result.unwrap_err(),
        PipelineFailure::UnknownProvider {
            provider: "nope".to_string()
        }
    );
    assert!(outcome.attempts.is_empty());
    assert!(transport.requested().is_empty());
}

#[tokio::test]
async fn skip_experimental_providers() {
    let transport = Arc::new(alpha_fixture(hidden("xk9", &gzip_base64(TEMPLATE_URL))));
    let service = service(transport);

    let outcome = resolve_movie(&service, "gamma").await;

    assert_eq!(
        outcome.attempts[0].failure,
        Some(PipelineFailure::ProviderUnsupported {
            provider: "gamma".to_string()
        })
    );
    assert_eq!(outcome.result.unwrap().source, "alpha");
}

fn single_hop_registry() -> Arc<ProviderRegistry> {
    Arc::new(ProviderRegistry::new(vec![ProviderDescriptor {
        id: "solo".to_string(),
        status: ProviderStatus::Supported,
        hops: vec![HopDescriptor::new(
            "https://solo.test/{kind}/{id}",
            None,
            ExtractorKind::HiddenPayload,
        )],
        alternates: Vec::new(),
        placeholders: HashMap::from([("{v1}".to_string(), "media1.example".to_string())]),
    }]))
}

fn mocked_service(transport: MockTransportServiceTrait) -> ResolverService {
    ResolverService::new(
        single_hop_registry(),
        Arc::new(transport),
        Arc::new(DecodeCascade::new(static_transforms())),
        silent_events(),
        settings(),
    )
}

#[tokio::test]
async fn retry_a_transient_hop_failure_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let body = hidden("xk9", &gzip_base64(TEMPLATE_URL));

    let mut transport = MockTransportServiceTrait::new();
    transport
        .expect_fetch()
        .withf(|url, _| url.ends_with("solo.test/movie/tt0111161"))
        .times(2)
        .returning(move |url, _| {
            let status = if counter.fetch_add(1, Ordering::SeqCst) == 0 { 503 } else { 200 };
            Ok(FetchResult {
                url: url.to_string(),
                status,
                body: body.clone(),
                headers: HashMap::new(),
            })
        });

    let outcome = resolve_movie(&mocked_service(transport), "solo").await;

    assert_eq!(outcome.result.unwrap().stream_url, RESOLVED_URL);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn give_up_after_the_retry_budget() {
    let mut transport = MockTransportServiceTrait::new();
    transport
        .expect_fetch()
        .times(2)
        .returning(|_, _| Err(TransportError::Timeout));

    let outcome = resolve_movie(&mocked_service(transport), "solo").await;

    assert_eq!(
        outcome.result.unwrap_err(),
        PipelineFailure::NetworkTimeout { stage: Stage::Hop(1) }
    );
}

#[tokio::test]
async fn not_retry_markup_failures() {
    let mut transport = MockTransportServiceTrait::new();
    transport.expect_fetch().times(1).returning(|url, _| {
        Ok(FetchResult {
            url: url.to_string(),
            status: 200,
            body: "<html><body>no payload here</body></html>".to_string(),
            headers: HashMap::new(),
        })
    });

    let outcome = resolve_movie(&mocked_service(transport), "solo").await;

    assert_eq!(
        outcome.result.unwrap_err(),
        PipelineFailure::PayloadNotFound { stage: Stage::Hop(1) }
    );
}
