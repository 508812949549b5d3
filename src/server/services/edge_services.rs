use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::AppConfig,
    database::{RedisDatabase, provider::ProviderRegistry},
    server::{
        services::{
            browser_services::BrowserFallbackStrategy,
            event_services::EventService,
            resolver_services::{ResolverService, ResolverSettings},
            sandbox_services::{SandboxConfig, SandboxService, SandboxStrategy},
            transport_services::{HttpTransport, TransportConfig},
        },
        utils::decode_utils::{DecodeCascade, static_transforms},
    },
};

use super::{
    event_services::DynEventService, resolver_services::DynResolverService,
    sandbox_services::DynSandboxService, transport_services::DynTransportService,
};

/// everything the controllers need, cloned into each request through an Extension
#[derive(Clone)]
pub struct EdgeServices {
    pub resolver: DynResolverService,
    pub registry: Arc<ProviderRegistry>,
    pub events: DynEventService,
    pub redis: Option<Arc<RedisDatabase>>,
    pub config: Arc<AppConfig>,
    /// cancelled on shutdown, every in flight resolution gets a child of it
    pub shutdown: CancellationToken,
}

impl EdgeServices {
    pub fn new(
        redis_db: Option<RedisDatabase>,
        config: Arc<AppConfig>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        info!("starting edge services...");

        let redis = redis_db.map(Arc::new);
        let registry = Arc::new(
            ProviderRegistry::builtin().with_placeholder_overrides(&config.placeholder_overrides()),
        );
        info!("provider registry ok, {} providers", registry.providers().len());

        let transport = Arc::new(
            HttpTransport::new(TransportConfig {
                user_agent: config.user_agent.clone(),
                timeout: Duration::from_secs(config.request_timeout_secs),
                max_body_bytes: config.max_body_bytes,
            })
            .context("failed to build transport")?,
        ) as DynTransportService;

        let sandbox = Arc::new(SandboxService::new(SandboxConfig {
            timeout: Duration::from_millis(config.sandbox_timeout_ms),
            memory_limit_bytes: config.sandbox_memory_limit_mb * 1024 * 1024,
        })) as DynSandboxService;

        let mut cascade =
            DecodeCascade::new(static_transforms()).with_strategy(Arc::new(SandboxStrategy::new(sandbox)));
        if let Some(service_url) = &config.browser_service_url {
            let browser = BrowserFallbackStrategy::new(
                service_url,
                Duration::from_secs(config.request_timeout_secs * 2),
            )
            .context("failed to build browser fallback")?;
            cascade = cascade.with_strategy(Arc::new(browser));
        }
        info!("decode cascade ok: {}", cascade.strategy_names().join(", "));

        let events = Arc::new(EventService::new(redis.clone())) as DynEventService;

        let resolver = Arc::new(ResolverService::new(
            registry.clone(),
            transport,
            Arc::new(cascade),
            events.clone(),
            ResolverSettings {
                hop_retries: config.hop_retries,
                user_agent: config.user_agent.clone(),
                ..ResolverSettings::default()
            },
        )) as DynResolverService;

        Ok(Self {
            resolver,
            registry,
            events,
            redis,
            config,
            shutdown,
        })
    }
}
