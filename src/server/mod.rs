pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{Extension, Router, http::HeaderValue, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{config::AppConfig, database::RedisDatabase};

use api::{health_controller::health_endpoint, resolve_controller::ResolveController};
use services::edge_services::EdgeServices;

// every resolution can hold a sandbox thread, this keeps the blocking pool from running away
const MAX_CONCURRENT_REQUESTS: usize = 256;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_uptime_seconds() -> u64 {
    STARTED_AT.elapsed().as_secs()
}

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct EdgeApplicationServer;

impl EdgeApplicationServer {
    /// routes without any process wide state attached, the metrics handle is optional so tests
    /// don't have to install a global recorder
    pub fn router(services: EdgeServices, metrics: Option<PrometheusHandle>) -> Router {
        let cors = Self::cors_layer(&services.config.cors_origin);

        let mut router = Router::new()
            .merge(ResolveController::app())
            .route("/health", get(health_endpoint));

        if let Some(handle) = metrics {
            router = router.route("/metrics", get(move || std::future::ready(handle.render())));
        }

        router
            .layer(Extension(services))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
    }

    pub async fn serve(config: Arc<AppConfig>, redis_db: Option<RedisDatabase>) -> anyhow::Result<()> {
        Lazy::force(&STARTED_AT);

        let metrics = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install prometheus recorder")?;

        let shutdown = CancellationToken::new();
        let services = EdgeServices::new(redis_db, config.clone(), shutdown.clone())
            .context("failed to start edge services")?;

        let router = Self::router(services, Some(metrics));

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind listener")?;

        info!("routes initialized, listening on port {}", config.port);

        axum::serve(listener, router)
            .with_graceful_shutdown(Self::shutdown_signal(shutdown))
            .await
            .context("error while starting API server")?;

        Ok(())
    }

    fn cors_layer(cors_origin: &str) -> CorsLayer {
        let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

        if cors_origin.trim() == "*" {
            return layer.allow_origin(Any);
        }

        let origins: Vec<HeaderValue> = cors_origin
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("ignoring invalid cors origin {}", origin);
                    None
                }
            })
            .collect();

        layer.allow_origin(origins)
    }

    async fn shutdown_signal(shutdown: CancellationToken) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for shutdown signal: {}", e);
            return;
        }

        info!("shutdown signal received, cancelling in flight resolutions");
        shutdown.cancel();
    }
}
