use axum::Extension;
use axum::Json;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::error;

use crate::database::provider::ProviderStatus;
use crate::server::dtos::health_dto::{
    HealthResponse, HealthStatus, PipelineHealth, RedisHealth, ServiceHealthDetails,
};
use crate::server::services::edge_services::EdgeServices;
use crate::server::{get_app_version, get_uptime_seconds};

/// the pipeline itself has nothing to ping, redis is the only dependency that can be down and
/// even then resolutions keep working, so a dead redis only degrades
pub async fn health_endpoint(
    Extension(services): Extension<EdgeServices>,
) -> (StatusCode, Json<HealthResponse>) {
    let redis_health = check_redis_health(&services).await;

    let supported_providers = services
        .registry
        .providers()
        .iter()
        .filter(|p| p.status == ProviderStatus::Supported)
        .count();

    let overall_status = match &redis_health {
        _ if supported_providers == 0 => HealthStatus::Unhealthy,
        Some(redis) if redis.status == HealthStatus::Unhealthy => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    };

    let response = HealthResponse {
        status: overall_status,
        timestamp: Utc::now(),
        uptime_seconds: get_uptime_seconds(),
        version: get_app_version().to_string(),
        environment: format!("{:?}", services.config.cargo_env).to_lowercase(),
        services: ServiceHealthDetails {
            redis: redis_health,
            pipeline: PipelineHealth {
                providers: services.registry.providers().len(),
                supported_providers,
            },
        },
    };

    let http_status = match overall_status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(response))
}

async fn check_redis_health(services: &EdgeServices) -> Option<RedisHealth> {
    let redis = services.redis.as_ref()?;

    Some(match redis.health_check().await {
        Ok(response_time) => RedisHealth {
            status: HealthStatus::Healthy,
            response_time_ms: response_time,
        },
        Err(e) => {
            error!("Redis health check failed: {}", e);
            RedisHealth {
                status: HealthStatus::Unhealthy,
                response_time_ms: 0.0,
            }
        }
    })
}
