use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::database::RedisDatabase;

pub type DynEventService = Arc<dyn EventServiceTrait + Send + Sync>;

/// one finished resolution, written out and never read back by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionEvent {
    pub provider_id: String,
    pub success: bool,
    /// provider that actually produced the stream, can differ from the requested one
    pub source: Option<String>,
    pub failed_stage: Option<String>,
    pub failure_kind: Option<String>,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ResolutionEvent {
    pub fn outcome(&self) -> &'static str {
        if self.success { "success" } else { "failure" }
    }
}

#[automock]
#[async_trait]
pub trait EventServiceTrait {
    async fn emit(&self, event: ResolutionEvent);
}

/// logs, counts and optionally ships every event, none of it can fail a resolution
pub struct EventService {
    redis: Option<Arc<RedisDatabase>>,
}

impl EventService {
    pub fn new(redis: Option<Arc<RedisDatabase>>) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl EventServiceTrait for EventService {
    async fn emit(&self, event: ResolutionEvent) {
        if event.success {
            info!(
                "resolved {} via {} in {}ms",
                event.provider_id,
                event.source.as_deref().unwrap_or("unknown"),
                event.elapsed_ms
            );
        } else {
            warn!(
                "resolution for {} failed at {} ({}) after {}ms",
                event.provider_id,
                event.failed_stage.as_deref().unwrap_or("unknown"),
                event.failure_kind.as_deref().unwrap_or("unknown"),
                event.elapsed_ms
            );
        }

        metrics::counter!(
            "resolver_resolutions_total",
            "provider" => event.provider_id.clone(),
            "outcome" => event.outcome()
        )
        .increment(1);
        metrics::histogram!(
            "resolver_resolution_duration_seconds",
            "provider" => event.provider_id.clone()
        )
        .record(event.elapsed_ms as f64 / 1000.0);

        let Some(redis) = &self.redis else {
            return;
        };

        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(e) = redis.push_event(&payload).await {
                    error!("Failed to ship resolution event: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize resolution event: {}", e),
        }
    }
}
