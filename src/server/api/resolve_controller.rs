use axum::{Extension, Json, Router, http::StatusCode, routing::get};
use tracing::debug;

use crate::server::{
    dtos::resolve_dto::{ProviderSummary, ResolveQuery, ResolveResponse},
    error::{AppResult, Error, PipelineFailure},
    extractors::ValidatedQuery,
    services::edge_services::EdgeServices,
};

pub struct ResolveController;

impl ResolveController {
    pub fn app() -> Router {
        Router::new()
            .route("/resolve", get(Self::resolve))
            .route("/providers", get(Self::providers))
    }

    /// 200 with the stream, 502 with the failure, 404 only when the provider doesn't exist
    pub async fn resolve(
        Extension(services): Extension<EdgeServices>,
        ValidatedQuery(query): ValidatedQuery<ResolveQuery>,
    ) -> AppResult<(StatusCode, Json<ResolveResponse>)> {
        let request = query.into_request()?;
        debug!(
            "resolving {:?} {} via {}",
            request.content_kind, request.external_id, request.provider_id
        );

        // a dropped server takes every in flight walk down with it
        let cancel = services.shutdown.child_token();
        let outcome = services.resolver.resolve(&request, &cancel).await;

        let status = match outcome.failure() {
            None => StatusCode::OK,
            Some(PipelineFailure::UnknownProvider { provider }) => {
                return Err(Error::NotFound(format!("unknown provider {}", provider)));
            }
            Some(_) => StatusCode::BAD_GATEWAY,
        };

        Ok((status, Json(ResolveResponse::from(outcome))))
    }

    pub async fn providers(Extension(services): Extension<EdgeServices>) -> Json<Vec<ProviderSummary>> {
        Json(
            services
                .registry
                .providers()
                .iter()
                .map(ProviderSummary::from)
                .collect(),
        )
    }
}
