use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::database::provider::{ContentKind, ProviderDescriptor, ProviderStatus, ResolutionRequest};
use crate::server::error::{AppResult, PipelineFailure};
use crate::server::services::resolver_services::ResolveOutcome;

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_episode_fields"))]
pub struct ResolveQuery {
    #[validate(length(min = 1, max = 64))]
    pub provider: String,
    pub kind: ContentKind,
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    #[validate(range(min = 1, max = 1000))]
    pub season: Option<u32>,
    #[validate(range(min = 1, max = 10000))]
    pub episode: Option<u32>,
}

fn validate_episode_fields(query: &ResolveQuery) -> Result<(), ValidationError> {
    let complete = match query.kind {
        ContentKind::Movie => query.season.is_none() && query.episode.is_none(),
        ContentKind::Episode => query.season.is_some() && query.episode.is_some(),
    };

    if complete {
        Ok(())
    } else {
        Err(ValidationError::new("episode_fields")
            .with_message("episodes need season and episode, movies take neither".into()))
    }
}

impl ResolveQuery {
    pub fn into_request(self) -> AppResult<ResolutionRequest> {
        ResolutionRequest::new(self.provider, self.kind, self.id, self.season, self.episode)
    }
}

#[derive(Debug, Serialize)]
pub struct AttemptSummary {
    pub provider: String,
    pub failed_stage: Option<String>,
    pub error: Option<PipelineFailure>,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    pub attempts: Vec<AttemptSummary>,
    pub elapsed_ms: u64,
}

impl From<ResolveOutcome> for ResolveResponse {
    fn from(outcome: ResolveOutcome) -> Self {
        let attempts = outcome
            .attempts
            .into_iter()
            .map(|attempt| AttemptSummary {
                provider: attempt.provider,
                failed_stage: attempt.failure.as_ref().map(|f| f.stage().to_string()),
                error: attempt.failure,
            })
            .collect();
        let elapsed_ms = outcome.elapsed.as_millis() as u64;

        match outcome.result {
            Ok(stream) => Self {
                success: true,
                url: Some(stream.stream_url),
                headers: Some(stream.required_headers),
                source: stream.source,
                error: None,
                failed_stage: None,
                attempts,
                elapsed_ms,
            },
            Err(failure) => Self {
                success: false,
                url: None,
                headers: None,
                source: outcome.source,
                failed_stage: Some(failure.stage().to_string()),
                error: Some(failure),
                attempts,
                elapsed_ms,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProviderSummary {
    pub id: String,
    pub status: ProviderStatus,
    pub hops: usize,
    pub alternates: Vec<String>,
}

impl From<&ProviderDescriptor> for ProviderSummary {
    fn from(provider: &ProviderDescriptor) -> Self {
        Self {
            id: provider.id.clone(),
            status: provider.status,
            hops: provider.hops.len(),
            alternates: provider.alternates.clone(),
        }
    }
}
