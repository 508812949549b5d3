use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Serialize, Serializer};
use serde_json::json;

pub type AppResult<T> = Result<T, Error>;

/// errors that end up on the wire, everything the pipeline reports goes through PipelineFailure
/// instead and is folded into a response body by the controllers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Error::BadRequest(errors.to_string().replace('\n', ", "))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Error::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// where in the walk a resolution stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Registry,
    Hop(usize),
    DecoderScript,
    Decoding,
    Placeholder,
    Validation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Registry => write!(f, "registry"),
            Stage::Hop(n) => write!(f, "hop_{}", n),
            Stage::DecoderScript => write!(f, "decoder_script"),
            Stage::Decoding => write!(f, "decoding"),
            Stage::Placeholder => write!(f, "placeholder"),
            Stage::Validation => write!(f, "validation"),
        }
    }
}

// stages go over the wire as "hop_2" rather than {"hop": 2}
impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// failure taxonomy for a single resolution
///
/// MarkupShapeChanged and PayloadNotFound mean the target changed its markup and the registry or
/// the cascade needs updating, network flavoured variants mean try again later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineFailure {
    #[error("network timeout at {stage}")]
    NetworkTimeout { stage: Stage },

    #[error("network error at {stage}: {reason}")]
    NetworkError { stage: Stage, reason: String },

    #[error("upstream returned status {status} at {stage}")]
    UpstreamStatus { stage: Stage, status: u16 },

    #[error("too many redirects at {stage}")]
    TooManyRedirects { stage: Stage },

    #[error("markup shape changed at {stage}")]
    MarkupShapeChanged { stage: Stage },

    #[error("hidden payload not found at {stage}")]
    PayloadNotFound { stage: Stage },

    #[error("no decoder script could be captured")]
    DecoderScriptNotFound,

    #[error("all decode strategies exhausted ({})", attempts.join(", "))]
    AllDecodeStrategiesExhausted { attempts: Vec<String> },

    #[error("sandboxed decoder timed out")]
    SandboxTimeout,

    #[error("sandboxed decoder produced no output")]
    SandboxNoOutput,

    #[error("placeholder {token} left unresolved")]
    PlaceholderUnresolved { token: String },

    #[error("decoded value is not a playable url: {url}")]
    InvalidFinalUrl { url: String },

    #[error("no provider registered as {provider}")]
    UnknownProvider { provider: String },

    #[error("provider {provider} is experimental and not resolvable")]
    ProviderUnsupported { provider: String },

    #[error("resolution cancelled at {stage}")]
    Cancelled { stage: Stage },
}

impl PipelineFailure {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineFailure::NetworkTimeout { stage }
            | PipelineFailure::NetworkError { stage, .. }
            | PipelineFailure::UpstreamStatus { stage, .. }
            | PipelineFailure::TooManyRedirects { stage }
            | PipelineFailure::MarkupShapeChanged { stage }
            | PipelineFailure::PayloadNotFound { stage }
            | PipelineFailure::Cancelled { stage } => *stage,
            PipelineFailure::DecoderScriptNotFound => Stage::DecoderScript,
            PipelineFailure::AllDecodeStrategiesExhausted { .. }
            | PipelineFailure::SandboxTimeout
            | PipelineFailure::SandboxNoOutput => Stage::Decoding,
            PipelineFailure::PlaceholderUnresolved { .. } => Stage::Placeholder,
            PipelineFailure::InvalidFinalUrl { .. } => Stage::Validation,
            PipelineFailure::UnknownProvider { .. } | PipelineFailure::ProviderUnsupported { .. } => {
                Stage::Registry
            }
        }
    }

    /// worth retrying the same hop, everything else means the provider is done for this request
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineFailure::NetworkTimeout { .. } | PipelineFailure::NetworkError { .. } => true,
            PipelineFailure::UpstreamStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// short machine readable tag, used for metrics labels and events
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineFailure::NetworkTimeout { .. } => "network_timeout",
            PipelineFailure::NetworkError { .. } => "network_error",
            PipelineFailure::UpstreamStatus { .. } => "upstream_status",
            PipelineFailure::TooManyRedirects { .. } => "too_many_redirects",
            PipelineFailure::MarkupShapeChanged { .. } => "markup_shape_changed",
            PipelineFailure::PayloadNotFound { .. } => "payload_not_found",
            PipelineFailure::DecoderScriptNotFound => "decoder_script_not_found",
            PipelineFailure::AllDecodeStrategiesExhausted { .. } => {
                "all_decode_strategies_exhausted"
            }
            PipelineFailure::SandboxTimeout => "sandbox_timeout",
            PipelineFailure::SandboxNoOutput => "sandbox_no_output",
            PipelineFailure::PlaceholderUnresolved { .. } => "placeholder_unresolved",
            PipelineFailure::InvalidFinalUrl { .. } => "invalid_final_url",
            PipelineFailure::UnknownProvider { .. } => "unknown_provider",
            PipelineFailure::ProviderUnsupported { .. } => "provider_unsupported",
            PipelineFailure::Cancelled { .. } => "cancelled",
        }
    }
}
