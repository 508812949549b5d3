use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::server::error::{AppResult, Error};

/// what the caller wants resolved, built once per request and never touched afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Movie,
    Episode,
}

impl ContentKind {
    /// embed pages call episodes "tv"
    pub fn path_segment(&self) -> &'static str {
        match self {
            ContentKind::Movie => "movie",
            ContentKind::Episode => "tv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionRequest {
    pub provider_id: String,
    pub content_kind: ContentKind,
    pub external_id: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl ResolutionRequest {
    pub fn new(
        provider_id: impl Into<String>,
        content_kind: ContentKind,
        external_id: impl Into<String>,
        season: Option<u32>,
        episode: Option<u32>,
    ) -> AppResult<Self> {
        let external_id = external_id.into();
        if external_id.trim().is_empty() {
            return Err(Error::BadRequest("external id must not be empty".to_string()));
        }

        match (content_kind, season, episode) {
            (ContentKind::Movie, None, None) | (ContentKind::Episode, Some(_), Some(_)) => {}
            (ContentKind::Movie, _, _) => {
                return Err(Error::BadRequest(
                    "movies don't take a season or episode".to_string(),
                ));
            }
            (ContentKind::Episode, _, _) => {
                return Err(Error::BadRequest(
                    "episodes need both a season and an episode".to_string(),
                ));
            }
        }

        Ok(Self {
            provider_id: provider_id.into(),
            content_kind,
            external_id,
            season,
            episode,
        })
    }

    pub fn movie(provider_id: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            content_kind: ContentKind::Movie,
            external_id: external_id.into(),
            season: None,
            episode: None,
        }
    }

    pub fn episode(
        provider_id: impl Into<String>,
        external_id: impl Into<String>,
        season: u32,
        episode: u32,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            content_kind: ContentKind::Episode,
            external_id: external_id.into(),
            season: Some(season),
            episode: Some(episode),
        }
    }

    /// same content, different provider, used when falling back
    pub fn retarget(&self, provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            ..self.clone()
        }
    }
}

/// which markup extractor runs on a hop's body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorKind {
    /// pulls a provider issued hash, the next hop url is built from it
    DataHash,
    /// pulls the next hop url with a provider specific regex, `url` group or group 1
    NextHopUrl { pattern: String },
    /// terminal hop, pulls the hidden encoded payload and its decoder script
    HiddenPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HopDescriptor {
    pub url_template: String,
    pub referer_template: Option<String>,
    pub extractor: ExtractorKind,
}

impl HopDescriptor {
    pub fn new(
        url_template: impl Into<String>,
        referer_template: Option<&str>,
        extractor: ExtractorKind,
    ) -> Self {
        Self {
            url_template: url_template.into(),
            referer_template: referer_template.map(str::to_string),
            extractor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Supported,
    /// listed so it can be seen, never walked
    Experimental,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub status: ProviderStatus,
    pub hops: Vec<HopDescriptor>,
    /// tried in order when this provider fails outright
    pub alternates: Vec<String>,
    /// template token (e.g. `{v1}`) to literal, applied after decoding
    pub placeholders: HashMap<String, String>,
}

/// the hidden blob pulled from the terminal hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub element_id: String,
    pub blob: String,
    pub decoder_script_source: Option<String>,
}

impl EncodedPayload {
    pub fn new(element_id: impl Into<String>, blob: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
            blob: blob.into(),
            decoder_script_source: None,
        }
    }

    pub fn with_decoder_script(mut self, source: impl Into<String>) -> Self {
        self.decoder_script_source = Some(source.into());
        self
    }
}

/// one cascade entry's result, kept for diagnostics only
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodeAttempt {
    pub strategy_name: String,
    pub succeeded: bool,
    pub output: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedStream {
    pub stream_url: String,
    pub required_headers: HashMap<String, String>,
    pub source: String,
}
