use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::server::error::PipelineFailure;

use super::model::{ExtractorKind, HopDescriptor, ProviderDescriptor, ProviderStatus};

// the rcp page hands the prorcp path over inside a player config literal
const PRORCP_PATTERN: &str = r#"src:\s*['"](?P<url>/prorcp/[^'"]+)['"]"#;

/// static description of every provider the navigator can walk
///
/// built once at startup, handed around behind an Arc and never written again. when a target
/// changes its url shape this table is what gets edited, not the navigator
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: Vec<ProviderDescriptor>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderDescriptor>) -> Self {
        Self { providers }
    }

    pub fn builtin() -> Self {
        let cdn_hosts: HashMap<String, String> = [
            ("{v1}", "shadowlandschronicles.com"),
            ("{v2}", "shadowlandschronicles.net"),
            ("{v3}", "shadowlandschronicles.org"),
            ("{v4}", "cloudnestra.com"),
        ]
        .into_iter()
        .map(|(token, host)| (token.to_string(), host.to_string()))
        .collect();

        // the three mirrors share the same rcp host and the same three hop shape
        let embed_chain = |id: &str, embed_base: &str, alternates: &[&str]| ProviderDescriptor {
            id: id.to_string(),
            status: ProviderStatus::Supported,
            hops: vec![
                HopDescriptor::new(
                    format!("{embed_base}/embed/{{kind}}/{{id}}{{episode_path}}"),
                    None,
                    ExtractorKind::DataHash,
                ),
                HopDescriptor::new(
                    "https://cloudnestra.com/rcp/{artifact}",
                    Some("{previous_url}"),
                    ExtractorKind::NextHopUrl {
                        pattern: PRORCP_PATTERN.to_string(),
                    },
                ),
                HopDescriptor::new(
                    "{artifact}",
                    Some("{previous_url}"),
                    ExtractorKind::HiddenPayload,
                ),
            ],
            alternates: alternates.iter().map(|a| a.to_string()).collect(),
            placeholders: cdn_hosts.clone(),
        };

        Self::new(vec![
            embed_chain("vidsrc", "https://vidsrc.xyz", &["vidsrc_net", "vsembed"]),
            embed_chain("vidsrc_net", "https://vidsrc.net", &["vsembed", "vidsrc"]),
            embed_chain("vsembed", "https://vsembed.ru", &["vidsrc", "vidsrc_net"]),
            // byte level cipher nobody has pinned down yet, listed but never walked
            ProviderDescriptor {
                id: "vidlink".to_string(),
                status: ProviderStatus::Experimental,
                hops: vec![HopDescriptor::new(
                    "https://vidlink.pro/{kind}/{id}{episode_path}",
                    None,
                    ExtractorKind::HiddenPayload,
                )],
                alternates: vec!["vidsrc".to_string()],
                placeholders: HashMap::new(),
            },
        ])
    }

    /// operator supplied placeholder values win over the shipped ones, applied before the
    /// registry is shared
    pub fn with_placeholder_overrides(mut self, overrides: &HashMap<String, String>) -> Self {
        if overrides.is_empty() {
            return self;
        }

        for provider in &mut self.providers {
            for (token, value) in overrides {
                provider.placeholders.insert(token.clone(), value.clone());
            }
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn providers(&self) -> &[ProviderDescriptor] {
        &self.providers
    }

    /// requested provider first, then its alternates in priority order
    ///
    /// a missing requested provider is fatal, missing or repeated alternates are only skipped
    pub fn fallback_order(&self, requested: &str) -> Result<Vec<&ProviderDescriptor>, PipelineFailure> {
        let primary = self
            .get(requested)
            .ok_or_else(|| PipelineFailure::UnknownProvider {
                provider: requested.to_string(),
            })?;

        let mut seen = HashSet::from([primary.id.as_str()]);
        let mut order = vec![primary];

        for alternate in &primary.alternates {
            if !seen.insert(alternate.as_str()) {
                continue;
            }
            match self.get(alternate) {
                Some(provider) => order.push(provider),
                None => warn!(
                    "provider {} lists unknown alternate {}, skipping",
                    primary.id, alternate
                ),
            }
        }

        Ok(order)
    }
}
