// pure extractors over a fetched page, nothing in here touches the network
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::warn;
use url::Url;

use crate::database::provider::EncodedPayload;

/// real payloads are long, short hidden elements are almost always ui state
pub const HIDDEN_PAYLOAD_MIN_LEN: usize = 500;

// second pass floor for compact payloads that happen to be short
const COMPACT_PAYLOAD_MIN_LEN: usize = 32;

const ELEMENT_LOOKUP_CALLS: &[&str] = &["getElementById(", "querySelector("];
const CHAR_CODE_CALLS: &[&str] = &["fromCharCode", "charCodeAt"];

// external scripts that are never the decoder
const LIBRARY_MARKERS: &[&str] = &[
    "jquery",
    "hls.js",
    "hls.min",
    "jwplayer",
    "playerjs",
    "analytics",
    "gtag",
    "googletag",
    "cdn-cgi",
    "disable-devtool",
];

static DATA_HASH_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[data-hash]").expect("static selector should parse"));
static IFRAME_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("iframe[src]").expect("static selector should parse"));
static SCRIPT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script").expect("static selector should parse"));
static BLOCK_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("div[id], span[id], p[id], section[id], pre[id]")
        .expect("static selector should parse")
});

static INLINE_HASH_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"data-hash\s*[=:]\s*["']([^"']+)["']"#,
        r#"\bhash\s*[:=]\s*["']([A-Za-z0-9+/=_\-:.]{6,})["']"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static hash regex should compile"))
    .collect()
});
static DISPLAY_NONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)display\s*:\s*none").expect("static regex should compile"));
static PAYLOAD_ALPHABET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9+/=_\-.:~%{}]+$").expect("static regex should compile")
});

/// where the decoder for a hidden payload lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderScriptRef {
    Inline(String),
    /// absolute urls in document order, each still has to go through transport and pass
    /// `is_decoder_source` before it can run
    External(Vec<String>),
}

fn inline_scripts(document: &Html) -> Vec<String> {
    document
        .select(&SCRIPT_SELECTOR)
        .filter(|el| el.value().attr("src").is_none())
        .map(|el| el.text().collect::<String>())
        .collect()
}

fn capture_url(re: &Regex, haystack: &str) -> Option<String> {
    let caps = re.captures(haystack)?;
    caps.name("url")
        .or_else(|| caps.get(1))
        .or_else(|| caps.get(0))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// provider issued hash, attribute first and inline scripts second
pub fn extract_data_hash(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    let from_attribute = document
        .select(&DATA_HASH_SELECTOR)
        .filter_map(|el| el.value().attr("data-hash"))
        .map(str::trim)
        .find(|hash| !hash.is_empty())
        .map(str::to_string);

    from_attribute.or_else(|| {
        inline_scripts(&document).iter().find_map(|script| {
            INLINE_HASH_PATTERNS.iter().find_map(|re| {
                re.captures(script)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            })
        })
    })
}

/// next hop url matching the provider pattern, made absolute against the page it came from
pub fn extract_next_hop_url(html: &str, pattern: &str, base_url: &str) -> Option<String> {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!("next hop pattern {} doesn't compile: {}", pattern, e);
            return None;
        }
    };
    let base = Url::parse(base_url).ok()?;
    let document = Html::parse_document(html);

    let from_iframe = document
        .select(&IFRAME_SELECTOR)
        .filter_map(|el| el.value().attr("src"))
        .find_map(|src| capture_url(&re, src));

    // inline script literals, anywhere in the raw document
    from_iframe
        .or_else(|| capture_url(&re, html))
        .and_then(|candidate| base.join(&candidate).ok())
        .map(|url| url.to_string())
}

/// hidden block element holding the encoded blob
///
/// first pass wants something longer than the noise threshold, the second pass only runs when
/// that finds nothing and takes the longest hidden token-shaped text
pub fn extract_hidden_payload(html: &str) -> Option<EncodedPayload> {
    let document = Html::parse_document(html);

    let hidden: Vec<(String, String)> = document
        .select(&BLOCK_SELECTOR)
        .filter(|el| {
            el.value()
                .attr("style")
                .is_some_and(|style| DISPLAY_NONE.is_match(style))
        })
        .filter_map(|el| {
            let id = el.value().attr("id")?.trim();
            if id.is_empty() {
                return None;
            }
            let text = el.text().collect::<String>().trim().to_string();
            Some((id.to_string(), text))
        })
        .collect();

    if let Some((id, text)) = hidden
        .iter()
        .find(|(_, text)| text.chars().count() > HIDDEN_PAYLOAD_MIN_LEN)
    {
        return Some(EncodedPayload::new(id.as_str(), text.as_str()));
    }

    hidden
        .into_iter()
        .filter(|(_, text)| text.len() >= COMPACT_PAYLOAD_MIN_LEN && PAYLOAD_ALPHABET.is_match(text))
        .max_by_key(|(_, text)| text.len())
        .map(|(id, text)| EncodedPayload::new(id, text))
}

/// both signals together mean "this script decodes the hidden element"
pub fn is_decoder_source(source: &str) -> bool {
    ELEMENT_LOOKUP_CALLS.iter().any(|call| source.contains(call))
        && CHAR_CODE_CALLS.iter().any(|call| source.contains(call))
}

/// inline decoder if one is on the page, otherwise every non library external script
pub fn extract_decoder_script(html: &str, base_url: &str) -> Option<DecoderScriptRef> {
    let document = Html::parse_document(html);
    let mut external = Vec::new();

    for el in document.select(&SCRIPT_SELECTOR) {
        match el.value().attr("src") {
            Some(src) => {
                let lower = src.to_ascii_lowercase();
                if !src.trim().is_empty() && !LIBRARY_MARKERS.iter().any(|m| lower.contains(m)) {
                    external.push(src.trim().to_string());
                }
            }
            None => {
                let text: String = el.text().collect();
                if is_decoder_source(&text) {
                    return Some(DecoderScriptRef::Inline(text));
                }
            }
        }
    }

    let base = Url::parse(base_url).ok()?;
    let mut urls: Vec<String> = Vec::with_capacity(external.len());
    for url in external.iter().filter_map(|src| base.join(src).ok()) {
        let url = url.to_string();
        if !urls.contains(&url) {
            urls.push(url);
        }
    }

    (!urls.is_empty()).then_some(DecoderScriptRef::External(urls))
}
