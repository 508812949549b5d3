// decode cascade, every strategy has the same signature and never touches the payload, so new ones
// can be slotted in without the navigator noticing
use std::borrow::Cow;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use flate2::read::{GzDecoder, ZlibDecoder};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::database::provider::{DecodeAttempt, EncodedPayload};

/// what a strategy gets besides the payload itself, read only
#[derive(Debug, Clone, Default)]
pub struct DecodeContext {
    pub provider_id: String,
    /// terminal hop url the payload was pulled from
    pub page_url: String,
}

/// output that could be a playable stream, cheap enough to run after every candidate
pub fn looks_like_stream(output: &str) -> bool {
    let trimmed = output.trim();
    !trimmed.is_empty()
        && (trimmed.contains("http://") || trimmed.contains("https://") || trimmed.contains(".m3u8"))
}

#[async_trait]
pub trait DecodeStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// must not touch anything outside of its arguments
    async fn attempt(&self, payload: &EncodedPayload, ctx: &DecodeContext) -> Option<String>;

    /// output plus a note for the attempt record, for strategies that know more about a miss
    /// than "no output"
    async fn attempt_noted(
        &self,
        payload: &EncodedPayload,
        ctx: &DecodeContext,
    ) -> (Option<String>, Option<String>) {
        (self.attempt(payload, ctx).await, None)
    }
}

pub type DynDecodeStrategy = Arc<dyn DecodeStrategy>;

/// wraps a plain transform so it can sit in the cascade
pub struct TransformStrategy {
    name: &'static str,
    transform: fn(&EncodedPayload) -> Option<String>,
}

impl TransformStrategy {
    pub const fn new(name: &'static str, transform: fn(&EncodedPayload) -> Option<String>) -> Self {
        Self { name, transform }
    }
}

#[async_trait]
impl DecodeStrategy for TransformStrategy {
    fn name(&self) -> &str {
        self.name
    }

    async fn attempt(&self, payload: &EncodedPayload, _ctx: &DecodeContext) -> Option<String> {
        (self.transform)(payload)
    }
}

#[derive(Debug, Clone)]
pub struct CascadeReport {
    pub output: Option<String>,
    pub winner: Option<String>,
    pub attempts: Vec<DecodeAttempt>,
}

impl CascadeReport {
    pub fn tried(&self) -> Vec<String> {
        self.attempts.iter().map(|a| a.strategy_name.clone()).collect()
    }
}

/// ordered strategy list, built once at startup and shared read only
pub struct DecodeCascade {
    strategies: Vec<DynDecodeStrategy>,
}

impl DecodeCascade {
    pub fn new(strategies: Vec<DynDecodeStrategy>) -> Self {
        Self { strategies }
    }

    pub fn with_strategy(mut self, strategy: DynDecodeStrategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    /// first strategy whose output passes `looks_like_stream` wins, nothing after it runs
    pub async fn decode(&self, payload: &EncodedPayload, ctx: &DecodeContext) -> CascadeReport {
        let digest = payload_digest(payload);
        let mut attempts = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            let (output, strategy_note) = strategy.attempt_noted(payload, ctx).await;
            let succeeded = output.as_deref().is_some_and(looks_like_stream);

            debug!(
                "payload {} strategy {} -> {}",
                digest,
                strategy.name(),
                if succeeded { "hit" } else { "miss" }
            );

            let note = match (&output, succeeded) {
                (_, true) => None,
                _ if strategy_note.is_some() => strategy_note,
                (None, _) => Some("no output".to_string()),
                (Some(_), false) => Some("output is not stream shaped".to_string()),
            };

            attempts.push(DecodeAttempt {
                strategy_name: strategy.name().to_string(),
                succeeded,
                output: output.clone(),
                note,
            });

            if succeeded {
                return CascadeReport {
                    output: output.map(|o| o.trim().to_string()),
                    winner: Some(strategy.name().to_string()),
                    attempts,
                };
            }
        }

        CascadeReport {
            output: None,
            winner: None,
            attempts,
        }
    }
}

/// short stable digest so log lines about the same payload can be grouped
pub fn payload_digest(payload: &EncodedPayload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.element_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.blob.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// the static transforms, cheapest and likeliest first
pub fn static_transforms() -> Vec<DynDecodeStrategy> {
    vec![
        Arc::new(TransformStrategy::new("plain", plain)),
        Arc::new(TransformStrategy::new("base64", base64_standard)),
        Arc::new(TransformStrategy::new("base64_url", base64_url)),
        Arc::new(TransformStrategy::new("reverse_base64", reverse_base64)),
        Arc::new(TransformStrategy::new("hex", hex_text)),
        Arc::new(TransformStrategy::new("xor_element_id", xor_element_id)),
        Arc::new(TransformStrategy::new("rot13_base64", rot13_base64)),
        Arc::new(TransformStrategy::new("caesar", caesar)),
        Arc::new(TransformStrategy::new("printable_rotation", printable_rotation)),
    ]
}

/// inflate gzip, zlib or zstd if the magic bytes say so, otherwise hand the bytes back
pub fn maybe_decompress(bytes: Vec<u8>) -> Vec<u8> {
    let inflated = match bytes.as_slice() {
        [0x1f, 0x8b, ..] => {
            let mut out = Vec::new();
            GzDecoder::new(&bytes[..]).read_to_end(&mut out).ok().map(|_| out)
        }
        [0x28, 0xb5, 0x2f, 0xfd, ..] => zstd::decode_all(&bytes[..]).ok(),
        [0x78, 0x01 | 0x5e | 0x9c | 0xda, ..] => {
            let mut out = Vec::new();
            ZlibDecoder::new(&bytes[..]).read_to_end(&mut out).ok().map(|_| out)
        }
        _ => None,
    };

    inflated.unwrap_or(bytes)
}

fn bytes_to_text(bytes: Vec<u8>) -> Option<String> {
    String::from_utf8(maybe_decompress(bytes)).ok()
}

fn compact(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .trim_end_matches('=')
        .to_string()
}

fn decode_base64(input: &str) -> Option<Vec<u8>> {
    STANDARD_NO_PAD.decode(compact(input)).ok()
}

fn decode_base64_url(input: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(compact(input)).ok()
}

fn rot13(input: &str) -> String {
    shift_alpha(input, 13)
}

/// caesar shift over both ascii letter ranges, everything else untouched
pub fn shift_alpha(input: &str, shift: u8) -> String {
    let shift = shift % 26;
    input
        .chars()
        .map(|c| match c {
            'a'..='z' => (b'a' + (c as u8 - b'a' + shift) % 26) as char,
            'A'..='Z' => (b'A' + (c as u8 - b'A' + shift) % 26) as char,
            _ => c,
        })
        .collect()
}

/// rotates ascii 33 ('!') to 126 ('~'), 94 characters, by `n` positions
pub fn rotate_printable(input: &str, n: u32) -> String {
    input
        .chars()
        .map(|c| {
            let code = c as u32;
            if (33..=126).contains(&code) {
                char::from_u32(33 + ((code - 33) + n) % 94).unwrap_or(c)
            } else {
                c
            }
        })
        .collect()
}

// candidate is accepted straight away or after one more base64 step
fn direct_or_base64(candidate: &str) -> Option<String> {
    if looks_like_stream(candidate) {
        return Some(candidate.to_string());
    }
    decode_base64(candidate)
        .and_then(bytes_to_text)
        .filter(|s| looks_like_stream(s))
}

fn plain(payload: &EncodedPayload) -> Option<String> {
    let blob = payload.blob.trim();
    let unescaped = urlencoding::decode(blob).unwrap_or(Cow::Borrowed(blob));
    Some(unescaped.into_owned())
}

fn base64_standard(payload: &EncodedPayload) -> Option<String> {
    decode_base64(&payload.blob).and_then(bytes_to_text)
}

fn base64_url(payload: &EncodedPayload) -> Option<String> {
    decode_base64_url(&payload.blob).and_then(bytes_to_text)
}

/// reversed url safe base64, some targets also subtract a small constant from every byte
fn reverse_base64(payload: &EncodedPayload) -> Option<String> {
    let reversed: String = payload
        .blob
        .chars()
        .rev()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            _ => c,
        })
        .collect();
    let bytes = decode_base64(&reversed)?;

    (0u8..=10)
        .filter_map(|shift| {
            let shifted: Vec<u8> = bytes.iter().map(|b| b.wrapping_sub(shift)).collect();
            bytes_to_text(shifted)
        })
        .find(|s| looks_like_stream(s))
}

fn hex_text(payload: &EncodedPayload) -> Option<String> {
    hex::decode(compact(&payload.blob)).ok().and_then(bytes_to_text)
}

/// element id as a repeating xor key over the hex or base64 decoded blob
fn xor_element_id(payload: &EncodedPayload) -> Option<String> {
    let key = payload.element_id.as_bytes();
    if key.is_empty() {
        return None;
    }

    let sources = [hex::decode(compact(&payload.blob)).ok(), decode_base64(&payload.blob)];

    sources.into_iter().flatten().find_map(|bytes| {
        let xored: Vec<u8> = bytes
            .iter()
            .zip(key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect();
        bytes_to_text(xored).and_then(|text| direct_or_base64(&text))
    })
}

fn rot13_base64(payload: &EncodedPayload) -> Option<String> {
    decode_base64(&rot13(&payload.blob)).and_then(bytes_to_text)
}

/// every alphabetic shift, 25 of them, is cheap enough to just try
fn caesar(payload: &EncodedPayload) -> Option<String> {
    (1u8..26).find_map(|shift| direct_or_base64(&shift_alpha(payload.blob.trim(), shift)))
}

/// same idea over the whole printable range, 93 rotations
fn printable_rotation(payload: &EncodedPayload) -> Option<String> {
    (1u32..94).find_map(|n| direct_or_base64(&rotate_printable(payload.blob.trim(), n)))
}
