// the one place target supplied code runs. every run gets its own quickjs runtime that only sees
// a fake document and local base64 primitives, and the host pulls the plug on a deadline
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use mockall::automock;
use once_cell::sync::Lazy;
use regex::Regex;
use rquickjs::context::intrinsic;
use rquickjs::{Context, Ctx, Function, Runtime, Value};
use serde::Serialize;
use tracing::{debug, warn};

use crate::database::provider::EncodedPayload;
use crate::server::error::PipelineFailure;
use crate::server::utils::decode_utils::{DecodeContext, DecodeStrategy};

pub type DynSandboxService = Arc<dyn SandboxServiceTrait + Send + Sync>;

const MAX_STACK_BYTES: usize = 1024 * 1024;

// slack for thread handoff on top of the interpreter deadline
const HOST_GRACE: Duration = Duration::from_millis(250);

// the full intrinsic set minus `Date` and `Performance`, so no clock is reachable
type SandboxIntrinsics = (
    intrinsic::Eval,
    intrinsic::RegExpCompiler,
    intrinsic::RegExp,
    intrinsic::Json,
    intrinsic::Proxy,
    intrinsic::MapSet,
    intrinsic::TypedArrays,
    intrinsic::Promise,
    intrinsic::BigInt,
    intrinsic::WeakRef,
);

// the host functions are handed to this closure and never bound as globals themselves
const PRELUDE: &str = r#"
(function (lookup, decodeBase64, encodeBase64) {
    'use strict';
    var g = globalThis;
    function element(id) {
        var text = lookup(String(id));
        if (text === undefined || text === null) {
            return null;
        }
        return Object.freeze({ id: String(id), textContent: text, innerHTML: text, innerText: text });
    }
    g.document = Object.freeze({
        getElementById: function (id) {
            return element(id);
        },
        querySelector: function (selector) {
            var s = String(selector);
            return s.charAt(0) === '#' ? element(s.slice(1)) : null;
        }
    });
    g.atob = function (input) {
        var out = decodeBase64(String(input));
        if (out === undefined || out === null) {
            throw new Error('InvalidCharacterError');
        }
        return out;
    };
    g.btoa = function (input) {
        var out = encodeBase64(String(input));
        if (out === undefined || out === null) {
            throw new Error('InvalidCharacterError');
        }
        return out;
    };
    g.window = g;
    delete g.Date;
    delete g.performance;
})
"#;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("static regex should compile"));

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub timeout: Duration,
    pub memory_limit_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            memory_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

/// one call from the script into a mocked primitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrimitiveCall {
    pub primitive: &'static str,
    pub argument_len: usize,
    pub produced: bool,
}

/// per run record of primitive calls, owned by the run and handed back with its result
#[derive(Debug, Clone, Default)]
pub struct SandboxTrace {
    calls: Arc<Mutex<Vec<PrimitiveCall>>>,
}

impl SandboxTrace {
    pub fn record(&self, primitive: &'static str, argument_len: usize, produced: bool) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(PrimitiveCall {
                primitive,
                argument_len,
                produced,
            });
        }
    }

    pub fn calls(&self) -> Vec<PrimitiveCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxFailure {
    #[error("decoder ran past its deadline")]
    Timeout,

    #[error("decoder left no string under {0}")]
    NoOutput(String),

    #[error("decoder threw: {0}")]
    ScriptError(String),
}

impl From<&SandboxFailure> for PipelineFailure {
    fn from(failure: &SandboxFailure) -> Self {
        match failure {
            SandboxFailure::Timeout => PipelineFailure::SandboxTimeout,
            SandboxFailure::NoOutput(_) | SandboxFailure::ScriptError(_) => {
                PipelineFailure::SandboxNoOutput
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxReport {
    pub outcome: Result<String, SandboxFailure>,
    pub calls: Vec<PrimitiveCall>,
    pub elapsed: Duration,
}

#[automock]
#[async_trait]
pub trait SandboxServiceTrait {
    /// full report, primitive calls included
    async fn execute(&self, decoder_source: &str, payload: &EncodedPayload) -> SandboxReport;

    /// candidate output or nothing, never an error the caller has to handle
    async fn run(&self, decoder_source: &str, payload: &EncodedPayload) -> Option<String>;
}

pub struct SandboxService {
    config: SandboxConfig,
}

impl SandboxService {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SandboxServiceTrait for SandboxService {
    async fn execute(&self, decoder_source: &str, payload: &EncodedPayload) -> SandboxReport {
        let started = Instant::now();
        let trace = SandboxTrace::default();

        let source = decoder_source.to_string();
        let job_payload = payload.clone();
        let job_config = self.config.clone();
        let job_trace = trace.clone();
        let job = tokio::task::spawn_blocking(move || {
            execute_isolated(&source, &job_payload, &job_config, &job_trace)
        });

        // the interrupt handler should stop the script first, this is the bound if it doesn't
        let outcome = match tokio::time::timeout(self.config.timeout + HOST_GRACE, job).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(SandboxFailure::ScriptError(format!(
                "sandbox thread failed: {}",
                e
            ))),
            Err(_) => Err(SandboxFailure::Timeout),
        };

        SandboxReport {
            outcome,
            calls: trace.calls(),
            elapsed: started.elapsed(),
        }
    }

    async fn run(&self, decoder_source: &str, payload: &EncodedPayload) -> Option<String> {
        let report = self.execute(decoder_source, payload).await;
        match report.outcome {
            Ok(output) => Some(output),
            Err(failure) => {
                debug!("sandbox run for {} failed: {}", payload.element_id, failure);
                None
            }
        }
    }
}

fn execute_isolated(
    source: &str,
    payload: &EncodedPayload,
    config: &SandboxConfig,
    trace: &SandboxTrace,
) -> Result<String, SandboxFailure> {
    let runtime = Runtime::new()
        .map_err(|e| SandboxFailure::ScriptError(format!("runtime failed: {}", e)))?;
    runtime.set_memory_limit(config.memory_limit_bytes);
    runtime.set_max_stack_size(MAX_STACK_BYTES);

    let deadline = Instant::now() + config.timeout;
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    runtime.set_interrupt_handler(Some(Box::new(move || {
        if Instant::now() >= deadline {
            flag.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    })));

    let context = Context::custom::<SandboxIntrinsics>(&runtime)
        .map_err(|e| SandboxFailure::ScriptError(format!("context failed: {}", e)))?;

    let result = context.with(|ctx| {
        install_surface(&ctx, payload, trace)
            .map_err(|e| SandboxFailure::ScriptError(describe(&ctx, e)))?;

        ctx.eval::<Value, _>(source.to_string())
            .map_err(|e| SandboxFailure::ScriptError(describe(&ctx, e)))?;

        read_output(&ctx, &payload.element_id)
            .ok_or_else(|| SandboxFailure::NoOutput(payload.element_id.clone()))
    });

    if interrupted.load(Ordering::SeqCst) {
        return Err(SandboxFailure::Timeout);
    }
    result
}

fn install_surface<'js>(
    ctx: &Ctx<'js>,
    payload: &EncodedPayload,
    trace: &SandboxTrace,
) -> rquickjs::Result<()> {
    let element_id = payload.element_id.clone();
    let blob = payload.blob.clone();
    let lookup_trace = trace.clone();
    let lookup = Function::new(ctx.clone(), move |id: String| -> Option<String> {
        let found = id == element_id;
        lookup_trace.record("getElementById", id.len(), found);
        found.then(|| blob.clone())
    })?;

    let decode_trace = trace.clone();
    let decode = Function::new(ctx.clone(), move |input: String| -> Option<String> {
        let decoded = decode_binary_string(&input);
        decode_trace.record("atob", input.len(), decoded.is_some());
        decoded
    })?;

    let encode_trace = trace.clone();
    let encode = Function::new(ctx.clone(), move |input: String| -> Option<String> {
        let encoded = encode_binary_string(&input);
        encode_trace.record("btoa", input.len(), encoded.is_some());
        encoded
    })?;

    let install: Function = ctx.eval(PRELUDE)?;
    install.call::<_, ()>((lookup, decode, encode))
}

/// atob semantics, every decoded byte becomes one latin-1 code unit
fn decode_binary_string(input: &str) -> Option<String> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD_NO_PAD.decode(cleaned.trim_end_matches('=')).ok()?;
    Some(bytes.into_iter().map(char::from).collect())
}

/// btoa semantics, anything above latin-1 is rejected
fn encode_binary_string(input: &str) -> Option<String> {
    let bytes: Option<Vec<u8>> = input
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect();
    bytes.map(|b| STANDARD.encode(b))
}

fn read_output(ctx: &Ctx<'_>, element_id: &str) -> Option<String> {
    let from_global = ctx
        .globals()
        .get::<_, Value>(element_id)
        .ok()
        .and_then(|v| string_value(&v));

    from_global.or_else(|| {
        // top level let/const never land on the global object
        if !IDENTIFIER.is_match(element_id) {
            return None;
        }
        let probe = format!(
            "typeof {id} === 'string' ? {id} : undefined",
            id = element_id
        );
        match ctx.eval::<Value, _>(probe) {
            Ok(value) => string_value(&value),
            Err(_) => {
                let _ = ctx.catch();
                None
            }
        }
    })
}

fn string_value(value: &Value<'_>) -> Option<String> {
    value
        .as_string()
        .and_then(|s| s.to_string().ok())
        .filter(|s| !s.trim().is_empty())
}

fn describe(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    if !error.is_exception() {
        return error.to_string();
    }

    let caught = ctx.catch();
    match caught.as_exception() {
        Some(exception) => exception
            .message()
            .unwrap_or_else(|| "exception without message".to_string()),
        None => format!("thrown value {:?}", caught),
    }
}

/// the sandbox as one more cascade entry, only does anything when a decoder script was captured
pub struct SandboxStrategy {
    sandbox: DynSandboxService,
}

impl SandboxStrategy {
    pub fn new(sandbox: DynSandboxService) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl DecodeStrategy for SandboxStrategy {
    fn name(&self) -> &str {
        "sandbox"
    }

    async fn attempt(&self, payload: &EncodedPayload, ctx: &DecodeContext) -> Option<String> {
        self.attempt_noted(payload, ctx).await.0
    }

    async fn attempt_noted(
        &self,
        payload: &EncodedPayload,
        ctx: &DecodeContext,
    ) -> (Option<String>, Option<String>) {
        let Some(source) = payload.decoder_script_source.as_deref() else {
            return (None, Some("no decoder script captured".to_string()));
        };
        let report = self.sandbox.execute(source, payload).await;

        match report.outcome {
            Ok(output) => {
                debug!(
                    "sandboxed decoder for {} produced output in {:?} after {} primitive calls",
                    ctx.provider_id,
                    report.elapsed,
                    report.calls.len()
                );
                (Some(output), None)
            }
            Err(failure) => {
                let kind = PipelineFailure::from(&failure).kind();
                warn!(
                    "sandboxed decoder for {} failed ({}) after {:?}: {}, calls: {:?}",
                    ctx.provider_id, kind, report.elapsed, failure, report.calls
                );
                (None, Some(format!("{}: {}", kind, failure)))
            }
        }
    }
}
