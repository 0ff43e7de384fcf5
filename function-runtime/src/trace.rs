//! Distributed tracing across the isolation boundary
//!
//! The incoming trace context is extracted from W3C `traceparent` headers.
//! Only requests explicitly marked as sampled are traced with the exporting
//! tracer; all others go through a no-op tracer that still forwards the
//! parent context. The resulting span context travels to the isolated unit
//! as a [`TraceCarrier`] and is attached there with [`TraceScope`].

use std::collections::HashMap;
use std::time::Duration;

use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::noop::NoopTracer;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer, TracerProvider as _};
use opentelemetry::{global, Context, ContextGuard, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use tracing::warn;

use crate::config::Config;
use crate::invoker::InvocationResult;
use crate::types::Headers;

/// Serialized span context handed to the isolated unit
pub type TraceCarrier = HashMap<String, String>;

const SPAN_NAME: &str = "function.invoke";

impl Extractor for Headers {
    fn get(&self, key: &str) -> Option<&str> {
        Headers::get(self, key)
    }

    fn keys(&self) -> Vec<&str> {
        self.iter().map(|(name, _)| name).collect()
    }
}

/// Creates one [`InvocationSpan`] per request
pub struct TraceBridge {
    tracer: Option<opentelemetry_sdk::trace::Tracer>,
    noop: NoopTracer,
    propagator: TraceContextPropagator,
}

impl TraceBridge {
    /// A bridge that never exports but still propagates context.
    pub fn disabled() -> Self {
        Self {
            tracer: None,
            noop: NoopTracer::new(),
            propagator: TraceContextPropagator::new(),
        }
    }

    pub fn with_tracer(tracer: opentelemetry_sdk::trace::Tracer) -> Self {
        Self {
            tracer: Some(tracer),
            ..Self::disabled()
        }
    }

    pub fn bridge(&self, headers: &Headers, method: &str, path: &str) -> InvocationSpan {
        let parent = self.propagator.extract(headers);
        let sampled = is_sampled(headers, &parent);

        let cx = match (&self.tracer, sampled) {
            (Some(tracer), true) => start_span(tracer, &parent, method, path),
            _ => start_span(&self.noop, &parent, method, path),
        };

        InvocationSpan {
            cx,
            sampled,
            ended: false,
        }
    }
}

fn start_span<T>(tracer: &T, parent: &Context, method: &str, path: &str) -> Context
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    let span = tracer
        .span_builder(SPAN_NAME)
        .with_kind(SpanKind::Server)
        .with_attributes(vec![
            KeyValue::new("http.request.method", method.to_owned()),
            KeyValue::new("url.path", path.to_owned()),
        ])
        .start_with_context(tracer, parent);
    parent.with_span(span)
}

/// Explicit B3 sampling headers win; otherwise the W3C sampled flag decides.
fn is_sampled(headers: &Headers, parent: &Context) -> bool {
    if headers.get("x-b3-flags").map(str::trim) == Some("1") {
        return true;
    }
    match headers.get("x-b3-sampled").map(str::trim) {
        Some(flag) => flag == "1" || flag.eq_ignore_ascii_case("true"),
        None => parent.span().span_context().is_sampled(),
    }
}

/// The span of a single invocation, ended exactly once
pub struct InvocationSpan {
    cx: Context,
    sampled: bool,
    ended: bool,
}

impl InvocationSpan {
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// The span context in a form that can cross a process boundary.
    pub fn carrier(&self) -> TraceCarrier {
        let mut carrier = TraceCarrier::new();
        TraceContextPropagator::new().inject_context(&self.cx, &mut carrier);
        carrier
    }

    pub fn finish(mut self, result: &InvocationResult) {
        let span = self.cx.span();
        span.set_attribute(KeyValue::new("faas.outcome", result.outcome()));
        match result {
            InvocationResult::Success(_) => span.set_status(Status::Ok),
            InvocationResult::Timeout => span.set_status(Status::error("deadline exceeded")),
            InvocationResult::Failure(failure) => span.set_status(Status::error(failure.to_string())),
        }
        span.end();
        self.ended = true;
    }
}

impl Drop for InvocationSpan {
    fn drop(&mut self) {
        if !self.ended {
            self.cx.span().end();
        }
    }
}

/// Keeps a propagated context attached for the lifetime of the scope
pub struct TraceScope {
    _guard: ContextGuard,
}

impl TraceScope {
    pub fn attach(carrier: &TraceCarrier) -> Self {
        let cx = TraceContextPropagator::new().extract(carrier);
        Self { _guard: cx.attach() }
    }
}

/// Build the exporting tracer provider when a collector endpoint is set.
///
/// Must be called from within a Tokio runtime. Exporter failures fall back
/// to no export.
pub fn init_tracer_provider(config: &Config) -> Option<TracerProvider> {
    let endpoint = config.trace_collector_endpoint.as_ref()?;

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            warn!(error = %e, endpoint = %endpoint, "failed to create OTLP exporter, traces will not be exported");
            return None;
        }
    };

    let resource = Resource::new(vec![
        KeyValue::new("service.name", config.function_name.clone()),
        KeyValue::new("service.namespace", config.namespace.clone()),
        KeyValue::new("faas.runtime", config.runtime.clone()),
    ]);

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TraceContextPropagator::new());
    Some(provider)
}

pub fn bridge_for(provider: Option<&TracerProvider>) -> TraceBridge {
    match provider {
        Some(provider) => TraceBridge::with_tracer(provider.tracer("function-runtime")),
        None => TraceBridge::disabled(),
    }
}

/// Flush and stop the tracer provider
pub fn shutdown(provider: Option<TracerProvider>) {
    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            warn!(error = ?e, "error shutting down tracer provider");
        }
    }
}
