// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels inside message headers: [`inject_context`] writes the current
//! context into outgoing headers and [`new_span`] opens a consumer span from the context
//! found on a delivery. [`timed`] logs how long a lifecycle operation took.

use crate::transport::{HeaderValue, Headers};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, future::Future};
use tokio::time::Instant;
use tracing::debug;

/// Adapter reading and writing trace context in a message header map.
pub(crate) struct HeadersPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeadersPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeadersPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

impl Extractor for HeadersPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(HeaderValue::String(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the current trace context into `headers`.
pub(crate) fn inject_context(headers: &mut Headers) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeadersPropagator::new(headers))
    });
}

/// Opens a consumer span for a delivery, parented on the context its headers carry.
pub(crate) fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut carrier = headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersPropagator::new(&mut carrier))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

/// Runs `operation`, logging its label and elapsed time at debug level.
pub(crate) async fn timed<F: Future>(label: &'static str, operation: F) -> F::Output {
    let started = Instant::now();
    debug!(operation = label, "started");
    let output = operation.await;
    debug!(
        operation = label,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "finished"
    );
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagator_round_trips_string_headers() {
        let mut headers = Headers::new();
        HeadersPropagator::new(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());
        headers.insert("x-redelivered-count".to_owned(), HeaderValue::Int(1));

        let propagator = HeadersPropagator::new(&mut headers);
        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.get("x-redelivered-count"), None);
        assert_eq!(propagator.keys().len(), 2);
    }
}
