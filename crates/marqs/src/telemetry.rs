//! Span semantics and trace-context propagation.
//!
//! Every broker operation runs inside a span carrying messaging-semantic
//! attributes. Operations that find no work record a distinguished
//! `outcome = "idle"` status instead of an error, so the tracing pipeline can
//! tell an idle poll apart from a failure. Trace context is injected into
//! message data at enqueue and restored from it at dequeue, linking the
//! producer's trace to the consumer's.

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::HashMap;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const SYSTEM_NAME: &str = "marqs";

/// Reserved member of message `data` carrying the W3C trace context.
pub const TRACE_CONTEXT_FIELD: &str = "traceContext";

/// Value recorded under `outcome` when an operation found no work.
pub const OUTCOME_IDLE: &str = "idle";

/// Marks the current span as having completed without finding work.
pub fn record_idle() {
    tracing::Span::current().record("outcome", OUTCOME_IDLE);
}

/// Injects the current span's trace context into `data` under
/// [`TRACE_CONTEXT_FIELD`]. Non-object `data` is carried unmodified: there is
/// nowhere to put the context without changing the payload's shape.
pub fn inject_trace_context(data: &mut serde_json::Value) {
    let Some(object) = data.as_object_mut() else {
        return;
    };

    let mut carrier: HashMap<String, String> = HashMap::new();
    let propagator = TraceContextPropagator::new();
    propagator.inject_context(&tracing::Span::current().context(), &mut carrier);

    if carrier.is_empty() {
        return;
    }
    object.insert(
        TRACE_CONTEXT_FIELD.to_string(),
        serde_json::json!(carrier),
    );
}

/// Reads a trace context previously injected into `data`, and sets it as the
/// parent of the current span. Missing or malformed contexts are ignored.
pub fn adopt_trace_context(data: &serde_json::Value) {
    let Some(context) = data.get(TRACE_CONTEXT_FIELD).and_then(|v| v.as_object()) else {
        return;
    };

    let carrier: HashMap<String, String> = context
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect();

    let propagator = TraceContextPropagator::new();
    tracing::Span::current().set_parent(propagator.extract(&carrier));
}

/// Renders parent-ZSET candidates as a compact `queue=score` list for span
/// attributes.
pub fn format_queues_with_scores(queues: &[(String, f64)]) -> String {
    queues
        .iter()
        .map(|(queue, score)| format!("{queue}={score}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inject_leaves_non_objects_alone() {
        let mut data = serde_json::json!("scalar");
        inject_trace_context(&mut data);
        assert_eq!(data, serde_json::json!("scalar"));
    }

    #[test]
    fn adopt_ignores_missing_context() {
        // No panic, no effect.
        adopt_trace_context(&serde_json::json!({"x": 1}));
        adopt_trace_context(&serde_json::json!(42));
    }

    #[test]
    fn queues_with_scores_render_flat() {
        let rendered = format_queues_with_scores(&[
            ("queue:e1:a:o:org1".to_string(), 100.0),
            ("queue:e1:b:o:org1".to_string(), 250.0),
        ]);
        assert_eq!(rendered, "queue:e1:a:o:org1=100,queue:e1:b:o:org1=250");
    }
}
