use opentelemetry::trace::TraceId;
use rand::Rng;
use tracing::{field, Span};

/// Random trace id used to correlate the log lines of a single reconciliation.
pub fn get_trace_id() -> TraceId {
    let mut rng = rand::thread_rng();
    let val: u128 = rng.gen();
    TraceId::from(val)
}

/// Records a fresh trace id on the current span's `trace_id` field.
pub fn record_trace_id() {
    let trace_id = get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
}
