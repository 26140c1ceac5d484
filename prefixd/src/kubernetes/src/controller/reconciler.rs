pub mod ip;
pub mod prefix;
pub mod prefix_allocation_scheduler;

use kube::runtime::events::{Event, EventType};

use super::{object::Object, store::Store};

/// Publishes an event for `obj`. Failing to record it never fails the reconciliation.
pub(crate) async fn record<K: Object, S: Store>(
    store: &S,
    obj: &K,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: reason.to_string(),
        secondary: None,
    };
    if let Err(e) = store.record_event(obj, event).await {
        tracing::warn!(error=?e, reason, "failed to record event");
    }
}
