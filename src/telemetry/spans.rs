//! Span helpers for locks and channel requests.

use tracing::Span;

use crate::model::{RequestId, RequestState};

/// Start a span covering one request on a channel.
///
/// `request.state` starts empty and is filled by [`record_state_transition`].
pub fn start_request_span(channel: &str, request_id: &RequestId) -> Span {
    tracing::info_span!(
        "channel.request",
        "channel.name" = channel,
        "request.id" = %request_id,
        "request.state" = tracing::field::Empty,
    )
}

/// Start a span covering a lock acquisition or critical section.
pub fn start_lock_span(name: &str) -> Span {
    tracing::info_span!("lock.hold", "lock.name" = name, "lock.acquired" = tracing::field::Empty)
}

/// Record a request state transition on the given span.
pub fn record_state_transition(span: &Span, from: RequestState, to: RequestState) {
    span.record("request.state", tracing::field::display(to));
    span.in_scope(|| {
        if to.is_terminal() {
            tracing::info!(%from, %to, "request complete");
        } else {
            tracing::debug!(%from, %to, "state_transition");
        }
    });
}
