//! Live event streaming over server-sent events.
//!
//! Each connected client gets its own broker subscription; disconnecting
//! drops the subscription and releases its queue.

use crate::events::EventBroker;
use axum::{
    extract::State,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use tracing::debug;

/// Serve gateway events as a JSON SSE stream.
pub async fn events_stream(
    State(broker): State<EventBroker>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    debug!("live event stream subscriber connected");

    let stream = broker.subscribe().map(|event| {
        let sse = SseEvent::default()
            .json_data(&event)
            .unwrap_or_else(|_| SseEvent::default());
        Ok(sse)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
