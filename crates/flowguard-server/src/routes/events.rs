use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};

use crate::state::AppState;

#[derive(serde::Deserialize)]
pub struct EventsQuery {
    /// Restrict the stream to one device (plus untagged global events).
    pub device: Option<String>,
}

/// GET /api/events — SSE stream of pipeline events.
///
/// Each SSE event is named after the payload's `type` field and carries the
/// full `{type, device, timestamp, data}` object as JSON. The subscription
/// is torn down when the client disconnects and the stream drops.
pub async fn sse_events(
    State(app): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl axum::response::IntoResponse {
    let rx = app.pipeline.subscribe(query.device);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let sse = match serde_json::to_string(&event) {
            Ok(json) => Event::default().event(event.event_type.as_str()).data(json),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize event");
                Event::default().event("error").data("serialization failed")
            }
        };
        Some((Ok::<Event, Infallible>(sse), rx))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
