use std::convert::Infallible;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use futures::stream::{self, Stream, StreamExt};

use super::AppState;
use crate::status::StatusEvent;

fn to_sse(event: &StatusEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(event.phase.to_string()).data(data)
}

/// GET /api/projects/{id}/events — recorded history, then live events.
pub(crate) async fn stream_events(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (history, live) = state.status.subscribe_with_history(&project_id);
    tracing::debug!(project_id = %project_id, replayed = history.len(), "status subscriber attached");
    let stream = stream::iter(history)
        .chain(live)
        .map(|event| Ok(to_sse(&event)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/projects/{id}/events", get(stream_events))
}
