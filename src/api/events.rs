//! Server-sent stream of [`ClientEvent`]s

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::AppState;
use crate::services::events::ClientEvent;

fn to_sse(event: &ClientEvent) -> Option<Event> {
    match Event::default().event(event.kind()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            warn!(error = %e, event = event.kind(), "Could not encode client event");
            None
        }
    }
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Client subscribed to events");
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|item| async move {
        // Lagged receivers skip what they missed
        item.ok().as_ref().and_then(to_sse).map(Ok)
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/events", get(events))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_encodes() {
        let event = ClientEvent::InfoToast {
            message: "done".into(),
        };
        assert!(to_sse(&event).is_some());
    }
}
