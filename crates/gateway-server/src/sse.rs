//! Canonical events as Server-Sent Events.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};

use gateway_core::events::StreamEvent;

/// `event: <type>` with the payload JSON alone as `data`.
pub fn to_sse_event(event: &StreamEvent) -> serde_json::Result<Event> {
    Ok(Event::default()
        .event(event.event_type())
        .data(event.payload_json()?))
}

/// Wrap a turn's events as an SSE response. The response body ends when the
/// turn stream ends; dropping the body (client gone) drops the turn.
pub fn sse_response<S>(events: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    let frames = events.filter_map(|event| async move {
        match to_sse_event(&event) {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                tracing::warn!(event_type = event.event_type(), error = %e, "dropping unencodable event");
                None
            }
        }
    });
    Sse::new(frames).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use gateway_core::ids::SessionId;
    use gateway_core::sse::decode_events;

    #[tokio::test]
    async fn body_decodes_back_to_events() {
        let events = vec![
            StreamEvent::text("Hel\nlo"),
            StreamEvent::done(SessionId::from_raw("b-1")),
        ];
        let resp = sse_response(futures::stream::iter(events.clone())).into_response();
        assert_eq!(
            resp.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("event: text_delta\ndata: {\"text\":\"Hel\\nlo\"}\n\n"));
        assert_eq!(decode_events(&body), events);
    }
}
