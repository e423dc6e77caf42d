//! Server-sent event framing of live sessions.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;
use tracing::warn;

use kubestream_logs::SessionEvent;

/// Event name of source lifecycle changes
pub const SOURCE_EVENT: &str = "container-event";

/// Event name of backfill batches
pub const BACKFILL_EVENT: &str = "logs-backfill";

/// Frame one session event; records are unnamed message events
pub fn to_sse(event: &SessionEvent) -> Option<Event> {
    let framed = match event {
        SessionEvent::Record(record) => Event::default().json_data(record),
        SessionEvent::Source(change) => Event::default().event(SOURCE_EVENT).json_data(change),
        SessionEvent::Backfill(batch) => Event::default().event(BACKFILL_EVENT).json_data(batch),
        SessionEvent::Heartbeat => return Some(Event::default().comment("ping")),
    };

    match framed {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(error = %err, "error while encoding event");
            None
        }
    }
}

/// Body stream of a session; dropping it cancels the session through `guard`
pub fn event_stream(
    events: mpsc::Receiver<SessionEvent>,
    guard: DropGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((events, guard), |(mut events, guard)| async move {
        loop {
            let event = events.recv().await?;
            if let Some(framed) = to_sse(&event) {
                return Some((Ok(framed), (events, guard)));
            }
        }
    })
}
