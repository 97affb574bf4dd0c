//! Server-Sent Events bridge for the reply stream

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

/// Events emitted while one reply is produced.
#[derive(Debug, Clone)]
pub enum ReplyEvent {
    /// A first-reply title was generated and saved.
    Title { title: String },
    /// One cleaned text increment.
    Fragment { text: String },
    /// Terminal: the full accumulated reply.
    Done { text: String, truncated: bool },
    /// Terminal: the reply failed outright.
    Error { message: String },
}

/// Wrap the reply channel in an SSE response. The stream ends when the
/// producing task drops its sender.
pub fn reply_sse(
    rx: mpsc::UnboundedReceiver<ReplyEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = UnboundedReceiverStream::new(rx).map(|event| Ok(reply_event_to_axum(event)));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn reply_event_to_axum(event: ReplyEvent) -> Event {
    let (event_type, data) = match event {
        ReplyEvent::Title { title } => ("title", json!({ "title": title })),
        ReplyEvent::Fragment { text } => ("fragment", json!({ "text": text })),
        ReplyEvent::Done { text, truncated } => {
            ("done", json!({ "text": text, "truncated": truncated }))
        }
        ReplyEvent::Error { message } => ("error", json!({ "message": message })),
    };

    Event::default().event(event_type).data(data.to_string())
}
