//! Per-connection WebSocket task.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};

use super::{Gateway, Outbound};

/// Drive one upgraded socket for `observer` until either side goes away.
///
/// The connection is registered for its whole lifetime; the registration
/// is dropped on every exit path, which removes it from the gateway.
pub async fn serve_socket(socket: WebSocket, gateway: Arc<Gateway>, observer: String) {
    let mut registration = gateway.register(observer);
    let conn_id = registration.conn_id();
    tracing::info!(observer = %registration.observer(), conn_id, "observer connected");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound = registration.recv() => {
                let frame = match outbound {
                    Some(Outbound::Text(text)) => Message::Text(text.to_string().into()),
                    Some(Outbound::Ping) => Message::Ping(Bytes::new()),
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if sink.send(frame).await.is_err() {
                    tracing::debug!(conn_id, "observer sink closed");
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Pong(_))) => tracing::trace!(conn_id, "pong received"),
                // Observers only listen.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn_id, error = %e, "observer receive error");
                    break;
                }
            },
        }
    }

    tracing::info!(observer = %registration.observer(), conn_id, "observer disconnected");
}
