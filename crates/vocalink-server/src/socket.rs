//! WebSocket pump shared by the session, dashboard and sync endpoints.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{Outbound, CLOSE_GOING_AWAY};

/// Drive one socket until either side ends or the server shuts down.
///
/// A writer task drains `outbound` into the socket and sends heartbeat pings;
/// the reader runs in the caller's task and hands every text frame to `on_text`.
/// Returns once the peer is gone, the owning [`Connection`](crate::connection::Connection)
/// is closed, or `shutdown` fires.
pub async fn pump(
    socket: WebSocket,
    mut outbound: mpsc::Receiver<Outbound>,
    heartbeat: Duration,
    shutdown: CancellationToken,
    mut on_text: impl FnMut(&str),
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_shutdown = shutdown.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(Outbound::Text(text)) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame { code, reason: reason.into() };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        break;
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    tracing::trace!("sent ping");
                }
                _ = writer_shutdown.cancelled() => {
                    let frame = CloseFrame { code: CLOSE_GOING_AWAY, reason: "server shutting down".into() };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let reader = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => on_text(text.as_str()),
                Message::Close(_) => break,
                // axum answers pings itself
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = &mut writer => {}
        _ = reader => {}
        _ = shutdown.cancelled() => {
            // let the writer flush its close frame
            let _ = (&mut writer).await;
        }
    }
    writer.abort();
}
