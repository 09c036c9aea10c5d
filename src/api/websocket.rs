//! WebSocket event stream.
//!
//! Each connection gets a writer task fed by an [`EventHub`] subscription and
//! a reader task that only watches for the client going away.
//!
//! [`EventHub`]: crate::events::EventHub

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::stream::{SplitSink, SplitStream};
use futures::{sink::SinkExt, stream::StreamExt};
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use super::{ApiError, ApiState};
use crate::config::origin_allowed;
use crate::events::Subscription;

/// Time allowed to write one frame.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Time allowed between two frames from the client.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping interval; must be shorter than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);
/// Largest frame accepted from a client.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, headers: HeaderMap, State(state): State<ApiState>) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(&state.allowed_origins, origin) {
        tracing::warn!(origin = origin.unwrap_or(""), "websocket origin rejected");
        return ApiError::new(StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    // Registered before the upgrade completes so no event after it is missed.
    let subscription = state.lifecycle.hub().subscribe();
    let shutdown = state.shutdown.clone();
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, subscription, shutdown))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, subscription: Subscription, shutdown: CancellationToken) {
    let (sender, receiver) = socket.split();

    let mut send_task = tokio::spawn(write_loop(sender, subscription, shutdown));
    let mut recv_task = tokio::spawn(read_loop(receiver));

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }
    tracing::debug!("websocket client disconnected");
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut subscription: Subscription,
    shutdown: CancellationToken,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = send_within(&mut sender, Message::Close(None)).await;
                break;
            }
            next = subscription.recv() => {
                let Some(first) = next else {
                    let _ = send_within(&mut sender, Message::Close(None)).await;
                    break;
                };
                let frame = coalesce(&first, &mut subscription);
                if !send_within(&mut sender, Message::Text(frame)).await {
                    break;
                }
            }
            _ = ping.tick() => {
                if !send_within(&mut sender, Message::Ping(Vec::new())).await {
                    break;
                }
            }
        }
    }
}

/// Join `first` with everything already queued, one event per line.
fn coalesce(first: &str, subscription: &mut Subscription) -> String {
    let mut frame = first.to_string();
    while let Some(next) = subscription.try_recv() {
        frame.push('\n');
        frame.push_str(&next);
    }
    frame
}

async fn send_within(sender: &mut SplitSink<WebSocket, Message>, message: Message) -> bool {
    match timeout(WRITE_WAIT, sender.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "websocket write failed");
            false
        }
        Err(_) => {
            tracing::warn!("websocket write timed out");
            false
        }
    }
}

/// Discard client frames; any frame (pongs included) refreshes the deadline.
async fn read_loop(mut receiver: SplitStream<WebSocket>) {
    loop {
        match timeout(PONG_WAIT, receiver.next()).await {
            Err(_) => {
                tracing::debug!("websocket read deadline exceeded");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(_))) => {}
        }
    }
}
