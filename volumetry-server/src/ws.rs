//! Realtime WebSocket endpoint.
//!
//! Subscribers get the full bus feed plus an inventory snapshot on connect.
//! Clients must `ping` at least every 90 seconds; the server replies `pong`
//! and closes silent connections.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use volumetry_model::{BusMessage, Page, VolumeFilters, VolumeSort};

use crate::state::AppState;

/// A subscriber that has not pinged within this window is closed.
const PING_DEADLINE: Duration = Duration::from_secs(90);
/// How often the deadline is checked.
const PING_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn frame_to_message(frame: &BusMessage) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Message::Text(Utf8Bytes::from(json))),
        Err(err) => {
            warn!(error = %err, "failed to encode bus frame");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (subscriber_id, mut bus_rx) = state.bus.subscribe();
    state.metrics.bus_subscribers.inc();
    debug!(subscriber = %subscriber_id, "websocket subscriber connected");

    // inventory snapshot so a fresh client can render without a REST call
    if let Ok((volumes, _)) = state
        .store
        .list_volumes(
            &VolumeFilters::default(),
            VolumeSort::default(),
            Page {
                offset: 0,
                limit: volumetry_model::filter::MAX_PAGE_SIZE,
            },
        )
        .await
    {
        if let Some(message) = frame_to_message(&BusMessage::volume_update(volumes)) {
            if sender.send(message).await.is_err() {
                state.bus.unsubscribe(subscriber_id);
                state.metrics.bus_subscribers.dec();
                return;
            }
        }
    }

    // outbound: drain the bus subscription until it closes (slow-consumer
    // disconnect surfaces here as a closed channel)
    let (pong_tx, mut pong_rx) = tokio::sync::mpsc::channel::<BusMessage>(8);
    let outbound = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = bus_rx.recv() => frame,
                frame = pong_rx.recv() => frame,
            };
            let Some(frame) = frame else { break };
            let Some(message) = frame_to_message(&frame) else {
                continue;
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // inbound: ping handling and liveness accounting
    let mut last_ping = Instant::now();
    let mut deadline_check = tokio::time::interval(PING_CHECK_INTERVAL);
    deadline_check.tick().await;

    loop {
        tokio::select! {
            _ = deadline_check.tick() => {
                if last_ping.elapsed() > PING_DEADLINE {
                    debug!(subscriber = %subscriber_id, "closing silent websocket subscriber");
                    break;
                }
            }
            incoming = receiver.next() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<BusMessage>(text.as_str()) {
                            Ok(BusMessage::Ping { .. }) => {
                                last_ping = Instant::now();
                                if pong_tx.send(BusMessage::pong()).await.is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {
                                debug!("ignoring non-ping client frame");
                            }
                            Err(err) => {
                                debug!(error = %err, "unparseable client frame");
                            }
                        }
                    }
                    Ok(Message::Ping(_)) => {
                        // protocol-level pings also count as liveness
                        last_ping = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(error = %err, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    state.bus.unsubscribe(subscriber_id);
    state.metrics.bus_subscribers.dec();
    outbound.abort();
    debug!(subscriber = %subscriber_id, "websocket subscriber disconnected");
}
