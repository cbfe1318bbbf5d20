//! WebSocket adapter: per connection, one reader loop (envelope parsing and
//! dispatch into the owning room's mailbox) and one writer task (draining
//! the bounded outbound queue). Heartbeat pings originate here; the actor
//! never touches a socket.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use crate::protocol::{
    parse_client_frame, CloseReason, ServerEvent, ServerFrame,
};
use crate::room::outbound::{self, DrainItem, OutboundReceiver, OutboundSender};
use crate::room::{AcquireError, ConnId, RoomCommand, RoomHandle};
use crate::state::AppState;

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(room_code): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, room_code, socket))
}

async fn handle_socket(state: AppState, room_code: String, socket: WebSocket) {
    let conn_id: ConnId = Uuid::new_v4();
    let span = tracing::info_span!("ws_session", room = %room_code, conn = %conn_id);
    run_connection(state, room_code, conn_id, socket)
        .instrument(span)
        .await;
}

async fn run_connection(state: AppState, room_code: String, conn_id: ConnId, socket: WebSocket) {
    let registry = state.registry();

    let room = match registry.acquire(&room_code).await {
        Ok(handle) => handle,
        Err(err) => {
            let message = match err {
                AcquireError::RoomNotFound => "room_not_found",
                AcquireError::RoomClosed => "room_closed",
                AcquireError::Store(ref store_err) => {
                    tracing::warn!(error = %store_err, "room materialisation failed");
                    "internal error"
                }
            };
            reject(socket, message).await;
            return;
        }
    };

    let config = registry.room_config().clone();
    let (queue_tx, queue_rx) = outbound::channel(config.outbound_capacity);
    let connected = room
        .send(RoomCommand::Connect {
            conn_id,
            queue: queue_tx.clone(),
        })
        .await;
    if !connected {
        reject(socket, "room_closed").await;
        return;
    }

    let (ws_tx, ws_rx) = socket.split();
    let (control_tx, control_rx) = mpsc::channel::<WriterControl>(8);
    let writer = tokio::spawn(writer_task(
        ws_tx,
        queue_rx,
        control_rx,
        config.drain_timeout,
    ));

    read_loop(
        &room,
        conn_id,
        ws_rx,
        &queue_tx,
        control_tx,
        config.heartbeat_interval,
        config.pong_timeout,
    )
    .await;

    let _ = room.send(RoomCommand::ConnectionClosed { conn_id }).await;
    queue_tx.close(None);
    let _ = writer.await;
    tracing::debug!("connection finished");
}

enum WriterControl {
    Ping,
}

async fn read_loop(
    room: &RoomHandle,
    conn_id: ConnId,
    mut ws_rx: SplitStream<WebSocket>,
    queue: &OutboundSender,
    control_tx: mpsc::Sender<WriterControl>,
    heartbeat_interval: Duration,
    pong_timeout: Duration,
) {
    let mut ping_interval = tokio::time::interval(heartbeat_interval);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        // A disabled branch still evaluates its expression, so keep the
        // deadline meaningful even when no pong is outstanding.
        let deadline = pong_deadline.unwrap_or_else(|| Instant::now() + heartbeat_interval);

        tokio::select! {
            _ = ping_interval.tick() => {
                if control_tx.send(WriterControl::Ping).await.is_err() {
                    break;
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + pong_timeout);
                }
            }

            _ = sleep_until(deadline), if pong_deadline.is_some() => {
                tracing::info!("heartbeat timeout, closing connection");
                queue.close(Some(CloseReason::Timeout));
                break;
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match parse_client_frame(&text) {
                        Ok(frame) => {
                            if !room.send(RoomCommand::Inbound { conn_id, frame }).await {
                                break;
                            }
                        }
                        Err(err) => {
                            // Malformed envelopes answer the originator only.
                            tracing::debug!(error = %err, "malformed client frame");
                            queue.push(ServerFrame::new(ServerEvent::BadRequest {
                                message: "malformed envelope".to_string(),
                            }));
                        }
                    },
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // The transport answers pings itself.
                    }
                    Some(Ok(Message::Binary(_))) => {
                        queue.push(ServerFrame::new(ServerEvent::BadRequest {
                            message: "text frames only".to_string(),
                        }));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "socket read error");
                        break;
                    }
                }
            }
        }

        if queue.is_closed() {
            break;
        }
    }
}

async fn writer_task(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut queue_rx: OutboundReceiver,
    mut control_rx: mpsc::Receiver<WriterControl>,
    drain_timeout: Duration,
) {
    let mut control_open = true;
    loop {
        tokio::select! {
            item = queue_rx.next() => match item {
                DrainItem::Frame(frame) => {
                    let sent = timeout(
                        drain_timeout,
                        ws_tx.send(Message::Text(frame.to_json())),
                    )
                    .await;
                    if !matches!(sent, Ok(Ok(()))) {
                        break;
                    }
                }
                DrainItem::Closed(reason) => {
                    let close = Message::Close(reason.map(|r| CloseFrame {
                        code: close_code(r),
                        reason: r.as_str().into(),
                    }));
                    let _ = timeout(drain_timeout, ws_tx.send(close)).await;
                    break;
                }
            },

            control = control_rx.recv(), if control_open => match control {
                Some(WriterControl::Ping) => {
                    let sent = timeout(drain_timeout, ws_tx.send(Message::Ping(Vec::new()))).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        break;
                    }
                }
                None => control_open = false,
            },
        }
    }
}

/// Application close codes in the 4000 range, one per close reason.
fn close_code(reason: CloseReason) -> u16 {
    match reason {
        CloseReason::SupersededByNewer => 4001,
        CloseReason::Timeout => 4002,
        CloseReason::BackpressureFatal => 4003,
        CloseReason::RoomClosed => 4004,
    }
}

/// Terminal frame for connections that never reach a live room.
async fn reject(socket: WebSocket, message: &str) {
    let mut socket = socket;
    let frame = ServerFrame::new(ServerEvent::BadRequest {
        message: message.to_string(),
    });
    let _ = socket.send(Message::Text(frame.to_json())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code(CloseReason::RoomClosed),
            reason: message.to_string().into(),
        })))
        .await;
}
