//! A single downstream WebSocket connection: its subscribed-tile set, its
//! outbound queue, and the heartbeat liveness flags the dispatcher's
//! heartbeat sweep reads and mutates.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use tilemath::TileKey;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::outbox::Outbox;
use crate::protocol::{ClientMessage, ServerMessage, VesselDto};
use crate::store::Store;

/// Hard cap on tiles a single session may subscribe to in aggregate. Excess
/// tiles in a subscribe request are logged and dropped rather than rejecting
/// the whole message.
pub const MAX_SUBSCRIBED_TILES: usize = 1500;

pub struct Session {
    pub id: Uuid,
    pub subscribed: RwLock<FxHashSet<TileKey>>,
    pub outbox: Outbox,
    pub awaiting_pong: AtomicBool,
    ping_notify: Notify,
    close_notify: Notify,
    close_reason: Mutex<Option<(u16, &'static str)>>,
}

impl Session {
    pub(crate) fn new(outbox_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            subscribed: RwLock::new(FxHashSet::default()),
            outbox: Outbox::new(outbox_cap),
            awaiting_pong: AtomicBool::new(false),
            ping_notify: Notify::new(),
            close_notify: Notify::new(),
            close_reason: Mutex::new(None),
        })
    }

    /// Called by the heartbeat sweep to request a WS-level ping. The writer
    /// task observes this alongside the outbox and sends the frame directly.
    pub fn request_ping(&self) {
        self.ping_notify.notify_one();
    }

    /// Called by the heartbeat sweep when a previous ping went unanswered.
    /// Forces the reader loop to exit and the connection to close.
    pub fn request_close(&self, code: u16, reason: &'static str) {
        *self.close_reason.lock() = Some((code, reason));
        self.close_notify.notify_one();
    }
}

pub struct GatewayState {
    pub store: Arc<Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub outbox_cap: usize,
}

pub async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let session = Session::new(state.outbox_cap);
    let sid = session.id;
    state.dispatcher.register_session(sid, session.clone());

    session.outbox.push(ServerMessage::Connected {
        client_id: sid.to_string(),
        message: "connected".to_string(),
    });

    let (mut sink, mut stream) = socket.split();

    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = writer_session.outbox.pop() => {
                    match msg {
                        Some(msg) => {
                            let text = serde_json::to_string(&msg).unwrap_or_default();
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = writer_session.ping_notify.notified() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let reason = writer_session.close_reason.lock().clone();
        let frame = reason.map(|(code, reason)| CloseFrame {
            code,
            reason: reason.into(),
        });
        let _ = sink.send(Message::Close(frame)).await;
    });

    loop {
        tokio::select! {
            next = stream.next() => {
                match next {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&session, &state, &text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        session.awaiting_pong.store(false, Ordering::Relaxed);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(session = %sid, error = %err, "socket read error");
                        break;
                    }
                }
            }
            _ = session.close_notify.notified() => break,
        }
    }

    writer.abort();
    let subscribed = session.subscribed.read().clone();
    state.dispatcher.remove_session(sid, &subscribed);
    session.outbox.close();
}

async fn handle_client_message(session: &Arc<Session>, state: &Arc<GatewayState>, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::debug!(session = %session.id, error = %err, "ignoring malformed client message");
            return;
        }
    };

    match msg {
        ClientMessage::Ping => {
            session.outbox.push(ServerMessage::Pong);
        }
        ClientMessage::Subscribe { tiles } => subscribe(session, state, tiles).await,
        ClientMessage::Unsubscribe { tiles } => unsubscribe(session, state, tiles),
    }
}

async fn subscribe(session: &Arc<Session>, state: &Arc<GatewayState>, requested: Vec<String>) {
    let parsed: Vec<TileKey> = requested
        .iter()
        .filter_map(|raw| match raw.parse::<TileKey>() {
            Ok(tile) => Some(tile),
            Err(_) => {
                tracing::debug!(session = %session.id, tile = %raw, "rejecting malformed tile key");
                None
            }
        })
        .collect();

    let fresh: Vec<TileKey> = {
        let mut subscribed = session.subscribed.write();
        let room = MAX_SUBSCRIBED_TILES.saturating_sub(subscribed.len());
        if parsed.len() > room {
            tracing::warn!(
                session = %session.id,
                requested = parsed.len(),
                room,
                "subscribe request exceeds per-session tile cap, dropping excess"
            );
        }
        parsed
            .into_iter()
            .filter(|tile| subscribed.insert(*tile))
            .take(room)
            .collect()
    };

    if fresh.is_empty() {
        return;
    }

    state.dispatcher.subscribe(session.id, &fresh);

    session.outbox.push(ServerMessage::Subscribed {
        tiles: fresh.iter().map(ToString::to_string).collect(),
        message: "subscribed".to_string(),
    });

    for tile in fresh {
        let vessels: Vec<VesselDto> = state
            .store
            .get_vessels_in_tile(tile)
            .iter()
            .map(VesselDto::from)
            .collect();
        if !vessels.is_empty() {
            session.outbox.push(ServerMessage::VesselUpdate {
                tile: tile.to_string(),
                vessels,
            });
        }
    }
}

fn unsubscribe(session: &Arc<Session>, state: &Arc<GatewayState>, requested: Vec<String>) {
    let removed: Vec<TileKey> = {
        let mut subscribed = session.subscribed.write();
        requested
            .iter()
            .filter_map(|raw| raw.parse::<TileKey>().ok())
            .filter(|tile| subscribed.remove(tile))
            .collect()
    };

    if removed.is_empty() {
        return;
    }

    state.dispatcher.unsubscribe(session.id, &removed);
    session.outbox.push(ServerMessage::Unsubscribed {
        tiles: removed.iter().map(ToString::to_string).collect(),
        message: "unsubscribed".to_string(),
    });
}
