//! Per-session bounded outbound queue.
//!
//! Writes to one downstream connection are serialized through this queue so
//! the session's writer task is the only thing touching the socket. Under
//! overflow the oldest pending `vessel_update` is dropped to make room;
//! `connected`/`subscribed`/`unsubscribed` frames are never dropped, since
//! losing one of those would desync the client's view of its own
//! subscriptions.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::ServerMessage;

struct Inner {
    queue: VecDeque<ServerMessage>,
    closed: bool,
}

#[derive(Clone)]
pub struct Outbox {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    cap: usize,
}

impl Outbox {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
            cap,
        }
    }

    /// Enqueues `msg`. Control messages are always accepted; a droppable
    /// message pushed onto a full queue evicts the oldest droppable entry
    /// first. Returns `false` if the outbox is closed.
    pub fn push(&self, msg: ServerMessage) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        if !msg.is_control() && inner.queue.len() >= self.cap {
            if let Some(pos) = inner.queue.iter().position(|m| !m.is_control()) {
                inner.queue.remove(pos);
                crate::metrics::outbox_dropped();
            }
        }
        inner.queue.push_back(msg);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Waits for and removes the next message, or returns `None` once the
    /// outbox is closed and drained.
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(msg) = inner.queue.pop_front() {
                    return Some(msg);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vessel_update(tile: &str) -> ServerMessage {
        ServerMessage::VesselUpdate {
            tile: tile.to_string(),
            vessels: vec![],
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_droppable_message() {
        let outbox = Outbox::new(2);
        assert!(outbox.push(vessel_update("12/0/0")));
        assert!(outbox.push(vessel_update("12/0/1")));
        assert!(outbox.push(vessel_update("12/0/2")));

        let first = outbox.pop().await.unwrap();
        match first {
            ServerMessage::VesselUpdate { tile, .. } => assert_eq!(tile, "12/0/1"),
            _ => panic!("expected vessel_update"),
        }
    }

    #[tokio::test]
    async fn control_messages_are_never_dropped() {
        let outbox = Outbox::new(1);
        assert!(outbox.push(ServerMessage::Connected {
            client_id: "a".into(),
            message: "hi".into(),
        }));
        assert!(outbox.push(vessel_update("12/0/0")));
        assert!(outbox.push(ServerMessage::Subscribed {
            tiles: vec!["12/0/0".into()],
            message: "ok".into(),
        }));

        assert_eq!(outbox.len(), 3);
    }

    #[tokio::test]
    async fn closed_outbox_stops_accepting_and_draining() {
        let outbox = Outbox::new(4);
        outbox.push(vessel_update("12/0/0"));
        outbox.close();
        assert!(!outbox.push(vessel_update("12/0/1")));
        assert!(outbox.pop().await.is_some());
        assert!(outbox.pop().await.is_none());
    }
}
