use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Sender half of a connection's outbound queue. The ws writer task drains
/// the other half into the socket.
pub type OutboundSender = mpsc::UnboundedSender<String>;

struct Connection {
    user_id: String,
    tx: OutboundSender,
}

/// Live set of open chat channels, shared across handlers.
///
/// Fan-out snapshots the senders under the read lock and delivers after
/// releasing it, so register/unregister during a broadcast can't corrupt
/// iteration. A channel whose receiver is gone is simply skipped.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: &str, tx: OutboundSender) -> ConnectionId {
        let id = Uuid::now_v7();
        let mut live = self.inner.write().expect("registry lock poisoned");
        live.insert(
            id,
            Connection {
                user_id: user_id.to_owned(),
                tx,
            },
        );
        id
    }

    pub fn unregister(&self, id: ConnectionId) {
        let mut live = self.inner.write().expect("registry lock poisoned");
        live.remove(&id);
    }

    /// Drop every live channel, used on server shutdown. Each connection's
    /// writer sees its queue close and shuts the socket down.
    pub fn disconnect_all(&self) {
        let mut live = self.inner.write().expect("registry lock poisoned");
        live.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `payload` to every live channel. Returns the delivery count;
    /// closed channels are skipped, not errors.
    pub fn broadcast(&self, payload: &str) -> usize {
        let senders: Vec<OutboundSender> = {
            let live = self.inner.read().expect("registry lock poisoned");
            live.values().map(|c| c.tx.clone()).collect()
        };

        senders
            .iter()
            .filter(|tx| tx.send(payload.to_owned()).is_ok())
            .count()
    }

    /// Deliver `payload` only to channels belonging to the given users.
    /// Each connection receives at most one copy even if a user id repeats.
    pub fn send_to_users(&self, user_ids: &[&str], payload: &str) -> usize {
        let senders: Vec<OutboundSender> = {
            let live = self.inner.read().expect("registry lock poisoned");
            live.values()
                .filter(|c| user_ids.contains(&c.user_id.as_str()))
                .map(|c| c.tx.clone())
                .collect()
        };

        senders
            .iter()
            .filter(|tx| tx.send(payload.to_owned()).is_ok())
            .count()
    }
}
