//! Connection hub: outbound delivery to live sockets.
//!
//! DESIGN
//! ======
//! Each socket registers a bounded `mpsc` sender under its `ConnectionId`.
//! The hub only delivers to an explicit list of recipients; deciding who is
//! in a room and who to exclude belongs to the session layer.
//!
//! Delivery is best-effort `try_send` and never awaits, so a slow or dead
//! client cannot stall fan-out to its peers.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::event::{ConnectionId, ServerEvent};

#[derive(Default)]
pub struct ConnectionHub {
    clients: DashMap<ConnectionId, mpsc::Sender<ServerEvent>>,
}

impl ConnectionHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: ConnectionId, tx: mpsc::Sender<ServerEvent>) {
        self.clients.insert(connection_id, tx);
    }

    pub fn unregister(&self, connection_id: ConnectionId) {
        self.clients.remove(&connection_id);
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Deliver one event to one connection. Returns false if it was dropped.
    pub fn send(&self, to: ConnectionId, event: &ServerEvent) -> bool {
        let Some(tx) = self.clients.get(&to) else {
            return false;
        };
        match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %to, event = event.name(), "client queue full; dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(connection_id = %to, event = event.name(), "client queue closed; dropping event");
                false
            }
        }
    }

    /// Deliver one event to every listed connection. Returns the delivered count.
    pub fn send_many(&self, recipients: &[ConnectionId], event: &ServerEvent) -> usize {
        recipients
            .iter()
            .filter(|to| self.send(**to, event))
            .count()
    }
}
