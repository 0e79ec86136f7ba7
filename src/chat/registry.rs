use std::{collections::HashMap, io, pin::Pin, sync::Arc};

use axum::extract::ws::Message;
use futures_util::{FutureExt, Sink, SinkExt};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ConnectionId = Uuid;

type Outbound = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// The write half of a live client connection.
pub struct Connection {
    id: ConnectionId,
    outbound: Mutex<Outbound>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Writes one message. Concurrent senders are serialized per connection.
    ///
    /// A write still pending when the connection is closed is abandoned, so a
    /// peer that stopped reading can't hold a broadcast hostage.
    pub async fn send(&self, message: Message) -> Result<(), axum::Error> {
        let write = async {
            let mut outbound = self.outbound.lock().await;
            outbound.send(message).await
        };

        tokio::select! {
            biased;
            result = write => result,
            _ = self.closed() => Err(axum::Error::new(io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed"))),
        }
    }

    /// Sends a close frame if it can go out right away. Skipped when another
    /// write holds the connection or the sink isn't ready.
    pub fn try_send_close(&self) -> bool {
        let Ok(mut outbound) = self.outbound.try_lock() else {
            return false;
        };
        matches!(outbound.send(Message::Close(None)).now_or_never(), Some(Ok(())))
    }

    /// Asks the connection's read loop to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The set of live connections.
///
/// Mutation takes the write lock and [`Registry::snapshot`] takes the read
/// lock, so a broadcast never observes a half-applied add or remove.
#[derive(Clone, Default)]
pub struct Registry {
    connections: Arc<RwLock<HashMap<ConnectionId, Arc<Connection>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a new connection under a fresh id. `cancel` is the token its
    /// read loop listens on.
    pub async fn add<S>(&self, outbound: S, cancel: CancellationToken) -> Arc<Connection>
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        let connection = Arc::new(Connection {
            id: Uuid::now_v7(),
            outbound: Mutex::new(Box::pin(outbound)),
            cancel,
        });

        self.connections
            .write()
            .await
            .insert(connection.id, connection.clone());

        connection
    }

    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(&id)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// The connections live right now. Later additions are not included.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Cancels the read loop of `id`, which then removes itself.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        match self.get(id).await {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::chat::testing::{channel_sink, stalled_sink};

    #[tokio::test]
    async fn add_assigns_distinct_ids() {
        let registry = Registry::new();
        let (a, _rx_a) = channel_sink();
        let (b, _rx_b) = channel_sink();

        let a = registry.add(a, CancellationToken::new()).await;
        let b = registry.add(b, CancellationToken::new()).await;

        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn remove_forgets_connection() {
        let registry = Registry::new();
        let (sink, _rx) = channel_sink();
        let connection = registry.add(sink, CancellationToken::new()).await;

        assert!(registry.remove(connection.id()).await.is_some());
        assert!(registry.remove(connection.id()).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn snapshot_excludes_later_additions() {
        let registry = Registry::new();
        let (a, _rx_a) = channel_sink();
        registry.add(a, CancellationToken::new()).await;

        let snapshot = registry.snapshot().await;
        let (b, _rx_b) = channel_sink();
        registry.add(b, CancellationToken::new()).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn disconnect_cancels_connection() {
        let registry = Registry::new();
        let (sink, _rx) = channel_sink();
        let connection = registry.add(sink, CancellationToken::new()).await;

        assert!(registry.disconnect(connection.id()).await);
        assert!(connection.is_closed());
        assert!(!registry.disconnect(Uuid::now_v7()).await);
    }

    #[tokio::test]
    async fn send_reaches_outbound() {
        let registry = Registry::new();
        let (sink, mut rx) = channel_sink();
        let connection = registry.add(sink, CancellationToken::new()).await;

        connection.send(Message::Text("ping".into())).await.unwrap();
        assert_eq!(rx.recv().await, Some(Message::Text("ping".into())));
    }

    #[tokio::test]
    async fn close_abandons_a_stuck_write() {
        let registry = Registry::new();
        let connection = registry.add(stalled_sink(), CancellationToken::new()).await;

        let writer = connection.clone();
        let write = tokio::spawn(async move { writer.send(Message::Text("stuck".into())).await });
        tokio::task::yield_now().await;

        connection.close();
        let result = tokio::time::timeout(Duration::from_secs(5), write).await.unwrap().unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn close_frame_is_skipped_while_a_write_is_stuck() {
        let registry = Registry::new();
        let connection = registry.add(stalled_sink(), CancellationToken::new()).await;

        let writer = connection.clone();
        let _write = tokio::spawn(async move { writer.send(Message::Text("stuck".into())).await });
        while connection.outbound.try_lock().is_ok() {
            tokio::task::yield_now().await;
        }

        assert!(!connection.try_send_close());
    }

    #[tokio::test]
    async fn close_frame_goes_out_when_idle() {
        let registry = Registry::new();
        let (sink, mut rx) = channel_sink();
        let connection = registry.add(sink, CancellationToken::new()).await;

        assert!(connection.try_send_close());
        assert_eq!(rx.recv().await, Some(Message::Close(None)));
    }
}
