use axum::extract::ws::{Message, Utf8Bytes};
use futures_util::future::join_all;
use tracing::{debug, warn};

use super::registry::Registry;

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Fans a payload out to every registered connection.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Registry,
}

impl Broadcaster {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Writes `payload` as a text frame to a snapshot of the registry.
    ///
    /// Writes run concurrently and the call returns once every one has been
    /// attempted. A failed write is logged and skipped; the connection stays
    /// registered until its own read loop ends.
    pub async fn broadcast(&self, payload: Utf8Bytes) -> Delivery {
        let targets = self.registry.snapshot().await;

        let writes = targets.iter().map(|connection| {
            let message = Message::Text(payload.clone());
            async move { (connection.id(), connection.send(message).await) }
        });

        let mut delivery = Delivery::default();
        for (id, result) in join_all(writes).await {
            match result {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    warn!(connection = %id, error = %e, "failed to write to connection");
                    delivery.failed += 1;
                }
            }
        }

        debug!(delivered = delivery.delivered, failed = delivery.failed, "broadcast");
        delivery
    }
}
