use axum::extract::ws::Message;
use futures_util::{Sink, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{config::Config, db::{StoredMessage, Store}};

use super::{broadcast::{Broadcaster, Delivery}, envelope::Envelope, registry::{Connection, Registry}};

/// Why a connection's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ReadErrors,
    Cancelled,
}

/// Drives connections: reads envelopes, stores them and relays them to
/// everyone connected.
#[derive(Clone)]
pub struct Ingestor {
    store: Store,
    registry: Registry,
    broadcaster: Broadcaster,
    shutdown: CancellationToken,
    max_message_size: usize,
    read_error_limit: u32,
}

impl Ingestor {
    pub fn new(store: Store, registry: Registry, shutdown: CancellationToken, config: &Config) -> Self {
        Self {
            store,
            broadcaster: Broadcaster::new(registry.clone()),
            registry,
            shutdown,
            max_message_size: config.max_message_size,
            read_error_limit: config.read_error_limit.max(1),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Registers the connection, reads from it until it closes, is cancelled
    /// or keeps failing, then deregisters it.
    pub async fn serve<O, I>(&self, outbound: O, mut inbound: I) -> CloseReason
    where
        O: Sink<Message, Error = axum::Error> + Send + 'static,
        I: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let connection = self.registry.add(outbound, self.shutdown.child_token()).await;
        info!(connection = %connection.id(), "connection opened");

        let reason = self.read_loop(&connection, &mut inbound).await;

        self.registry.remove(connection.id()).await;
        if reason == CloseReason::Cancelled && !connection.try_send_close() {
            debug!(connection = %connection.id(), "skipped close frame");
        }

        info!(connection = %connection.id(), ?reason, "connection closed");
        reason
    }

    async fn read_loop<I>(&self, connection: &Connection, inbound: &mut I) -> CloseReason
    where
        I: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let mut read_errors = 0;

        loop {
            let frame = tokio::select! {
                _ = connection.closed() => return CloseReason::Cancelled,
                frame = inbound.next() => frame,
            };

            match frame {
                None | Some(Ok(Message::Close(_))) => return CloseReason::PeerClosed,
                Some(Ok(message)) => {
                    read_errors = 0;
                    let frame = match &message {
                        Message::Text(text) => text.as_str().as_bytes(),
                        Message::Binary(bytes) => &bytes[..],
                        _ => continue,
                    };

                    // a broadcast can wait on a slow peer; stay cancellable meanwhile
                    tokio::select! {
                        _ = connection.closed() => return CloseReason::Cancelled,
                        _ = self.ingest_frame(frame) => {}
                    }
                }
                Some(Err(e)) => {
                    read_errors += 1;
                    warn!(connection = %connection.id(), error = %e, read_errors, "error reading from connection");
                    if read_errors >= self.read_error_limit {
                        return CloseReason::ReadErrors;
                    }
                }
            }
        }
    }

    /// Handles one inbound frame. Returns `None` when the frame is not a valid
    /// envelope; nothing is stored or broadcast in that case.
    ///
    /// Persistence and broadcast are independent: a store failure is logged
    /// and the envelope is relayed anyway, just without `created_at`.
    pub async fn ingest_frame(&self, frame: &[u8]) -> Option<Delivery> {
        let mut envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "discarding malformed frame");
                return None;
            }
        };

        match self.persist(&envelope).await {
            Ok(stored) => {
                debug!(id = stored.id, author = %stored.author_id, "stored message");
                envelope.created_at = Some(stored.created_at);
            }
            Err(e) => error!(author = %envelope.user.id, error = %e, "failed to store message"),
        }

        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode envelope");
                return None;
            }
        };

        Some(self.broadcaster.broadcast(payload.into()).await)
    }

    async fn persist(&self, envelope: &Envelope) -> Result<StoredMessage, sqlx::Error> {
        match self.store.upsert_user(&envelope.user).await {
            Ok(true) => info!(user = %envelope.user.id, username = %envelope.user.username, "new user"),
            Ok(false) => {}
            Err(e) => error!(user = %envelope.user.id, error = %e, "failed to upsert user"),
        }

        self.store.insert_message(&envelope.user.id, &envelope.message).await
    }
}
