pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::error::DeliveryError;

pub type ConnectionId = Uuid;

/// Outbound half of a live push connection.
pub trait PushSink: Send + Sync {
    fn send_text(&self, text: String) -> BoxFuture<'_, Result<(), Report<DeliveryError>>>;

    /// Close the underlying transport. Closing twice is a no-op.
    fn close(&self) -> BoxFuture<'_, ()>;
}

#[derive(Clone)]
struct Connection {
    id: ConnectionId,
    sink: Arc<dyn PushSink>,
}

/// One live push connection per user id.
///
/// The map lock is only held for lookups and swaps; every write and close
/// happens on a cloned sink after the lock is released.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `sink` as the connection of `user_id`, closing any previous one.
    pub async fn register(&self, user_id: &str, sink: Arc<dyn PushSink>) -> ConnectionId {
        let id = Uuid::new_v4();
        let replaced = self
            .connections
            .write()
            .insert(user_id.to_string(), Connection { id, sink });

        if let Some(old) = replaced {
            tracing::info!(user_id, old = %old.id, new = %id, "replacing push connection");
            old.sink.close().await;
        } else {
            tracing::info!(user_id, connection = %id, "push connection registered");
        }
        id
    }

    pub async fn unregister(&self, user_id: &str) {
        let removed = self.connections.write().remove(user_id);
        if let Some(conn) = removed {
            tracing::info!(user_id, connection = %conn.id, "push connection unregistered");
            conn.sink.close().await;
        }
    }

    /// Remove the entry for `user_id` only if it is still `connection_id`.
    ///
    /// Returns `false` when the user has since reconnected.
    pub fn release(&self, user_id: &str, connection_id: ConnectionId) -> bool {
        let mut connections = self.connections.write();
        match connections.get(user_id) {
            Some(conn) if conn.id == connection_id => {
                connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn send<T: Serialize>(
        &self,
        user_id: &str,
        message: &T,
    ) -> Result<(), Report<DeliveryError>> {
        let sink = self
            .connections
            .read()
            .get(user_id)
            .map(|conn| Arc::clone(&conn.sink))
            .ok_or_else(|| {
                Report::new(DeliveryError::NotConnected {
                    user_id: user_id.to_string(),
                })
            })?;

        let text = serde_json::to_string(message).change_context(DeliveryError::Serialize)?;
        sink.send_text(text).await
    }

    /// Write `message` to every live connection. Returns the number of
    /// successful deliveries.
    pub async fn broadcast<T: Serialize>(&self, message: &T) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize broadcast message");
                return 0;
            }
        };

        let targets: Vec<(String, Arc<dyn PushSink>)> = self
            .connections
            .read()
            .iter()
            .map(|(user_id, conn)| (user_id.clone(), Arc::clone(&conn.sink)))
            .collect();

        let mut delivered = 0;
        for (user_id, sink) in targets {
            match sink.send_text(text.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(error = ?e, user_id = %user_id, "broadcast delivery failed"),
            }
        }
        delivered
    }

    pub async fn close_all(&self) {
        let drained: Vec<Connection> = self.connections.write().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for conn in drained {
            conn.sink.close().await;
        }
        tracing::info!(closed = count, "all push connections closed");
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connections.read().contains_key(user_id)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc;

    use super::*;

    /// Sink that forwards every frame into a channel.
    pub struct ChannelSink {
        tx: mpsc::UnboundedSender<String>,
        closed: AtomicBool,
    }

    impl ChannelSink {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let sink = Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
            });
            (sink, rx)
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl PushSink for ChannelSink {
        fn send_text(&self, text: String) -> BoxFuture<'_, Result<(), Report<DeliveryError>>> {
            Box::pin(async move {
                self.tx.send(text).map_err(|_| {
                    Report::new(DeliveryError::Transport {
                        user_id: "test".into(),
                    })
                })
            })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.closed.store(true, Ordering::SeqCst);
            })
        }
    }

    /// Sink whose writes always fail.
    pub struct FailingSink;

    impl PushSink for FailingSink {
        fn send_text(&self, _text: String) -> BoxFuture<'_, Result<(), Report<DeliveryError>>> {
            Box::pin(async {
                Err(Report::new(DeliveryError::Transport {
                    user_id: "test".into(),
                }))
            })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ChannelSink, FailingSink};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_to_unknown_user_is_not_connected() {
        let registry = ConnectionRegistry::new();
        let err = registry.send("u-1", &json!({"a": 1})).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            DeliveryError::NotConnected { .. }
        ));
    }

    #[tokio::test]
    async fn send_writes_json_text() {
        let registry = ConnectionRegistry::new();
        let (sink, mut rx) = ChannelSink::new();
        registry.register("u-1", sink).await;

        registry.send("u-1", &json!({"price": 165.0})).await.unwrap();
        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["price"], 165.0);
    }

    #[tokio::test]
    async fn register_replaces_and_closes_previous() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = ChannelSink::new();
        let (second, mut second_rx) = ChannelSink::new();

        registry.register("u-1", first.clone()).await;
        registry.register("u-1", second.clone()).await;

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.len(), 1);

        registry.send("u-1", &"hello").await.unwrap();
        assert_eq!(second_rx.recv().await.unwrap(), "\"hello\"");
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_registration_leaves_one_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut sinks = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let (sink, _rx) = ChannelSink::new();
            sinks.push(Arc::clone(&sink));
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.register("u-1", sink).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len(), 1);
        let open = sinks.iter().filter(|s| !s.is_closed()).count();
        assert_eq!(open, 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (sink, _rx) = ChannelSink::new();
        registry.register("u-1", sink.clone()).await;

        registry.unregister("u-1").await;
        registry.unregister("u-1").await;

        assert!(sink.is_closed());
        assert!(!registry.is_connected("u-1"));
    }

    #[tokio::test]
    async fn release_ignores_stale_connection() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = ChannelSink::new();
        let (second, _rx2) = ChannelSink::new();

        let stale = registry.register("u-1", first).await;
        let current = registry.register("u-1", second).await;

        assert!(!registry.release("u-1", stale));
        assert!(registry.is_connected("u-1"));
        assert!(registry.release("u-1", current));
        assert!(!registry.is_connected("u-1"));
    }

    #[tokio::test]
    async fn transport_error_keeps_registration() {
        let registry = ConnectionRegistry::new();
        registry.register("u-1", Arc::new(FailingSink)).await;

        let err = registry.send("u-1", &"x").await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            DeliveryError::Transport { .. }
        ));
        assert!(registry.is_connected("u-1"));
    }

    #[tokio::test]
    async fn broadcast_continues_past_failures() {
        let registry = ConnectionRegistry::new();
        let (a, mut a_rx) = ChannelSink::new();
        let (b, mut b_rx) = ChannelSink::new();
        registry.register("a", a).await;
        registry.register("broken", Arc::new(FailingSink)).await;
        registry.register("b", b).await;

        let delivered = registry.broadcast(&json!({"kind": "notice"})).await;
        assert_eq!(delivered, 2);
        assert!(a_rx.recv().await.is_some());
        assert!(b_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = ChannelSink::new();
        let (b, _b_rx) = ChannelSink::new();
        registry.register("a", a.clone()).await;
        registry.register("b", b.clone()).await;

        registry.close_all().await;

        assert!(registry.is_empty());
        assert!(a.is_closed() && b.is_closed());
    }
}
