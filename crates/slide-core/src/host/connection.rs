//! Renderer connections and the registry that tracks them.
//!
//! Each attached renderer gets a numeric [`ConnectionId`]. The main process
//! holds a [`RendererConnection`] for pushing events; the renderer side holds
//! a [`RendererEndpoint`] for sending, invoking and transferring ports.

use crate::cancel::CancellationToken;
use crate::error::{Result, SlideError};
use crate::host::port::MessagePort;
use crate::pubsub::{PubSub, Subscription, Tagged};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Per-process identifier of a renderer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Main-to-renderer push on a named channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub channel: String,
    pub payload: Value,
}

/// Renderer-to-main traffic, tagged with the sending connection.
#[derive(Debug)]
pub enum InboundEvent {
    /// Fire-and-forget message.
    Send {
        sender: ConnectionId,
        channel: String,
        payload: Value,
    },
    /// Request expecting exactly one reply.
    Invoke {
        sender: ConnectionId,
        channel: String,
        payload: Value,
        reply: oneshot::Sender<Value>,
    },
    /// Transfer of one end of a port pair.
    PostPort {
        sender: ConnectionId,
        channel: String,
        port: MessagePort,
    },
}

impl InboundEvent {
    pub fn sender(&self) -> ConnectionId {
        match self {
            InboundEvent::Send { sender, .. }
            | InboundEvent::Invoke { sender, .. }
            | InboundEvent::PostPort { sender, .. } => *sender,
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            InboundEvent::Send { channel, .. }
            | InboundEvent::Invoke { channel, .. }
            | InboundEvent::PostPort { channel, .. } => channel,
        }
    }
}

/// Receiver the host dispatch loop consumes.
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundEvent>;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Attached(ConnectionId),
    Destroyed(ConnectionId),
}

/// Discriminant of [`ConnectionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Attached,
    Destroyed,
}

impl Tagged for ConnectionEvent {
    type Tag = ConnectionEventKind;

    fn tag(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::Attached(_) => ConnectionEventKind::Attached,
            ConnectionEvent::Destroyed(_) => ConnectionEventKind::Destroyed,
        }
    }
}

/// Main-process handle to one renderer.
#[derive(Debug)]
pub struct RendererConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    destroyed: CancellationToken,
}

impl RendererConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Push an event to the renderer.
    pub fn send(&self, channel: &str, payload: Value) -> Result<()> {
        if self.is_destroyed() {
            return Err(SlideError::ConnectionClosed {
                connection_id: self.id.0,
            });
        }
        self.outbound
            .send(OutboundEvent {
                channel: channel.to_string(),
                payload,
            })
            .map_err(|_| SlideError::ConnectionClosed {
                connection_id: self.id.0,
            })
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled() || self.outbound.is_closed()
    }

    /// Resolves when the renderer is destroyed.
    pub async fn destroyed(&self) {
        tokio::select! {
            _ = self.destroyed.cancelled() => {}
            _ = self.outbound.closed() => {}
        }
    }
}

/// Cloneable renderer-side sender towards the main process.
#[derive(Debug, Clone)]
pub struct RendererLink {
    id: ConnectionId,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    destroyed: CancellationToken,
}

impl RendererLink {
    pub(crate) fn new(
        id: ConnectionId,
        inbound: mpsc::UnboundedSender<InboundEvent>,
        destroyed: CancellationToken,
    ) -> Self {
        Self {
            id,
            inbound,
            destroyed,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn deliver(&self, event: InboundEvent) -> Result<()> {
        if self.destroyed.is_cancelled() {
            return Err(SlideError::ConnectionClosed {
                connection_id: self.id.0,
            });
        }
        self.inbound
            .send(event)
            .map_err(|_| SlideError::ConnectionClosed {
                connection_id: self.id.0,
            })
    }

    /// Fire-and-forget message to the main process.
    pub fn send(&self, channel: &str, payload: Value) -> Result<()> {
        self.deliver(InboundEvent::Send {
            sender: self.id,
            channel: channel.to_string(),
            payload,
        })
    }

    /// Request/response round trip to the main process.
    pub async fn invoke(&self, channel: &str, payload: Value) -> Result<Value> {
        let (reply, response) = oneshot::channel();
        self.deliver(InboundEvent::Invoke {
            sender: self.id,
            channel: channel.to_string(),
            payload,
            reply,
        })?;
        response.await.map_err(|_| SlideError::ConnectionClosed {
            connection_id: self.id.0,
        })
    }

    /// Transfer one end of a port pair to the main process.
    pub fn post_port(&self, channel: &str, port: MessagePort) -> Result<()> {
        self.deliver(InboundEvent::PostPort {
            sender: self.id,
            channel: channel.to_string(),
            port,
        })
    }

    /// Mark the renderer as destroyed.
    pub fn destroy(&self) {
        self.destroyed.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }
}

/// Renderer side of a connection: a link plus the incoming event queue.
#[derive(Debug)]
pub struct RendererEndpoint {
    link: RendererLink,
    events: mpsc::UnboundedReceiver<OutboundEvent>,
}

impl RendererEndpoint {
    pub(crate) fn new(link: RendererLink, events: mpsc::UnboundedReceiver<OutboundEvent>) -> Self {
        Self { link, events }
    }

    pub fn id(&self) -> ConnectionId {
        self.link.id
    }

    pub fn link(&self) -> &RendererLink {
        &self.link
    }

    /// Next event pushed by the main process.
    pub async fn next_event(&mut self) -> Option<OutboundEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<OutboundEvent> {
        self.events.try_recv().ok()
    }

    pub fn into_parts(self) -> (RendererLink, mpsc::UnboundedReceiver<OutboundEvent>) {
        (self.link, self.events)
    }

    pub fn destroy(&self) {
        self.link.destroy();
    }
}

struct RegistryInner {
    next_id: AtomicU32,
    connections: RwLock<HashMap<ConnectionId, Arc<RendererConnection>>>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    lifecycle: PubSub<ConnectionEvent>,
}

/// Tracks every attached renderer connection.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.ids())
            .finish()
    }
}

impl ConnectionRegistry {
    /// Create a registry and the receiver for all renderer-to-main traffic.
    pub fn new() -> (Self, InboundReceiver) {
        let (inbound, receiver) = mpsc::unbounded_channel();
        let registry = Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU32::new(1),
                connections: RwLock::new(HashMap::new()),
                inbound,
                lifecycle: PubSub::new("connections"),
            }),
        };
        (registry, receiver)
    }

    /// Attach a new renderer and return its endpoint.
    ///
    /// Must be called from within a Tokio runtime: a watcher task removes the
    /// connection as soon as its destroyed signal fires.
    pub fn attach(&self) -> RendererEndpoint {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbound, events) = mpsc::unbounded_channel();
        let destroyed = CancellationToken::new();
        let connection = Arc::new(RendererConnection {
            id,
            outbound,
            destroyed: destroyed.clone(),
        });

        self.write_connections().insert(id, Arc::clone(&connection));
        self.inner.lifecycle.publish(ConnectionEvent::Attached(id));
        info!("Renderer connection {} attached", id);

        let registry = self.clone();
        tokio::spawn(async move {
            connection.destroyed().await;
            registry.remove(id);
        });

        RendererEndpoint::new(
            RendererLink::new(id, self.inner.inbound.clone(), destroyed),
            events,
        )
    }

    /// Fire the destroyed signal for a connection and forget it.
    pub fn destroy(&self, id: ConnectionId) -> bool {
        let connection = self.get(id);
        if let Some(connection) = &connection {
            connection.destroyed.cancel();
        }
        self.remove(id)
    }

    fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.write_connections().remove(&id).is_some();
        if removed {
            self.inner.lifecycle.publish(ConnectionEvent::Destroyed(id));
            info!("Renderer connection {} destroyed", id);
        } else {
            debug!("Renderer connection {} already removed", id);
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<RendererConnection>> {
        self.read_connections().get(&id).cloned()
    }

    /// Every connection whose destroyed signal has not fired.
    pub fn live(&self) -> Vec<Arc<RendererConnection>> {
        let mut live: Vec<_> = self
            .read_connections()
            .values()
            .filter(|connection| !connection.is_destroyed())
            .cloned()
            .collect();
        live.sort_by_key(|connection| connection.id());
        live
    }

    /// Ids of every live connection, ascending.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.live().iter().map(|connection| connection.id()).collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some_and(|connection| !connection.is_destroyed())
    }

    /// Send to one connection, treating a destroyed connection as a no-op.
    pub fn send_to(&self, id: ConnectionId, channel: &str, payload: Value) -> Result<()> {
        match self.get(id) {
            Some(connection) => connection.send(channel, payload),
            None => Err(SlideError::ConnectionClosed { connection_id: id.0 }),
        }
    }

    /// Subscribe to attach/destroy notifications.
    pub fn lifecycle(&self) -> Subscription<ConnectionEvent> {
        self.inner.lifecycle.subscribe()
    }

    pub fn lifecycle_bus(&self) -> &PubSub<ConnectionEvent> {
        &self.inner.lifecycle
    }

    fn read_connections(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Arc<RendererConnection>>> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_connections(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<RendererConnection>>> {
        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_attach_assigns_increasing_ids() {
        let (registry, _inbound) = ConnectionRegistry::new();
        let a = registry.attach();
        let b = registry.attach();
        assert!(a.id() < b.id());
        assert_eq!(registry.ids(), vec![a.id(), b.id()]);
    }

    #[tokio::test]
    async fn test_send_reaches_endpoint() {
        let (registry, _inbound) = ConnectionRegistry::new();
        let mut endpoint = registry.attach();
        registry
            .send_to(endpoint.id(), "hello", json!({"n": 1}))
            .unwrap();
        let event = endpoint.next_event().await.unwrap();
        assert_eq!(event.channel, "hello");
        assert_eq!(event.payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_destroy_removes_connection_and_rejects_sends() {
        let (registry, _inbound) = ConnectionRegistry::new();
        let mut lifecycle = registry.lifecycle();
        let endpoint = registry.attach();
        let id = endpoint.id();
        let connection = registry.get(id).unwrap();

        assert!(registry.destroy(id));
        assert!(!registry.contains(id));
        assert!(registry.ids().is_empty());
        assert!(connection.send("x", json!(null)).is_err());
        assert!(endpoint.link().send("x", json!(null)).is_err());

        assert_eq!(lifecycle.recv().await, Some(ConnectionEvent::Attached(id)));
        assert_eq!(lifecycle.recv().await, Some(ConnectionEvent::Destroyed(id)));
    }

    #[tokio::test]
    async fn test_renderer_side_destroy_is_observed() {
        let (registry, _inbound) = ConnectionRegistry::new();
        let endpoint = registry.attach();
        let id = endpoint.id();
        endpoint.destroy();

        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.get(id).is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_link_traffic_is_tagged_with_sender() {
        let (registry, mut inbound) = ConnectionRegistry::new();
        let endpoint = registry.attach();
        endpoint.link().send("ping", json!(1)).unwrap();
        let event = inbound.recv().await.unwrap();
        assert_eq!(event.sender(), endpoint.id());
        assert_eq!(event.channel(), "ping");
    }
}
