//! Renderer session: dispatches main-process pushes to channel listeners.

use crate::host::{ConnectionId, OutboundEvent, RendererEndpoint, RendererLink};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Listener = Arc<dyn Fn(Value) + Send + Sync>;
type ListenerTable = Mutex<HashMap<String, Vec<(u64, Listener)>>>;

/// Live mirrors per ref id within one session.
///
/// The owner tracks observers per connection, so only the last mirror of a
/// ref may unregister the connection.
#[derive(Debug, Default)]
pub(crate) struct MirrorCounts {
    counts: Mutex<HashMap<String, usize>>,
}

impl MirrorCounts {
    pub(crate) fn retain(&self, ref_id: &str) -> usize {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(ref_id.to_string()).or_default();
        *count += 1;
        *count
    }

    /// Returns `true` when the released mirror was the last one.
    pub(crate) fn release(&self, ref_id: &str) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        match counts.get_mut(ref_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counts.remove(ref_id);
                true
            }
            None => true,
        }
    }

    pub(crate) fn get(&self, ref_id: &str) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ref_id)
            .copied()
            .unwrap_or(0)
    }
}

/// The renderer half of a connection plus its listener table.
///
/// Events are dispatched one at a time in arrival order, so listeners on one
/// channel observe pushes exactly in the order the main process sent them.
pub struct RendererSession {
    link: RendererLink,
    listeners: Arc<ListenerTable>,
    mirrors: Arc<MirrorCounts>,
    next_id: AtomicU64,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for RendererSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererSession")
            .field("id", &self.link.id())
            .finish()
    }
}

impl RendererSession {
    /// Start dispatching events from `endpoint`.
    pub fn new(endpoint: RendererEndpoint) -> Self {
        let (link, events) = endpoint.into_parts();
        let listeners: Arc<ListenerTable> = Arc::new(Mutex::new(HashMap::new()));
        let pump = tokio::spawn(pump_events(link.id(), events, Arc::clone(&listeners)));
        Self {
            link,
            listeners,
            mirrors: Arc::default(),
            next_id: AtomicU64::new(1),
            pump,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.link.id()
    }

    pub fn link(&self) -> &RendererLink {
        &self.link
    }

    pub(crate) fn mirrors(&self) -> &Arc<MirrorCounts> {
        &self.mirrors
    }

    /// Number of live mirrors of `ref_id` in this session.
    pub fn mirror_count(&self, ref_id: &str) -> usize {
        self.mirrors.get(ref_id)
    }

    /// Listen on a channel until the returned handle is dropped.
    ///
    /// Listeners run on the dispatch task and must not block.
    pub fn on<F>(&self, channel: &str, listener: F) -> ChannelListener
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        ChannelListener {
            id,
            channel: channel.to_string(),
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Tear the session down: signal destruction and stop dispatching.
    pub fn close(&self) {
        self.link.destroy();
        self.pump.abort();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for RendererSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump_events(
    id: ConnectionId,
    mut events: mpsc::UnboundedReceiver<OutboundEvent>,
    listeners: Arc<ListenerTable>,
) {
    while let Some(event) = events.recv().await {
        let targets: Vec<Listener> = listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.channel)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        if targets.is_empty() {
            debug!("No listener on {} for renderer {}", event.channel, id);
        }
        for listener in targets {
            let payload = event.payload.clone();
            if catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
                error!("Listener on {} panicked in renderer {}", event.channel, id);
            }
        }
    }
    debug!("Event pump for renderer {} stopped", id);
}

/// Registration of one channel listener; dropping it removes the listener.
#[derive(Debug)]
pub struct ChannelListener {
    id: u64,
    channel: String,
    listeners: Weak<ListenerTable>,
}

impl ChannelListener {
    pub fn remove(self) {}
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let mut table = listeners.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entries) = table.get_mut(&self.channel) {
                entries.retain(|(id, _)| *id != self.id);
                if entries.is_empty() {
                    table.remove(&self.channel);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ConnectionRegistry;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_listener_receives_and_detaches() {
        let (registry, _inbound) = ConnectionRegistry::new();
        let session = RendererSession::new(registry.attach());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = session.on("greeting", move |payload| {
            let _ = tx.send(payload);
        });

        registry.send_to(session.id(), "greeting", json!("hi")).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(json!("hi")));

        assert_eq!(session.listener_count("greeting"), 1);
        listener.remove();
        assert_eq!(session.listener_count("greeting"), 0);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_dispatch() {
        let (registry, _inbound) = ConnectionRegistry::new();
        let session = RendererSession::new(registry.attach());
        let _bad = session.on("x", |_| panic!("listener bug"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _good = session.on("x", move |payload| {
            let _ = tx.send(payload);
        });

        registry.send_to(session.id(), "x", json!(1)).unwrap();
        registry.send_to(session.id(), "x", json!(2)).unwrap();
        assert_eq!(rx.recv().await, Some(json!(1)));
        assert_eq!(rx.recv().await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_close_destroys_connection() {
        let (registry, _inbound) = ConnectionRegistry::new();
        let session = RendererSession::new(registry.attach());
        let id = session.id();
        session.close();
        assert!(session.link().send("x", json!(null)).is_err());
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.contains(id) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
