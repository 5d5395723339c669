//! Renderer-side mirror of a main-process ref.
//!
//! The mirror never writes its own value. `set` and `update` are forwarded to
//! the owner and the mirrored value only changes when the owner's broadcast
//! comes back on the ref's sync channel.

use super::session::{ChannelListener, MirrorCounts, RendererSession};
use crate::config::ChannelConfig;
use crate::error::{Result, SlideError};
use crate::host::RendererLink;
use crate::refs::RefMessage;
use crate::schema::Schema;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

type Callback<V> = Arc<dyn Fn(&V) + Send + Sync>;

struct MirrorShared<S: Schema> {
    ref_id: String,
    schema: S,
    // Lock order: subscribers, then current.
    subscribers: Mutex<Vec<(u64, Callback<S::Value>)>>,
    current: Mutex<Option<S::Value>>,
    next_id: AtomicU64,
}

impl<S: Schema> MirrorShared<S> {
    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<(u64, Callback<S::Value>)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<S::Value>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_sync(&self, raw: &Value) {
        let value = match self.schema.decode(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("Discarding undecodable sync for ref {}: {}", self.ref_id, e);
                return;
            }
        };
        // Callbacks run on a snapshot so they may drop their own subscription.
        let callbacks: Vec<Callback<S::Value>> = {
            let subscribers = self.lock_subscribers();
            *self.lock_current() = Some(value.clone());
            subscribers
                .iter()
                .map(|(_, callback)| Arc::clone(callback))
                .collect()
        };
        for callback in callbacks {
            callback(&value);
        }
    }
}

/// A renderer's view of one ref.
pub struct RefMirror<S: Schema> {
    shared: Arc<MirrorShared<S>>,
    link: RendererLink,
    counts: Arc<MirrorCounts>,
    _sync: ChannelListener,
}

impl<S: Schema> fmt::Debug for RefMirror<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefMirror")
            .field("ref_id", &self.shared.ref_id)
            .field("schema", &self.shared.schema.name())
            .finish()
    }
}

impl<S: Schema> RefMirror<S> {
    /// Start mirroring `ref_id` and register with its owner.
    ///
    /// The owner answers the registration with its current value, so the
    /// mirror catches up without waiting for the next mutation. Several
    /// mirrors of one ref may share a session; the connection stays
    /// registered until the last of them is dropped.
    pub fn attach(session: &RendererSession, ref_id: &str, schema: S) -> Result<Self> {
        let shared = Arc::new(MirrorShared {
            ref_id: ref_id.to_string(),
            schema,
            subscribers: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });

        let listener_shared = Arc::clone(&shared);
        let sync = session.on(&ChannelConfig::ref_sync_channel(ref_id), move |raw| {
            listener_shared.apply_sync(&raw)
        });

        let link = session.link().clone();
        link.send(
            ChannelConfig::REF_REGISTER,
            serde_json::to_value(RefMessage::id(ref_id))?,
        )?;
        let counts = Arc::clone(session.mirrors());
        let live = counts.retain(ref_id);
        debug!(
            "Mirroring ref {} in renderer {} ({} live)",
            ref_id,
            link.id(),
            live
        );

        Ok(Self {
            shared,
            link,
            counts,
            _sync: sync,
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.ref_id
    }

    /// Last value received from the owner, if any has arrived yet.
    pub fn current(&self) -> Option<S::Value> {
        self.shared.lock_current().clone()
    }

    /// Fetch the owner's value.
    pub async fn get(&self) -> Result<S::Value> {
        let raw = self
            .link
            .invoke(
                ChannelConfig::REF_GET,
                serde_json::to_value(RefMessage::id(self.id()))?,
            )
            .await?;
        if raw.is_null() {
            return Err(SlideError::RefNotFound {
                ref_id: self.id().to_string(),
            });
        }
        self.shared.schema.decode(&raw)
    }

    /// Ask the owner to replace its value.
    pub fn set(&self, value: &S::Value) -> Result<()> {
        let encoded = self.shared.schema.encode(value)?;
        self.link.send(
            ChannelConfig::REF_UPDATE,
            serde_json::to_value(RefMessage::with_value(self.id(), encoded))?,
        )
    }

    /// Read the owner's value, transform it and send it back.
    ///
    /// Concurrent writers race: the last write to reach the owner wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&S::Value) -> S::Value,
    {
        let value = self.get().await?;
        self.set(&f(&value))
    }

    /// Call `callback` with the current value, then with every change.
    ///
    /// Callbacks run on the session's dispatch task and must not subscribe
    /// to the same mirror from inside the callback.
    pub fn subscribe<F>(&self, callback: F) -> RefSubscription<S>
    where
        F: Fn(&S::Value) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback<S::Value> = Arc::new(callback);
        {
            let mut subscribers = self.shared.lock_subscribers();
            if let Some(value) = self.shared.lock_current().clone() {
                callback(&value);
            }
            subscribers.push((id, callback));
        }
        RefSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock_subscribers().len()
    }
}

impl<S: Schema> Drop for RefMirror<S> {
    fn drop(&mut self) {
        if !self.counts.release(self.id()) {
            return;
        }
        let message = serde_json::to_value(RefMessage::id(self.id())).unwrap_or(Value::Null);
        if let Err(e) = self.link.send(ChannelConfig::REF_UNREGISTER, message) {
            debug!("Unregister for ref {} not sent: {}", self.shared.ref_id, e);
        }
    }
}

/// Active mirror subscription; dropping it unsubscribes.
pub struct RefSubscription<S: Schema> {
    id: u64,
    shared: Weak<MirrorShared<S>>,
}

impl<S: Schema> RefSubscription<S> {
    pub fn unsubscribe(self) {}
}

impl<S: Schema> fmt::Debug for RefSubscription<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefSubscription").field("id", &self.id).finish()
    }
}

impl<S: Schema> Drop for RefSubscription<S> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.lock_subscribers().retain(|(id, _)| *id != self.id);
        }
    }
}
