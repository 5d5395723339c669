//! Owner side of a replicated ref.
//!
//! All mutations funnel through one path: the in-memory value is replaced
//! under the mutation lock and the encoded value is queued for the sync
//! worker. The worker persists each change and then fans it out to every
//! registered observer, strictly in queue order. Observer registration and
//! removal go through the same queue, so a new observer's catch-up push never
//! overtakes or duplicates a change and a removal always lands after the
//! registration it follows.
//!
//! Updates decoded from renderers are queued per ref and applied by a
//! dedicated task, so a long-running `update_effect` delays them without
//! stalling whoever received them. They apply in arrival order.

use crate::config::ChannelConfig;
use crate::error::{Result, SlideError};
use crate::host::{ConnectionId, ConnectionRegistry};
use crate::schema::Schema;
use crate::store::KeyValueStore;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Whether and where a ref is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOptions {
    pub persist: bool,
    /// Overrides the default `<prefix>-<refId>` key.
    pub key: Option<String>,
}

impl PersistOptions {
    pub fn persisted() -> Self {
        Self {
            persist: true,
            key: None,
        }
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            persist: true,
            key: Some(key.into()),
        }
    }

    pub fn store_key(&self, prefix: &str, ref_id: &str) -> String {
        self.key
            .clone()
            .unwrap_or_else(|| format!("{}-{}", prefix, ref_id))
    }
}

/// Services a ref needs from its owning process.
#[derive(Clone)]
pub struct RefContext {
    pub store: Arc<dyn KeyValueStore>,
    pub registry: ConnectionRegistry,
    pub key_prefix: String,
}

enum RefCommand {
    Changed(Value),
    Register(ConnectionId),
    Unregister(ConnectionId),
    Flush(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

type Observers = Arc<Mutex<BTreeSet<ConnectionId>>>;

struct RefInner<S: Schema> {
    id: String,
    schema: S,
    value: RwLock<S::Value>,
    mutation: tokio::sync::Mutex<()>,
    commands: mpsc::UnboundedSender<RefCommand>,
    remote: mpsc::UnboundedSender<S::Value>,
    observers: Observers,
    persist_key: Option<String>,
    closed: AtomicBool,
}

/// A named, typed cell owned by this process and replicated to observers.
pub struct IpcRef<S: Schema> {
    inner: Arc<RefInner<S>>,
}

impl<S: Schema> Clone for IpcRef<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Schema> fmt::Debug for IpcRef<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcRef")
            .field("id", &self.inner.id)
            .field("schema", &self.inner.schema.name())
            .field("persist_key", &self.inner.persist_key)
            .finish()
    }
}

impl<S: Schema> IpcRef<S> {
    /// Create a ref and start its sync worker.
    ///
    /// When persistence is enabled the stored value is decoded through
    /// `schema`; a missing or undecodable value leaves `initial` in place.
    pub async fn create(
        id: impl Into<String>,
        initial: S::Value,
        schema: S,
        persist: Option<PersistOptions>,
        ctx: RefContext,
    ) -> Result<Self> {
        let id = id.into();
        let persist_key = persist
            .filter(|options| options.persist)
            .map(|options| options.store_key(&ctx.key_prefix, &id));

        let mut value = initial;
        if let Some(key) = &persist_key {
            match ctx.store.get(key).await {
                Ok(Some(raw)) => match schema.decode(&raw) {
                    Ok(stored) => {
                        info!("Rehydrated ref {} from {}", id, key);
                        value = stored;
                    }
                    Err(e) => warn!(
                        "Stored value for ref {} failed to decode, using initial value: {}",
                        id, e
                    ),
                },
                Ok(None) => debug!("No stored value for ref {}", id),
                Err(e) => warn!("Failed to read stored value for ref {}: {}", id, e),
            }
        }

        let encoded = schema.encode(&value)?;
        let (commands, receiver) = mpsc::unbounded_channel();
        let observers: Observers = Arc::new(Mutex::new(BTreeSet::new()));

        let worker = SyncWorker {
            ref_id: id.clone(),
            channel: ChannelConfig::ref_sync_channel(&id),
            store: persist_key.clone().map(|key| (Arc::clone(&ctx.store), key)),
            registry: ctx.registry,
            observers: Arc::clone(&observers),
            latest: encoded,
        };
        tokio::spawn(worker.run(receiver));

        let (remote, updates) = mpsc::unbounded_channel();
        let inner = Arc::new(RefInner {
            id,
            schema,
            value: RwLock::new(value),
            mutation: tokio::sync::Mutex::new(()),
            commands,
            remote,
            observers,
            persist_key,
            closed: AtomicBool::new(false),
        });
        tokio::spawn(Self::apply_remote(Arc::downgrade(&inner), updates));

        Ok(Self { inner })
    }

    /// Apply queued renderer updates until the last handle is dropped.
    async fn apply_remote(
        owner: Weak<RefInner<S>>,
        mut updates: mpsc::UnboundedReceiver<S::Value>,
    ) {
        while let Some(value) = updates.recv().await {
            let Some(inner) = owner.upgrade() else {
                break;
            };
            let owned = Self { inner };
            if let Err(e) = owned.set(value).await {
                warn!("Dropped renderer update for ref {}: {}", owned.id(), e);
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn schema(&self) -> &S {
        &self.inner.schema
    }

    pub fn persist_key(&self) -> Option<&str> {
        self.inner.persist_key.as_deref()
    }

    /// Current value. Never waits on I/O.
    pub fn get(&self) -> S::Value {
        self.inner
            .value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the value.
    pub async fn set(&self, value: S::Value) -> Result<()> {
        self.update(move |_| value).await
    }

    /// Replace the value with `f(current)`.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&S::Value) -> S::Value,
    {
        let _guard = self.inner.mutation.lock().await;
        self.ensure_open()?;
        let next = f(&self.get());
        self.commit(next)
    }

    /// Replace the value with the outcome of an effectful computation.
    ///
    /// Other mutations wait until the effect completes. If the effect fails
    /// the value is left unchanged.
    pub async fn update_effect<F, Fut, E>(&self, f: F) -> std::result::Result<(), E>
    where
        F: FnOnce(S::Value) -> Fut,
        Fut: Future<Output = std::result::Result<S::Value, E>>,
        E: From<SlideError>,
    {
        let _guard = self.inner.mutation.lock().await;
        self.ensure_open()?;
        let next = f(self.get()).await?;
        self.commit(next)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SlideError::RefClosed {
                ref_id: self.inner.id.clone(),
            });
        }
        Ok(())
    }

    fn commit(&self, next: S::Value) -> Result<()> {
        let encoded = self.inner.schema.encode(&next)?;
        *self
            .inner
            .value
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;
        self.send(RefCommand::Changed(encoded))
    }

    fn send(&self, command: RefCommand) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| SlideError::RefClosed {
                ref_id: self.inner.id.clone(),
            })
    }

    /// Add an observer. It receives the current value, then every change.
    pub fn register(&self, connection: ConnectionId) -> Result<()> {
        self.ensure_open()?;
        self.send(RefCommand::Register(connection))
    }

    /// Remove an observer once every earlier command has been applied.
    pub fn unregister(&self, connection: ConnectionId) -> Result<()> {
        self.send(RefCommand::Unregister(connection))
    }

    /// Snapshot of the fan-out set.
    pub fn observers(&self) -> Vec<ConnectionId> {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Wait until every change queued so far has been persisted and broadcast.
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(RefCommand::Flush(done))?;
        wait.await.map_err(|_| SlideError::RefClosed {
            ref_id: self.inner.id.clone(),
        })
    }

    /// Stop broadcasting and unregister every observer.
    ///
    /// Changes queued before the call are still delivered.
    pub async fn close(&self) {
        let _guard = self.inner.mutation.lock().await;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (done, wait) = oneshot::channel();
        if self.send(RefCommand::Stop(done)).is_ok() {
            let _ = wait.await;
        }
        info!("Ref {} closed", self.inner.id);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Schema-encoded current value.
    pub fn encoded(&self) -> Result<Value> {
        self.inner.schema.encode(&self.get())
    }

    /// Decode a wire value and queue it for the mutation path.
    ///
    /// Decoding happens immediately, so an invalid value is rejected here and
    /// never queued. Queued values apply in submission order behind any
    /// mutation already in progress.
    pub fn submit_encoded(&self, raw: &Value) -> Result<()> {
        self.ensure_open()?;
        let value = self.inner.schema.decode(raw)?;
        self.inner
            .remote
            .send(value)
            .map_err(|_| SlideError::RefClosed {
                ref_id: self.inner.id.clone(),
            })
    }
}

struct SyncWorker {
    ref_id: String,
    channel: String,
    store: Option<(Arc<dyn KeyValueStore>, String)>,
    registry: ConnectionRegistry,
    observers: Observers,
    latest: Value,
}

impl SyncWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RefCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                RefCommand::Changed(value) => {
                    self.persist(&value).await;
                    self.broadcast(&value);
                    self.latest = value;
                }
                RefCommand::Register(connection) => {
                    let inserted = self
                        .observers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(connection);
                    if inserted {
                        debug!("Connection {} observing ref {}", connection, self.ref_id);
                    }
                    self.push(connection, self.latest.clone());
                }
                RefCommand::Unregister(connection) => {
                    let removed = self
                        .observers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&connection);
                    if removed {
                        debug!("Connection {} stopped observing ref {}", connection, self.ref_id);
                    }
                }
                RefCommand::Flush(done) => {
                    let _ = done.send(());
                }
                RefCommand::Stop(done) => {
                    self.observers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clear();
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!("Sync worker for ref {} stopped", self.ref_id);
    }

    async fn persist(&self, value: &Value) {
        if let Some((store, key)) = &self.store {
            if let Err(e) = store.set(key, value.clone()).await {
                error!("Failed to persist ref {} to {}: {}", self.ref_id, key, e);
            }
        }
    }

    fn broadcast(&self, value: &Value) {
        let observers: Vec<ConnectionId> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        for connection in observers {
            self.push(connection, value.clone());
        }
    }

    fn push(&self, connection: ConnectionId, value: Value) {
        let outcome = match self.registry.get(connection) {
            Some(target) if !target.is_destroyed() => target.send(&self.channel, value),
            _ => Err(SlideError::ConnectionClosed {
                connection_id: connection.0,
            }),
        };
        if let Err(e) = outcome {
            warn!(
                "Dropping observer {} of ref {}: {}",
                connection, self.ref_id, e
            );
            self.observers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&connection);
        }
    }
}
