//! Process-wide registry of owned refs and the handlers for ref channels.

use super::owner::{IpcRef, PersistOptions, RefContext};
use crate::error::{Result, SlideError};
use crate::host::{ConnectionEvent, ConnectionEventKind, ConnectionId, ConnectionRegistry};
use crate::pubsub::ListenerHandle;
use crate::schema::Schema;
use crate::store::KeyValueStore;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Type-erased view of an [`IpcRef`] used by the channel handlers.
#[async_trait]
trait ErasedRef: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn schema_name(&self) -> String;
    fn register(&self, connection: ConnectionId) -> Result<()>;
    fn unregister(&self, connection: ConnectionId) -> Result<()>;
    fn encoded(&self) -> Result<Value>;
    fn submit_encoded(&self, raw: &Value) -> Result<()>;
    async fn close(&self);
}

#[async_trait]
impl<S: Schema> ErasedRef for IpcRef<S> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema_name(&self) -> String {
        self.schema().name().to_string()
    }

    fn register(&self, connection: ConnectionId) -> Result<()> {
        IpcRef::register(self, connection)
    }

    fn unregister(&self, connection: ConnectionId) -> Result<()> {
        IpcRef::unregister(self, connection)
    }

    fn encoded(&self) -> Result<Value> {
        IpcRef::encoded(self)
    }

    fn submit_encoded(&self, raw: &Value) -> Result<()> {
        IpcRef::submit_encoded(self, raw)
    }

    async fn close(&self) {
        IpcRef::close(self).await
    }
}

struct ServiceInner {
    refs: Mutex<HashMap<String, Arc<dyn ErasedRef>>>,
    ctx: RefContext,
}

/// Owns every ref in the process.
#[derive(Clone)]
pub struct IpcRefService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for IpcRefService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcRefService")
            .field("refs", &self.ids())
            .finish()
    }
}

impl IpcRefService {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        registry: ConnectionRegistry,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                refs: Mutex::new(HashMap::new()),
                ctx: RefContext {
                    store,
                    registry,
                    key_prefix: key_prefix.into(),
                },
            }),
        }
    }

    /// Create a ref, or return the existing one with the same id.
    ///
    /// Creating an id twice is not an error: the second caller gets the
    /// first instance and a warning is logged. Asking for a different value
    /// type than the existing ref fails with [`SlideError::RefTypeMismatch`].
    pub async fn create<S: Schema>(
        &self,
        id: &str,
        initial: S::Value,
        schema: S,
        persist: Option<PersistOptions>,
    ) -> Result<IpcRef<S>> {
        if let Some(existing) = self.lookup(id) {
            warn!("Ref {} already exists, returning existing instance", id);
            return downcast(id, existing.as_ref());
        }

        let created = IpcRef::create(id, initial, schema, persist, self.inner.ctx.clone()).await?;

        let existing = {
            let mut refs = self.lock_refs();
            match refs.get(id) {
                Some(existing) => Some(Arc::clone(existing)),
                None => {
                    refs.insert(id.to_string(), Arc::new(created.clone()));
                    None
                }
            }
        };
        match existing {
            Some(existing) => {
                // Lost a creation race; keep the winner.
                created.close().await;
                warn!("Ref {} already exists, returning existing instance", id);
                downcast(id, existing.as_ref())
            }
            None => {
                info!("Created ref {}", id);
                Ok(created)
            }
        }
    }

    /// Typed handle to an existing ref.
    pub fn get<S: Schema>(&self, id: &str) -> Result<IpcRef<S>> {
        let erased = self.lookup(id).ok_or_else(|| SlideError::RefNotFound {
            ref_id: id.to_string(),
        })?;
        downcast(id, erased.as_ref())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock_refs().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_refs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close and forget one ref.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.lock_refs().remove(id);
        match removed {
            Some(erased) => {
                erased.close().await;
                info!("Removed ref {}", id);
                true
            }
            None => false,
        }
    }

    /// Handle `ipcref:register`.
    pub fn register(&self, connection: ConnectionId, ref_id: &str) -> Result<()> {
        self.require(ref_id)?.register(connection)?;
        debug!("Connection {} registered for ref {}", connection, ref_id);
        Ok(())
    }

    /// Handle `ipcref:unregister`.
    pub fn unregister(&self, connection: ConnectionId, ref_id: &str) -> Result<()> {
        self.require(ref_id)?.unregister(connection)?;
        debug!("Connection {} unregistered from ref {}", connection, ref_id);
        Ok(())
    }

    /// Drop a connection from every fan-out set.
    pub fn unregister_connection(&self, connection: ConnectionId) {
        let refs: Vec<Arc<dyn ErasedRef>> = self.lock_refs().values().cloned().collect();
        for erased in &refs {
            // A closed ref has already dropped all of its observers.
            let _ = erased.unregister(connection);
        }
        debug!("Unregistered connection {} from {} refs", connection, refs.len());
    }

    /// Handle `ipcref:update`: decode through the schema, then queue the
    /// mutation. Returns without waiting for the ref's mutation lock.
    pub fn update_from_renderer(&self, ref_id: &str, raw: &Value) -> Result<()> {
        self.require(ref_id)?.submit_encoded(raw)
    }

    /// Handle `ipcref:get`: the encoded value, or `null` for unknown refs.
    pub fn get_encoded(&self, ref_id: &str) -> Value {
        match self.lookup(ref_id).map(|erased| erased.encoded()) {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                warn!("Failed to encode ref {}: {}", ref_id, e);
                Value::Null
            }
            None => Value::Null,
        }
    }

    /// Unregister connections from every ref as soon as they are destroyed.
    pub fn spawn_connection_cleanup(&self) -> ListenerHandle {
        let service = self.clone();
        self.inner
            .ctx
            .registry
            .lifecycle_bus()
            .listen_to(ConnectionEventKind::Destroyed, move |event| {
                let service = service.clone();
                async move {
                    if let ConnectionEvent::Destroyed(id) = event {
                        service.unregister_connection(id);
                    }
                    Ok(())
                }
            })
    }

    /// Close every ref.
    pub async fn shutdown(&self) {
        let refs: Vec<(String, Arc<dyn ErasedRef>)> = self.lock_refs().drain().collect();
        for (id, erased) in refs {
            erased.close().await;
            debug!("Closed ref {} on shutdown", id);
        }
    }

    fn lookup(&self, id: &str) -> Option<Arc<dyn ErasedRef>> {
        self.lock_refs().get(id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<dyn ErasedRef>> {
        self.lookup(id).ok_or_else(|| SlideError::RefNotFound {
            ref_id: id.to_string(),
        })
    }

    fn lock_refs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn ErasedRef>>> {
        self.inner
            .refs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn downcast<S: Schema>(id: &str, erased: &dyn ErasedRef) -> Result<IpcRef<S>> {
    erased
        .as_any()
        .downcast_ref::<IpcRef<S>>()
        .cloned()
        .ok_or_else(|| SlideError::RefTypeMismatch {
            ref_id: id.to_string(),
            existing: erased.schema_name(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SerdeSchema;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn service() -> (IpcRefService, ConnectionRegistry) {
        let (registry, _inbound) = ConnectionRegistry::new();
        let service = IpcRefService::new(Arc::new(MemoryStore::new()), registry.clone(), "ipcref");
        (service, registry)
    }

    #[tokio::test]
    async fn test_duplicate_create_returns_existing() {
        let (service, _registry) = service();
        let first = service
            .create("counter", 1i64, SerdeSchema::<i64>::new("Counter"), None)
            .await
            .unwrap();
        first.set(9).await.unwrap();

        let second = service
            .create("counter", 0i64, SerdeSchema::<i64>::new("Counter"), None)
            .await
            .unwrap();
        assert_eq!(second.get(), 9);
        assert_eq!(service.ids(), vec!["counter".to_string()]);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_reported() {
        let (service, _registry) = service();
        service
            .create("counter", 1i64, SerdeSchema::<i64>::new("Counter"), None)
            .await
            .unwrap();
        let err = service.get::<SerdeSchema<String>>("counter").unwrap_err();
        assert!(matches!(err, SlideError::RefTypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_get_encoded_unknown_is_null() {
        let (service, _registry) = service();
        assert_eq!(service.get_encoded("missing"), Value::Null);
    }

    #[tokio::test]
    async fn test_update_from_renderer_validates() {
        let (service, _registry) = service();
        let counter = service
            .create("counter", 1i64, SerdeSchema::<i64>::new("Counter"), None)
            .await
            .unwrap();

        assert!(service
            .update_from_renderer("counter", &json!("nope"))
            .is_err());
        assert!(service.update_from_renderer("missing", &json!(2)).is_err());
        assert_eq!(counter.get(), 1);

        service.update_from_renderer("counter", &json!(2)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.get() != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(service.get_encoded("counter"), json!(2));
    }

    #[tokio::test]
    async fn test_remove_closes_ref() {
        let (service, _registry) = service();
        let counter = service
            .create("counter", 1i64, SerdeSchema::<i64>::new("Counter"), None)
            .await
            .unwrap();
        assert!(service.remove("counter").await);
        assert!(!service.remove("counter").await);
        assert!(counter.is_closed());
        assert!(matches!(
            service.register(ConnectionId(1), "counter"),
            Err(SlideError::RefNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_destroyed_connection_is_unregistered_everywhere() {
        let (service, registry) = service();
        let _cleanup = service.spawn_connection_cleanup();
        let endpoint = registry.attach();
        let a = service
            .create("a", 0i64, SerdeSchema::<i64>::new("A"), None)
            .await
            .unwrap();
        let b = service
            .create("b", 0i64, SerdeSchema::<i64>::new("B"), None)
            .await
            .unwrap();
        service.register(endpoint.id(), "a").unwrap();
        service.register(endpoint.id(), "b").unwrap();
        a.flush().await.unwrap();
        b.flush().await.unwrap();

        registry.destroy(endpoint.id());
        tokio::time::timeout(Duration::from_secs(1), async {
            while !a.observers().is_empty() || !b.observers().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
