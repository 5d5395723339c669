//! Assembly of the main-process side: registry, refs, bus, RPC server and the
//! background tasks tying them together.

use crate::client::RendererSession;
use crate::config::StoreConfig;
use crate::error::{Result, SlideError};
use crate::host::{ConnectionRegistry, IpcHost, RendererEndpoint};
use crate::ipc::{IpcServer, IpcServerHandle};
use crate::message::{Message, MessageTag};
use crate::pubsub::{ListenerHandle, PubSub, RendererBroadcaster};
use crate::refs::IpcRefService;
use crate::rpc::{Router, RpcServer};
use crate::store::{KeyValueStore, MemoryStore};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Builder for [`SlideRuntime`].
///
/// # Example
///
/// ```rust,ignore
/// use slide_core::{contract, SlideRuntime};
///
/// let mut router = Router::new();
/// router.unary::<contract::Sum, _, _>(|p| async move { Ok(p.a + p.b) })?;
///
/// let runtime = SlideRuntime::builder()
///     .with_router(router)
///     .declared_procedures(contract::PROCEDURES)
///     .build()
///     .await?;
/// ```
pub struct SlideRuntimeBuilder {
    store: Option<Arc<dyn KeyValueStore>>,
    router: Router,
    declared: Option<&'static [&'static str]>,
    key_prefix: String,
    broadcast: bool,
}

impl Default for SlideRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlideRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            router: Router::new(),
            declared: None,
            key_prefix: StoreConfig::DEFAULT_KEY_PREFIX.to_string(),
            broadcast: true,
        }
    }

    /// Persistence backend for refs.
    ///
    /// Default: an in-memory store.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Procedure names the router must serve exactly.
    ///
    /// When set, `build` fails if the router has a missing or extra handler.
    pub fn declared_procedures(mut self, declared: &'static [&'static str]) -> Self {
        self.declared = Some(declared);
        self
    }

    /// Prefix of default persist keys.
    ///
    /// Default: `ipcref`
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Forward every bus message to every live renderer.
    ///
    /// Default: `true`
    pub fn broadcast_to_renderers(mut self, enable: bool) -> Self {
        self.broadcast = enable;
        self
    }

    /// Validate the tables and start the background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn build(self) -> Result<SlideRuntime> {
        MessageTag::check_table()?;
        if let Some(declared) = self.declared {
            self.router.check_complete(declared)?;
        }
        if self.key_prefix.is_empty() {
            return Err(SlideError::Config {
                message: "key prefix must not be empty".to_string(),
            });
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let (registry, inbound) = ConnectionRegistry::new();
        let refs = IpcRefService::new(store, registry.clone(), self.key_prefix);
        let bus: PubSub<Message> = PubSub::messages("messages");
        let rpc = RpcServer::new(self.router);
        info!(
            "Serving {} RPC procedure(s): {:?}",
            rpc.router().names().len(),
            rpc.router().names()
        );

        let host = IpcHost::new(registry.clone(), refs.clone(), bus.clone(), rpc.clone());
        let dispatcher = tokio::spawn(host.run(inbound));
        let mut listeners = vec![refs.spawn_connection_cleanup()];
        if self.broadcast {
            listeners.push(RendererBroadcaster::spawn(&bus, registry.clone()));
        }

        Ok(SlideRuntime {
            registry,
            refs,
            bus,
            rpc,
            dispatcher,
            listeners,
            ipc_server: Mutex::new(None),
        })
    }
}

/// The running main-process side of the IPC substrate.
pub struct SlideRuntime {
    registry: ConnectionRegistry,
    refs: IpcRefService,
    bus: PubSub<Message>,
    rpc: RpcServer,
    dispatcher: JoinHandle<()>,
    listeners: Vec<ListenerHandle>,
    ipc_server: Mutex<Option<IpcServerHandle>>,
}

impl std::fmt::Debug for SlideRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlideRuntime")
            .field("registry", &self.registry)
            .field("refs", &self.refs)
            .field("rpc", &self.rpc)
            .finish()
    }
}

impl SlideRuntime {
    pub fn builder() -> SlideRuntimeBuilder {
        SlideRuntimeBuilder::new()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn refs(&self) -> &IpcRefService {
        &self.refs
    }

    pub fn bus(&self) -> &PubSub<Message> {
        &self.bus
    }

    pub fn rpc(&self) -> &RpcServer {
        &self.rpc
    }

    /// Attach an in-process renderer.
    pub fn attach(&self) -> RendererEndpoint {
        self.registry.attach()
    }

    /// Attach an in-process renderer with its session already running.
    pub fn connect_renderer(&self) -> RendererSession {
        RendererSession::new(self.registry.attach())
    }

    /// Serve out-of-process renderers on `addr`. Port 0 picks a free port.
    pub async fn start_ipc_server(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let handle = IpcServer::start(addr, self.registry.clone()).await?;
        let bound = handle.addr();
        let previous = self
            .ipc_server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if previous.is_some() {
            info!("Replaced running IPC server");
        }
        info!("IPC server started on {}", bound);
        Ok(bound)
    }

    pub fn ipc_addr(&self) -> Option<SocketAddr> {
        self.ipc_server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(IpcServerHandle::addr)
    }

    /// Stop serving and release every resource.
    ///
    /// Renderer connections are destroyed, every ref is closed and the bus
    /// stops accepting messages.
    pub async fn shutdown(self) {
        let server = self
            .ipc_server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut server) = server {
            server.shutdown();
        }

        self.rpc.shutdown();
        for id in self.registry.ids() {
            self.registry.destroy(id);
        }
        self.refs.shutdown().await;
        self.bus.shutdown();
        for listener in &self.listeners {
            listener.stop();
        }
        self.dispatcher.abort();
        debug!("Runtime background tasks stopped");
        info!("Slide runtime shut down");
    }
}
