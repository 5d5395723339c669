//! Slide Core - typed cross-process IPC substrate for the Slide desktop app.
//!
//! The main process owns the authoritative state and serves renderers three
//! ways:
//!
//! - replicated refs ([`IpcRef`]) pushed to every registered observer,
//! - a tagged event bus ([`PubSub`]) bridged to every renderer,
//! - multiplexed RPC ([`RpcServer`]) over one dedicated port per renderer.
//!
//! Renderers use the types in [`client`], either in-process or through the
//! socket bridge in [`ipc`].
//!
//! # Example
//!
//! ```rust,ignore
//! use slide_core::{contract, SlideRuntime};
//!
//! #[tokio::main]
//! async fn main() -> slide_core::Result<()> {
//!     let runtime = SlideRuntime::builder().build().await?;
//!     let ready = runtime
//!         .refs()
//!         .create(
//!             contract::AppReadyRef::ID,
//!             contract::AppReadyState::initial(),
//!             contract::AppReadyRef::schema(),
//!             None,
//!         )
//!         .await?;
//!
//!     let renderer = runtime.connect_renderer();
//!     let mirror = renderer.mirror(contract::AppReadyRef::ID, contract::AppReadyRef::schema())?;
//!
//!     ready.set(contract::AppReadyState::ready()).await?;
//!     println!("ready: {}", mirror.get().await?.is_ready);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cancel;
pub mod client;
pub mod config;
pub mod contract;
pub mod error;
pub mod host;
pub mod ipc;
pub mod message;
pub mod project;
pub mod pubsub;
pub mod refs;
pub mod rpc;
pub mod schema;
pub mod store;

mod runtime;

// Re-export commonly used types
pub use agent::{spawn_agent_republisher, AgentEvent, AgentEventSource};
pub use cancel::{CancellationToken, CancelledError};
pub use client::{RefMirror, RendererPubSub, RendererSession, RpcClient, RpcStream};
pub use error::{Result, SlideError};
pub use host::{ConnectionId, ConnectionRegistry, IpcHost, RendererEndpoint, RendererLink};
pub use ipc::{IpcClient, IpcServer, IpcServerHandle};
pub use message::{Message, MessageSchema, MessageTag};
pub use project::{ProjectChange, ProjectWatcher};
pub use pubsub::{ListenerHandle, PubSub, Subscription};
pub use refs::{IpcRef, IpcRefService, PersistOptions};
pub use rpc::{RequestId, Router, RpcProcedure, RpcServer};
pub use schema::{Schema, SerdeSchema};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};

pub use runtime::{SlideRuntime, SlideRuntimeBuilder};
