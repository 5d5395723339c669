//! Renderer-side glue: the session listener table, ref mirrors, bus access
//! and the RPC client.
//!
//! Everything here runs on top of a [`RendererEndpoint`], so the same code
//! serves an in-process renderer and one bridged over a socket.
//!
//! [`RendererEndpoint`]: crate::host::RendererEndpoint

mod pubsub;
mod refs;
mod rpc;
mod session;

pub use pubsub::RendererPubSub;
pub use refs::{RefMirror, RefSubscription};
pub use rpc::{RpcClient, RpcConnector, RpcStream, TypedRpcStream};
pub use session::{ChannelListener, RendererSession};

use crate::error::Result;
use crate::schema::Schema;

impl RendererSession {
    pub fn pubsub(&self) -> RendererPubSub<'_> {
        RendererPubSub::new(self)
    }

    /// RPC client negotiating its port over this session's link.
    pub fn rpc_client(&self) -> RpcClient {
        RpcClient::for_link(self.link().clone())
    }

    pub fn mirror<S: Schema>(&self, ref_id: &str, schema: S) -> Result<RefMirror<S>> {
        RefMirror::attach(self, ref_id, schema)
    }
}
