//! Multiplexed request/response/streaming RPC over a dedicated port.
//!
//! The renderer opens a port pair and transfers one end to the main process
//! on `rpc:port`. From then on every frame for that connection flows over the
//! port: `Request`, `Ack` and `Interrupt` towards the server, `Chunk` and
//! `Exit` back.

pub mod frame;
mod router;
mod server;

pub use frame::{Cause, ClientFrame, ExitValue, RequestId, RpcDefect, ServerFrame};
pub use router::{HandlerFailure, Router, RpcProcedure};
pub use server::RpcServer;
