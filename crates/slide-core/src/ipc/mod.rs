//! Socket bridge for renderers running in another process.
//!
//! The server attaches every accepted socket to the host's connection
//! registry. The client side yields a normal renderer endpoint, including
//! transferable message ports.

mod client;
mod ports;
pub mod protocol;
mod server;

pub use client::IpcClient;
pub use protocol::WireFrame;
pub use server::{IpcServer, IpcServerHandle};
