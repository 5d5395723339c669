//! TCP server exposing the host's IPC surface to out-of-process renderers.
//!
//! Each accepted socket is attached to the [`ConnectionRegistry`] as one
//! renderer connection. Closing the socket fires that connection's destroyed
//! signal, so ref observers and RPC ports are cleaned up exactly as for an
//! in-process renderer.

use super::ports::BridgedPorts;
use super::protocol::{read_wire_frame, write_frames, WireFrame};
use crate::config::RpcConfig;
use crate::error::Result;
use crate::host::port;
use crate::host::ConnectionRegistry;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running bridge server. Dropping shuts down the server.
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl IpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and close every bridged renderer.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Bridge server for renderer connections.
pub struct IpcServer;

impl IpcServer {
    /// Listen on `addr`; port 0 picks a free port.
    pub async fn start(addr: SocketAddr, registry: ConnectionRegistry) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("IPC bridge listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            registry,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(IpcServerHandle {
            addr,
            port,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        registry: ConnectionRegistry,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("IPC bridge shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= RpcConfig::MAX_IPC_CONNECTIONS {
                                warn!(
                                    "Rejecting bridge connection from {}: at max capacity ({})",
                                    peer_addr,
                                    RpcConfig::MAX_IPC_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let registry = registry.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Bridge connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, registry, conn_shutdown).await {
                                    debug!("Bridge connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Bridge accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        registry: ConnectionRegistry,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let (link, mut events) = registry.attach().into_parts();
        let id = link.id();

        let (frames, frame_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_frames(writer, frame_rx));
        let _ = frames.send(WireFrame::Hello { connection_id: id });

        let event_frames = frames.clone();
        let event_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let frame = WireFrame::Event {
                    channel: event.channel,
                    payload: event.payload,
                };
                if event_frames.send(frame).is_err() {
                    break;
                }
            }
        });

        let ports = BridgedPorts::new(frames.clone());
        let result = loop {
            let frame = tokio::select! {
                result = read_wire_frame(&mut reader) => match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                _ = shutdown_rx.changed() => break Ok(()),
            };

            match frame {
                WireFrame::Send { channel, payload } => {
                    if let Err(e) = link.send(&channel, payload) {
                        warn!("Bridged send on {} from {} failed: {}", channel, id, e);
                    }
                }
                WireFrame::Invoke {
                    invoke_id,
                    channel,
                    payload,
                } => {
                    let link = link.clone();
                    let frames = frames.clone();
                    tokio::spawn(async move {
                        let payload = link.invoke(&channel, payload).await.unwrap_or_else(|e| {
                            debug!("Bridged invoke on {} failed: {}", channel, e);
                            Value::Null
                        });
                        let _ = frames.send(WireFrame::Reply { invoke_id, payload });
                    });
                }
                WireFrame::PortOpen { port_id, channel } => {
                    let (local, remote) = port::channel();
                    match link.post_port(&channel, remote) {
                        Ok(()) => ports.bind(port_id, local),
                        Err(e) => {
                            warn!("Bridged port on {} from {} refused: {}", channel, id, e);
                            let _ = frames.send(WireFrame::PortClose { port_id });
                        }
                    }
                }
                WireFrame::PortMessage { port_id, message } => ports.deliver(port_id, message),
                WireFrame::PortClose { port_id } => ports.close(port_id),
                other => warn!("Unexpected {} frame from bridged renderer {}", other.kind(), id),
            }
        };

        info!("Bridged renderer {} disconnected", id);
        link.destroy();
        ports.close_all();
        event_task.abort();
        writer_task.abort();
        result
    }
}
