//! Renderer side of the socket bridge.
//!
//! [`IpcClient::connect`] returns an ordinary [`RendererEndpoint`], so ref
//! mirrors, the renderer bus and the RPC client run unchanged over TCP.

use super::ports::BridgedPorts;
use super::protocol::{read_wire_frame, write_frames, FrameSender, WireFrame};
use crate::cancel::CancellationToken;
use crate::config::RpcConfig;
use crate::error::{Result, SlideError};
use crate::host::{InboundEvent, OutboundEvent, RendererEndpoint, RendererLink};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type PendingInvokes = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// Connects out-of-process renderers to an [`IpcServer`](super::IpcServer).
pub struct IpcClient;

impl IpcClient {
    /// Connect and wait for the server to assign a connection id.
    ///
    /// Uses the configured connection timeout from `RpcConfig`.
    pub async fn connect(addr: SocketAddr) -> Result<RendererEndpoint> {
        let stream = tokio::time::timeout(RpcConfig::IPC_CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| SlideError::ClientConnect {
                message: format!("timed out connecting to {}", addr),
            })?
            .map_err(|e| SlideError::ClientConnect {
                message: format!("failed to connect to {}: {}", addr, e),
            })?;

        let (mut reader, writer) = stream.into_split();
        let id = match read_wire_frame(&mut reader).await? {
            Some(WireFrame::Hello { connection_id }) => connection_id,
            Some(other) => {
                return Err(SlideError::Protocol {
                    message: format!("expected hello, got {}", other.kind()),
                })
            }
            None => {
                return Err(SlideError::ClientConnect {
                    message: format!("{} closed before hello", addr),
                })
            }
        };
        debug!("Bridge client connected to {} as renderer {}", addr, id);

        let (frames, frame_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_frames(writer, frame_rx));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let destroyed = CancellationToken::new();
        let ports = BridgedPorts::new(frames.clone());
        let invokes: PendingInvokes = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(forward_inbound(
            inbound_rx,
            frames,
            ports.clone(),
            Arc::clone(&invokes),
            destroyed.clone(),
        ));
        tokio::spawn(read_server(
            reader,
            events_tx,
            ports,
            invokes,
            destroyed.clone(),
            writer_task,
        ));

        Ok(RendererEndpoint::new(
            RendererLink::new(id, inbound_tx, destroyed),
            events_rx,
        ))
    }
}

async fn forward_inbound(
    mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
    frames: FrameSender,
    ports: BridgedPorts,
    invokes: PendingInvokes,
    destroyed: CancellationToken,
) {
    let next_invoke = AtomicU64::new(1);
    let next_port = AtomicU64::new(1);
    loop {
        let event = tokio::select! {
            _ = destroyed.cancelled() => break,
            event = inbound.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let frame = match event {
            InboundEvent::Send {
                channel, payload, ..
            } => WireFrame::Send { channel, payload },
            InboundEvent::Invoke {
                channel,
                payload,
                reply,
                ..
            } => {
                let invoke_id = next_invoke.fetch_add(1, Ordering::Relaxed);
                let mut pending = invokes.lock().unwrap_or_else(PoisonError::into_inner);
                // The reader clears the table once the socket is gone.
                if destroyed.is_cancelled() {
                    break;
                }
                pending.insert(invoke_id, reply);
                drop(pending);
                WireFrame::Invoke {
                    invoke_id,
                    channel,
                    payload,
                }
            }
            InboundEvent::PostPort { channel, port, .. } => {
                let port_id = next_port.fetch_add(1, Ordering::Relaxed);
                // Announce before binding so the peer knows the id first.
                let open = WireFrame::PortOpen { port_id, channel };
                if frames.send(open).is_err() {
                    break;
                }
                ports.bind(port_id, port);
                continue;
            }
        };
        if frames.send(frame).is_err() {
            break;
        }
    }
    debug!("Bridge outbound forwarding stopped");
}

async fn read_server(
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<OutboundEvent>,
    ports: BridgedPorts,
    invokes: PendingInvokes,
    destroyed: CancellationToken,
    writer_task: JoinHandle<Result<()>>,
) {
    loop {
        let frame = tokio::select! {
            _ = destroyed.cancelled() => break,
            result = read_wire_frame(&mut reader) => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("Bridge read failed: {}", e);
                    break;
                }
            },
        };
        match frame {
            WireFrame::Event { channel, payload } => {
                let _ = events.send(OutboundEvent { channel, payload });
            }
            WireFrame::Reply { invoke_id, payload } => {
                let reply = invokes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&invoke_id);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(payload);
                    }
                    None => warn!("Stray reply {} from bridge server", invoke_id),
                }
            }
            WireFrame::PortMessage { port_id, message } => ports.deliver(port_id, message),
            WireFrame::PortClose { port_id } => ports.close(port_id),
            other => warn!("Unexpected {} frame from bridge server", other.kind()),
        }
    }

    info!("Bridge connection closed");
    destroyed.cancel();
    ports.close_all();
    // Dropping the pending replies fails every outstanding invoke.
    invokes
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
    writer_task.abort();
}
