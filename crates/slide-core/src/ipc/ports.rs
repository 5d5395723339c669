//! Message ports carried across the bridge socket.
//!
//! Each side keeps its local end of a bridged port keyed by `port_id`.
//! Messages posted locally become `PortMessage` frames, and a local close
//! becomes `PortClose`. Frames from the peer are applied the same way.

use super::protocol::{FrameSender, WireFrame};
use crate::host::port::{MessagePort, PortSender};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Clone)]
pub(crate) struct BridgedPorts {
    frames: FrameSender,
    ports: Arc<Mutex<HashMap<u64, PortSender>>>,
}

impl BridgedPorts {
    pub(crate) fn new(frames: FrameSender) -> Self {
        Self {
            frames,
            ports: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PortSender>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start pumping a local port end onto the socket.
    pub(crate) fn bind(&self, port_id: u64, port: MessagePort) {
        let (sender, mut receiver) = port.split();
        if let Some(previous) = self.lock().insert(port_id, sender) {
            previous.close();
        }
        let table = self.clone();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if table
                    .frames
                    .send(WireFrame::PortMessage { port_id, message })
                    .is_err()
                {
                    break;
                }
            }
            // Only announce closes that originate on this side.
            if table.lock().remove(&port_id).is_some() {
                let _ = table.frames.send(WireFrame::PortClose { port_id });
            }
        });
    }

    pub(crate) fn deliver(&self, port_id: u64, message: Value) {
        let port = self.lock().get(&port_id).cloned();
        match port {
            Some(port) => {
                if let Err(e) = port.post(message) {
                    debug!("Bridged port {} rejected a message: {}", port_id, e);
                }
            }
            None => debug!("Message for unknown bridged port {}", port_id),
        }
    }

    pub(crate) fn close(&self, port_id: u64) {
        let removed = self.lock().remove(&port_id);
        if let Some(port) = removed {
            port.close();
        }
    }

    pub(crate) fn close_all(&self) {
        let ports: Vec<PortSender> = self.lock().drain().map(|(_, port)| port).collect();
        for port in ports {
            port.close();
        }
    }
}
