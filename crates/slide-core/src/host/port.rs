//! Two-ended message channel used as the dedicated RPC port.
//!
//! [`channel`] returns a connected pair. Whatever one end posts, the other
//! receives in order. Closing either end closes both, and the peer observes
//! the close through [`PortReceiver::recv`] returning `None`.

use crate::cancel::CancellationToken;
use crate::error::{Result, SlideError};
use serde_json::Value;
use tokio::sync::mpsc;

/// Create a connected pair of ports.
pub fn channel() -> (MessagePort, MessagePort) {
    let closed = CancellationToken::new();
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a = MessagePort {
        sender: PortSender {
            tx: b_tx,
            closed: closed.clone(),
        },
        receiver: PortReceiver {
            rx: a_rx,
            closed: closed.clone(),
        },
    };
    let b = MessagePort {
        sender: PortSender { tx: a_tx, closed: closed.clone() },
        receiver: PortReceiver { rx: b_rx, closed },
    };
    (a, b)
}

/// One end of a port pair.
#[derive(Debug)]
pub struct MessagePort {
    sender: PortSender,
    receiver: PortReceiver,
}

impl MessagePort {
    /// Post a message to the other end.
    pub fn post(&self, message: Value) -> Result<()> {
        self.sender.post(message)
    }

    /// Receive the next message from the other end.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Cloneable sending half of a port.
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<Value>,
    closed: CancellationToken,
}

impl PortSender {
    pub fn post(&self, message: Value) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(SlideError::PortClosed);
        }
        self.tx.send(message).map_err(|_| SlideError::PortClosed)
    }

    /// Close both ends of the pair.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once the pair has been closed from either end.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Receiving half of a port.
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<Value>,
    closed: CancellationToken,
}

impl PortReceiver {
    /// Next message, or `None` once the pair is closed or the peer is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        if self.closed.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            message = self.rx.recv() => message,
            _ = self.closed.cancelled() => None,
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}
