//! Socket bridge wire format.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! [`WireFrame`]:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::RpcConfig;
use crate::error::{Result, SlideError};
use crate::host::ConnectionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// One message on the bridge socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireFrame {
    /// First frame from the server: the id assigned to this renderer.
    Hello { connection_id: ConnectionId },
    /// Renderer fire-and-forget message.
    Send { channel: String, payload: Value },
    /// Renderer request expecting one `Reply`.
    Invoke {
        invoke_id: u64,
        channel: String,
        payload: Value,
    },
    Reply { invoke_id: u64, payload: Value },
    /// Main-process push to the renderer.
    Event { channel: String, payload: Value },
    /// The renderer transferred one end of a port on `channel`.
    PortOpen { port_id: u64, channel: String },
    PortMessage { port_id: u64, message: Value },
    PortClose { port_id: u64 },
}

impl WireFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            WireFrame::Hello { .. } => "hello",
            WireFrame::Send { .. } => "send",
            WireFrame::Invoke { .. } => "invoke",
            WireFrame::Reply { .. } => "reply",
            WireFrame::Event { .. } => "event",
            WireFrame::PortOpen { .. } => "port_open",
            WireFrame::PortMessage { .. } => "port_message",
            WireFrame::PortClose { .. } => "port_close",
        }
    }
}

pub(crate) type FrameSender = mpsc::UnboundedSender<WireFrame>;

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > RpcConfig::MAX_IPC_MESSAGE_SIZE {
        return Err(SlideError::validation(
            "ipc_frame",
            format!(
                "frame size {} exceeds maximum {}",
                len,
                RpcConfig::MAX_IPC_MESSAGE_SIZE
            ),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= RpcConfig::MAX_IPC_MESSAGE_SIZE)
        .ok_or_else(|| {
            SlideError::validation("ipc_frame", format!("frame size {} too large", payload.len()))
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_wire_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<WireFrame>> {
    match read_frame(reader).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn write_wire_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &WireFrame) -> Result<()> {
    let bytes = serde_json::to_vec(frame)?;
    write_frame(writer, &bytes).await
}

/// Drain queued frames onto the socket until every sender is gone.
pub(crate) async fn write_frames<W: AsyncWriteExt + Unpin>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<WireFrame>,
) -> Result<()> {
    while let Some(frame) = frames.recv().await {
        write_wire_frame(&mut writer, &frame).await?;
    }
    Ok(())
}
