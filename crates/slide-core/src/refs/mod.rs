//! Replicated references.
//!
//! An [`IpcRef`] is a typed cell with exactly one owner process. Every
//! successful mutation is persisted (when enabled) and then pushed on
//! `ipcref:sync:{refId}` to each registered observer connection, in
//! mutation order. Renderers read and mutate through
//! [`RefMirror`](crate::client::RefMirror); their writes are forwarded to the
//! owner and never applied locally first.

mod owner;
mod service;

pub use owner::{IpcRef, PersistOptions, RefContext};
pub use service::IpcRefService;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of the `ipcref:*` channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefMessage {
    pub ref_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl RefMessage {
    pub fn id(ref_id: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            value: None,
        }
    }

    pub fn with_value(ref_id: impl Into<String>, value: Value) -> Self {
        Self {
            ref_id: ref_id.into(),
            value: Some(value),
        }
    }
}
