//! Pub/sub message contract.
//!
//! [`Message`] is a closed tagged union keyed by `_tag`. Every instance is
//! validated before it is published and after it is decoded from a wire
//! payload, so nothing crosses the bus as untyped JSON.

use crate::error::{Result, SlideError};
use crate::pubsub::Tagged;
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Milliseconds since the Unix epoch, the timestamp unit of every message.
pub fn now_millis() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

/// A domain event carried by the pub/sub bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase", deny_unknown_fields)]
pub enum Message {
    AppReady {
        timestamp: f64,
    },
    TaskStart {
        task_id: String,
        timestamp: f64,
    },
    TaskStop {
        task_id: String,
        timestamp: f64,
    },
    TaskContinue {
        task_id: String,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        timestamp: f64,
    },
    TaskExited {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip: Option<bool>,
        timestamp: f64,
    },
    InvalidateQuery {
        query_key: Vec<Value>,
        timestamp: f64,
    },
    InvalidateTask {
        task_id: String,
        timestamp: f64,
    },
    SetWindowTitle {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    ShowUpdateDialog {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        check_for_updates: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    Quit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        force: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    GetAppInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        include_version: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    ToggleTheme {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    OpenExternalLink {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    OpenSlideFolder {
        timestamp: f64,
    },
}

/// Discriminant of [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageTag {
    AppReady,
    TaskStart,
    TaskStop,
    TaskContinue,
    TaskExited,
    InvalidateQuery,
    InvalidateTask,
    SetWindowTitle,
    ShowUpdateDialog,
    Quit,
    GetAppInfo,
    ToggleTheme,
    OpenExternalLink,
    OpenSlideFolder,
}

impl MessageTag {
    /// Every declared tag, in declaration order.
    pub const ALL: [MessageTag; 14] = [
        MessageTag::AppReady,
        MessageTag::TaskStart,
        MessageTag::TaskStop,
        MessageTag::TaskContinue,
        MessageTag::TaskExited,
        MessageTag::InvalidateQuery,
        MessageTag::InvalidateTask,
        MessageTag::SetWindowTitle,
        MessageTag::ShowUpdateDialog,
        MessageTag::Quit,
        MessageTag::GetAppInfo,
        MessageTag::ToggleTheme,
        MessageTag::OpenExternalLink,
        MessageTag::OpenSlideFolder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageTag::AppReady => "AppReady",
            MessageTag::TaskStart => "TaskStart",
            MessageTag::TaskStop => "TaskStop",
            MessageTag::TaskContinue => "TaskContinue",
            MessageTag::TaskExited => "TaskExited",
            MessageTag::InvalidateQuery => "InvalidateQuery",
            MessageTag::InvalidateTask => "InvalidateTask",
            MessageTag::SetWindowTitle => "SetWindowTitle",
            MessageTag::ShowUpdateDialog => "ShowUpdateDialog",
            MessageTag::Quit => "Quit",
            MessageTag::GetAppInfo => "GetAppInfo",
            MessageTag::ToggleTheme => "ToggleTheme",
            MessageTag::OpenExternalLink => "OpenExternalLink",
            MessageTag::OpenSlideFolder => "OpenSlideFolder",
        }
    }

    /// Startup check that every tag is unique and maps back to itself.
    pub fn check_table() -> Result<()> {
        let mut seen = HashSet::new();
        for tag in Self::ALL {
            if !seen.insert(tag.as_str()) {
                return Err(SlideError::Config {
                    message: format!("duplicate message tag {}", tag),
                });
            }
            if tag.as_str().parse::<MessageTag>()? != tag {
                return Err(SlideError::Config {
                    message: format!("message tag {} does not round-trip", tag),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageTag {
    type Err = SlideError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| SlideError::validation("MessageTag", format!("unknown tag {:?}", s)))
    }
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::AppReady { .. } => MessageTag::AppReady,
            Message::TaskStart { .. } => MessageTag::TaskStart,
            Message::TaskStop { .. } => MessageTag::TaskStop,
            Message::TaskContinue { .. } => MessageTag::TaskContinue,
            Message::TaskExited { .. } => MessageTag::TaskExited,
            Message::InvalidateQuery { .. } => MessageTag::InvalidateQuery,
            Message::InvalidateTask { .. } => MessageTag::InvalidateTask,
            Message::SetWindowTitle { .. } => MessageTag::SetWindowTitle,
            Message::ShowUpdateDialog { .. } => MessageTag::ShowUpdateDialog,
            Message::Quit { .. } => MessageTag::Quit,
            Message::GetAppInfo { .. } => MessageTag::GetAppInfo,
            Message::ToggleTheme { .. } => MessageTag::ToggleTheme,
            Message::OpenExternalLink { .. } => MessageTag::OpenExternalLink,
            Message::OpenSlideFolder { .. } => MessageTag::OpenSlideFolder,
        }
    }

    pub fn app_ready() -> Self {
        Message::AppReady {
            timestamp: now_millis(),
        }
    }

    pub fn task_start(task_id: impl Into<String>) -> Self {
        Message::TaskStart {
            task_id: task_id.into(),
            timestamp: now_millis(),
        }
    }

    pub fn task_stop(task_id: impl Into<String>) -> Self {
        Message::TaskStop {
            task_id: task_id.into(),
            timestamp: now_millis(),
        }
    }

    pub fn task_exited(task_id: impl Into<String>) -> Self {
        Message::TaskExited {
            task_id: task_id.into(),
            skip: None,
            timestamp: now_millis(),
        }
    }

    pub fn invalidate_query(query_key: Vec<Value>) -> Self {
        Message::InvalidateQuery {
            query_key,
            timestamp: now_millis(),
        }
    }

    pub fn set_window_title(title: impl Into<String>) -> Self {
        Message::SetWindowTitle {
            title: title.into(),
            timestamp: Some(now_millis()),
        }
    }

    /// Field-level checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| Err(SlideError::validation(self.tag().as_str(), message));

        match self {
            Message::AppReady { timestamp } | Message::OpenSlideFolder { timestamp } => {
                check_timestamp(*timestamp).or_else(|m| fail(m))
            }
            Message::TaskStart { task_id, timestamp }
            | Message::TaskStop { task_id, timestamp }
            | Message::TaskExited {
                task_id, timestamp, ..
            }
            | Message::InvalidateTask { task_id, timestamp } => {
                if task_id.is_empty() {
                    return fail("taskId must not be empty");
                }
                check_timestamp(*timestamp).or_else(|m| fail(m))
            }
            Message::TaskContinue {
                task_id,
                prompt,
                timestamp,
                ..
            } => {
                if task_id.is_empty() {
                    return fail("taskId must not be empty");
                }
                if prompt.is_empty() {
                    return fail("prompt must not be empty");
                }
                check_timestamp(*timestamp).or_else(|m| fail(m))
            }
            Message::InvalidateQuery {
                query_key,
                timestamp,
            } => {
                if query_key.is_empty() {
                    return fail("queryKey must not be empty");
                }
                check_timestamp(*timestamp).or_else(|m| fail(m))
            }
            Message::SetWindowTitle { title, timestamp } => {
                if title.is_empty() {
                    return fail("title must not be empty");
                }
                check_optional_timestamp(*timestamp).or_else(|m| fail(m))
            }
            Message::OpenExternalLink { url, timestamp } => {
                if url.is_empty() {
                    return fail("url must not be empty");
                }
                check_optional_timestamp(*timestamp).or_else(|m| fail(m))
            }
            Message::ShowUpdateDialog { timestamp, .. }
            | Message::Quit { timestamp, .. }
            | Message::GetAppInfo { timestamp, .. }
            | Message::ToggleTheme { timestamp } => {
                check_optional_timestamp(*timestamp).or_else(|m| fail(m))
            }
        }
    }
}

fn check_timestamp(timestamp: f64) -> std::result::Result<(), &'static str> {
    if timestamp.is_finite() && timestamp >= 0.0 {
        Ok(())
    } else {
        Err("timestamp must be a non-negative finite number")
    }
}

fn check_optional_timestamp(timestamp: Option<f64>) -> std::result::Result<(), &'static str> {
    timestamp.map_or(Ok(()), check_timestamp)
}

impl Tagged for Message {
    type Tag = MessageTag;

    fn tag(&self) -> MessageTag {
        Message::tag(self)
    }
}

/// Schema for [`Message`] values on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageSchema;

impl Schema for MessageSchema {
    type Value = Message;

    fn name(&self) -> &str {
        "Message"
    }

    fn encode(&self, value: &Message) -> Result<Value> {
        value.validate()?;
        serde_json::to_value(value).map_err(|e| SlideError::validation("Message", e))
    }

    fn decode(&self, raw: &Value) -> Result<Message> {
        let message =
            Message::deserialize(raw).map_err(|e| SlideError::validation("Message", e))?;
        message.validate()?;
        Ok(message)
    }
}

/// Serialize a message to JSON text after validating it.
pub fn serialize_message(message: &Message) -> Result<String> {
    message.validate()?;
    serde_json::to_string(message).map_err(|e| SlideError::validation("Message", e))
}

/// Parse and validate a message from JSON text.
pub fn deserialize_message(serialized: &str) -> Result<Message> {
    let message: Message =
        serde_json::from_str(serialized).map_err(|e| SlideError::validation("Message", e))?;
    message.validate()?;
    Ok(message)
}
