//! RPC wire frames.
//!
//! Client frames: `Request`, `Ack`, `Interrupt`, `Eof`.
//! Server frames: `Chunk`, `Exit`, `Defect`.
//!
//! Request ids are 64-bit and always travel as decimal strings, since a JSON
//! number cannot carry them losslessly. [`RequestId`] owns that conversion so
//! no call site does it by hand.

use crate::error::{Result, SlideError};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;

/// Wire-safe request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn to_wire(self) -> String {
        self.0.to_string()
    }

    pub fn from_wire(wire: &str) -> Result<Self> {
        wire.parse::<u64>()
            .map(RequestId)
            .map_err(|e| SlideError::Protocol {
                message: format!("invalid request id {:?}: {}", wire, e),
            })
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RequestIdVisitor;

        impl Visitor<'_> for RequestIdVisitor {
            type Value = RequestId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a request id as a decimal string or non-negative integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<RequestId, E> {
                v.parse::<u64>().map(RequestId).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<RequestId, E> {
                Ok(RequestId(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<RequestId, E> {
                u64::try_from(v).map(RequestId).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(RequestIdVisitor)
    }
}

/// Renderer-to-main frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum ClientFrame {
    Request {
        id: RequestId,
        tag: String,
        payload: Value,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    Ack {
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
    Interrupt {
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
    Eof,
}

/// Main-to-renderer frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum ServerFrame {
    Chunk {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        values: Vec<Value>,
    },
    Exit {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        exit: ExitValue,
    },
    /// Connection-level failure not tied to one request.
    Defect { defect: Value },
}

impl ServerFrame {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ServerFrame::Chunk { request_id, .. } | ServerFrame::Exit { request_id, .. } => {
                Some(*request_id)
            }
            ServerFrame::Defect { .. } => None,
        }
    }
}

/// Terminal outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum ExitValue {
    Success { value: Value },
    Failure { cause: Cause },
}

impl ExitValue {
    pub fn success(value: Value) -> Self {
        ExitValue::Success { value }
    }

    pub fn fail(error: Value) -> Self {
        ExitValue::Failure {
            cause: Cause::Fail { error },
        }
    }

    pub fn die(defect: RpcDefect) -> Self {
        ExitValue::Failure {
            cause: Cause::Die {
                defect: defect.to_value(),
            },
        }
    }

    pub fn interrupted() -> Self {
        ExitValue::Failure {
            cause: Cause::Interrupt,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitValue::Success { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            ExitValue::Failure {
                cause: Cause::Interrupt
            }
        )
    }

    /// Map the exit onto the caller's result.
    pub fn into_result(self, procedure: &str, request_id: RequestId) -> Result<Value> {
        match self {
            ExitValue::Success { value } => Ok(value),
            ExitValue::Failure { cause } => Err(match cause {
                Cause::Fail { error } => SlideError::Rpc {
                    procedure: procedure.to_string(),
                    error,
                },
                Cause::Die { defect } => RpcDefect::from_value(&defect).into_error(),
                Cause::Interrupt => SlideError::Interrupted {
                    request_id: request_id.to_wire(),
                },
            }),
        }
    }
}

/// Why a request failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum Cause {
    /// The handler returned its typed error.
    Fail { error: Value },
    /// The request could not be processed at all.
    Die { defect: Value },
    /// The request was interrupted before it finished.
    Interrupt,
}

/// Structured defect carried by `Cause::Die`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum RpcDefect {
    MalformedRequest { message: String },
    InvalidPayload { procedure: String, message: String },
    ProcedureNotFound { procedure: String },
    HandlerPanicked { procedure: String },
    Unknown { message: String },
}

impl RpcDefect {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"_tag": "Unknown"}))
    }

    pub fn from_value(raw: &Value) -> Self {
        RpcDefect::deserialize(raw).unwrap_or_else(|_| RpcDefect::Unknown {
            message: raw.to_string(),
        })
    }

    pub fn into_error(self) -> SlideError {
        match self {
            RpcDefect::InvalidPayload { procedure, message } => SlideError::InvalidParams {
                message: format!("{}: {}", procedure, message),
            },
            RpcDefect::ProcedureNotFound { procedure } => {
                SlideError::ProcedureNotFound { procedure }
            }
            RpcDefect::MalformedRequest { message } => SlideError::Protocol { message },
            RpcDefect::HandlerPanicked { procedure } => SlideError::RpcDefect {
                message: format!("handler for {} panicked", procedure),
            },
            RpcDefect::Unknown { message } => SlideError::RpcDefect { message },
        }
    }
}

/// Best-effort id of a client frame that failed to decode.
pub fn peek_request_id(raw: &Value) -> Option<RequestId> {
    let id = match raw.get("_tag").and_then(Value::as_str) {
        Some("Request") => raw.get("id")?,
        _ => raw.get("requestId")?,
    };
    RequestId::deserialize(id).ok()
}

/// Encode a server frame for the port.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Value> {
    serde_json::to_value(frame).map_err(SlideError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_boundaries_round_trip() {
        const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;
        for raw in [0, 1, MAX_SAFE_INTEGER, MAX_SAFE_INTEGER + 1, MAX_SAFE_INTEGER + 2, u64::MAX] {
            let id = RequestId(raw);
            let wire = serde_json::to_value(id).unwrap();
            assert_eq!(wire, Value::String(raw.to_string()));
            let back: RequestId = serde_json::from_value(wire).unwrap();
            assert_eq!(back, id);
        }
    }

    #[test]
    fn test_request_id_accepts_numbers_on_receive() {
        let id: RequestId = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(id, RequestId(42));
        assert!(serde_json::from_value::<RequestId>(json!(-1)).is_err());
        assert!(serde_json::from_value::<RequestId>(json!("abc")).is_err());
    }

    #[test]
    fn test_request_frame_wire_shape() {
        let frame = ClientFrame::Request {
            id: RequestId(9_007_199_254_740_993),
            tag: "Sum".into(),
            payload: json!({"a": 2, "b": 3}),
            headers: vec![],
        };
        let wire = encode_frame(&frame).unwrap();
        assert_eq!(wire["_tag"], "Request");
        assert_eq!(wire["id"], "9007199254740993");
        assert_eq!(serde_json::from_value::<ClientFrame>(wire).unwrap(), frame);
    }

    #[test]
    fn test_exit_wire_shape() {
        let frame = ServerFrame::Exit {
            request_id: RequestId(3),
            exit: ExitValue::interrupted(),
        };
        assert_eq!(
            encode_frame(&frame).unwrap(),
            json!({"_tag": "Exit", "requestId": "3", "exit": {"_tag": "Failure", "cause": {"_tag": "Interrupt"}}})
        );
    }

    #[test]
    fn test_defect_maps_to_typed_errors() {
        let exit = ExitValue::die(RpcDefect::InvalidPayload {
            procedure: "Sum".into(),
            message: "a: invalid type".into(),
        });
        let err = exit.into_result("Sum", RequestId(1)).unwrap_err();
        assert!(matches!(err, SlideError::InvalidParams { .. }));

        let exit = ExitValue::die(RpcDefect::ProcedureNotFound {
            procedure: "Nope".into(),
        });
        assert!(matches!(
            exit.into_result("Nope", RequestId(2)),
            Err(SlideError::ProcedureNotFound { .. })
        ));
    }

    #[test]
    fn test_peek_request_id() {
        assert_eq!(
            peek_request_id(&json!({"_tag": "Request", "id": "17", "tag": 5})),
            Some(RequestId(17))
        );
        assert_eq!(
            peek_request_id(&json!({"_tag": "Ack", "requestId": "4"})),
            Some(RequestId(4))
        );
        assert_eq!(peek_request_id(&json!({"_tag": "Request"})), None);
    }
}
