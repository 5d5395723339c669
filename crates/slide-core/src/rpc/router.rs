//! Typed procedure declarations and the name-keyed handler router.

use super::frame::RpcDefect;
use crate::error::{Result, SlideError};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

/// A procedure declaration shared by the main process and renderers.
///
/// `Payload` is decoded and validated before the handler runs. Failures of
/// type `Error` reach the caller as typed RPC errors.
pub trait RpcProcedure: Send + Sync + 'static {
    const NAME: &'static str;
    /// Stream procedures emit any number of chunks before their exit.
    const STREAM: bool = false;

    type Payload: Serialize + DeserializeOwned + Send + 'static;
    type Success: Serialize + DeserializeOwned + Send + 'static;
    type Error: Serialize + DeserializeOwned + Send + 'static;

    /// Checks beyond what the payload type enforces.
    fn validate(_payload: &Self::Payload) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// How a handler invocation failed, before it is put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerFailure {
    /// The handler's typed error.
    Fail(Value),
    /// The request could not be processed.
    Die(RpcDefect),
}

pub(crate) type UnaryFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, HandlerFailure>> + Send + Sync>;

pub(crate) type StreamFn = Arc<
    dyn Fn(Value) -> std::result::Result<BoxStream<'static, std::result::Result<Value, HandlerFailure>>, HandlerFailure>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub(crate) enum Handler {
    Unary(UnaryFn),
    Stream(StreamFn),
}

/// Name-keyed procedure handlers.
#[derive(Clone, Default)]
pub struct Router {
    procedures: HashMap<&'static str, Handler>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("procedures", &self.names())
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler of a single-value procedure.
    pub fn unary<P, F, Fut>(&mut self, handler: F) -> Result<&mut Self>
    where
        P: RpcProcedure,
        F: Fn(P::Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<P::Success, P::Error>> + Send + 'static,
    {
        if P::STREAM {
            return Err(SlideError::Config {
                message: format!("{} is a stream procedure", P::NAME),
            });
        }
        let handler = Arc::new(handler);
        let erased: UnaryFn = Arc::new(move |raw: Value| {
            let handler = Arc::clone(&handler);
            async move {
                let payload = decode_payload::<P>(raw)?;
                match handler(payload).await {
                    Ok(success) => encode_success::<P>(&success),
                    Err(error) => Err(encode_error::<P>(&error)),
                }
            }
            .boxed()
        });
        self.insert(P::NAME, Handler::Unary(erased))
    }

    /// Register the handler of a stream procedure.
    pub fn stream<P, F, S>(&mut self, handler: F) -> Result<&mut Self>
    where
        P: RpcProcedure,
        F: Fn(P::Payload) -> S + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<P::Success, P::Error>> + Send + 'static,
    {
        if !P::STREAM {
            return Err(SlideError::Config {
                message: format!("{} is not a stream procedure", P::NAME),
            });
        }
        let erased: StreamFn = Arc::new(move |raw: Value| {
            let payload = decode_payload::<P>(raw)?;
            let items = handler(payload).map(|item| match item {
                Ok(success) => encode_success::<P>(&success),
                Err(error) => Err(encode_error::<P>(&error)),
            });
            Ok(items.boxed())
        });
        self.insert(P::NAME, Handler::Stream(erased))
    }

    fn insert(&mut self, name: &'static str, handler: Handler) -> Result<&mut Self> {
        if self.procedures.contains_key(name) {
            return Err(SlideError::DuplicateProcedure {
                procedure: name.to_string(),
            });
        }
        self.procedures.insert(name, handler);
        Ok(self)
    }

    pub(crate) fn handler(&self, name: &str) -> Option<&Handler> {
        self.procedures.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    pub fn is_stream(&self, name: &str) -> Option<bool> {
        self.procedures
            .get(name)
            .map(|handler| matches!(handler, Handler::Stream(_)))
    }

    /// Registered procedure names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.procedures.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Startup check: every declared procedure has a handler and no handler
    /// exists for an undeclared name.
    pub fn check_complete(&self, declared: &[&str]) -> Result<()> {
        let declared: BTreeSet<&str> = declared.iter().copied().collect();
        let registered: BTreeSet<&str> = self.procedures.keys().copied().collect();

        let missing: Vec<&str> = declared.difference(&registered).copied().collect();
        let extra: Vec<&str> = registered.difference(&declared).copied().collect();
        if missing.is_empty() && extra.is_empty() {
            return Ok(());
        }
        Err(SlideError::Config {
            message: format!(
                "procedure table mismatch: missing handlers {:?}, undeclared handlers {:?}",
                missing, extra
            ),
        })
    }
}

fn decode_payload<P: RpcProcedure>(raw: Value) -> std::result::Result<P::Payload, HandlerFailure> {
    let invalid = |message: String| {
        HandlerFailure::Die(RpcDefect::InvalidPayload {
            procedure: P::NAME.to_string(),
            message,
        })
    };
    let payload: P::Payload = serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;
    P::validate(&payload).map_err(invalid)?;
    Ok(payload)
}

fn encode_success<P: RpcProcedure>(success: &P::Success) -> std::result::Result<Value, HandlerFailure> {
    serde_json::to_value(success).map_err(|e| {
        HandlerFailure::Die(RpcDefect::Unknown {
            message: format!("failed to encode {} result: {}", P::NAME, e),
        })
    })
}

fn encode_error<P: RpcProcedure>(error: &P::Error) -> HandlerFailure {
    match serde_json::to_value(error) {
        Ok(value) => HandlerFailure::Fail(value),
        Err(e) => HandlerFailure::Die(RpcDefect::Unknown {
            message: format!("failed to encode {} error: {}", P::NAME, e),
        }),
    }
}
