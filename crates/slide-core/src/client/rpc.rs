//! Renderer-side RPC client.
//!
//! The client owns at most one dedicated port at a time. Every call first
//! awaits [`RpcClient::ensure_connection`], which shares a single in-flight
//! connection attempt between concurrent callers and forgets a failed attempt
//! so the next caller retries.

use crate::config::{ChannelConfig, RpcConfig};
use crate::error::{Result, SlideError};
use crate::host::port::{self, MessagePort, PortReceiver, PortSender};
use crate::host::RendererLink;
use crate::rpc::frame::encode_frame;
use crate::rpc::{ClientFrame, RequestId, RpcProcedure, ServerFrame};
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, Stream};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Opens the dedicated port towards the RPC server.
#[async_trait]
pub trait RpcConnector: Send + Sync + 'static {
    /// Open a fresh port whose other end has been handed to the server.
    async fn open(&self) -> Result<MessagePort>;
}

#[async_trait]
impl RpcConnector for RendererLink {
    async fn open(&self) -> Result<MessagePort> {
        self.send(ChannelConfig::RPC_CONNECT, Value::Null)?;
        let (local, remote) = port::channel();
        self.post_port(ChannelConfig::RPC_PORT, remote)?;
        Ok(local)
    }
}

#[derive(Clone)]
struct ActivePort {
    port: PortSender,
    generation: u64,
}

type ConnectAttempt = Shared<BoxFuture<'static, std::result::Result<ActivePort, String>>>;

enum ConnState {
    Idle,
    Connecting(ConnectAttempt),
    Connected(ActivePort),
    Closed,
}

enum StreamEvent {
    Chunk(Vec<Value>),
    Exit(Result<Value>),
}

enum Reply {
    Unary(oneshot::Sender<Result<Value>>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

struct PendingCall {
    procedure: String,
    generation: u64,
    reply: Reply,
}

impl PendingCall {
    fn settle(self, result: Result<Value>) {
        // The caller may already be gone.
        match self.reply {
            Reply::Unary(tx) => {
                let _ = tx.send(result);
            }
            Reply::Stream(tx) => {
                let _ = tx.send(StreamEvent::Exit(result));
            }
        }
    }
}

struct ClientInner {
    connector: Arc<dyn RpcConnector>,
    state: Mutex<ConnState>,
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    next_request_id: AtomicU64,
    next_generation: AtomicU64,
}

impl ClientInner {
    fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<RequestId, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Chunk { request_id, values } => {
                let pending = self.lock_pending();
                match pending.get(&request_id).map(|call| &call.reply) {
                    Some(Reply::Stream(tx)) => {
                        let _ = tx.send(StreamEvent::Chunk(values));
                    }
                    Some(Reply::Unary(_)) => {
                        warn!("Chunk for unary request {}, ignoring", request_id)
                    }
                    None => warn!("Stray Chunk for request {}", request_id),
                }
            }
            ServerFrame::Exit { request_id, exit } => {
                let Some(call) = self.lock_pending().remove(&request_id) else {
                    warn!("Stray Exit for request {}", request_id);
                    return;
                };
                let result = exit.into_result(&call.procedure, request_id);
                call.settle(result);
            }
            ServerFrame::Defect { defect } => {
                error!("RPC server reported a defect: {}", defect);
            }
        }
    }

    fn connection_lost(&self, generation: u64) {
        let lost: Vec<(RequestId, PendingCall)> = {
            let mut pending = self.lock_pending();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, call)| call.generation == generation)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };
        if !lost.is_empty() {
            warn!("RPC port lost with {} request(s) in flight", lost.len());
        }
        for (request_id, call) in lost {
            call.settle(Err(SlideError::ConnectionLost {
                request_id: request_id.to_wire(),
            }));
        }

        let mut state = self.lock_state();
        if matches!(&*state, ConnState::Connected(active) if active.generation == generation) {
            *state = ConnState::Idle;
            info!("RPC port closed, next call reconnects");
        }
    }
}

async fn connect_once(inner: Arc<ClientInner>) -> std::result::Result<ActivePort, String> {
    let opened = inner.connector.open().await;
    let mut state = inner.lock_state();
    if matches!(*state, ConnState::Closed) {
        if let Ok(port) = &opened {
            port.close();
        }
        return Err(SlideError::ClientClosed.to_string());
    }
    match opened {
        Ok(port) => {
            let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let (sender, receiver) = port.split();
            let active = ActivePort {
                port: sender,
                generation,
            };
            *state = ConnState::Connected(active.clone());
            drop(state);
            tokio::spawn(read_frames(Arc::clone(&inner), generation, receiver));
            info!("RPC port {} established", generation);
            Ok(active)
        }
        Err(e) => {
            *state = ConnState::Idle;
            warn!("RPC connection attempt failed: {}", e);
            Err(e.to_string())
        }
    }
}

async fn read_frames(inner: Arc<ClientInner>, generation: u64, mut receiver: PortReceiver) {
    while let Some(raw) = receiver.recv().await {
        match ServerFrame::deserialize(&raw) {
            Ok(frame) => inner.dispatch(frame),
            Err(e) => warn!("Malformed RPC frame from server: {}", e),
        }
    }
    inner.connection_lost(generation);
}

fn post_frame(port: &PortSender, frame: &ClientFrame) -> Result<()> {
    port.post(encode_frame(frame)?)
}

/// Client for procedures served by [`crate::rpc::RpcServer`].
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl RpcClient {
    pub fn new(connector: impl RpcConnector) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connector: Arc::new(connector),
                state: Mutex::new(ConnState::Idle),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Client whose port is negotiated over a renderer link.
    pub fn for_link(link: RendererLink) -> Self {
        Self::new(link)
    }

    /// Make sure a port is bound, connecting if needed.
    pub async fn ensure_connection(&self) -> Result<()> {
        self.active_port().await.map(|_| ())
    }

    async fn active_port(&self) -> Result<ActivePort> {
        let attempt = {
            let mut state = self.inner.lock_state();
            match &*state {
                ConnState::Closed => return Err(SlideError::ClientClosed),
                ConnState::Connected(active) if !active.port.is_closed() => {
                    return Ok(active.clone())
                }
                ConnState::Connecting(attempt) => attempt.clone(),
                ConnState::Idle | ConnState::Connected(_) => {
                    debug!("Opening RPC port");
                    let attempt = connect_once(Arc::clone(&self.inner)).boxed().shared();
                    *state = ConnState::Connecting(attempt.clone());
                    attempt
                }
            }
        };
        attempt
            .await
            .map_err(|message| SlideError::ClientConnect { message })
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.inner.lock_state(), ConnState::Connected(active) if !active.port.is_closed())
    }

    /// Requests waiting for their Exit.
    pub fn pending_requests(&self) -> usize {
        self.inner.lock_pending().len()
    }

    async fn start(&self, procedure: &str, payload: Value, reply: Reply) -> Result<InFlight> {
        let active = self.active_port().await?;
        let request_id = RequestId(self.inner.next_request_id.fetch_add(1, Ordering::Relaxed));
        self.inner.lock_pending().insert(
            request_id,
            PendingCall {
                procedure: procedure.to_string(),
                generation: active.generation,
                reply,
            },
        );
        let flight = InFlight {
            inner: Arc::clone(&self.inner),
            request_id,
            port: active.port,
        };
        if self.is_closed() {
            return Err(SlideError::ClientClosed);
        }
        post_frame(
            &flight.port,
            &ClientFrame::Request {
                id: request_id,
                tag: procedure.to_string(),
                payload,
                headers: Vec::new(),
            },
        )?;
        debug!("Sent request {} {}", request_id, procedure);
        Ok(flight)
    }

    /// Call a procedure by name and wait for its single result.
    pub async fn call(&self, procedure: &str, payload: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let flight = self.start(procedure, payload, Reply::Unary(tx)).await?;
        rx.await.map_err(|_| SlideError::ConnectionLost {
            request_id: flight.request_id.to_wire(),
        })?
    }

    /// Typed single-value call.
    ///
    /// A typed failure arrives as [`SlideError::Rpc`]; use
    /// [`SlideError::rpc_error`] to decode it as `P::Error`.
    pub async fn invoke<P: RpcProcedure>(&self, payload: P::Payload) -> Result<P::Success> {
        if P::STREAM {
            return Err(SlideError::validation(P::NAME, "stream procedure called as unary"));
        }
        let raw = self.call(P::NAME, serde_json::to_value(payload)?).await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Start a stream procedure.
    pub async fn stream(&self, procedure: &str, payload: Value) -> Result<RpcStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let flight = self.start(procedure, payload, Reply::Stream(tx)).await?;
        Ok(RpcStream {
            flight,
            events: rx,
            buffered: VecDeque::new(),
            ack_owed: false,
            done: false,
        })
    }

    /// Typed stream call.
    pub async fn invoke_stream<P: RpcProcedure>(
        &self,
        payload: P::Payload,
    ) -> Result<TypedRpcStream<P>> {
        if !P::STREAM {
            return Err(SlideError::validation(P::NAME, "unary procedure called as stream"));
        }
        let stream = self.stream(P::NAME, serde_json::to_value(payload)?).await?;
        Ok(TypedRpcStream {
            stream,
            _procedure: PhantomData,
        })
    }

    /// Ask the server to abandon a request.
    pub fn interrupt(&self, request_id: RequestId) -> Result<()> {
        let port = match &*self.inner.lock_state() {
            ConnState::Connected(active) => active.port.clone(),
            ConnState::Closed => return Err(SlideError::ClientClosed),
            _ => return Err(SlideError::PortClosed),
        };
        post_frame(&port, &ClientFrame::Interrupt { request_id })
    }

    /// Page teardown: close the port and reject every pending and future call.
    pub fn cleanup(&self) {
        let previous = std::mem::replace(&mut *self.inner.lock_state(), ConnState::Closed);
        if let ConnState::Connected(active) = previous {
            let _ = post_frame(&active.port, &ClientFrame::Eof);
            active.port.close();
        }
        let pending: Vec<PendingCall> = self.inner.lock_pending().drain().map(|(_, c)| c).collect();
        if !pending.is_empty() {
            debug!("Rejecting {} pending request(s) on cleanup", pending.len());
        }
        for call in pending {
            call.settle(Err(SlideError::ClientClosed));
        }
        info!("RPC client cleaned up");
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.lock_state(), ConnState::Closed)
    }
}

/// Guard for one open request. Dropping it before the Exit arrives sends
/// an Interrupt.
struct InFlight {
    inner: Arc<ClientInner>,
    request_id: RequestId,
    port: PortSender,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.inner.lock_pending().remove(&self.request_id).is_some() {
            debug!("Interrupting abandoned request {}", self.request_id);
            let _ = post_frame(
                &self.port,
                &ClientFrame::Interrupt {
                    request_id: self.request_id,
                },
            );
        }
    }
}

/// Chunks of a stream procedure, ending after its Exit.
///
/// Each received chunk is acknowledged once the consumer asks for more, so at
/// most one unacknowledged chunk is ever in flight per request.
pub struct RpcStream {
    flight: InFlight,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    buffered: VecDeque<Value>,
    ack_owed: bool,
    done: bool,
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("request_id", &self.flight.request_id)
            .field("done", &self.done)
            .finish()
    }
}

impl RpcStream {
    pub fn request_id(&self) -> RequestId {
        self.flight.request_id
    }

    /// Send an Interrupt. The stream still ends with the Exit the server
    /// sends in response.
    pub fn interrupt(&self) -> Result<()> {
        post_frame(
            &self.flight.port,
            &ClientFrame::Interrupt {
                request_id: self.flight.request_id,
            },
        )
    }

    fn send_ack(&mut self) {
        self.ack_owed = false;
        if let Err(e) = post_frame(
            &self.flight.port,
            &ClientFrame::Ack {
                request_id: self.flight.request_id,
            },
        ) {
            debug!("Ack for request {} not sent: {}", self.flight.request_id, e);
        }
    }
}

impl Stream for RpcStream {
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(value) = this.buffered.pop_front() {
                return Poll::Ready(Some(Ok(value)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            if this.ack_owed {
                this.send_ack();
            }
            match ready!(this.events.poll_recv(cx)) {
                Some(StreamEvent::Chunk(values)) => {
                    this.buffered.extend(values);
                    this.ack_owed = RpcConfig::SUPPORTS_ACK;
                }
                Some(StreamEvent::Exit(Ok(_))) => this.done = true,
                Some(StreamEvent::Exit(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.done = true;
                    return Poll::Ready(Some(Err(SlideError::ConnectionLost {
                        request_id: this.flight.request_id.to_wire(),
                    })));
                }
            }
        }
    }
}

/// [`RpcStream`] decoding each chunk as `P::Success`.
pub struct TypedRpcStream<P: RpcProcedure> {
    stream: RpcStream,
    _procedure: PhantomData<fn() -> P>,
}

impl<P: RpcProcedure> TypedRpcStream<P> {
    pub fn request_id(&self) -> RequestId {
        self.stream.request_id()
    }

    pub fn interrupt(&self) -> Result<()> {
        self.stream.interrupt()
    }
}

impl<P: RpcProcedure> Stream for TypedRpcStream<P> {
    type Item = Result<P::Success>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.stream).poll_next(cx).map(|item| {
            item.map(|result| {
                result.and_then(|raw| serde_json::from_value(raw).map_err(SlideError::from))
            })
        })
    }
}
