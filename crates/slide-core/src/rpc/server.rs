//! RPC server and its per-connection port transport.
//!
//! Each renderer connection binds exactly one port. A forwarding task per port
//! decodes client frames and drives request lifecycles:
//!
//! ```text
//! Request -> Chunk* -> Exit          (stream procedure)
//! Request -> Exit                    (unary procedure)
//! Request -> ... Interrupt -> Exit   (Exit carries an Interrupt cause)
//! ```
//!
//! Requests never time out. A request stays open until its handler finishes,
//! the client interrupts it, or the connection goes away.

use super::frame::{
    encode_frame, peek_request_id, ClientFrame, ExitValue, RequestId, RpcDefect, ServerFrame,
};
use super::router::{Handler, HandlerFailure, Router};
use crate::cancel::CancellationToken;
use crate::config::RpcConfig;
use crate::error::Result;
use crate::host::port::{MessagePort, PortReceiver, PortSender};
use crate::host::{ConnectionId, RendererConnection};
use crate::pubsub::{PubSub, Subscription};
use futures::{FutureExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct ActiveRequest {
    cancel: CancellationToken,
    acks: Arc<Notify>,
}

struct ClientSlot {
    generation: u64,
    port: PortSender,
    requests: HashMap<RequestId, ActiveRequest>,
    forwarder: JoinHandle<()>,
}

impl ClientSlot {
    fn teardown(self, abort_forwarder: bool) {
        for request in self.requests.values() {
            request.cancel.cancel();
        }
        self.port.close();
        if abort_forwarder {
            self.forwarder.abort();
        }
    }
}

struct ServerInner {
    router: Router,
    clients: Mutex<HashMap<ConnectionId, ClientSlot>>,
    disconnects: PubSub<ConnectionId>,
    next_generation: AtomicU64,
    shut_down: AtomicBool,
}

/// Serves registered procedures to every connected renderer.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("router", &self.inner.router)
            .field("clients", &self.client_ids())
            .finish()
    }
}

impl RpcServer {
    pub fn new(router: Router) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                router,
                clients: Mutex::new(HashMap::new()),
                disconnects: PubSub::new("rpc-disconnects"),
                next_generation: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Whether the transport asks for an ack after each chunk.
    pub fn supports_ack(&self) -> bool {
        RpcConfig::SUPPORTS_ACK
    }

    /// Bind a renderer's port. A port already bound for the same connection
    /// is closed and its in-flight requests are abandoned.
    pub fn connect(&self, connection: Arc<RendererConnection>, port: MessagePort) {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            warn!("RPC server shut down, rejecting port from {}", connection.id());
            port.close();
            return;
        }

        let id = connection.id();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = port.split();

        let previous = {
            let mut clients = self.lock_clients();
            // Spawned under the lock so the forwarder cannot see a missing slot.
            let forwarder = tokio::spawn(self.clone().forward(
                connection,
                generation,
                sender.clone(),
                receiver,
            ));
            clients.insert(
                id,
                ClientSlot {
                    generation,
                    port: sender,
                    requests: HashMap::new(),
                    forwarder,
                },
            )
        };

        if let Some(previous) = previous {
            info!("Replacing RPC port for client {}", id);
            previous.teardown(true);
        } else {
            info!("RPC client {} connected", id);
        }
    }

    /// Ids of every client with a bound port, ascending.
    pub fn client_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock_clients().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of requests still open for a client.
    pub fn active_requests(&self, client: ConnectionId) -> usize {
        self.lock_clients()
            .get(&client)
            .map_or(0, |slot| slot.requests.len())
    }

    /// Stream of client ids whose ports were torn down.
    pub fn disconnects(&self) -> Subscription<ConnectionId> {
        self.inner.disconnects.subscribe()
    }

    /// Interrupt a request. Returns `false` if it is not open.
    pub fn interrupt(&self, client: ConnectionId, request_id: RequestId) -> bool {
        match self
            .lock_clients()
            .get(&client)
            .and_then(|slot| slot.requests.get(&request_id))
        {
            Some(request) => {
                request.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Handle an interrupt sent on the `rpc:interrupt` channel.
    ///
    /// Accepts `{"requestId": id}` or a bare id.
    pub fn interrupt_from_channel(&self, client: ConnectionId, payload: &Value) -> Result<bool> {
        let raw = payload.get("requestId").unwrap_or(payload);
        let request_id = RequestId::deserialize(raw)?;
        let interrupted = self.interrupt(client, request_id);
        if !interrupted {
            debug!(
                "Interrupt for request {} from client {} matched nothing",
                request_id, client
            );
        }
        Ok(interrupted)
    }

    /// Tear down a client's port and abandon its requests.
    pub fn end(&self, client: ConnectionId) -> bool {
        let removed = self.lock_clients().remove(&client);
        match removed {
            Some(slot) => {
                slot.teardown(true);
                self.announce_disconnect(client);
                true
            }
            None => false,
        }
    }

    /// Close every port and refuse new ones.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let slots: Vec<(ConnectionId, ClientSlot)> = self.lock_clients().drain().collect();
        for (client, slot) in slots {
            slot.teardown(true);
            self.announce_disconnect(client);
        }
        self.inner.disconnects.shutdown();
        info!("RPC server shut down");
    }

    async fn forward(
        self,
        connection: Arc<RendererConnection>,
        generation: u64,
        port: PortSender,
        mut receiver: PortReceiver,
    ) {
        let client = connection.id();
        // Runs on normal exit and when the task is aborted.
        let _cleanup = ForwarderCleanup {
            server: self.clone(),
            client,
            generation,
        };

        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(raw) => self.handle_message(client, generation, &port, raw),
                    None => {
                        debug!("RPC port for client {} closed", client);
                        break;
                    }
                },
                _ = connection.destroyed() => {
                    debug!("Client {} destroyed", client);
                    break;
                }
            }
        }
    }

    fn handle_message(&self, client: ConnectionId, generation: u64, port: &PortSender, raw: Value) {
        match ClientFrame::deserialize(&raw) {
            Ok(frame) => self.handle_frame(client, generation, port, frame),
            Err(e) => {
                warn!("Malformed RPC frame from client {}: {}", client, e);
                if let Some(request_id) = peek_request_id(&raw) {
                    if self.is_active(client, generation, request_id) {
                        // The running request owns this id and will send its own Exit.
                        warn!(
                            "Dropping malformed frame for active request {} from client {}",
                            request_id, client
                        );
                        return;
                    }
                    send_frame(
                        port,
                        ServerFrame::Exit {
                            request_id,
                            exit: ExitValue::die(RpcDefect::MalformedRequest {
                                message: e.to_string(),
                            }),
                        },
                    );
                }
            }
        }
    }

    fn handle_frame(&self, client: ConnectionId, generation: u64, port: &PortSender, frame: ClientFrame) {
        match frame {
            ClientFrame::Request {
                id, tag, payload, ..
            } => self.start_request(client, generation, port, id, tag, payload),
            ClientFrame::Ack { request_id } => {
                let acked = self
                    .lock_clients()
                    .get(&client)
                    .filter(|slot| slot.generation == generation)
                    .and_then(|slot| slot.requests.get(&request_id))
                    .map(|request| request.acks.notify_one())
                    .is_some();
                if !acked {
                    warn!("Stray Ack for request {} from client {}", request_id, client);
                }
            }
            ClientFrame::Interrupt { request_id } => {
                if !self.interrupt(client, request_id) {
                    debug!(
                        "Interrupt for finished request {} from client {}",
                        request_id, client
                    );
                }
            }
            ClientFrame::Eof => debug!("Client {} finished sending", client),
        }
    }

    fn is_active(&self, client: ConnectionId, generation: u64, request_id: RequestId) -> bool {
        self.lock_clients()
            .get(&client)
            .filter(|slot| slot.generation == generation)
            .is_some_and(|slot| slot.requests.contains_key(&request_id))
    }

    fn start_request(
        &self,
        client: ConnectionId,
        generation: u64,
        port: &PortSender,
        request_id: RequestId,
        procedure: String,
        payload: Value,
    ) {
        if self.is_active(client, generation, request_id) {
            warn!(
                "Duplicate request id {} from client {}, ignoring",
                request_id, client
            );
            return;
        }
        let Some(handler) = self.inner.router.handler(&procedure).cloned() else {
            warn!("Unknown procedure {} requested by client {}", procedure, client);
            send_frame(
                port,
                ServerFrame::Exit {
                    request_id,
                    exit: ExitValue::die(RpcDefect::ProcedureNotFound { procedure }),
                },
            );
            return;
        };

        let cancel = CancellationToken::new();
        let acks = Arc::new(Notify::new());
        {
            let mut clients = self.lock_clients();
            let Some(slot) = clients
                .get_mut(&client)
                .filter(|slot| slot.generation == generation)
            else {
                return;
            };
            if slot.requests.contains_key(&request_id) {
                warn!(
                    "Duplicate request id {} from client {}, ignoring",
                    request_id, client
                );
                return;
            }
            slot.requests.insert(
                request_id,
                ActiveRequest {
                    cancel: cancel.clone(),
                    acks: Arc::clone(&acks),
                },
            );
        }
        debug!("Request {} {} from client {}", request_id, procedure, client);

        let server = self.clone();
        let port = port.clone();
        tokio::spawn(async move {
            let exit = run_handler(&procedure, handler, payload, &port, request_id, &cancel, &acks).await;
            server.finish_request(client, generation, request_id);
            if exit.is_interrupted() {
                debug!("Request {} {} interrupted", request_id, procedure);
            }
            send_frame(&port, ServerFrame::Exit { request_id, exit });
        });
    }

    fn finish_request(&self, client: ConnectionId, generation: u64, request_id: RequestId) {
        if let Some(slot) = self
            .lock_clients()
            .get_mut(&client)
            .filter(|slot| slot.generation == generation)
        {
            slot.requests.remove(&request_id);
        }
    }

    fn remove_client(&self, client: ConnectionId, generation: u64) {
        let removed = {
            let mut clients = self.lock_clients();
            match clients.get(&client) {
                Some(slot) if slot.generation == generation => clients.remove(&client),
                _ => None,
            }
        };
        if let Some(slot) = removed {
            slot.teardown(false);
            self.announce_disconnect(client);
        }
    }

    fn announce_disconnect(&self, client: ConnectionId) {
        info!("RPC client {} disconnected", client);
        self.inner.disconnects.publish(client);
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, ClientSlot>> {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

struct ForwarderCleanup {
    server: RpcServer,
    client: ConnectionId,
    generation: u64,
}

impl Drop for ForwarderCleanup {
    fn drop(&mut self) {
        self.server.remove_client(self.client, self.generation);
    }
}

async fn run_handler(
    procedure: &str,
    handler: Handler,
    payload: Value,
    port: &PortSender,
    request_id: RequestId,
    cancel: &CancellationToken,
    acks: &Notify,
) -> ExitValue {
    match handler {
        Handler::Unary(call) => {
            let invocation = AssertUnwindSafe(call(payload)).catch_unwind();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => ExitValue::interrupted(),
                outcome = invocation => match outcome {
                    Ok(Ok(value)) => ExitValue::success(value),
                    Ok(Err(failure)) => failure_exit(procedure, failure),
                    Err(_) => panicked(procedure),
                },
            }
        }
        Handler::Stream(open) => {
            let mut items = match std::panic::catch_unwind(AssertUnwindSafe(|| open(payload))) {
                Ok(Ok(items)) => items,
                Ok(Err(failure)) => return failure_exit(procedure, failure),
                Err(_) => return panicked(procedure),
            };
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return ExitValue::interrupted(),
                    next = AssertUnwindSafe(items.next()).catch_unwind() => next,
                };
                let value = match next {
                    Ok(Some(Ok(value))) => value,
                    Ok(Some(Err(failure))) => return failure_exit(procedure, failure),
                    Ok(None) => return ExitValue::success(Value::Null),
                    Err(_) => return panicked(procedure),
                };

                if cancel.is_cancelled() {
                    return ExitValue::interrupted();
                }
                if !send_frame(
                    port,
                    ServerFrame::Chunk {
                        request_id,
                        values: vec![value],
                    },
                ) {
                    return ExitValue::interrupted();
                }
                if RpcConfig::SUPPORTS_ACK {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return ExitValue::interrupted(),
                        _ = acks.notified() => {}
                    }
                }
            }
        }
    }
}

fn failure_exit(procedure: &str, failure: HandlerFailure) -> ExitValue {
    match failure {
        HandlerFailure::Fail(error) => {
            warn!("Handler for {} failed: {}", procedure, error);
            ExitValue::fail(error)
        }
        HandlerFailure::Die(defect) => {
            error!("Request for {} died: {:?}", procedure, defect);
            ExitValue::die(defect)
        }
    }
}

fn panicked(procedure: &str) -> ExitValue {
    error!("Handler for {} panicked", procedure);
    ExitValue::die(RpcDefect::HandlerPanicked {
        procedure: procedure.to_string(),
    })
}

/// Post a frame, returning whether the port accepted it.
fn send_frame(port: &PortSender, frame: ServerFrame) -> bool {
    let encoded = match encode_frame(&frame) {
        Ok(encoded) => encoded,
        Err(e) => {
            error!("Failed to encode RPC frame: {}", e);
            return false;
        }
    };
    match port.post(encoded) {
        Ok(()) => true,
        Err(e) => {
            debug!("Dropping {:?} for closed port: {}", frame.request_id(), e);
            false
        }
    }
}
