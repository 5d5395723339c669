//! Main-process host: renderer connections, ports and the inbound dispatch
//! point.
//!
//! All renderer-to-main traffic arrives on one queue and is routed by
//! [`IpcHost`] according to its channel name. Routing never waits on a ref's
//! mutation lock: renderer updates are queued on the ref they target.

mod connection;
pub mod port;

pub use connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionId, ConnectionRegistry, InboundEvent,
    InboundReceiver, OutboundEvent, RendererConnection, RendererEndpoint, RendererLink,
};
pub use port::{MessagePort, PortReceiver, PortSender};

use crate::config::ChannelConfig;
use crate::error::{Result, SlideError};
use crate::message::Message;
use crate::pubsub::{publish_from_renderer, PubSub};
use crate::refs::{IpcRefService, RefMessage};
use crate::rpc::RpcServer;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Routes inbound renderer traffic to the ref service, the bus and the RPC
/// server.
#[derive(Clone, Debug)]
pub struct IpcHost {
    registry: ConnectionRegistry,
    refs: IpcRefService,
    bus: PubSub<Message>,
    rpc: RpcServer,
}

impl IpcHost {
    pub fn new(
        registry: ConnectionRegistry,
        refs: IpcRefService,
        bus: PubSub<Message>,
        rpc: RpcServer,
    ) -> Self {
        Self {
            registry,
            refs,
            bus,
            rpc,
        }
    }

    /// Process inbound events in arrival order until the queue closes.
    pub async fn run(self, mut inbound: InboundReceiver) {
        info!("IPC host dispatch loop started");
        while let Some(event) = inbound.recv().await {
            let sender = event.sender();
            let channel = event.channel().to_string();
            if let Err(e) = self.dispatch(event) {
                warn!("Failed to handle {} from connection {}: {}", channel, sender, e);
            }
        }
        info!("IPC host dispatch loop stopped");
    }

    /// Handle one inbound event.
    pub fn dispatch(&self, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Send {
                sender,
                channel,
                payload,
            } => self.on_send(sender, &channel, payload),
            InboundEvent::Invoke {
                sender,
                channel,
                payload,
                reply,
            } => {
                let response = self.on_invoke(sender, &channel, payload);
                if reply.send(response).is_err() {
                    debug!("Connection {} stopped waiting for {}", sender, channel);
                }
                Ok(())
            }
            InboundEvent::PostPort {
                sender,
                channel,
                port,
            } => self.on_port(sender, &channel, port),
        }
    }

    fn on_send(&self, sender: ConnectionId, channel: &str, payload: Value) -> Result<()> {
        match channel {
            ChannelConfig::REF_REGISTER => {
                let message: RefMessage = serde_json::from_value(payload)?;
                self.refs.register(sender, &message.ref_id)
            }
            ChannelConfig::REF_UNREGISTER => {
                let message: RefMessage = serde_json::from_value(payload)?;
                self.refs.unregister(sender, &message.ref_id)
            }
            ChannelConfig::REF_UPDATE => {
                let message: RefMessage = serde_json::from_value(payload)?;
                let value = message.value.ok_or_else(|| {
                    SlideError::validation(ChannelConfig::REF_UPDATE, "missing value")
                })?;
                self.refs.update_from_renderer(&message.ref_id, &value)
            }
            ChannelConfig::PUBSUB_PUBLISH => {
                if !publish_from_renderer(&self.bus, &payload)? {
                    warn!("Dropped publish from {}: bus is shut down", sender);
                }
                Ok(())
            }
            ChannelConfig::RPC_INTERRUPT => {
                self.rpc.interrupt_from_channel(sender, &payload).map(|_| ())
            }
            ChannelConfig::RPC_CONNECT => {
                debug!("Connection {} requested an RPC port", sender);
                Ok(())
            }
            other => {
                warn!("Unhandled channel {} from connection {}", other, sender);
                Ok(())
            }
        }
    }

    fn on_invoke(&self, sender: ConnectionId, channel: &str, payload: Value) -> Value {
        match channel {
            ChannelConfig::REF_GET => match serde_json::from_value::<RefMessage>(payload) {
                Ok(message) => self.refs.get_encoded(&message.ref_id),
                Err(e) => {
                    warn!("Invalid {} payload from {}: {}", channel, sender, e);
                    Value::Null
                }
            },
            other => {
                warn!("Unhandled invoke {} from connection {}", other, sender);
                Value::Null
            }
        }
    }

    fn on_port(&self, sender: ConnectionId, channel: &str, port: MessagePort) -> Result<()> {
        if channel != ChannelConfig::RPC_PORT {
            port.close();
            return Err(SlideError::Protocol {
                message: format!("unexpected port on channel {}", channel),
            });
        }
        match self.registry.get(sender) {
            Some(connection) if !connection.is_destroyed() => {
                self.rpc.connect(connection, port);
                Ok(())
            }
            _ => {
                port.close();
                Err(SlideError::ConnectionClosed {
                    connection_id: sender.0,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Router;
    use crate::schema::{Schema, SerdeSchema};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    struct Fixture {
        host: IpcHost,
        refs: IpcRefService,
        bus: PubSub<Message>,
        rpc: RpcServer,
        endpoint: RendererEndpoint,
    }

    fn fixture() -> Fixture {
        let (registry, _inbound) = ConnectionRegistry::new();
        let refs = IpcRefService::new(Arc::new(MemoryStore::new()), registry.clone(), "ipcref");
        let bus = PubSub::messages("host-test");
        let rpc = RpcServer::new(Router::new());
        let host = IpcHost::new(registry.clone(), refs.clone(), bus.clone(), rpc.clone());
        let endpoint = registry.attach();
        Fixture {
            host,
            refs,
            bus,
            rpc,
            endpoint,
        }
    }

    fn send(sender: ConnectionId, channel: &str, payload: Value) -> InboundEvent {
        InboundEvent::Send {
            sender,
            channel: channel.to_string(),
            payload,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn counter() -> SerdeSchema<i64> {
        SerdeSchema::<i64>::new("Counter").with_validator(|v| {
            if *v >= 0 {
                Ok(())
            } else {
                Err("must be non-negative".into())
            }
        })
    }

    #[tokio::test]
    async fn test_register_pushes_current_value() {
        let mut f = fixture();
        f.refs.create("count", 7, counter(), None).await.unwrap();
        let id = f.endpoint.id();

        f.host
            .dispatch(send(id, ChannelConfig::REF_REGISTER, json!({"refId": "count"})))
            .unwrap();
        let event = f.endpoint.next_event().await.unwrap();
        assert_eq!(event.channel, ChannelConfig::ref_sync_channel("count"));
        assert_eq!(event.payload, json!(7));
    }

    #[tokio::test]
    async fn test_get_invoke_returns_encoded_value_or_null() {
        let f = fixture();
        f.refs.create("count", 3, counter(), None).await.unwrap();
        let id = f.endpoint.id();

        let (reply, response) = oneshot::channel();
        f.host
            .dispatch(InboundEvent::Invoke {
                sender: id,
                channel: ChannelConfig::REF_GET.to_string(),
                payload: json!({"refId": "count"}),
                reply,
            })
            .unwrap();
        assert_eq!(response.await.unwrap(), json!(3));

        let (reply, response) = oneshot::channel();
        f.host
            .dispatch(InboundEvent::Invoke {
                sender: id,
                channel: ChannelConfig::REF_GET.to_string(),
                payload: json!({"refId": "missing"}),
                reply,
            })
            .unwrap();
        assert_eq!(response.await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_invalid_update_leaves_value_unchanged() {
        let f = fixture();
        let count = f.refs.create("count", 1, counter(), None).await.unwrap();
        let id = f.endpoint.id();

        let rejected = f.host.dispatch(send(
            id,
            ChannelConfig::REF_UPDATE,
            json!({"refId": "count", "value": -5}),
        ));
        assert!(rejected.is_err());
        assert_eq!(count.get(), 1);

        f.host
            .dispatch(send(
                id,
                ChannelConfig::REF_UPDATE,
                json!({"refId": "count", "value": 9}),
            ))
            .unwrap();
        wait_for(|| count.get() == 9).await;
    }

    #[tokio::test]
    async fn test_slow_effect_does_not_stall_dispatch() {
        let (registry, inbound) = ConnectionRegistry::new();
        let refs = IpcRefService::new(Arc::new(MemoryStore::new()), registry.clone(), "ipcref");
        let rpc = RpcServer::new(Router::new());
        let host = IpcHost::new(
            registry.clone(),
            refs.clone(),
            PubSub::messages("host-test"),
            rpc.clone(),
        );
        tokio::spawn(host.run(inbound));
        let endpoint = registry.attach();
        let count = refs.create("count", 1, counter(), None).await.unwrap();

        let (release, held) = oneshot::channel::<()>();
        let (started, running) = oneshot::channel::<()>();
        let slow = {
            let count = count.clone();
            tokio::spawn(async move {
                count
                    .update_effect(|x| async move {
                        let _ = started.send(());
                        let _ = held.await;
                        Ok::<_, SlideError>(x + 1)
                    })
                    .await
            })
        };
        running.await.unwrap();

        let link = endpoint.link();
        link.send(ChannelConfig::REF_UPDATE, json!({"refId": "count", "value": 5}))
            .unwrap();
        link.send(ChannelConfig::RPC_INTERRUPT, json!({"requestId": "1"}))
            .unwrap();
        let (_local, remote) = port::channel();
        link.post_port(ChannelConfig::RPC_PORT, remote).unwrap();

        // Traffic queued behind the update is handled while the effect runs.
        wait_for(|| rpc.client_ids() == vec![endpoint.id()]).await;
        assert_eq!(count.get(), 1);

        release.send(()).unwrap();
        slow.await.unwrap().unwrap();
        wait_for(|| count.get() == 5).await;
    }

    #[tokio::test]
    async fn test_renderer_publish_reaches_bus() {
        let f = fixture();
        let mut sub = f.bus.subscribe();
        let id = f.endpoint.id();

        let message = Message::task_start("t1");
        let payload = crate::message::MessageSchema.encode(&message).unwrap();
        f.host
            .dispatch(send(id, ChannelConfig::PUBSUB_PUBLISH, payload))
            .unwrap();
        assert_eq!(sub.recv().await, Some(message));

        let invalid = f.host.dispatch(send(
            id,
            ChannelConfig::PUBSUB_PUBLISH,
            json!({"_tag": "Nope"}),
        ));
        assert!(invalid.is_err());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_port_binds_rpc_client() {
        let f = fixture();
        let id = f.endpoint.id();
        let (_local, remote) = port::channel();
        f.host
            .dispatch(InboundEvent::PostPort {
                sender: id,
                channel: ChannelConfig::RPC_PORT.to_string(),
                port: remote,
            })
            .unwrap();
        assert_eq!(f.rpc.client_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_port_on_other_channel_is_rejected() {
        let f = fixture();
        let (local, remote) = port::channel();
        let outcome = f.host.dispatch(InboundEvent::PostPort {
            sender: f.endpoint.id(),
            channel: "somewhere".to_string(),
            port: remote,
        });
        assert!(matches!(outcome, Err(SlideError::Protocol { .. })));
        assert!(local.is_closed());
    }
}
