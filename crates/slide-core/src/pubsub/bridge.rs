//! Bridging rules between the bus and renderer connections.
//!
//! Every bus message is forwarded to every live renderer, and renderer
//! publishes are validated before they reach the bus.

use super::{ListenerHandle, PubSub};
use crate::config::ChannelConfig;
use crate::error::{Result, SlideError};
use crate::host::ConnectionRegistry;
use crate::message::{deserialize_message, Message, MessageSchema};
use crate::schema::Schema;
use serde_json::Value;
use tracing::{debug, warn};

/// Send `message` to every live renderer connection.
///
/// A failure to reach one connection is logged and skipped. Returns how many
/// connections accepted the message.
pub fn broadcast_to_renderers(registry: &ConnectionRegistry, message: &Message) -> Result<usize> {
    let payload = MessageSchema.encode(message)?;
    let mut delivered = 0;
    for connection in registry.live() {
        match connection.send(ChannelConfig::PUBSUB_RENDERER_SUBSCRIBE, payload.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => warn!(
                "Failed to broadcast {} to renderer {}: {}",
                message.tag(),
                connection.id(),
                e
            ),
        }
    }
    Ok(delivered)
}

/// Decode a renderer publish and put it on the bus.
///
/// The payload may be JSON text or an already-parsed object.
pub fn publish_from_renderer(bus: &PubSub<Message>, payload: &Value) -> Result<bool> {
    let message = match payload {
        Value::String(serialized) => deserialize_message(serialized)?,
        other => MessageSchema.decode(other)?,
    };
    debug!("Renderer published {}", message.tag());
    Ok(bus.publish(message))
}

/// Forwards every bus message to all live renderers.
pub struct RendererBroadcaster;

impl RendererBroadcaster {
    pub fn spawn(bus: &PubSub<Message>, registry: ConnectionRegistry) -> ListenerHandle {
        bus.listen(move |message| {
            let registry = registry.clone();
            async move {
                broadcast_to_renderers(&registry, &message)?;
                Ok(())
            }
        })
    }
}

impl PubSub<Message> {
    /// The message bus: every publish is validated first.
    pub fn messages(name: &'static str) -> Self {
        Self::with_validator(name, Message::validate)
    }

    /// Send a message verbatim to every live renderer connection.
    pub fn broadcast_to_renderers(
        &self,
        registry: &ConnectionRegistry,
        message: &Message,
    ) -> Result<usize> {
        if self.is_shutdown() {
            return Err(SlideError::BusShutdown);
        }
        broadcast_to_renderers(registry, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_broadcast_skips_destroyed_connections() {
        let (registry, _inbound) = ConnectionRegistry::new();
        let mut a = registry.attach();
        let b = registry.attach();
        registry.destroy(b.id());

        let delivered = broadcast_to_renderers(&registry, &Message::app_ready()).unwrap();
        assert_eq!(delivered, 1);

        let event = a.next_event().await.unwrap();
        assert_eq!(event.channel, ChannelConfig::PUBSUB_RENDERER_SUBSCRIBE);
        assert_eq!(event.payload["_tag"], "AppReady");
    }

    #[tokio::test]
    async fn test_publish_from_renderer_accepts_text_and_objects() {
        let bus = PubSub::messages("test");
        let mut sub = bus.subscribe();

        let text = json!(r#"{"_tag":"TaskStart","taskId":"t1","timestamp":1}"#);
        assert!(publish_from_renderer(&bus, &text).unwrap());
        let object = json!({"_tag": "ToggleTheme"});
        assert!(publish_from_renderer(&bus, &object).unwrap());

        assert!(matches!(sub.recv().await, Some(Message::TaskStart { .. })));
        assert!(matches!(sub.recv().await, Some(Message::ToggleTheme { .. })));
    }

    #[tokio::test]
    async fn test_publish_from_renderer_rejects_invalid() {
        let bus = PubSub::messages("test");
        let mut sub = bus.subscribe();
        let invalid = json!({"_tag": "SetWindowTitle", "title": ""});
        assert!(publish_from_renderer(&bus, &invalid).is_err());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_broadcaster_forwards_bus_messages() {
        let (registry, _inbound) = ConnectionRegistry::new();
        let mut endpoint = registry.attach();
        let bus = PubSub::messages("test");
        let _broadcaster = RendererBroadcaster::spawn(&bus, registry.clone());

        bus.publish(Message::set_window_title("Slide"));
        let event = tokio::time::timeout(Duration::from_secs(1), endpoint.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["_tag"], "SetWindowTitle");
        assert_eq!(event.payload["title"], "Slide");
    }
}
