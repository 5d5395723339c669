//! Renderer access to the main-process event bus.

use super::session::{ChannelListener, RendererSession};
use crate::config::ChannelConfig;
use crate::error::Result;
use crate::message::{Message, MessageTag};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Publishes to and listens on the bus from a renderer.
#[derive(Debug, Clone, Copy)]
pub struct RendererPubSub<'a> {
    session: &'a RendererSession,
}

impl<'a> RendererPubSub<'a> {
    pub fn new(session: &'a RendererSession) -> Self {
        Self { session }
    }

    /// Validate and hand a message to the main-process bus.
    pub fn publish(&self, message: &Message) -> Result<()> {
        message.validate()?;
        self.session
            .link()
            .send(ChannelConfig::PUBSUB_PUBLISH, serde_json::to_value(message)?)
    }

    /// Handle every message the main process broadcasts.
    pub fn subscribe<F>(&self, handler: F) -> ChannelListener
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.listen(None, handler)
    }

    /// Handle broadcast messages carrying `tag` only.
    pub fn subscribe_to<F>(&self, tag: MessageTag, handler: F) -> ChannelListener
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.listen(Some(tag), handler)
    }

    fn listen<F>(&self, tag: Option<MessageTag>, handler: F) -> ChannelListener
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.session
            .on(ChannelConfig::PUBSUB_RENDERER_SUBSCRIBE, move |raw| {
                match decode_broadcast(&raw) {
                    Ok(message) if tag.map_or(true, |tag| message.tag() == tag) => handler(message),
                    Ok(_) => {}
                    Err(e) => warn!("Dropping invalid broadcast: {}", e),
                }
            })
    }
}

fn decode_broadcast(raw: &Value) -> Result<Message> {
    let message = Message::deserialize(raw)?;
    message.validate()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ConnectionRegistry, InboundEvent};
    use crate::pubsub::{broadcast_to_renderers, publish_from_renderer, PubSub};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_publish_reaches_main_bus() {
        let (registry, mut inbound) = ConnectionRegistry::new();
        let session = RendererSession::new(registry.attach());
        let bus: PubSub<Message> = PubSub::messages("test");
        let mut sub = bus.subscribe();

        RendererPubSub::new(&session)
            .publish(&Message::task_start("t1"))
            .unwrap();
        let InboundEvent::Send { channel, payload, .. } = inbound.recv().await.unwrap() else {
            panic!("expected a send");
        };
        assert_eq!(channel, ChannelConfig::PUBSUB_PUBLISH);
        assert!(publish_from_renderer(&bus, &payload).unwrap());
        assert_eq!(sub.recv().await.map(|m| m.tag()), Some(MessageTag::TaskStart));
    }

    #[tokio::test]
    async fn test_invalid_message_rejected_locally() {
        let (registry, _inbound) = ConnectionRegistry::new();
        let session = RendererSession::new(registry.attach());
        assert!(RendererPubSub::new(&session)
            .publish(&Message::task_start(""))
            .is_err());
    }

    #[tokio::test]
    async fn test_subscribe_to_filters_by_tag() {
        let (registry, _inbound) = ConnectionRegistry::new();
        let session = RendererSession::new(registry.attach());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _listener = RendererPubSub::new(&session).subscribe_to(MessageTag::TaskStop, move |m| {
            let _ = tx.send(m);
        });

        broadcast_to_renderers(&registry, &Message::task_start("a")).unwrap();
        broadcast_to_renderers(&registry, &Message::task_stop("b")).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.tag(), MessageTag::TaskStop);
        assert!(rx.try_recv().is_err());
    }
}
