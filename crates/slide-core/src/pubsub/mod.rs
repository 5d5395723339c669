//! In-process pub/sub event bus.
//!
//! The bus is a single unbounded multicast hub: every subscription gets its
//! own unbounded queue, so a slow consumer never causes another to miss a
//! message and `publish` never blocks. Tag filtering happens on the consumer
//! side by wrapping a raw subscription.

mod bridge;

pub use bridge::{broadcast_to_renderers, publish_from_renderer, RendererBroadcaster};

use crate::error::{Result, SlideError};
use futures::{FutureExt, Stream};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A payload with a discriminant the bus can filter on.
pub trait Tagged {
    type Tag: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    fn tag(&self) -> Self::Tag;
}

struct Subscriber<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
}

type Validator<T> = Box<dyn Fn(&T) -> Result<()> + Send + Sync>;

struct PubSubInner<T> {
    name: &'static str,
    validator: Option<Validator<T>>,
    subscribers: Mutex<Vec<Subscriber<T>>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

/// Unbounded multi-subscriber broadcast channel.
pub struct PubSub<T> {
    inner: Arc<PubSubInner<T>>,
}

impl<T> Clone for PubSub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for PubSub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSub")
            .field("name", &self.inner.name)
            .field("validated", &self.inner.validator.is_some())
            .field("shutdown", &self.inner.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: Clone + Send + 'static> PubSub<T> {
    /// Create a bus. The name only appears in logs.
    pub fn new(name: &'static str) -> Self {
        Self::build(name, None)
    }

    /// Create a bus that refuses every message `validator` rejects.
    pub fn with_validator<F>(name: &'static str, validator: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        Self::build(name, Some(Box::new(validator)))
    }

    fn build(name: &'static str, validator: Option<Validator<T>>) -> Self {
        Self {
            inner: Arc::new(PubSubInner {
                name,
                validator,
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Deliver a message to every live subscription.
    ///
    /// Returns `false` once the bus has been shut down, or when the bus
    /// validator rejects the message. Rejections are logged and nothing is
    /// delivered.
    pub fn publish(&self, message: T) -> bool {
        match self.try_publish(message) {
            Ok(()) => true,
            Err(SlideError::BusShutdown) => false,
            Err(e) => {
                warn!("Rejected message on {}: {}", self.inner.name, e);
                false
            }
        }
    }

    /// Like [`publish`](Self::publish) but reports why a message was refused.
    pub fn try_publish(&self, message: T) -> Result<()> {
        if let Some(validate) = &self.inner.validator {
            validate(&message)?;
        }
        // Sending under the lock keeps per-subscriber order equal to publish order.
        let mut subscribers = self.lock_subscribers();
        if self.is_shutdown() {
            return Err(SlideError::BusShutdown);
        }
        subscribers.retain(|subscriber| subscriber.tx.send(message.clone()).is_ok());
        Ok(())
    }

    /// Open an independent cursor that yields every future message.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.lock_subscribers();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        // After shutdown the sender is dropped here and the subscription completes.
        if !self.is_shutdown() {
            subscribers.push(Subscriber { id, tx });
        }
        Subscription { id, rx }
    }

    /// Subscribe to the messages whose tag equals `tag`.
    pub fn subscribe_to(&self, tag: T::Tag) -> TaggedSubscription<T>
    where
        T: Tagged,
    {
        TaggedSubscription {
            inner: self.subscribe(),
            tag,
        }
    }

    /// Run `handler` for every message, in order, on a background task.
    ///
    /// A failing or panicking handler is logged and the loop moves on to the
    /// next message.
    pub fn listen<F, Fut>(&self, handler: F) -> ListenerHandle
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let name = self.inner.name;
        let task = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                run_isolated(name, "*", &handler, message).await;
            }
            debug!("Listener on {} finished", name);
        });
        ListenerHandle { task }
    }

    /// Run `handler` for every message tagged `tag`, isolating failures.
    pub fn listen_to<F, Fut>(&self, tag: T::Tag, handler: F) -> ListenerHandle
    where
        T: Tagged,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut subscription = self.subscribe_to(tag);
        let name = self.inner.name;
        let task = tokio::spawn(async move {
            let label = format!("{:?}", tag);
            while let Some(message) = subscription.recv().await {
                run_isolated(name, &label, &handler, message).await;
            }
            debug!("Listener for {} on {} finished", label, name);
        });
        ListenerHandle { task }
    }

    /// Close the bus. Publishing fails afterwards and every subscription
    /// completes once it has drained what was already delivered.
    pub fn shutdown(&self) {
        let mut subscribers = self.lock_subscribers();
        self.inner.shutdown.store(true, Ordering::SeqCst);
        subscribers.clear();
        debug!("Event bus {} shut down", self.inner.name);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|subscriber| !subscriber.tx.is_closed());
        subscribers.len()
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber<T>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_isolated<T, F, Fut>(bus: &str, label: &str, handler: &F, message: T)
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    // The async block defers the call so a panic in the synchronous part is caught too.
    let outcome = AssertUnwindSafe(async { handler(message).await })
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Listener for {} on {} failed: {}", label, bus, e),
        Err(_) => error!("Listener for {} on {} panicked", label, bus),
    }
}

/// A cursor over every message published after it was opened.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// A subscription filtered down to one tag.
pub struct TaggedSubscription<T: Tagged> {
    inner: Subscription<T>,
    tag: T::Tag,
}

impl<T: Tagged> TaggedSubscription<T> {
    pub fn tag(&self) -> T::Tag {
        self.tag
    }

    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let message = self.inner.recv().await?;
            if message.tag() == self.tag {
                return Some(message);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        while let Some(message) = self.inner.try_recv() {
            if message.tag() == self.tag {
                return Some(message);
            }
        }
        None
    }
}

impl<T: Tagged> Stream for TaggedSubscription<T>
where
    T::Tag: Unpin,
{
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        loop {
            match self.inner.rx.poll_recv(cx) {
                Poll::Ready(Some(message)) if message.tag() == self.tag => {
                    return Poll::Ready(Some(message))
                }
                Poll::Ready(Some(_)) => continue,
                other => return other,
            }
        }
    }
}

/// Handle to a background listener; dropping it stops the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageTag};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_subscription_sees_every_message_in_order() {
        let bus: PubSub<u32> = PubSub::new("test");
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        for n in 0..5 {
            assert!(bus.publish(n));
        }

        for n in 0..5 {
            assert_eq!(a.recv().await, Some(n));
            assert_eq!(b.recv().await, Some(n));
        }
    }

    #[tokio::test]
    async fn test_subscription_only_sees_later_messages() {
        let bus: PubSub<u32> = PubSub::new("test");
        bus.publish(1);
        let mut late = bus.subscribe();
        bus.publish(2);
        assert_eq!(late.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_publish_and_completes_subscriptions() {
        let bus: PubSub<u32> = PubSub::new("test");
        let mut sub = bus.subscribe();
        bus.publish(7);
        bus.shutdown();

        assert!(bus.is_shutdown());
        assert!(!bus.publish(8));
        assert!(matches!(bus.try_publish(9), Err(SlideError::BusShutdown)));
        assert_eq!(sub.recv().await, Some(7));
        assert_eq!(sub.recv().await, None);

        let mut after = bus.subscribe();
        assert_eq!(after.recv().await, None);
    }

    #[tokio::test]
    async fn test_debug_reports_state_for_any_payload() {
        #[derive(Clone)]
        struct Opaque;
        let bus: PubSub<Opaque> = PubSub::new("opaque");
        assert!(format!("{:?}", bus).contains("shutdown: false"));
        bus.shutdown();
        assert!(format!("{:?}", bus).contains("shutdown: true"));
    }

    #[tokio::test]
    async fn test_validator_rejects_before_delivery() {
        let bus: PubSub<u32> = PubSub::with_validator("even", |n: &u32| {
            if n % 2 == 0 {
                Ok(())
            } else {
                Err(SlideError::validation("even", "odd number"))
            }
        });
        let mut sub = bus.subscribe();

        assert!(!bus.publish(3));
        assert!(matches!(
            bus.try_publish(5),
            Err(SlideError::Validation { .. })
        ));
        assert!(bus.publish(4));
        assert_eq!(sub.try_recv(), Some(4));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus: PubSub<u32> = PubSub::new("test");
        let sub = bus.subscribe();
        let _keep = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(sub);
        bus.publish(1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_listen_to_survives_failing_handler() {
        let bus: PubSub<Message> = PubSub::messages("test");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _listener = bus.listen_to(MessageTag::TaskStart, move |message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                match message {
                    Message::TaskStart { task_id, .. } if task_id == "boom" => {
                        Err(SlideError::Protocol {
                            message: "boom".into(),
                        })
                    }
                    _ => Ok(()),
                }
            }
        });

        bus.publish(Message::task_start("boom"));
        bus.publish(Message::app_ready());
        bus.publish(Message::task_start("ok"));

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tagged_try_recv_skips_other_tags() {
        let bus: PubSub<Message> = PubSub::messages("test");
        let mut starts = bus.subscribe_to(MessageTag::TaskStart);
        bus.publish(Message::app_ready());
        bus.publish(Message::task_start("t1"));
        assert!(matches!(
            starts.try_recv(),
            Some(Message::TaskStart { ref task_id, .. }) if task_id == "t1"
        ));
        assert!(starts.try_recv().is_none());
    }
}
