//! Republishing an external agent's event stream onto the bus.
//!
//! The agent process itself lives outside this crate. Whatever drives it
//! implements [`AgentEventSource`]; [`spawn_agent_republisher`] turns every
//! event into bus messages so renderers refresh the affected task.

use crate::message::{now_millis, Message};
use crate::pubsub::PubSub;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One observation from a running agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The agent produced output for a task.
    Output { task_id: String, payload: Value },
    /// The agent for a task finished.
    Exited {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip: Option<bool>,
    },
}

impl AgentEvent {
    pub fn task_id(&self) -> &str {
        match self {
            AgentEvent::Output { task_id, .. } | AgentEvent::Exited { task_id, .. } => task_id,
        }
    }
}

/// Query key invalidating one task and its messages.
pub fn task_query_key(task_id: &str) -> Vec<Value> {
    vec![json!("tasks"), json!(task_id)]
}

/// Query key invalidating every task list.
pub fn tasks_query_key() -> Vec<Value> {
    vec![json!("tasks")]
}

/// Bus messages announcing one agent event.
pub fn messages_for(event: &AgentEvent) -> Vec<Message> {
    match event {
        AgentEvent::Output { task_id, .. } => {
            vec![Message::invalidate_query(task_query_key(task_id))]
        }
        AgentEvent::Exited { task_id, skip } => vec![
            Message::TaskExited {
                task_id: task_id.clone(),
                skip: *skip,
                timestamp: now_millis(),
            },
            Message::invalidate_query(tasks_query_key()),
        ],
    }
}

/// Source of agent events.
#[async_trait]
pub trait AgentEventSource: Send + 'static {
    /// Next event, or `None` once the agent side has gone away.
    async fn next_event(&mut self) -> Option<AgentEvent>;
}

#[async_trait]
impl AgentEventSource for mpsc::UnboundedReceiver<AgentEvent> {
    async fn next_event(&mut self) -> Option<AgentEvent> {
        self.recv().await
    }
}

#[async_trait]
impl AgentEventSource for mpsc::Receiver<AgentEvent> {
    async fn next_event(&mut self) -> Option<AgentEvent> {
        self.recv().await
    }
}

/// Publish the messages for every agent event until the source ends or the
/// bus shuts down. Resolves to the number of messages published.
pub fn spawn_agent_republisher<S: AgentEventSource>(
    mut source: S,
    bus: PubSub<Message>,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut published = 0;
        while let Some(event) = source.next_event().await {
            debug!("Agent event for task {}", event.task_id());
            for message in messages_for(&event) {
                if let Err(e) = message.validate() {
                    warn!("Dropping invalid agent message: {}", e);
                    continue;
                }
                if !bus.publish(message) {
                    info!("Bus shut down, agent republisher stopping");
                    return published;
                }
                published += 1;
            }
        }
        debug!("Agent event source ended");
        published
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageTag;

    #[tokio::test]
    async fn test_events_are_republished_in_order() {
        let bus: PubSub<Message> = PubSub::messages("agent-test");
        let mut sub = bus.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let republisher = spawn_agent_republisher(rx, bus.clone());

        tx.send(AgentEvent::Output {
            task_id: "t1".into(),
            payload: json!({"type": "assistant"}),
        })
        .unwrap();
        tx.send(AgentEvent::Exited {
            task_id: "t1".into(),
            skip: None,
        })
        .unwrap();
        drop(tx);

        assert_eq!(republisher.await.unwrap(), 3);
        let first = sub.recv().await.unwrap();
        assert!(matches!(
            first,
            Message::InvalidateQuery { ref query_key, .. } if *query_key == task_query_key("t1")
        ));
        assert_eq!(sub.recv().await.unwrap().tag(), MessageTag::TaskExited);
        assert_eq!(sub.recv().await.unwrap().tag(), MessageTag::InvalidateQuery);
    }

    #[tokio::test]
    async fn test_invalid_events_are_skipped() {
        let bus: PubSub<Message> = PubSub::messages("agent-test");
        let (tx, rx) = mpsc::unbounded_channel();
        let republisher = spawn_agent_republisher(rx, bus.clone());
        tx.send(AgentEvent::Exited {
            task_id: String::new(),
            skip: Some(true),
        })
        .unwrap();
        drop(tx);
        // Only the task-list invalidation survives validation.
        assert_eq!(republisher.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stops_when_bus_shuts_down() {
        let bus: PubSub<Message> = PubSub::messages("agent-test");
        bus.shutdown();
        let (tx, rx) = mpsc::unbounded_channel();
        let republisher = spawn_agent_republisher(rx, bus);
        tx.send(AgentEvent::Output {
            task_id: "t".into(),
            payload: Value::Null,
        })
        .unwrap();
        assert_eq!(republisher.await.unwrap(), 0);
    }
}
