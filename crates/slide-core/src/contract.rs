//! Procedures and refs shared by the main process and the renderers.
//!
//! Both sides compile against these declarations: the host registers a
//! handler per procedure and checks the table against [`PROCEDURES`] at
//! startup, and renderers call them through
//! [`RpcClient::invoke`](crate::client::RpcClient::invoke).

use crate::error::Result;
use crate::message::{now_millis, Message};
use crate::project::ProjectChange;
use crate::pubsub::{ListenerHandle, PubSub};
use crate::refs::{IpcRef, IpcRefService};
use crate::rpc::RpcProcedure;
use crate::schema::SerdeSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Adds two numbers.
pub struct Sum;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SumPayload {
    pub a: f64,
    pub b: f64,
}

impl RpcProcedure for Sum {
    const NAME: &'static str = "Sum";
    type Payload = SumPayload;
    type Success = f64;
    type Error = String;

    fn validate(payload: &SumPayload) -> std::result::Result<(), String> {
        if payload.a.is_finite() && payload.b.is_finite() {
            Ok(())
        } else {
            Err("operands must be finite numbers".to_string())
        }
    }
}

/// Text content of one project file.
pub struct GetFileContent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilePayload {
    /// Project-relative path.
    pub path: String,
}

impl RpcProcedure for GetFileContent {
    const NAME: &'static str = "GetFileContent";
    type Payload = FilePayload;
    type Success = String;
    type Error = String;

    fn validate(payload: &FilePayload) -> std::result::Result<(), String> {
        if payload.path.trim().is_empty() {
            Err("path must not be empty".to_string())
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectPayload {
    /// Project-relative directory; the whole project when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

/// Streams every file path in the project.
pub struct ProjectFiles;

impl RpcProcedure for ProjectFiles {
    const NAME: &'static str = "ProjectFiles";
    const STREAM: bool = true;
    type Payload = ProjectPayload;
    type Success = String;
    type Error = String;
}

/// Streams add/change/unlink events below the project root.
pub struct WatchProject;

impl RpcProcedure for WatchProject {
    const NAME: &'static str = "WatchProject";
    const STREAM: bool = true;
    type Payload = ProjectPayload;
    type Success = ProjectChange;
    type Error = String;
}

/// Every procedure the host must serve.
pub const PROCEDURES: &[&str] = &[
    Sum::NAME,
    GetFileContent::NAME,
    ProjectFiles::NAME,
    WatchProject::NAME,
];

/// Whether the main process finished starting up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppReadyState {
    pub is_ready: bool,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
}

impl AppReadyState {
    pub fn initial() -> Self {
        Self {
            is_ready: false,
            timestamp: now_millis(),
            error: None,
            error_details: None,
            current_task_id: None,
        }
    }

    pub fn ready() -> Self {
        Self {
            is_ready: true,
            ..Self::initial()
        }
    }
}

pub struct AppReadyRef;

impl AppReadyRef {
    pub const ID: &'static str = "app-ready";

    pub fn schema() -> SerdeSchema<AppReadyState> {
        SerdeSchema::new("AppReadyState").with_validator(|state: &AppReadyState| {
            if state.timestamp.is_finite() && state.timestamp >= 0.0 {
                Ok(())
            } else {
                Err("timestamp must be a non-negative finite number".to_string())
            }
        })
    }
}

/// Ids of the tasks whose agent is running, sorted.
pub struct ActiveTasksRef;

impl ActiveTasksRef {
    pub const ID: &'static str = "active-tasks";

    pub fn schema() -> SerdeSchema<Vec<String>> {
        SerdeSchema::new("ActiveTasks").with_validator(|tasks: &Vec<String>| {
            if tasks.iter().any(String::is_empty) {
                return Err("task ids must not be empty".to_string());
            }
            if tasks.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err("task ids must be sorted and unique".to_string());
            }
            Ok(())
        })
    }

    /// The task set after `message`; unrelated messages leave it unchanged.
    pub fn apply(tasks: &[String], message: &Message) -> Vec<String> {
        let mut next = tasks.to_vec();
        match message {
            Message::TaskStart { task_id, .. } | Message::TaskContinue { task_id, .. } => {
                if let Err(index) = next.binary_search(task_id) {
                    next.insert(index, task_id.clone());
                }
            }
            Message::TaskStop { task_id, .. } | Message::TaskExited { task_id, .. } => {
                next.retain(|id| id != task_id);
            }
            _ => {}
        }
        next
    }

    fn is_lifecycle(message: &Message) -> bool {
        matches!(
            message,
            Message::TaskStart { .. }
                | Message::TaskContinue { .. }
                | Message::TaskStop { .. }
                | Message::TaskExited { .. }
        )
    }

    /// Create the ref and keep it in step with task lifecycle messages.
    ///
    /// Each message is applied inside the ref's mutation path, so changes
    /// made to the ref by other writers are never overwritten.
    pub async fn track(
        refs: &IpcRefService,
        bus: &PubSub<Message>,
    ) -> Result<(IpcRef<SerdeSchema<Vec<String>>>, ListenerHandle)> {
        let tasks = refs
            .create(Self::ID, Vec::new(), Self::schema(), None)
            .await?;
        let tracked = tasks.clone();
        let listener = bus.listen(move |message| {
            let tasks = tracked.clone();
            async move {
                if !Self::is_lifecycle(&message) {
                    return Ok(());
                }
                tasks.update(|current| Self::apply(current, &message)).await?;
                debug!("Active tasks now {:?}", tasks.get());
                Ok(())
            }
        });
        Ok((tasks, listener))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use serde_json::json;

    #[test]
    fn test_procedure_table_is_unique() {
        let mut names = PROCEDURES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), PROCEDURES.len());
    }

    #[test]
    fn test_sum_payload_requires_numbers() {
        assert!(serde_json::from_value::<SumPayload>(json!({"a": 2, "b": 3})).is_ok());
        assert!(serde_json::from_value::<SumPayload>(json!({"a": "x", "b": 3})).is_err());
    }

    #[test]
    fn test_active_tasks_apply() {
        let tasks = ActiveTasksRef::apply(&[], &Message::task_start("b"));
        let tasks = ActiveTasksRef::apply(&tasks, &Message::task_start("a"));
        let tasks = ActiveTasksRef::apply(&tasks, &Message::task_start("a"));
        assert_eq!(tasks, vec!["a".to_string(), "b".to_string()]);

        let tasks = ActiveTasksRef::apply(&tasks, &Message::task_exited("b"));
        assert_eq!(tasks, vec!["a".to_string()]);
        let tasks = ActiveTasksRef::apply(&tasks, &Message::app_ready());
        assert_eq!(tasks, vec!["a".to_string()]);
    }

    #[test]
    fn test_active_tasks_schema_rejects_unsorted() {
        let schema = ActiveTasksRef::schema();
        assert!(schema.decode(&json!(["a", "b"])).is_ok());
        assert!(schema.decode(&json!(["b", "a"])).is_err());
        assert!(schema.decode(&json!(["a", "a"])).is_err());
    }

    #[tokio::test]
    async fn test_active_tasks_follow_the_bus() {
        let (registry, _inbound) = crate::host::ConnectionRegistry::new();
        let refs = IpcRefService::new(
            std::sync::Arc::new(crate::store::MemoryStore::new()),
            registry,
            "ipcref",
        );
        let bus = PubSub::messages("contract-test");
        let (tasks, _listener) = ActiveTasksRef::track(&refs, &bus).await.unwrap();

        bus.publish(Message::task_start("t1"));
        bus.publish(Message::task_start("t2"));
        bus.publish(Message::task_stop("t1"));
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while tasks.get() != vec!["t2".to_string()] {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_tracking_keeps_concurrent_writes() {
        let (registry, _inbound) = crate::host::ConnectionRegistry::new();
        let refs = IpcRefService::new(
            std::sync::Arc::new(crate::store::MemoryStore::new()),
            registry,
            "ipcref",
        );
        let bus = PubSub::messages("contract-test");
        let (tasks, _listener) = ActiveTasksRef::track(&refs, &bus).await.unwrap();

        let (release, held) = tokio::sync::oneshot::channel::<()>();
        let (started, running) = tokio::sync::oneshot::channel::<()>();
        let manual = {
            let tasks = tasks.clone();
            tokio::spawn(async move {
                tasks
                    .update_effect(|current| async move {
                        let _ = started.send(());
                        let _ = held.await;
                        Ok::<_, crate::error::SlideError>(ActiveTasksRef::apply(
                            &current,
                            &Message::task_start("manual"),
                        ))
                    })
                    .await
            })
        };
        running.await.unwrap();

        bus.publish(Message::task_start("t1"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        release.send(()).unwrap();
        manual.await.unwrap().unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while tasks.get().len() != 2 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(tasks.get(), vec!["manual".to_string(), "t1".to_string()]);
    }

    #[test]
    fn test_app_ready_wire_shape() {
        let encoded = AppReadyRef::schema().encode(&AppReadyState::ready()).unwrap();
        assert_eq!(encoded["isReady"], json!(true));
        assert!(encoded.get("errorDetails").is_none());
    }
}
