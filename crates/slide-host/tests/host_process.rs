//! End-to-end tests against the `slide-host` binary.
//!
//! Each test starts the host on an ephemeral port, reads the announced port
//! from stdout and connects a renderer over the socket bridge.

use futures::StreamExt;
use slide_core::contract::{
    ActiveTasksRef, AppReadyRef, FilePayload, GetFileContent, ProjectFiles, ProjectPayload, Sum,
    SumPayload,
};
use slide_core::{IpcClient, Message, RendererSession, SlideError};
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

struct Host {
    _child: Child,
    addr: SocketAddr,
    _project: TempDir,
}

async fn spawn_host() -> Host {
    let project = TempDir::new().unwrap();
    std::fs::create_dir_all(project.path().join("docs")).unwrap();
    std::fs::write(project.path().join("docs/intro.md"), "# Intro").unwrap();
    std::fs::write(project.path().join("notes.txt"), "remember").unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_slide-host"))
        .arg("--ephemeral")
        .arg("--project")
        .arg(project.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let mut lines = BufReader::new(stdout).lines();
    let port = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(line) = lines.next_line().await.unwrap() {
            if let Some(port) = line.strip_prefix("SLIDE_PORT=") {
                return port.parse::<u16>().unwrap();
            }
        }
        panic!("host exited without announcing a port");
    })
    .await
    .expect("host did not announce a port");

    Host {
        _child: child,
        addr: SocketAddr::from(([127, 0, 0, 1], port)),
        _project: project,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_host_serves_sum() {
    let host = spawn_host().await;
    let session = RendererSession::new(IpcClient::connect(host.addr).await.unwrap());
    let client = session.rpc_client();

    let total = client
        .invoke::<Sum>(SumPayload { a: 2.0, b: 3.0 })
        .await
        .unwrap();
    assert_eq!(total, 5.0);
    assert!(matches!(
        client.call("Sum", serde_json::json!({"a": "x", "b": 3})).await,
        Err(SlideError::InvalidParams { .. })
    ));
}

#[tokio::test]
async fn test_host_serves_project_files() {
    let host = spawn_host().await;
    let session = RendererSession::new(IpcClient::connect(host.addr).await.unwrap());
    let client = session.rpc_client();

    let files: Vec<String> = client
        .invoke_stream::<ProjectFiles>(ProjectPayload::default())
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(files, vec!["docs/intro.md", "notes.txt"]);

    let content = client
        .invoke::<GetFileContent>(FilePayload {
            path: "docs/intro.md".into(),
        })
        .await
        .unwrap();
    assert_eq!(content, "# Intro");

    let escaped = client
        .invoke::<GetFileContent>(FilePayload {
            path: "../outside".into(),
        })
        .await
        .unwrap_err();
    assert!(escaped.rpc_error::<String>().is_some());
}

#[tokio::test]
async fn test_host_reports_ready_and_tracks_tasks() {
    let host = spawn_host().await;
    let session = RendererSession::new(IpcClient::connect(host.addr).await.unwrap());

    let ready = session
        .mirror(AppReadyRef::ID, AppReadyRef::schema())
        .unwrap();
    assert!(ready.get().await.unwrap().is_ready);

    let tasks = session
        .mirror(ActiveTasksRef::ID, ActiveTasksRef::schema())
        .unwrap();
    wait_until(|| tasks.current() == Some(Vec::new())).await;

    session.pubsub().publish(&Message::task_start("t2")).unwrap();
    session.pubsub().publish(&Message::task_start("t1")).unwrap();
    wait_until(|| tasks.current().map(|t| t.len()) == Some(2)).await;
    assert_eq!(
        tasks.current().unwrap(),
        vec!["t1".to_string(), "t2".to_string()]
    );

    session.pubsub().publish(&Message::task_stop("t2")).unwrap();
    wait_until(|| tasks.current() == Some(vec!["t1".to_string()])).await;
}
