//! Integration tests for the RPC transport: request, stream, exit and
//! interrupt handling between a renderer client and the server.

use futures::StreamExt;
use serde_json::{json, Value};
use slide_core::contract::{Sum, SumPayload};
use slide_core::rpc::{ClientFrame, ServerFrame};
use slide_core::{RequestId, Router, RpcProcedure, SlideError, SlideRuntime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Count;

impl RpcProcedure for Count {
    const NAME: &'static str = "Count";
    const STREAM: bool = true;
    type Payload = u32;
    type Success = u32;
    type Error = String;
}

struct Forever;

impl RpcProcedure for Forever {
    const NAME: &'static str = "Forever";
    const STREAM: bool = true;
    type Payload = ();
    type Success = u64;
    type Error = String;
}

struct Hang;

impl RpcProcedure for Hang {
    const NAME: &'static str = "Hang";
    type Payload = ();
    type Success = ();
    type Error = String;
}

struct Divide;

#[derive(serde::Serialize, serde::Deserialize)]
struct DividePayload {
    a: i64,
    b: i64,
}

impl RpcProcedure for Divide {
    const NAME: &'static str = "Divide";
    type Payload = DividePayload;
    type Success = i64;
    type Error = String;
}

struct Fixture {
    runtime: SlideRuntime,
    sum_calls: Arc<AtomicUsize>,
}

async fn fixture() -> Fixture {
    let sum_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&sum_calls);
    let mut router = Router::new();
    router
        .unary::<Sum, _, _>(move |p| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(p.a + p.b) }
        })
        .unwrap()
        .stream::<Count, _, _>(|n| futures::stream::iter((0..n).map(Ok)))
        .unwrap()
        .stream::<Forever, _, _>(|_| futures::stream::iter((0u64..).map(Ok)))
        .unwrap()
        .unary::<Hang, _, _>(|_| futures::future::pending())
        .unwrap()
        .unary::<Divide, _, _>(|p| async move {
            if p.b == 0 {
                Err("division by zero".to_string())
            } else {
                Ok(p.a / p.b)
            }
        })
        .unwrap();
    let runtime = SlideRuntime::builder()
        .with_router(router)
        .build()
        .await
        .unwrap();
    Fixture { runtime, sum_calls }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_sum_returns_total() {
    let f = fixture().await;
    let session = f.runtime.connect_renderer();
    let client = session.rpc_client();

    let total = client
        .invoke::<Sum>(SumPayload { a: 2.0, b: 3.0 })
        .await
        .unwrap();
    assert_eq!(total, 5.0);
    assert_eq!(f.sum_calls.load(Ordering::SeqCst), 1);
    f.runtime.shutdown().await;
}

#[tokio::test]
async fn test_sum_with_string_operand_is_rejected_before_handler() {
    let f = fixture().await;
    let session = f.runtime.connect_renderer();
    let client = session.rpc_client();

    let outcome = client.call("Sum", json!({"a": "x", "b": 3})).await;
    assert!(matches!(outcome, Err(SlideError::InvalidParams { .. })));
    assert_eq!(f.sum_calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.pending_requests(), 0);
    f.runtime.shutdown().await;
}

#[tokio::test]
async fn test_typed_error_reaches_caller() {
    let f = fixture().await;
    let session = f.runtime.connect_renderer();
    let client = session.rpc_client();

    let err = client
        .invoke::<Divide>(DividePayload { a: 1, b: 0 })
        .await
        .unwrap_err();
    assert_eq!(err.rpc_error::<String>().as_deref(), Some("division by zero"));
    assert_eq!(
        client.invoke::<Divide>(DividePayload { a: 9, b: 3 }).await.unwrap(),
        3
    );
    f.runtime.shutdown().await;
}

#[tokio::test]
async fn test_unknown_procedure_is_typed_error() {
    let f = fixture().await;
    let session = f.runtime.connect_renderer();
    let client = session.rpc_client();
    assert!(matches!(
        client.call("Missing", Value::Null).await,
        Err(SlideError::ProcedureNotFound { .. })
    ));
    f.runtime.shutdown().await;
}

#[tokio::test]
async fn test_stream_yields_every_chunk_then_ends() {
    let f = fixture().await;
    let session = f.runtime.connect_renderer();
    let client = session.rpc_client();

    for m in [0u32, 1, 7] {
        let stream = client.invoke_stream::<Count>(m).await.unwrap();
        let items: Vec<u32> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(items, (0..m).collect::<Vec<_>>());
    }
    assert_eq!(client.pending_requests(), 0);
    f.runtime.shutdown().await;
}

#[tokio::test]
async fn test_interrupt_ends_stream_without_more_chunks() {
    let f = fixture().await;
    let session = f.runtime.connect_renderer();
    let client = session.rpc_client();

    let mut stream = client.invoke_stream::<Forever>(()).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), 0);
    assert_eq!(stream.next().await.unwrap().unwrap(), 1);

    stream.interrupt().unwrap();
    assert!(matches!(
        stream.next().await,
        Some(Err(SlideError::Interrupted { .. }))
    ));
    assert!(stream.next().await.is_none());
    assert_eq!(client.pending_requests(), 0);
    f.runtime.shutdown().await;
}

#[tokio::test]
async fn test_stuck_handler_stays_open_until_interrupted() {
    let f = fixture().await;
    let session = f.runtime.connect_renderer();
    let client = session.rpc_client();
    let connection = session.id();

    let caller = {
        let client = client.clone();
        tokio::spawn(async move { client.call("Hang", Value::Null).await })
    };
    let rpc = f.runtime.rpc().clone();
    wait_until(|| rpc.active_requests(connection) == 1).await;

    // No timeout applies: the request is still open later on.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rpc.active_requests(connection), 1);
    assert!(!caller.is_finished());

    // Abandoning the call interrupts it on the server.
    caller.abort();
    wait_until(|| rpc.active_requests(connection) == 0).await;
    assert_eq!(client.pending_requests(), 0);
    f.runtime.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_share_one_port() {
    let f = fixture().await;
    let session = f.runtime.connect_renderer();
    let client = session.rpc_client();

    let calls = (0..8).map(|i| {
        let client = client.clone();
        async move {
            client
                .invoke::<Sum>(SumPayload {
                    a: i as f64,
                    b: 1.0,
                })
                .await
        }
    });
    let totals = futures::future::join_all(calls).await;
    for (i, total) in totals.into_iter().enumerate() {
        assert_eq!(total.unwrap(), i as f64 + 1.0);
    }
    assert_eq!(f.runtime.rpc().client_ids(), vec![session.id()]);
    f.runtime.shutdown().await;
}

#[tokio::test]
async fn test_cleanup_rejects_later_calls() {
    let f = fixture().await;
    let session = f.runtime.connect_renderer();
    let client = session.rpc_client();
    client.ensure_connection().await.unwrap();

    client.cleanup();
    assert!(client.is_closed());
    assert!(matches!(
        client.invoke::<Sum>(SumPayload { a: 1.0, b: 1.0 }).await,
        Err(SlideError::ClientClosed)
    ));
    f.runtime.shutdown().await;
}

#[tokio::test]
async fn test_destroyed_renderer_fails_pending_calls() {
    let f = fixture().await;
    let session = f.runtime.connect_renderer();
    let client = session.rpc_client();
    let connection = session.id();

    let caller = {
        let client = client.clone();
        tokio::spawn(async move { client.call("Hang", Value::Null).await })
    };
    let rpc = f.runtime.rpc().clone();
    wait_until(|| rpc.active_requests(connection) == 1).await;

    f.runtime.registry().destroy(connection);
    let outcome = tokio::time::timeout(Duration::from_secs(2), caller)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(SlideError::ConnectionLost { .. })));
    wait_until(|| rpc.client_ids().is_empty()).await;
    f.runtime.shutdown().await;
}

#[test]
fn test_request_ids_at_safe_integer_boundary_round_trip() {
    const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;
    for raw in [MAX_SAFE_INTEGER, MAX_SAFE_INTEGER + 1, MAX_SAFE_INTEGER + 2, u64::MAX] {
        let id = RequestId(raw);

        // Client to server.
        let request = serde_json::to_value(ClientFrame::Request {
            id,
            tag: "Sum".into(),
            payload: Value::Null,
            headers: Vec::new(),
        })
        .unwrap();
        assert_eq!(request["id"], json!(raw.to_string()));
        let ClientFrame::Request { id: decoded, .. } =
            serde_json::from_value::<ClientFrame>(request).unwrap()
        else {
            panic!("expected a request frame");
        };
        assert_eq!(decoded, id);

        // Server to client.
        let chunk = serde_json::to_value(ServerFrame::Chunk {
            request_id: id,
            values: vec![],
        })
        .unwrap();
        assert_eq!(chunk["requestId"], json!(raw.to_string()));
        let decoded: ServerFrame = serde_json::from_value(chunk).unwrap();
        assert_eq!(decoded.request_id(), Some(id));
    }
}
