//! End-to-end tests with the server on a worker thread.
//!
//! The worker runs its own single-threaded runtime, the way a host and a
//! worker each own their event loop, and the two sides share nothing but
//! the channel.

use anyhow::anyhow;
use duplex_rpc::{
    peek_transferables, ArrayBuffer, ClientConfig, EventEmitter, MessageChannel, MessagePort,
    Procedure, ProcedureTable, RpcClient, RpcError, RpcServer, UidStrategy, Value,
};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Deserialize)]
struct AddArgs {
    x: f64,
    y: f64,
}

fn worker_procedures(events: EventEmitter) -> ProcedureTable {
    ProcedureTable::builder()
        .procedure(
            "add",
            Procedure::typed(|args: AddArgs| async move { Ok(args.x + args.y) }),
        )
        .procedure("fail", Procedure::sync(|_| Err(anyhow!("boom"))))
        .procedure(
            "store",
            Procedure::sync(|data| {
                let buf = data
                    .get("buf")
                    .and_then(Value::as_buffer)
                    .cloned()
                    .ok_or_else(|| anyhow!("buf must be an ArrayBuffer"))?;
                let len = buf.len();
                Ok(Value::object([
                    ("buf", Value::from(buf)),
                    ("len", Value::from(len)),
                ]))
            }),
        )
        .procedure(
            "sleep",
            Procedure::typed(|ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            }),
        )
        .procedure(
            "progress",
            Procedure::typed(move |steps: u32| {
                let events = events.clone();
                async move {
                    for step in 0..steps {
                        events.emit("progress", Value::from(step))?;
                    }
                    Ok::<_, anyhow::Error>("done")
                }
            }),
        )
        .build()
        .unwrap()
}

/// Run a server for `port` on its own thread and runtime until the client
/// side of the channel goes away.
fn spawn_worker(port: MessagePort) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let server = RpcServer::new(port);
            let table = worker_procedures(server.emitter());
            server.serve(Arc::new(table)).join().await;
        });
    })
}

fn connect() -> (RpcClient, JoinHandle<()>) {
    let (host_port, worker_port) = MessageChannel::new();
    let worker = spawn_worker(worker_port);
    (RpcClient::new(host_port), worker)
}

#[tokio::test]
async fn test_add_returns_sum() {
    let (client, _worker) = connect();
    let result = client
        .call(
            "add",
            Value::object([("x", Value::from(2)), ("y", Value::from(3))]),
        )
        .await
        .unwrap();
    assert_eq!(result, Value::from(5));
}

#[tokio::test]
async fn test_unknown_method_rejects_with_exact_text() {
    let (client, _worker) = connect();
    let err = client.call("mul", Value::Null).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));
    assert_eq!(err.to_string(), "Unknown RPC method \"mul\"");
}

#[tokio::test]
async fn test_failing_procedure_rejects_with_its_message() {
    let (client, _worker) = connect();
    let err = client.call("fail", Value::Null).await.unwrap_err();
    assert!(err.remote_message().unwrap().contains("boom"));
}

#[tokio::test]
async fn test_buffers_travel_by_transfer_both_ways() {
    let (client, _worker) = connect();
    let buf = ArrayBuffer::zeroed(10);
    let data = Value::object([("buf", Value::from(buf.clone())), ("n", Value::from(5))]);

    let transfer = peek_transferables(&data);
    assert_eq!(transfer.len(), 1);
    assert!(transfer[0].same_buffer(&buf));

    let result = client.call("store", data).await.unwrap();
    assert_eq!(result.get("len"), Some(&Value::from(10)));
    let returned = result.get("buf").and_then(Value::as_buffer).unwrap();
    assert!(returned.same_buffer(&buf));
}

#[tokio::test]
async fn test_bad_argument_fails_the_call() {
    let (client, _worker) = connect();
    let err = client
        .call("add", Value::object([("x", Value::from("two"))]))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));
}

#[tokio::test]
async fn test_slow_call_does_not_block_fast_call() {
    let (client, _worker) = connect();
    let finished = Mutex::new(Vec::new());

    let slow = async {
        let ms: u64 = client.call_typed("sleep", &300u64).await.unwrap();
        finished.lock().unwrap().push(ms);
    };
    let fast = async {
        let ms: u64 = client.call_typed("sleep", &10u64).await.unwrap();
        finished.lock().unwrap().push(ms);
    };
    tokio::join!(slow, fast);

    assert_eq!(*finished.lock().unwrap(), vec![10, 300]);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_many_concurrent_calls_correlate() {
    let (client, _worker) = connect();
    let calls = (0..50).map(|n| {
        let client = &client;
        async move {
            let sum: f64 = client
                .call_typed("add", &serde_json::json!({ "x": n, "y": 1 }))
                .await
                .unwrap();
            (n, sum)
        }
    });

    for (n, sum) in futures::future::join_all(calls).await {
        assert_eq!(sum, f64::from(n + 1));
    }
}

#[tokio::test]
async fn test_events_arrive_before_the_reply() {
    let (client, _worker) = connect();
    let (_id, mut progress) = client.subscribe("progress");

    let done: String = client.call_typed("progress", &3u32).await.unwrap();
    assert_eq!(done, "done");

    for step in 0..3 {
        assert_eq!(progress.try_recv().unwrap(), Value::from(step));
    }
    assert!(progress.try_recv().is_err());
}

#[tokio::test]
async fn test_random_uids_work_end_to_end() {
    let (host_port, worker_port) = MessageChannel::new();
    let _worker = spawn_worker(worker_port);
    let config = ClientConfig::default().with_uid_strategy(UidStrategy::Random);
    let client = RpcClient::with_config(host_port, config);

    let sum: f64 = client
        .call_typed("add", &serde_json::json!({ "x": 1.5, "y": 2 }))
        .await
        .unwrap();
    assert_eq!(sum, 3.5);
}

#[tokio::test]
async fn test_worker_stops_when_client_is_dropped() {
    let (client, worker) = connect();
    let result: f64 = client
        .call_typed("add", &serde_json::json!({ "x": 1, "y": 1 }))
        .await
        .unwrap();
    assert_eq!(result, 2.0);

    drop(client);
    tokio::task::spawn_blocking(move || worker.join())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_calls_fail_once_server_is_gone() {
    let (host_port, worker_port) = MessageChannel::new();
    let table = ProcedureTable::builder()
        .procedure("ping", Procedure::sync(|_| Ok(Value::from("pong"))))
        .build()
        .unwrap();
    let handle = RpcServer::start(table, worker_port);
    let client = RpcClient::new(host_port);

    assert_eq!(
        client.call("ping", Value::Null).await.unwrap(),
        Value::from("pong")
    );

    drop(handle);
    // The client notices once its receive loop sees the channel end.
    while !client.is_closed() {
        tokio::task::yield_now().await;
    }
    let err = client.call("ping", Value::Null).await.unwrap_err();
    assert!(err.is_channel_closed());
}
