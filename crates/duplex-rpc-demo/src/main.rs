//! duplex-rpc demo - a host and a worker talking over one channel.
//!
//! The worker thread hosts an RPC server; the host drives a short scenario
//! through an RPC client and logs what comes back.

mod worker;

use anyhow::{bail, Result};
use clap::Parser;
use duplex_rpc::{ArrayBuffer, ClientConfig, MessageChannel, RpcClient, UidStrategy, Value};
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "duplex-rpc-demo")]
#[command(about = "Host/worker RPC demo over an in-process channel")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// How call uids are generated (counter or random)
    #[arg(long, default_value = "counter")]
    uid_strategy: UidStrategy,

    /// Fail calls that get no reply within this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Size in bytes of the buffer sent to the worker
    #[arg(long, default_value = "1024")]
    buffer_size: usize,

    /// Number of tick events the worker emits
    #[arg(long, default_value = "3")]
    ticks: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();

    info!("Starting duplex-rpc demo");

    let (host_port, worker_port) = MessageChannel::new();
    let worker = std::thread::Builder::new()
        .name("rpc-worker".into())
        .spawn(move || worker::run(worker_port))?;

    let mut config = ClientConfig::default().with_uid_strategy(args.uid_strategy);
    if let Some(ms) = args.timeout_ms {
        config = config.with_call_timeout(Duration::from_millis(ms));
    }
    info!("Client uid strategy: {}", config.uid_strategy);
    let client = RpcClient::with_config(host_port, config);

    run_scenario(&client, &args).await?;

    // Dropping the client closes the channel, which stops the worker.
    drop(client);
    match tokio::task::spawn_blocking(move || worker.join()).await? {
        Ok(result) => result?,
        Err(_) => bail!("worker thread panicked"),
    }

    info!("Worker stopped, exiting");
    Ok(())
}

async fn run_scenario(client: &RpcClient, args: &Args) -> Result<()> {
    let params = Value::from(serde_json::json!({ "x": 2, "y": 3 }));
    let sum = client.call("add", params).await?;
    info!("add(2, 3) = {:?}", sum);

    match client.call("mul", Value::Null).await {
        Ok(value) => warn!("mul unexpectedly returned {:?}", value),
        Err(e) => info!("mul rejected: {}", e),
    }

    match client.call("fail", Value::Null).await {
        Ok(value) => warn!("fail unexpectedly returned {:?}", value),
        Err(e) => info!("fail rejected: {}", e),
    }

    let buf = ArrayBuffer::from(vec![1u8; args.buffer_size]);
    let data = Value::object([
        ("buf", Value::from(buf.clone())),
        ("n", Value::from(args.buffer_size)),
    ]);
    info!(
        "Sending {} byte buffer ({} transferables)",
        buf.len(),
        duplex_rpc::peek_transferables(&data).len()
    );
    let reply = client.call("checksum", data).await?;
    let returned_same = reply
        .get("buf")
        .and_then(Value::as_buffer)
        .is_some_and(|returned| returned.same_buffer(&buf));
    info!(
        "checksum = {:?}, buffer came back without copying: {}",
        reply.get("sum"),
        returned_same
    );

    let (_listener, mut ticks) = client.subscribe("tick");
    let count: u32 = client.call_typed("ticks", &args.ticks).await?;
    // Events precede the reply on the channel, so all of them are queued.
    while let Ok(tick) = ticks.try_recv() {
        info!(
            "tick {:?} of {:?}",
            tick.get("index").and_then(duplex_rpc::Value::as_f64),
            tick.get("of").and_then(duplex_rpc::Value::as_f64)
        );
    }
    info!("ticks finished after {} events", count);

    Ok(())
}
