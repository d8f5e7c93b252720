//! Worker side of the demo: serves the procedure table on its own thread
//! and runtime until the host drops its end of the channel.

use anyhow::{anyhow, bail, Result};
use duplex_rpc::{EventEmitter, MessagePort, Procedure, ProcedureTable, RpcServer, Value};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize)]
struct AddParams {
    x: f64,
    y: f64,
}

/// Delay between two tick events.
const TICK_INTERVAL: Duration = Duration::from_millis(20);

pub fn run(port: MessagePort) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let server = RpcServer::new(port);
        let table = procedures(server.emitter())?;
        info!(
            "Worker serving {} procedures: {}",
            table.len(),
            table.names().join(", ")
        );

        server.serve(Arc::new(table)).join().await;
        info!("Worker channel closed");
        Ok::<_, anyhow::Error>(())
    })
}

fn procedures(events: EventEmitter) -> duplex_rpc::Result<ProcedureTable> {
    ProcedureTable::builder()
        .procedure(
            "add",
            Procedure::typed(|params: AddParams| async move { Ok(params.x + params.y) }),
        )
        .procedure("fail", Procedure::sync(|_| bail!("boom")))
        .procedure("checksum", Procedure::sync(checksum))
        .procedure(
            "ticks",
            Procedure::typed(move |count: u32| {
                let events = events.clone();
                async move {
                    for index in 0..count {
                        tokio::time::sleep(TICK_INTERVAL).await;
                        events.emit(
                            "tick",
                            Value::object([
                                ("index", Value::from(index)),
                                ("of", Value::from(count)),
                            ]),
                        )?;
                    }
                    Ok::<_, anyhow::Error>(count)
                }
            }),
        )
        .build()
}

/// Sum the bytes of `data.buf` and hand the buffer back.
fn checksum(data: Value) -> Result<Value> {
    let buf = data
        .get("buf")
        .and_then(Value::as_buffer)
        .cloned()
        .ok_or_else(|| anyhow!("expected an ArrayBuffer under \"buf\""))?;
    let sum: u64 = buf.as_bytes().iter().map(|&b| u64::from(b)).sum();

    Ok(Value::object([
        ("buf", Value::from(buf)),
        ("sum", Value::from(sum)),
    ]))
}
