//! RPC server: procedure table and dispatch loop.
//!
//! Receives request envelopes from the channel, looks the method up in an
//! immutable procedure table, runs the procedure and sends back exactly one
//! reply per request.
//!
//! # Concurrency
//!
//! Each request is dispatched on its own task, so a procedure that awaits
//! does not hold up the ones behind it and replies may go out in a different
//! order than requests came in. The table is read-only after construction
//! and shared via `Arc` without locking.

use crate::channel::{Port, PortReceiver, PortSender};
use crate::error::{panic_message, DispatchError};
use crate::events::EventEmitter;
use crate::protocol::{Reply, Request};
use crate::transfer::peek_transferables;
use crate::value::Value;
use crate::{Result, RpcError};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Future returned by a procedure.
pub type ProcedureFuture = BoxFuture<'static, anyhow::Result<Value>>;

type Handler = dyn Fn(Value) -> ProcedureFuture + Send + Sync;

/// A remotely callable function taking one data argument.
#[derive(Clone)]
pub struct Procedure {
    handler: Arc<Handler>,
}

impl Procedure {
    /// Wrap an async handler.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |data| handler(data).boxed()),
        }
    }

    /// Wrap a handler that completes immediately.
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(move |data| futures::future::ready(handler(data)).boxed()),
        }
    }

    /// Wrap an async handler with serde-typed argument and result.
    ///
    /// An argument that does not deserialize into `T` fails the call.
    pub fn typed<T, U, F, Fut>(handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        U: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        Self::new(move |data: Value| {
            let call = data.deserialize_into::<T>().map(&handler);
            async move {
                let output = call?.await?;
                Ok::<_, anyhow::Error>(Value::from_serialize(&output)?)
            }
        })
    }

    /// Run the procedure.
    pub fn invoke(&self, data: Value) -> ProcedureFuture {
        (self.handler)(data)
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure").finish_non_exhaustive()
    }
}

/// Immutable mapping from method name to procedure.
#[derive(Debug, Clone, Default)]
pub struct ProcedureTable {
    procedures: Arc<HashMap<String, Procedure>>,
}

impl ProcedureTable {
    pub fn builder() -> ProcedureTableBuilder {
        ProcedureTableBuilder::default()
    }

    pub fn get(&self, method: &str) -> Option<&Procedure> {
        self.procedures.get(method)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.procedures.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Collects procedures before the table is frozen.
#[derive(Debug, Default)]
pub struct ProcedureTableBuilder {
    procedures: HashMap<String, Procedure>,
    duplicate: Option<String>,
}

impl ProcedureTableBuilder {
    pub fn procedure(mut self, name: impl Into<String>, procedure: Procedure) -> Self {
        let name = name.into();
        if self.procedures.contains_key(&name) {
            self.duplicate.get_or_insert(name);
        } else {
            self.procedures.insert(name, procedure);
        }
        self
    }

    /// Freeze the table. Fails if any name was registered twice.
    pub fn build(self) -> Result<ProcedureTable> {
        if let Some(name) = self.duplicate {
            return Err(RpcError::DuplicateProcedure { name });
        }
        Ok(ProcedureTable {
            procedures: Arc::new(self.procedures),
        })
    }
}

/// Trait for dispatching one call to whatever serves it.
///
/// Implemented by `ProcedureTable`; tests and adapters may provide their own.
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(
        &self,
        method: &str,
        data: Value,
    ) -> std::result::Result<Value, DispatchError>;
}

#[async_trait::async_trait]
impl Dispatch for ProcedureTable {
    async fn dispatch(
        &self,
        method: &str,
        data: Value,
    ) -> std::result::Result<Value, DispatchError> {
        let procedure = self
            .get(method)
            .ok_or_else(|| DispatchError::UnknownMethod(method.to_string()))?;
        procedure
            .invoke(data)
            .await
            .map_err(|e| DispatchError::from_procedure(&e))
    }
}

/// Handle to a running server. Dropping it stops the receive loop.
pub struct RpcServerHandle {
    emitter: EventEmitter,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    /// Push an event to the client.
    pub fn emit(&self, event_name: impl Into<String>, data: Value) -> Result<()> {
        self.emitter.emit(event_name, data)
    }

    /// Stop reading new requests. Procedures already running still reply;
    /// the client keeps waiting for those replies even though its new
    /// calls now fail with `ChannelClosed`.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Wait until the receive loop ends, either through `shutdown` or
    /// because the client side of the channel went away.
    pub async fn join(mut self) {
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Server bound to one channel port.
///
/// ```rust,ignore
/// let server = RpcServer::new(port);
/// let events = server.emitter();
/// let table = ProcedureTable::builder()
///     .procedure("add", Procedure::typed(|(x, y): (f64, f64)| async move { Ok(x + y) }))
///     .build()?;
/// let handle = server.serve(Arc::new(table));
/// ```
pub struct RpcServer {
    sender: Arc<dyn PortSender>,
    receiver: Box<dyn PortReceiver>,
}

impl RpcServer {
    pub fn new(port: impl Port) -> Self {
        let (sender, receiver) = port.split();
        Self { sender, receiver }
    }

    /// Emitter for this server's channel, available before procedures are
    /// registered so they can capture it.
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter::new(self.sender.clone())
    }

    /// Start serving. Must be called from within a Tokio runtime.
    pub fn serve<D: Dispatch>(self, dispatch: Arc<D>) -> RpcServerHandle {
        let emitter = self.emitter();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task_handle = tokio::spawn(Self::receive_loop(
            dispatch,
            self.receiver,
            self.sender,
            shutdown_rx,
        ));

        RpcServerHandle {
            emitter,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        }
    }

    /// Serve `procedures` on `port`.
    pub fn start(procedures: ProcedureTable, port: impl Port) -> RpcServerHandle {
        info!("RPC server starting with {} procedures", procedures.len());
        Self::new(port).serve(Arc::new(procedures))
    }

    async fn receive_loop<D: Dispatch>(
        dispatch: Arc<D>,
        mut receiver: Box<dyn PortReceiver>,
        sender: Arc<dyn PortSender>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("RPC server shutting down");
                    break;
                }
                message = receiver.recv() => {
                    let Some(message) = message else {
                        debug!("RPC channel closed by client");
                        break;
                    };

                    let request = match Request::from_value(message) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!("Dropping inbound message: {}", e);
                            continue;
                        }
                    };

                    let dispatch = dispatch.clone();
                    let sender = sender.clone();
                    tokio::spawn(async move {
                        let reply = Self::process_request(&*dispatch, request).await;
                        Self::send_reply(&*sender, reply);
                    });
                }
            }
        }
    }

    async fn process_request<D: Dispatch>(dispatch: &D, request: Request) -> Reply {
        let Request { method, uid, data } = request;
        debug!("RPC call: {} ({})", method, uid);

        let outcome = AssertUnwindSafe(dispatch.dispatch(&method, data))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(DispatchError::Failed(format!(
                    "Procedure panicked: {}",
                    panic_message(&*panic)
                )))
            });

        match outcome {
            Ok(data) => Reply::Success { uid, method, data },
            Err(e) => {
                match &e {
                    DispatchError::UnknownMethod(_) => warn!("Method not found: {}", method),
                    DispatchError::Failed(_) => error!("RPC error for {}: {}", method, e),
                }
                Reply::Failure {
                    uid,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Post `reply`. A success reply that cannot be posted is replaced by a
    /// failure reply carrying the post error, so the caller always hears
    /// back while the channel is open.
    fn send_reply(sender: &dyn PortSender, reply: Reply) {
        // Buffers are only moved on success; a failure carries a string.
        let transfer = match &reply {
            Reply::Success { data, .. } => peek_transferables(data),
            Reply::Failure { .. } => Vec::new(),
        };
        let uid = reply.uid().clone();
        let was_success = reply.is_success();

        let err = match sender.post_message(reply.into_value(), transfer) {
            Ok(()) => return,
            Err(e) => e,
        };
        if err.is_channel_closed() || !was_success {
            error!("Failed to send reply for {}: {}", uid, err);
            return;
        }

        warn!("Reply for {} could not be posted, sending failure: {}", uid, err);
        let failure = Reply::Failure {
            uid: uid.clone(),
            error: err.to_string(),
        };
        if let Err(e) = sender.post_message(failure.into_value(), Vec::new()) {
            error!("Failed to send reply for {}: {}", uid, e);
        }
    }
}
