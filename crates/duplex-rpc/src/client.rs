//! RPC client: issues calls and correlates replies by uid.
//!
//! A background task reads the channel. Replies settle the pending call with
//! the same uid; events go to listeners; anything else is dropped.
//!
//! # Thread Safety
//!
//! The pending-call map is guarded by a `Mutex` because the calling path and
//! the receive task both mutate it. The lock is never held across an await.

use crate::channel::{Port, PortReceiver, PortSender};
use crate::config::ClientConfig;
use crate::events::{EventListeners, ListenerId};
use crate::protocol::{CallId, Event, Reply, Request, ServerMessage};
use crate::transfer::peek_transferables;
use crate::uid::UidGenerator;
use crate::value::Value;
use crate::{Result, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Caller waiting on a reply.
struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<CallId, PendingCall>,
    /// Set once the channel is gone; no call may register after that.
    closed: bool,
}

struct ClientInner {
    sender: Arc<dyn PortSender>,
    pending: Mutex<PendingCalls>,
    listeners: EventListeners,
    uids: UidGenerator,
    config: ClientConfig,
}

impl ClientInner {
    fn lock_pending(&self) -> MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending call under a uid nobody else is waiting on.
    fn register(&self, method: &str, tx: oneshot::Sender<Result<Value>>) -> Result<CallId> {
        let mut pending = self.lock_pending();
        if pending.closed {
            return Err(RpcError::ChannelClosed);
        }

        let uid = loop {
            let uid = self.uids.next();
            if !pending.calls.contains_key(&uid) {
                break uid;
            }
            debug!("uid {} already pending, drawing another", uid);
        };

        pending.calls.insert(
            uid.clone(),
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );
        Ok(uid)
    }

    fn take_pending(&self, uid: &CallId) -> Option<PendingCall> {
        self.lock_pending().calls.remove(uid)
    }

    fn handle_message(&self, message: Value) {
        let message = match ServerMessage::from_value(message) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping inbound message: {}", e);
                return;
            }
        };

        match message {
            ServerMessage::Reply(reply) => self.settle(reply),
            ServerMessage::Event(Event { event_name, data }) => {
                let delivered = self.listeners.dispatch(&event_name, &data);
                debug!("Event {} delivered to {} listeners", event_name, delivered);
            }
        }
    }

    fn settle(&self, reply: Reply) {
        let Some(call) = self.take_pending(reply.uid()) else {
            // Duplicate or stale reply.
            debug!("Ignoring reply for unknown call {}", reply.uid());
            return;
        };

        let result = match reply {
            Reply::Success { data, .. } => Ok(data),
            Reply::Failure { uid, error } => {
                debug!("RPC call {} ({}) failed: {}", call.method, uid, error);
                Err(RpcError::Remote(error))
            }
        };
        // The caller may have given up (timeout); nothing to do then.
        let _ = call.tx.send(result);
    }

    /// Fail everything still pending and refuse new calls.
    fn close(&self) {
        let calls: Vec<(CallId, PendingCall)> = {
            let mut pending = self.lock_pending();
            pending.closed = true;
            pending.calls.drain().collect()
        };

        for (uid, call) in calls {
            debug!("RPC call {} ({}) abandoned: channel closed", call.method, uid);
            let _ = call.tx.send(Err(RpcError::ChannelClosed));
        }
    }
}

/// Client bound to one channel port.
pub struct RpcClient {
    inner: Arc<ClientInner>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RpcClient {
    /// Create a client with default configuration. Must be called from
    /// within a Tokio runtime.
    pub fn new(port: impl Port) -> Self {
        Self::with_config(port, ClientConfig::default())
    }

    pub fn with_config(port: impl Port, config: ClientConfig) -> Self {
        let (sender, receiver) = port.split();
        let inner = Arc::new(ClientInner {
            sender,
            pending: Mutex::new(PendingCalls::default()),
            listeners: EventListeners::default(),
            uids: UidGenerator::new(config.uid_strategy),
            config,
        });

        let task_handle = tokio::spawn(Self::receive_loop(inner.clone(), receiver));

        Self {
            inner,
            task_handle: Some(task_handle),
        }
    }

    async fn receive_loop(inner: Arc<ClientInner>, mut receiver: Box<dyn PortReceiver>) {
        while let Some(message) = receiver.recv().await {
            inner.handle_message(message);
        }
        debug!("RPC channel closed by server");
        inner.close();
    }

    /// Call `method` on the server with `data`.
    ///
    /// Buffers inside `data` are transferred. Resolves with the procedure's
    /// result, or fails with `RpcError::Remote` carrying the server's error
    /// text verbatim.
    pub async fn call(&self, method: &str, data: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let uid = self.inner.register(method, tx)?;

        let transfer = peek_transferables(&data);
        debug!(
            "RPC call: {} ({}, {} transferables)",
            method,
            uid,
            transfer.len()
        );

        let request = Request {
            method: method.to_string(),
            uid: uid.clone(),
            data,
        };
        if let Err(e) = self.inner.sender.post_message(request.into_value(), transfer) {
            self.inner.take_pending(&uid);
            if e.is_channel_closed() {
                // The server stopped reading. Calls already sent may still
                // get replies, so only refuse new ones here.
                self.inner.lock_pending().closed = true;
            }
            return Err(e);
        }

        let outcome = match self.inner.config.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.take_pending(&uid);
                    warn!("RPC call {} ({}) timed out after {:?}", method, uid, timeout);
                    return Err(RpcError::Timeout {
                        method: method.to_string(),
                        uid: uid.to_string(),
                        timeout,
                    });
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or_else(|_| Err(RpcError::ChannelClosed))
    }

    /// Call with serde-typed input and output.
    pub async fn call_typed<I, O>(&self, method: &str, input: &I) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let data = Value::from_serialize(input)?;
        self.call(method, data).await?.deserialize_into()
    }

    /// Register a listener for `event_name`.
    pub fn on<F>(&self, event_name: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.listeners.add(event_name.into(), Arc::new(listener))
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Receive `event_name` payloads through a channel. The listener stays
    /// registered until removed with [`RpcClient::off`].
    pub fn subscribe(
        &self,
        event_name: impl Into<String>,
    ) -> (ListenerId, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on(event_name, move |data: &Value| {
            let _ = tx.send(data.clone());
        });
        (id, rx)
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.inner.listeners.count(event_name)
    }

    /// Number of calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.lock_pending().calls.len()
    }

    /// True once the server side of the channel is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.lock_pending().closed
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}
