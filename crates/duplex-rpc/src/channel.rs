//! Channel seam and an in-process duplex channel.
//!
//! The RPC layer only needs to post a value together with a transfer list,
//! and to receive values in the order the peer posted them. Any transport
//! that can do that implements [`Port`].
//!
//! [`MessageChannel`] is the in-process implementation. Its ports are `Send`
//! and may sit on different threads and runtimes, as a host and a worker do.

use crate::value::{ArrayBuffer, Value};
use crate::{Result, RpcError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sending half of a port.
pub trait PortSender: Send + Sync + 'static {
    /// Post `message` to the peer, moving every buffer in `transfer`
    /// instead of copying it.
    fn post_message(&self, message: Value, transfer: Vec<ArrayBuffer>) -> Result<()>;
}

/// Receiving half of a port.
#[async_trait]
pub trait PortReceiver: Send + 'static {
    /// Next message from the peer. `None` once the peer is gone.
    async fn recv(&mut self) -> Option<Value>;
}

/// One endpoint of a duplex channel.
pub trait Port: Send + 'static {
    fn split(self) -> (Arc<dyn PortSender>, Box<dyn PortReceiver>);
}

/// In-process duplex channel.
///
/// Unbounded in both directions. Posting clones buffers the way a
/// structured clone does: buffers named in the transfer list arrive sharing
/// the sender's storage, every other buffer arrives as a copy.
pub struct MessageChannel;

impl MessageChannel {
    /// Create a connected pair of ports.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MessagePort, MessagePort) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MessagePort {
                sender: MessagePortSender { tx: b_tx },
                receiver: MessagePortReceiver { rx: a_rx },
            },
            MessagePort {
                sender: MessagePortSender { tx: a_tx },
                receiver: MessagePortReceiver { rx: b_rx },
            },
        )
    }
}

/// One end of a [`MessageChannel`].
pub struct MessagePort {
    sender: MessagePortSender,
    receiver: MessagePortReceiver,
}

impl MessagePort {
    pub fn post_message(&self, message: Value, transfer: Vec<ArrayBuffer>) -> Result<()> {
        self.sender.post_message(message, transfer)
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    /// Split into owned halves without erasing their types.
    pub fn into_parts(self) -> (MessagePortSender, MessagePortReceiver) {
        (self.sender, self.receiver)
    }
}

impl Port for MessagePort {
    fn split(self) -> (Arc<dyn PortSender>, Box<dyn PortReceiver>) {
        (Arc::new(self.sender), Box::new(self.receiver))
    }
}

#[derive(Clone)]
pub struct MessagePortSender {
    tx: mpsc::UnboundedSender<Value>,
}

impl PortSender for MessagePortSender {
    fn post_message(&self, message: Value, transfer: Vec<ArrayBuffer>) -> Result<()> {
        check_transfer_list(&transfer)?;
        let message = structured_clone(message, &transfer);
        self.tx.send(message).map_err(|_| RpcError::ChannelClosed)
    }
}

pub struct MessagePortReceiver {
    rx: mpsc::UnboundedReceiver<Value>,
}

#[async_trait]
impl PortReceiver for MessagePortReceiver {
    async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

fn check_transfer_list(transfer: &[ArrayBuffer]) -> Result<()> {
    for (index, buffer) in transfer.iter().enumerate() {
        if transfer[..index].iter().any(|earlier| earlier.same_buffer(buffer)) {
            return Err(RpcError::DataClone {
                message: format!(
                    "ArrayBuffer at index {} is a duplicate of an earlier ArrayBuffer",
                    index
                ),
            });
        }
    }
    Ok(())
}

fn structured_clone(value: Value, transfer: &[ArrayBuffer]) -> Value {
    let carry = |buffer: ArrayBuffer| {
        if transfer.iter().any(|t| t.same_buffer(&buffer)) {
            buffer
        } else {
            buffer.deep_copy()
        }
    };

    match value {
        Value::Buffer(buffer) => Value::Buffer(carry(buffer)),
        Value::View(view) => {
            let buffer = carry(view.buffer().clone());
            Value::View(view.with_buffer(buffer))
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| structured_clone(item, transfer))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, structured_clone(v, transfer)))
                .collect(),
        ),
        scalar => scalar,
    }
}
