//! Duplex RPC - request/reply calls and events over a message channel.
//!
//! One side hosts an [`RpcServer`] with a table of named procedures; the
//! other side holds an [`RpcClient`]. Requests carry a uid and the server's
//! reply echoes it, so replies may arrive in any order. The server can also
//! push named events that the client fans out to listeners.
//!
//! Binary buffers found anywhere in a payload are transferred, not copied.
//!
//! # Example
//!
//! ```rust,ignore
//! use duplex_rpc::{MessageChannel, Procedure, ProcedureTable, RpcClient, RpcServer, Value};
//!
//! #[tokio::main]
//! async fn main() -> duplex_rpc::Result<()> {
//!     let (host_port, worker_port) = MessageChannel::new();
//!
//!     let table = ProcedureTable::builder()
//!         .procedure("add", Procedure::sync(|data| {
//!             let x = data.get("x").and_then(Value::as_f64).unwrap_or(0.0);
//!             let y = data.get("y").and_then(Value::as_f64).unwrap_or(0.0);
//!             Ok(Value::from(x + y))
//!         }))
//!         .build()?;
//!     let _server = RpcServer::start(table, worker_port);
//!
//!     let client = RpcClient::new(host_port);
//!     let sum = client
//!         .call("add", Value::object([("x", Value::from(2)), ("y", Value::from(3))]))
//!         .await?;
//!     assert_eq!(sum, Value::from(5));
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod server;
pub mod transfer;
pub mod uid;
pub mod value;

// Re-export commonly used types
pub use channel::{MessageChannel, MessagePort, Port, PortReceiver, PortSender};
pub use client::RpcClient;
pub use config::{ClientConfig, UidStrategy};
pub use error::{DispatchError, Result, RpcError};
pub use events::{EventEmitter, ListenerId};
pub use protocol::{CallId, Event, Reply, Request, ServerMessage};
pub use server::{Dispatch, Procedure, ProcedureTable, RpcServer, RpcServerHandle};
pub use transfer::{is_transferable, peek_transferables};
pub use value::{ArrayBuffer, Map, TypedArray, TypedArrayKind, Value};
