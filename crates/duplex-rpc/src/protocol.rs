//! Envelopes exchanged over the channel.
//!
//! On the wire every envelope is a plain object:
//!
//! ```text
//! Request : { method, uid, data }
//! ReplyOk : { uid, method, data }
//! ReplyErr: { uid, error }
//! Event   : { eventName, data }
//! ```
//!
//! In memory they are explicit variants. Decoding discriminates on field
//! presence exactly once, here, so the rest of the crate never has to.

use crate::value::{Map, Value};
use crate::{Result, RpcError};
use std::fmt;

pub const METHOD_FIELD: &str = "method";
pub const UID_FIELD: &str = "uid";
pub const DATA_FIELD: &str = "data";
pub const ERROR_FIELD: &str = "error";
pub const EVENT_NAME_FIELD: &str = "eventName";

/// Identifier correlating a request with its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        CallId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        CallId(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        CallId(id)
    }
}

/// Client → server call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub uid: CallId,
    pub data: Value,
}

/// Server → client answer to exactly one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success {
        uid: CallId,
        method: String,
        data: Value,
    },
    Failure {
        uid: CallId,
        error: String,
    },
}

impl Reply {
    pub fn uid(&self) -> &CallId {
        match self {
            Reply::Success { uid, .. } | Reply::Failure { uid, .. } => uid,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success { .. })
    }
}

/// Server → client notification, outside request/reply correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_name: String,
    pub data: Value,
}

/// Anything the server sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Reply(Reply),
    Event(Event),
}

impl Request {
    pub fn into_value(self) -> Value {
        Value::object([
            (METHOD_FIELD, Value::String(self.method)),
            (UID_FIELD, Value::String(self.uid.0)),
            (DATA_FIELD, self.data),
        ])
    }

    /// Decode a request. A missing `uid` is malformed; a missing or
    /// non-string `method` decodes as the empty name and later fails
    /// dispatch as an unknown method.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut map = into_object(value)?;
        let uid = take_uid(&mut map)?;
        let method = match map.shift_remove(METHOD_FIELD) {
            Some(Value::String(method)) => method,
            _ => String::new(),
        };
        let data = map.shift_remove(DATA_FIELD).unwrap_or_default();
        Ok(Request { method, uid, data })
    }
}

impl Reply {
    pub fn into_value(self) -> Value {
        match self {
            Reply::Success { uid, method, data } => Value::object([
                (UID_FIELD, Value::String(uid.0)),
                (METHOD_FIELD, Value::String(method)),
                (DATA_FIELD, data),
            ]),
            Reply::Failure { uid, error } => Value::object([
                (UID_FIELD, Value::String(uid.0)),
                (ERROR_FIELD, Value::String(error)),
            ]),
        }
    }
}

impl Event {
    pub fn into_value(self) -> Value {
        Value::object([
            (EVENT_NAME_FIELD, Value::String(self.event_name)),
            (DATA_FIELD, self.data),
        ])
    }
}

impl ServerMessage {
    pub fn into_value(self) -> Value {
        match self {
            ServerMessage::Reply(reply) => reply.into_value(),
            ServerMessage::Event(event) => event.into_value(),
        }
    }

    /// Decode a server envelope.
    ///
    /// `eventName` marks an event. Otherwise a `uid` is required, and an
    /// `error` member makes it a failure even if `data` is present too.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut map = into_object(value)?;

        if let Some(name) = map.shift_remove(EVENT_NAME_FIELD) {
            let event_name = match name {
                Value::String(name) => name,
                other => {
                    return Err(RpcError::malformed(format!(
                        "eventName must be a string, got {}",
                        other.type_name()
                    )))
                }
            };
            let data = map.shift_remove(DATA_FIELD).unwrap_or_default();
            return Ok(ServerMessage::Event(Event { event_name, data }));
        }

        let uid = take_uid(&mut map)?;

        if let Some(error) = map.shift_remove(ERROR_FIELD) {
            let error = match error {
                Value::String(error) => error,
                other => other
                    .to_json()
                    .map(|json| json.to_string())
                    .unwrap_or_else(|_| other.type_name().to_string()),
            };
            return Ok(ServerMessage::Reply(Reply::Failure { uid, error }));
        }

        let method = match map.shift_remove(METHOD_FIELD) {
            Some(Value::String(method)) => method,
            _ => String::new(),
        };
        let data = map.shift_remove(DATA_FIELD).unwrap_or_default();
        Ok(ServerMessage::Reply(Reply::Success { uid, method, data }))
    }
}

impl From<Reply> for ServerMessage {
    fn from(reply: Reply) -> Self {
        ServerMessage::Reply(reply)
    }
}

impl From<Event> for ServerMessage {
    fn from(event: Event) -> Self {
        ServerMessage::Event(event)
    }
}

fn into_object(value: Value) -> Result<Map> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(RpcError::malformed(format!(
            "envelope must be an object, got {}",
            other.type_name()
        ))),
    }
}

fn take_uid(map: &mut Map) -> Result<CallId> {
    match map.shift_remove(UID_FIELD) {
        Some(Value::String(uid)) => Ok(CallId(uid)),
        // Peers that generate numeric uids still correlate by their text.
        Some(Value::Number(n)) => Ok(CallId(Value::Number(n).to_json()?.to_string())),
        Some(other) => Err(RpcError::malformed(format!(
            "uid must be a string, got {}",
            other.type_name()
        ))),
        None => Err(RpcError::malformed("missing uid")),
    }
}
