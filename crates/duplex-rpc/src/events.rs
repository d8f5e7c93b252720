//! Out-of-band events.
//!
//! The server pushes events with an [`EventEmitter`]; the client fans them
//! out to listeners registered by event name. Events carry no uid and get
//! no reply, so they never touch pending calls.

use crate::channel::PortSender;
use crate::error::panic_message;
use crate::protocol::Event;
use crate::transfer::peek_transferables;
use crate::value::Value;
use crate::Result;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

/// Cloneable handle for pushing events to the client.
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<dyn PortSender>,
}

impl EventEmitter {
    pub(crate) fn new(sender: Arc<dyn PortSender>) -> Self {
        Self { sender }
    }

    /// Push `data` to every client listener of `event_name`.
    ///
    /// Buffers inside `data` are transferred. There is no acknowledgment.
    pub fn emit(&self, event_name: impl Into<String>, data: Value) -> Result<()> {
        let event = Event {
            event_name: event_name.into(),
            data,
        };
        let transfer = peek_transferables(&event.data);
        debug!(
            "Emitting event {} ({} transferables)",
            event.event_name,
            transfer.len()
        );
        self.sender.post_message(event.into_value(), transfer)
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub(crate) type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Listener registry keyed by event name.
#[derive(Default)]
pub(crate) struct EventListeners {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener)>>>,
}

impl EventListeners {
    pub fn add(&self, event_name: String, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.entry(event_name).or_default().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        listeners.retain(|_, registered| {
            let before = registered.len();
            registered.retain(|(listener_id, _)| *listener_id != id);
            removed |= registered.len() != before;
            !registered.is_empty()
        });
        removed
    }

    pub fn count(&self, event_name: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Call every listener of `event_name` in registration order. Returns
    /// how many were called.
    ///
    /// A panicking listener is logged and skipped; the rest still run.
    pub fn dispatch(&self, event_name: &str, data: &Value) -> usize {
        // Snapshot first so listeners may register or remove listeners.
        let snapshot: Vec<Listener> = match self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
        {
            Some(registered) => registered.iter().map(|(_, l)| l.clone()).collect(),
            None => return 0,
        };

        for listener in &snapshot {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(data))) {
                error!(
                    "Listener for {} panicked: {}",
                    event_name,
                    panic_message(&*payload)
                );
            }
        }
        snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Listener = Arc::new(move |data: &Value| {
            sink.lock().unwrap().push(data.clone());
        });
        (seen, listener)
    }

    #[test]
    fn test_dispatch_reaches_all_listeners_of_name() {
        let registry = EventListeners::default();
        let (first, l1) = recorder();
        let (second, l2) = recorder();
        let (other, l3) = recorder();
        registry.add("update".into(), l1);
        registry.add("update".into(), l2);
        registry.add("other".into(), l3);

        assert_eq!(registry.dispatch("update", &Value::from(7)), 2);
        assert_eq!(*first.lock().unwrap(), vec![Value::from(7)]);
        assert_eq!(*second.lock().unwrap(), vec![Value::from(7)]);
        assert!(other.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_listener() {
        let registry = EventListeners::default();
        let (seen, listener) = recorder();
        let id = registry.add("update".into(), listener);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.count("update"), 0);
        assert_eq!(registry.dispatch("update", &Value::Null), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_listener_may_register_during_dispatch() {
        let registry = Arc::new(EventListeners::default());
        let inner = registry.clone();
        registry.add(
            "update".into(),
            Arc::new(move |_: &Value| {
                inner.add("update".into(), Arc::new(|_: &Value| {}));
            }),
        );

        assert_eq!(registry.dispatch("update", &Value::Null), 1);
        assert_eq!(registry.count("update"), 2);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_dispatch() {
        let registry = EventListeners::default();
        registry.add(
            "update".into(),
            Arc::new(|_: &Value| panic!("listener blew up")),
        );
        let (seen, listener) = recorder();
        registry.add("update".into(), listener);

        assert_eq!(registry.dispatch("update", &Value::from(1)), 2);
        assert_eq!(*seen.lock().unwrap(), vec![Value::from(1)]);
    }

    #[tokio::test]
    async fn test_emitter_sends_event_envelope() {
        let (server_port, mut client_port) = crate::channel::MessageChannel::new();
        let (sender, _receiver) = crate::channel::Port::split(server_port);
        let emitter = EventEmitter::new(sender);

        emitter.emit("tick", Value::from(1)).unwrap();

        let message = client_port.recv().await.unwrap();
        assert_eq!(message.get("eventName"), Some(&Value::from("tick")));
        assert_eq!(message.get("data"), Some(&Value::from(1)));
        assert!(message.get("uid").is_none());
    }
}
