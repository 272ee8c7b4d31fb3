use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use tracing::{trace, warn};

use crate::message::Message;
use crate::{BusError, Result};

type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

enum BusCommand {
    Deliver(Message),
    Shutdown,
}

/// Receipt for a registered handler; hand it back to `remove` to unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    msg_type: String,
    id: u64,
}

#[derive(Default)]
struct HandlerTable {
    handlers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
}

impl HandlerTable {
    /// Snapshot the handlers for one type so dispatch never holds the map
    /// lock while running callbacks (handlers re-register and emit freely).
    fn snapshot(&self, msg_type: &str) -> Vec<Handler> {
        let handlers = self.handlers.lock().unwrap();
        handlers
            .get(msg_type)
            .map(|v| v.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}

/// Cloneable handle on the process message bus.
///
/// All handlers run sequentially on a single delivery thread; `emit` only
/// enqueues and never blocks on handler execution. That makes re-entrant
/// emits from inside a handler safe, and it means a handler must never call
/// `wait_for_response` (it would wait on its own thread).
pub struct MessageBus {
    table: Arc<HandlerTable>,
    tx: Sender<BusCommand>,
    next_id: Arc<AtomicU64>,
    delivery_thread: Arc<Mutex<Option<JoinHandle<()>>>>,
    delivery_thread_id: Arc<Mutex<Option<ThreadId>>>,
}

impl Clone for MessageBus {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            tx: self.tx.clone(),
            next_id: self.next_id.clone(),
            delivery_thread: self.delivery_thread.clone(),
            delivery_thread_id: self.delivery_thread_id.clone(),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (tx, rx) = unbounded::<BusCommand>();
        let table = Arc::new(HandlerTable::default());
        let thread_id = Arc::new(Mutex::new(None));

        let worker_table = table.clone();
        let worker_thread_id = thread_id.clone();
        let handle = thread::Builder::new()
            .name("ocpbus-delivery".into())
            .spawn(move || {
                *worker_thread_id.lock().unwrap() = Some(thread::current().id());
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        BusCommand::Deliver(msg) => {
                            trace!(msg_type = %msg.msg_type, "dispatching");
                            for handler in worker_table.snapshot(&msg.msg_type) {
                                handler(&msg);
                            }
                        }
                        BusCommand::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn bus delivery thread");

        Self {
            table,
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            delivery_thread: Arc::new(Mutex::new(Some(handle))),
            delivery_thread_id: thread_id,
        }
    }

    /// Register a handler for an exact message type.
    pub fn on(
        &self,
        msg_type: impl Into<String>,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Subscription {
        let msg_type = msg_type.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.table.handlers.lock().unwrap();
        handlers
            .entry(msg_type.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { msg_type, id }
    }

    pub fn remove(&self, sub: &Subscription) {
        let mut handlers = self.table.handlers.lock().unwrap();
        if let Some(list) = handlers.get_mut(&sub.msg_type) {
            list.retain(|(id, _)| *id != sub.id);
            if list.is_empty() {
                handlers.remove(&sub.msg_type);
            }
        }
    }

    /// Enqueue a message for delivery. Never blocks on handlers.
    pub fn emit(&self, msg: Message) {
        if self.tx.send(BusCommand::Deliver(msg)).is_err() {
            warn!("emit on a shut down message bus");
        }
    }

    /// Emit `msg` and wait for its `.response` counterpart.
    ///
    /// Must not be called from the delivery thread: the response could only
    /// be dispatched by the thread that would be waiting.
    pub fn wait_for_response(&self, msg: Message, timeout: Duration) -> Result<Message> {
        if self.is_delivery_thread() {
            warn!(
                msg_type = %msg.msg_type,
                "wait_for_response called from the delivery thread; refusing to deadlock"
            );
            return Err(BusError::ResponseTimeout(msg.response_type()));
        }
        let response_type = msg.response_type();
        let (tx, rx) = crossbeam_channel::bounded::<Message>(1);
        let sub = self.on(response_type.clone(), move |m| {
            let _ = tx.try_send(m.clone());
        });
        self.emit(msg);
        let result = rx.recv_timeout(timeout);
        self.remove(&sub);
        result.map_err(|_| BusError::ResponseTimeout(response_type))
    }

    /// Wait for the next message of `msg_type`. Test-harness aid.
    pub fn wait_for(&self, msg_type: impl Into<String>, timeout: Duration) -> Option<Message> {
        let waiter = self.waiter(msg_type);
        waiter.wait(timeout)
    }

    /// Register interest in `msg_type` now, collect the message later.
    /// Avoids the register/emit race of a bare `wait_for`.
    pub fn waiter(&self, msg_type: impl Into<String>) -> MessageWaiter {
        let (tx, rx) = crossbeam_channel::bounded::<Message>(1);
        let sub = self.on(msg_type, move |m| {
            let _ = tx.try_send(m.clone());
        });
        MessageWaiter {
            bus: self.clone(),
            sub,
            rx,
        }
    }

    fn is_delivery_thread(&self) -> bool {
        self.delivery_thread_id.lock().unwrap().as_ref() == Some(&thread::current().id())
    }

    /// Drain and stop the delivery thread. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(BusCommand::Shutdown);
        if let Some(handle) = self.delivery_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Pending interest in a single message, armed at creation time.
pub struct MessageWaiter {
    bus: MessageBus,
    sub: Subscription,
    rx: crossbeam_channel::Receiver<Message>,
}

impl MessageWaiter {
    pub fn wait(self, timeout: Duration) -> Option<Message> {
        let result = self.rx.recv_timeout(timeout).ok();
        self.bus.remove(&self.sub);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_to_registered_handler() {
        let bus = MessageBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.on("test.event", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let flush = bus.waiter("test.other");
        bus.emit(Message::new("test.event"));
        bus.emit(Message::new("test.other"));
        assert!(flush.wait(Duration::from_secs(1)).is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        bus.shutdown();
    }

    #[test]
    fn removed_handler_no_longer_fires() {
        let bus = MessageBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = bus.on("test.event", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.remove(&sub);
        let flush = bus.waiter("test.flush");
        bus.emit(Message::new("test.event"));
        bus.emit(Message::new("test.flush"));
        assert!(flush.wait(Duration::from_secs(1)).is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.shutdown();
    }

    #[test]
    fn request_response_round_trip() {
        let bus = MessageBus::new();
        let responder = bus.clone();
        bus.on("test.query", move |msg| {
            responder.emit(msg.response(json!({"answer": 42})));
        });
        let reply = bus
            .wait_for_response(Message::new("test.query"), Duration::from_secs(1))
            .unwrap();
        assert_eq!(reply.data_i64("answer"), Some(42));
        bus.shutdown();
    }

    #[test]
    fn response_timeout_when_nobody_answers() {
        let bus = MessageBus::new();
        let result = bus.wait_for_response(Message::new("test.silence"), Duration::from_millis(50));
        assert!(matches!(result, Err(BusError::ResponseTimeout(_))));
        bus.shutdown();
    }

    #[test]
    fn reentrant_emit_from_handler() {
        let bus = MessageBus::new();
        let chained = bus.clone();
        bus.on("test.first", move |msg| {
            chained.emit(msg.forward("test.second", json!({"hop": 2})));
        });
        let second = bus.waiter("test.second");
        bus.emit(Message::new("test.first"));
        let second = second.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(second.data_i64("hop"), Some(2));
        bus.shutdown();
    }
}
