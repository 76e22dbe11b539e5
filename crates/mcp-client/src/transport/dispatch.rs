//! Delivery gate between transport I/O tasks and the registered handlers
//!
//! Events raised while `connect()` is still running are queued and flushed in
//! order when it resolves. After `close()` nothing is delivered. Each connect
//! arms a new epoch; sinks from earlier epochs are silently ignored.

use super::TransportHandlers;
use crate::error::MCPError;
use crate::protocol::JsonRpcMessage;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::trace;

enum Event {
    Message(JsonRpcMessage),
    Error(MCPError),
    Close(Option<String>),
}

enum Gate {
    Pending(Vec<Event>),
    Open,
    Closed,
}

struct GateState {
    epoch: u64,
    gate: Gate,
}

pub(crate) struct EventDispatcher {
    handlers: RwLock<TransportHandlers>,
    state: Mutex<GateState>,
}

impl EventDispatcher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(TransportHandlers::default()),
            state: Mutex::new(GateState {
                epoch: 0,
                gate: Gate::Closed,
            }),
        })
    }

    pub(crate) fn set_handlers(&self, handlers: TransportHandlers) {
        *self.handlers.write() = handlers;
    }

    /// Start a new session; events are queued until [`EventSink::open`]
    pub(crate) fn arm(self: &Arc<Self>) -> EventSink {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.gate = Gate::Pending(Vec::new());
        EventSink {
            epoch: state.epoch,
            dispatcher: Arc::clone(self),
        }
    }

    /// Stop all delivery; returns once no handler is running
    pub(crate) fn close(&self) {
        self.state.lock().gate = Gate::Closed;
    }

    fn open(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        let queued = match std::mem::replace(&mut state.gate, Gate::Open) {
            Gate::Pending(queued) => queued,
            other => {
                state.gate = other;
                return;
            }
        };
        for event in queued {
            if self.deliver(&mut state, event) {
                break;
            }
        }
    }

    fn emit(&self, epoch: u64, event: Event) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            trace!("Dropping event from a previous session");
            return;
        }
        if let Gate::Pending(queue) = &mut state.gate {
            queue.push(event);
        } else if matches!(state.gate, Gate::Open) {
            self.deliver(&mut state, event);
        } else {
            trace!("Dropping event after close");
        }
    }

    /// Run the handler for `event`; returns true when the gate closed
    ///
    /// Handlers run under the gate lock, so they must not call back into the
    /// dispatcher synchronously.
    fn deliver(&self, state: &mut GateState, event: Event) -> bool {
        let handlers = self.handlers.read().clone();
        match event {
            Event::Message(message) => {
                if let Some(on_message) = handlers.on_message {
                    on_message(message);
                }
                false
            }
            Event::Error(error) => {
                if let Some(on_error) = handlers.on_error {
                    on_error(error);
                }
                false
            }
            Event::Close(reason) => {
                state.gate = Gate::Closed;
                if let Some(on_close) = handlers.on_close {
                    on_close(reason);
                }
                true
            }
        }
    }
}

/// Handle used by I/O tasks to raise events for one session
#[derive(Clone)]
pub(crate) struct EventSink {
    epoch: u64,
    dispatcher: Arc<EventDispatcher>,
}

impl EventSink {
    pub(crate) fn open(&self) {
        self.dispatcher.open(self.epoch);
    }

    pub(crate) fn message(&self, message: JsonRpcMessage) {
        self.dispatcher.emit(self.epoch, Event::Message(message));
    }

    pub(crate) fn error(&self, error: MCPError) {
        self.dispatcher.emit(self.epoch, Event::Error(error));
    }

    pub(crate) fn close(&self, reason: Option<String>) {
        self.dispatcher.emit(self.epoch, Event::Close(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcNotification;

    fn recorder(dispatcher: &EventDispatcher) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (m, e, c) = (log.clone(), log.clone(), log.clone());
        dispatcher.set_handlers(TransportHandlers {
            on_message: Some(Arc::new(move |msg: JsonRpcMessage| {
                m.lock().push(format!("message:{}", msg.method().unwrap_or("")));
            })),
            on_error: Some(Arc::new(move |_: MCPError| e.lock().push("error".to_string()))),
            on_close: Some(Arc::new(move |_: Option<String>| c.lock().push("close".to_string()))),
        });
        log
    }

    fn note(method: &str) -> JsonRpcMessage {
        JsonRpcNotification::new(method, None).into()
    }

    #[test]
    fn test_queued_until_open() {
        let dispatcher = EventDispatcher::new();
        let log = recorder(&dispatcher);

        let sink = dispatcher.arm();
        sink.message(note("a"));
        sink.error(MCPError::Transport("x".into()));
        sink.message(note("b"));
        assert!(log.lock().is_empty());

        sink.open();
        assert_eq!(*log.lock(), vec!["message:a", "error", "message:b"]);

        sink.message(note("c"));
        assert_eq!(log.lock().len(), 4);
    }

    #[test]
    fn test_nothing_after_close() {
        let dispatcher = EventDispatcher::new();
        let log = recorder(&dispatcher);

        let sink = dispatcher.arm();
        sink.open();
        dispatcher.close();
        sink.message(note("late"));
        sink.close(None);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_close_event_shuts_gate() {
        let dispatcher = EventDispatcher::new();
        let log = recorder(&dispatcher);

        let sink = dispatcher.arm();
        sink.open();
        sink.close(Some("gone".into()));
        sink.message(note("after"));
        assert_eq!(*log.lock(), vec!["close"]);
    }

    #[test]
    fn test_stale_epoch_ignored() {
        let dispatcher = EventDispatcher::new();
        let log = recorder(&dispatcher);

        let old = dispatcher.arm();
        old.open();
        let current = dispatcher.arm();
        current.open();

        old.message(note("stale"));
        current.message(note("fresh"));
        assert_eq!(*log.lock(), vec!["message:fresh"]);
    }
}
