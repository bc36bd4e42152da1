//! Cross-thread callback bridge.
//!
//! Transport worker threads call [`CallbackBridge::enqueue_notify`] or
//! [`CallbackBridge::enqueue_and_await`]; the host thread drains the queues
//! through a [`HostLoop`] and runs the registered handlers one at a time.
//!
//! # Architecture
//!
//! - **Registration**: one per [`CallbackKind`]. Registered while the host
//!   holds a handler for that kind; it then owns the sending half of that
//!   kind's queue.
//! - **Producers**: clone the sender under the registration lock, send
//!   outside it, and drop the clone. The clone keeps the queue alive for the
//!   duration of the send, so teardown can run concurrently.
//! - **Consumer**: [`HostLoop`] owns the receivers and handlers and never
//!   leaves the host thread.

mod host;

pub use host::{
    ConnectHandler, EventHandler, HostHandlers, HostLoop, InvokeNodeMethodHandler,
    NodeInputHandler,
};

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::correlation::{CallTicket, CorrelationTable};
use crate::error::{BridgeError, Result};
use crate::value::{SharedValue, Value};

/// The externally observable callback kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Connect,
    Disconnect,
    BroadcastEvent,
    NodeInput,
    InvokeMethod,
}

impl CallbackKind {
    pub const ALL: [CallbackKind; 5] = [
        CallbackKind::Connect,
        CallbackKind::Disconnect,
        CallbackKind::BroadcastEvent,
        CallbackKind::NodeInput,
        CallbackKind::InvokeMethod,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Connect => "connect",
            CallbackKind::Disconnect => "disconnect",
            CallbackKind::BroadcastEvent => "broadcast-event",
            CallbackKind::NodeInput => "node-input",
            CallbackKind::InvokeMethod => "invoke-method",
        }
    }

    /// Whether the producer waits for the handler's result.
    pub fn requires_result(&self) -> bool {
        matches!(self, CallbackKind::InvokeMethod)
    }

    fn index(self) -> usize {
        match self {
            CallbackKind::Connect => 0,
            CallbackKind::Disconnect => 1,
            CallbackKind::BroadcastEvent => 2,
            CallbackKind::NodeInput => 3,
            CallbackKind::InvokeMethod => 4,
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a single cross-thread call.
#[derive(Debug, Clone)]
pub enum BridgeMessage {
    Connect,
    Disconnect,
    BroadcastEvent {
        source: String,
        peer_id: u64,
        channel: i32,
        variable: String,
        value: SharedValue,
    },
    NodeInput {
        node_id: String,
        node_info: SharedValue,
        input_index: u32,
        message: SharedValue,
        synchronous: bool,
    },
    InvokeMethod {
        ticket: CallTicket,
        node_id: String,
        method: String,
        parameters: SharedValue,
    },
}

impl BridgeMessage {
    pub fn kind(&self) -> CallbackKind {
        match self {
            BridgeMessage::Connect => CallbackKind::Connect,
            BridgeMessage::Disconnect => CallbackKind::Disconnect,
            BridgeMessage::BroadcastEvent { .. } => CallbackKind::BroadcastEvent,
            BridgeMessage::NodeInput { .. } => CallbackKind::NodeInput,
            BridgeMessage::InvokeMethod { .. } => CallbackKind::InvokeMethod,
        }
    }
}

type Sender = mpsc::UnboundedSender<BridgeMessage>;
pub(crate) type Receiver = mpsc::UnboundedReceiver<BridgeMessage>;

#[derive(Debug, Default)]
struct CallbackRegistration {
    sender: Mutex<Option<Sender>>,
}

impl CallbackRegistration {
    fn acquire(&self) -> Option<Sender> {
        self.sender.lock().clone()
    }

    fn replace(&self, sender: Option<Sender>) -> Option<Sender> {
        std::mem::replace(&mut *self.sender.lock(), sender)
    }

    /// Unregister only if the slot still holds `sender`'s channel.
    ///
    /// A producer whose send failed may hold a sender from before a
    /// detach/attach cycle; the newer registration must survive it.
    fn clear_if(&self, sender: &Sender) -> bool {
        let mut slot = self.sender.lock();
        if slot.as_ref().is_some_and(|current| current.same_channel(sender)) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn is_registered(&self) -> bool {
        self.sender.lock().is_some()
    }
}

/// Producer-side handle shared by every transport thread.
#[derive(Debug)]
pub struct CallbackBridge {
    registrations: [CallbackRegistration; 5],
    table: Arc<CorrelationTable>,
    torn_down: AtomicBool,
}

impl CallbackBridge {
    /// Create a bridge with every kind unregistered.
    pub fn new(table: Arc<CorrelationTable>) -> Self {
        Self {
            registrations: Default::default(),
            table,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    pub fn is_registered(&self, kind: CallbackKind) -> bool {
        self.registration(kind).is_registered()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Queue a call for the host without waiting.
    ///
    /// Returns `false` when nothing is registered for the message's kind;
    /// the message is then dropped.
    pub fn enqueue_notify(&self, message: BridgeMessage) -> bool {
        let kind = message.kind();
        let Some(sender) = self.registration(kind).acquire() else {
            debug!("No {} handler registered, dropping call", kind);
            return false;
        };

        if sender.send(message).is_err() {
            // Receiver went away without detaching (host loop dropped).
            if self.registration(kind).clear_if(&sender) {
                warn!("{} queue closed, unregistering", kind);
            }
            return false;
        }
        true
    }

    /// Queue a call for the host and block until it reports a result.
    ///
    /// The caller must have registered the message's ticket with
    /// [`CorrelationTable::begin_call`]. Without a registered handler the
    /// pending call is released and `NoHandler` returned immediately.
    pub fn enqueue_and_await(&self, message: BridgeMessage, timeout: Duration) -> Result<Value> {
        let BridgeMessage::InvokeMethod { ticket, .. } = &message else {
            return Err(BridgeError::NotAwaitable {
                kind: message.kind(),
            });
        };
        let caller = ticket.caller();
        let kind = message.kind();

        if !self.enqueue_notify(message) {
            self.table.cancel_call(caller);
            return Err(BridgeError::NoHandler { kind });
        }

        Ok(self.table.wait_call(caller, timeout))
    }

    /// Invalidate every registration. Later enqueues are no-ops.
    ///
    /// Calls still waiting for the host are answered with a `NoHandler`
    /// fault, since no handler will run them any more.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for kind in CallbackKind::ALL {
            self.registration(kind).replace(None);
        }
        let fault = BridgeError::NoHandler {
            kind: CallbackKind::InvokeMethod,
        }
        .to_fault();
        let released = self.table.abort_all(fault);
        debug!("Callback bridge torn down ({} waiting calls released)", released);
    }

    /// Register `kind` and return the receiving half of its fresh queue.
    pub(crate) fn attach(&self, kind: CallbackKind) -> Result<Receiver> {
        if self.is_torn_down() {
            return Err(BridgeError::TornDown);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.registration(kind).replace(Some(sender));
        // Teardown may have raced with the replace above.
        if self.is_torn_down() {
            self.registration(kind).replace(None);
            return Err(BridgeError::TornDown);
        }
        Ok(receiver)
    }

    /// Unregister `kind`. Returns whether it was registered.
    pub(crate) fn detach(&self, kind: CallbackKind) -> bool {
        self.registration(kind).replace(None).is_some()
    }

    fn registration(&self, kind: CallbackKind) -> &CallbackRegistration {
        &self.registrations[kind.index()]
    }
}
