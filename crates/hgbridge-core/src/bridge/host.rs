//! Host-side consumer of the callback bridge.
//!
//! [`HostLoop`] is deliberately not `Send`: it owns the host's handlers and
//! runs them on the thread that created it, one at a time, in the order
//! each kind's messages were queued.

use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::debug;

use super::{BridgeMessage, CallbackBridge, CallbackKind, Receiver};
use crate::convert::{from_host, to_host};
use crate::error::{BridgeError, Result};
use crate::shutdown::ShutdownSignal;

/// `on_connect()` / `on_disconnect()`.
pub type ConnectHandler = Box<dyn FnMut()>;

/// `on_event(source, peer_id, channel, variable_name, value)`.
pub type EventHandler = Box<dyn FnMut(&str, u64, i32, &str, serde_json::Value)>;

/// `on_node_input(node_id, node_info, input_index, message, synchronous)`.
pub type NodeInputHandler =
    Box<dyn FnMut(&str, serde_json::Value, u32, serde_json::Value, bool) -> serde_json::Value>;

/// `on_invoke_node_method(node_id, method_name, parameters)`.
pub type InvokeNodeMethodHandler =
    Box<dyn FnMut(&str, &str, serde_json::Value) -> serde_json::Value>;

/// The optional handlers a host registers. Each is independent.
#[derive(Default)]
pub struct HostHandlers {
    on_connect: Option<ConnectHandler>,
    on_disconnect: Option<ConnectHandler>,
    on_event: Option<EventHandler>,
    on_node_input: Option<NodeInputHandler>,
    on_invoke_node_method: Option<InvokeNodeMethodHandler>,
}

impl HostHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, handler: impl FnMut() + 'static) -> Self {
        self.on_connect = Some(Box::new(handler));
        self
    }

    pub fn on_disconnect(mut self, handler: impl FnMut() + 'static) -> Self {
        self.on_disconnect = Some(Box::new(handler));
        self
    }

    pub fn on_event(
        mut self,
        handler: impl FnMut(&str, u64, i32, &str, serde_json::Value) + 'static,
    ) -> Self {
        self.on_event = Some(Box::new(handler));
        self
    }

    pub fn on_node_input(
        mut self,
        handler: impl FnMut(&str, serde_json::Value, u32, serde_json::Value, bool) -> serde_json::Value
            + 'static,
    ) -> Self {
        self.on_node_input = Some(Box::new(handler));
        self
    }

    pub fn on_invoke_node_method(
        mut self,
        handler: impl FnMut(&str, &str, serde_json::Value) -> serde_json::Value + 'static,
    ) -> Self {
        self.on_invoke_node_method = Some(Box::new(handler));
        self
    }

    /// Whether a handler is present for `kind`.
    pub fn has(&self, kind: CallbackKind) -> bool {
        match kind {
            CallbackKind::Connect => self.on_connect.is_some(),
            CallbackKind::Disconnect => self.on_disconnect.is_some(),
            CallbackKind::BroadcastEvent => self.on_event.is_some(),
            CallbackKind::NodeInput => self.on_node_input.is_some(),
            CallbackKind::InvokeMethod => self.on_invoke_node_method.is_some(),
        }
    }

    fn clear(&mut self, kind: CallbackKind) {
        match kind {
            CallbackKind::Connect => self.on_connect = None,
            CallbackKind::Disconnect => self.on_disconnect = None,
            CallbackKind::BroadcastEvent => self.on_event = None,
            CallbackKind::NodeInput => self.on_node_input = None,
            CallbackKind::InvokeMethod => self.on_invoke_node_method = None,
        }
    }
}

impl fmt::Debug for HostHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<&str> = CallbackKind::ALL
            .iter()
            .filter(|kind| self.has(**kind))
            .map(CallbackKind::as_str)
            .collect();
        f.debug_struct("HostHandlers")
            .field("registered", &registered)
            .finish()
    }
}

/// Single-threaded executor for bridged calls.
pub struct HostLoop {
    bridge: Arc<CallbackBridge>,
    handlers: HostHandlers,
    receivers: [Option<Receiver>; 5],
    cursor: usize,
}

impl HostLoop {
    /// Register every kind that has a handler and take over its queue.
    pub fn new(bridge: Arc<CallbackBridge>, handlers: HostHandlers) -> Result<Self> {
        let mut host = Self {
            bridge,
            handlers,
            receivers: Default::default(),
            cursor: 0,
        };
        for kind in CallbackKind::ALL {
            if host.handlers.has(kind) {
                host.attach(kind)?;
            }
        }
        Ok(host)
    }

    pub fn bridge(&self) -> &Arc<CallbackBridge> {
        &self.bridge
    }

    /// Whether `kind` currently has a handler attached to the bridge.
    pub fn is_registered(&self, kind: CallbackKind) -> bool {
        self.receivers[kind.index()].is_some()
    }

    pub fn set_on_connect(&mut self, handler: impl FnMut() + 'static) -> Result<()> {
        self.handlers.on_connect = Some(Box::new(handler));
        self.attach(CallbackKind::Connect)
    }

    pub fn set_on_disconnect(&mut self, handler: impl FnMut() + 'static) -> Result<()> {
        self.handlers.on_disconnect = Some(Box::new(handler));
        self.attach(CallbackKind::Disconnect)
    }

    pub fn set_on_event(
        &mut self,
        handler: impl FnMut(&str, u64, i32, &str, serde_json::Value) + 'static,
    ) -> Result<()> {
        self.handlers.on_event = Some(Box::new(handler));
        self.attach(CallbackKind::BroadcastEvent)
    }

    pub fn set_on_node_input(
        &mut self,
        handler: impl FnMut(&str, serde_json::Value, u32, serde_json::Value, bool) -> serde_json::Value
            + 'static,
    ) -> Result<()> {
        self.handlers.on_node_input = Some(Box::new(handler));
        self.attach(CallbackKind::NodeInput)
    }

    pub fn set_on_invoke_node_method(
        &mut self,
        handler: impl FnMut(&str, &str, serde_json::Value) -> serde_json::Value + 'static,
    ) -> Result<()> {
        self.handlers.on_invoke_node_method = Some(Box::new(handler));
        self.attach(CallbackKind::InvokeMethod)
    }

    /// Remove the handler for `kind` and unregister it from the bridge.
    ///
    /// Queued blocking calls of that kind are answered with a `NoHandler`
    /// fault so their callers do not wait out the deadline.
    pub fn clear(&mut self, kind: CallbackKind) {
        self.handlers.clear(kind);
        self.release(kind);
    }

    /// Execute everything queued right now. Returns the number of calls run.
    pub fn run_pending(&mut self) -> usize {
        let mut executed = 0;
        loop {
            let mut progressed = false;
            for kind in CallbackKind::ALL {
                let slot = &mut self.receivers[kind.index()];
                let Some(receiver) = slot else { continue };
                match receiver.try_recv() {
                    Ok(message) => {
                        self.execute(message);
                        executed += 1;
                        progressed = true;
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => *slot = None,
                }
            }
            if !progressed {
                return executed;
            }
        }
    }

    /// Wait for queued calls and execute them until `shutdown` is set or
    /// every queue has closed. Returns the number of calls run.
    ///
    /// Returns immediately when no handler is registered.
    pub async fn run(&mut self, shutdown: &ShutdownSignal) -> usize {
        let mut executed = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.triggered() => None,
                message = poll_fn(|cx| poll_next(&mut self.receivers, &mut self.cursor, cx)) => message,
            };
            let Some(message) = next else {
                return executed;
            };
            self.execute(message);
            executed += 1;
        }
    }

    fn attach(&mut self, kind: CallbackKind) -> Result<()> {
        if self.receivers[kind.index()].is_some() {
            return Ok(());
        }
        match self.bridge.attach(kind) {
            Ok(receiver) => {
                self.receivers[kind.index()] = Some(receiver);
                debug!("Registered {} handler", kind);
                Ok(())
            }
            Err(e) => {
                self.handlers.clear(kind);
                Err(e)
            }
        }
    }

    fn release(&mut self, kind: CallbackKind) {
        self.bridge.detach(kind);
        let Some(mut receiver) = self.receivers[kind.index()].take() else {
            return;
        };
        // Closing first makes racing producers fail fast instead of queueing.
        receiver.close();
        let mut dropped = 0usize;
        while let Ok(message) = receiver.try_recv() {
            self.reject(message);
            dropped += 1;
        }
        debug!("Unregistered {} handler ({} queued calls dropped)", kind, dropped);
    }

    fn reject(&self, message: BridgeMessage) {
        if let BridgeMessage::InvokeMethod { ticket, .. } = message {
            let fault = BridgeError::NoHandler {
                kind: CallbackKind::InvokeMethod,
            }
            .to_fault();
            self.bridge.table().complete_call(ticket, fault);
        }
    }

    fn execute(&mut self, message: BridgeMessage) {
        match message {
            BridgeMessage::Connect => {
                if let Some(handler) = self.handlers.on_connect.as_mut() {
                    handler();
                }
            }
            BridgeMessage::Disconnect => {
                if let Some(handler) = self.handlers.on_disconnect.as_mut() {
                    handler();
                }
            }
            BridgeMessage::BroadcastEvent {
                source,
                peer_id,
                channel,
                variable,
                value,
            } => {
                if let Some(handler) = self.handlers.on_event.as_mut() {
                    handler(&source, peer_id, channel, &variable, to_host(&value));
                }
            }
            BridgeMessage::NodeInput {
                node_id,
                node_info,
                input_index,
                message,
                synchronous,
            } => {
                if let Some(handler) = self.handlers.on_node_input.as_mut() {
                    let result = handler(
                        &node_id,
                        to_host(&node_info),
                        input_index,
                        to_host(&message),
                        synchronous,
                    );
                    if synchronous && !result.is_null() {
                        debug!("Node input result from {} is not relayed", node_id);
                    }
                }
            }
            BridgeMessage::InvokeMethod {
                ticket,
                node_id,
                method,
                parameters,
            } => {
                let result = match self.handlers.on_invoke_node_method.as_mut() {
                    Some(handler) => from_host(&handler(&node_id, &method, to_host(&parameters))),
                    None => BridgeError::NoHandler {
                        kind: CallbackKind::InvokeMethod,
                    }
                    .to_fault(),
                };
                self.bridge.table().complete_call(ticket, result);
            }
        }
    }
}

impl Drop for HostLoop {
    fn drop(&mut self) {
        for kind in CallbackKind::ALL {
            self.release(kind);
        }
    }
}

impl fmt::Debug for HostLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLoop")
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

/// Poll every open queue once, starting after the last one served.
fn poll_next(
    receivers: &mut [Option<Receiver>; 5],
    cursor: &mut usize,
    cx: &mut Context<'_>,
) -> Poll<Option<BridgeMessage>> {
    let mut open = false;
    for offset in 0..receivers.len() {
        let index = (*cursor + offset) % receivers.len();
        let slot = &mut receivers[index];
        let Some(receiver) = slot else { continue };
        match receiver.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                *cursor = (index + 1) % receivers.len();
                return Poll::Ready(Some(message));
            }
            Poll::Ready(None) => *slot = None,
            Poll::Pending => open = true,
        }
    }

    if open {
        Poll::Pending
    } else {
        Poll::Ready(None)
    }
}
