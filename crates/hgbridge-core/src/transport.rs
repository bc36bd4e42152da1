//! Seam to the IPC client that owns the socket.
//!
//! The bridge never touches the wire. A [`Connector`] hands the
//! [`LocalRpc`] surface to the transport, which calls it from its worker
//! threads, and returns a [`RemoteTransport`] for outbound calls.
//!
//! [`LoopbackPeer`] is an in-process transport: it plays the remote peer for
//! outbound calls and lets tests and tools drive the local methods from any
//! thread.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::dispatch::LocalRpc;
use crate::error::{BridgeError, Result};
use crate::value::Value;

/// Outbound half of a connected transport.
pub trait RemoteTransport: Send + Sync {
    /// Call a method on the remote peer. Failures come back as fault values.
    fn invoke(&self, method: &str, params: Vec<Value>) -> Value;

    /// Whether the connection is currently up.
    fn connected(&self) -> bool;
}

/// Establishes a transport for a target.
pub trait Connector {
    type Transport: RemoteTransport;

    /// Connect to `target`, routing incoming calls to `local`.
    fn connect(self, target: &str, local: Arc<dyn LocalRpc>) -> Result<Self::Transport>;
}

type RemoteMethod = Box<dyn Fn(Vec<Value>) -> Value + Send + Sync>;

/// In-process transport that stands in for the remote peer.
#[derive(Clone, Default)]
pub struct LoopbackPeer {
    inner: Arc<PeerInner>,
}

#[derive(Default)]
struct PeerInner {
    methods: RwLock<HashMap<String, RemoteMethod>>,
    local: RwLock<Option<Arc<dyn LocalRpc>>>,
    target: RwLock<Option<String>>,
    connected: AtomicBool,
}

impl LoopbackPeer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `name` for outbound [`RemoteTransport::invoke`] calls.
    pub fn register_method(
        &self,
        name: impl Into<String>,
        method: impl Fn(Vec<Value>) -> Value + Send + Sync + 'static,
    ) {
        self.inner
            .methods
            .write()
            .insert(name.into(), Box::new(method));
    }

    /// The target this peer was connected with.
    pub fn target(&self) -> Option<String> {
        self.inner.target.read().clone()
    }

    /// Local method names the attached surface asked to be registered.
    pub fn local_methods(&self) -> Vec<&'static str> {
        self.local()
            .map(|local| local.method_names())
            .unwrap_or_default()
    }

    /// Call a local method the way a transport worker thread would.
    pub fn call_local(&self, method: &str, params: Vec<Value>) -> Value {
        match self.local() {
            Some(local) => local.call_local(method, params),
            None => Value::fault(-32603, "Not connected."),
        }
    }

    /// Flip the connection state and notify the local surface.
    ///
    /// Returns `false` when no local surface is attached yet.
    pub fn set_connected(&self, connected: bool) -> bool {
        let Some(local) = self.local() else {
            return false;
        };
        if self.inner.connected.swap(connected, Ordering::SeqCst) != connected {
            if connected {
                local.on_connect();
            } else {
                debug!("Loopback peer disconnected");
                local.on_disconnect();
            }
        }
        true
    }

    fn local(&self) -> Option<Arc<dyn LocalRpc>> {
        self.inner.local.read().clone()
    }
}

impl RemoteTransport for LoopbackPeer {
    fn invoke(&self, method: &str, params: Vec<Value>) -> Value {
        if !self.connected() {
            return Value::fault(-32603, "Not connected.");
        }
        let methods = self.inner.methods.read();
        match methods.get(method) {
            Some(handler) => handler(params),
            None => BridgeError::MethodNotFound(method.to_string()).to_fault(),
        }
    }

    fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl Connector for LoopbackPeer {
    type Transport = LoopbackPeer;

    fn connect(self, target: &str, local: Arc<dyn LocalRpc>) -> Result<Self::Transport> {
        info!("Loopback transport attached to {}", target);
        *self.inner.target.write() = Some(target.to_string());
        *self.inner.local.write() = Some(local);
        self.set_connected(true);
        Ok(self)
    }
}

impl fmt::Debug for LoopbackPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackPeer")
            .field("target", &self.target())
            .field("connected", &self.connected())
            .field("methods", &self.inner.methods.read().len())
            .finish()
    }
}
