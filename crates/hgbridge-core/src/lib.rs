//! hgbridge core - lets a single-threaded host take part in Homegear IPC.
//!
//! The IPC client calls in on its own worker threads. This crate queues
//! those calls per callback kind and runs the host's handlers on the host
//! thread. For `invokeNodeMethod` the worker blocks until the host answers,
//! with a bounded, shutdown-aware wait.
//!
//! # Example
//!
//! ```rust,ignore
//! use hgbridge_core::{HostHandlers, LoopbackPeer, Session, ShutdownSignal};
//!
//! let handlers = HostHandlers::new()
//!     .on_event(|source, peer_id, channel, variable, value| {
//!         println!("{source} {peer_id}.{channel} {variable} = {value}");
//!     })
//!     .on_invoke_node_method(|node_id, method, _params| {
//!         serde_json::json!({ "node": node_id, "handled": method })
//!     });
//!
//! let mut session = Session::builder(LoopbackPeer::new())
//!     .target("/var/run/homegear/homegearIPC.sock")
//!     .handlers(handlers)
//!     .shutdown(ShutdownSignal::new())
//!     .connect()?;
//!
//! // Run whatever the transport queued so far on this thread.
//! session.run_pending();
//! ```

pub mod bridge;
pub mod config;
pub mod convert;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod value;

// Re-export commonly used types
pub use bridge::{BridgeMessage, CallbackBridge, CallbackKind, HostHandlers, HostLoop};
pub use config::{BridgeConfig, IpcDefaults, NodeInputVariant};
pub use convert::{from_host, params_from_host, to_host};
pub use correlation::{CallTicket, CallerId, CorrelationTable, PendingCall};
pub use dispatch::{Dispatcher, LocalRpc};
pub use error::{BridgeError, Result};
pub use session::{Session, SessionBuilder};
pub use shutdown::ShutdownSignal;
pub use transport::{Connector, LoopbackPeer, RemoteTransport};
pub use value::{Fault, SharedValue, Struct, Value};
