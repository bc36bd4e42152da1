//! Centralized configuration for the bridge.
//!
//! Fixed protocol constants live in [`IpcDefaults`]; the tunable subset is
//! carried by [`BridgeConfig`].

use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Protocol-level defaults.
pub struct IpcDefaults;

impl IpcDefaults {
    /// Socket the Homegear daemon listens on when no target is given.
    pub const SOCKET_PATH: &'static str = "/var/run/homegear/homegearIPC.sock";

    /// Overall deadline for a blocking `invokeNodeMethod` round trip.
    pub const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Re-check interval of the wait loop under the overall deadline.
    pub const WAIT_POLL_SLICE: Duration = Duration::from_secs(1);

    /// Reserved struct key receiving the input index in `nodeInput` messages.
    pub const INPUT_INDEX_KEY: &'static str = "_inputIndex";
}

/// Which `nodeInput` wire contract the dispatcher registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeInputVariant {
    /// `NodeInput(node_id, node_info, input_index, message)`.
    Legacy,
    /// `nodeInput(node_id, node_info, input_index, message, synchronous)`.
    #[default]
    Current,
}

impl NodeInputVariant {
    /// Method name the transport dispatches for this variant.
    pub fn method_name(&self) -> &'static str {
        match self {
            NodeInputVariant::Legacy => "NodeInput",
            NodeInputVariant::Current => "nodeInput",
        }
    }

    /// Exact positional parameter count.
    pub fn arity(&self) -> usize {
        match self {
            NodeInputVariant::Legacy => 4,
            NodeInputVariant::Current => 5,
        }
    }
}

/// Runtime configuration of a bridge session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Connection target handed to the transport (socket path).
    pub target: String,
    pub invoke_timeout: Duration,
    pub wait_poll_slice: Duration,
    pub node_input: NodeInputVariant,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            target: IpcDefaults::SOCKET_PATH.to_string(),
            invoke_timeout: IpcDefaults::INVOKE_TIMEOUT,
            wait_poll_slice: IpcDefaults::WAIT_POLL_SLICE,
            node_input: NodeInputVariant::default(),
        }
    }
}

impl BridgeConfig {
    /// Set the connection target. An empty target keeps the default socket.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        let target = target.into();
        self.target = if target.is_empty() {
            IpcDefaults::SOCKET_PATH.to_string()
        } else {
            target
        };
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn with_wait_poll_slice(mut self, slice: Duration) -> Self {
        self.wait_poll_slice = slice;
        self
    }

    pub fn with_node_input(mut self, variant: NodeInputVariant) -> Self {
        self.node_input = variant;
        self
    }

    /// Reject settings that would make the wait loop spin or never time out.
    pub fn validate(&self) -> Result<()> {
        if self.invoke_timeout.is_zero() {
            return Err(BridgeError::Config {
                message: "invoke timeout must be greater than zero".to_string(),
            });
        }
        if self.wait_poll_slice.is_zero() {
            return Err(BridgeError::Config {
                message: "wait poll slice must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
