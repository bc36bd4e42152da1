//! Error types for the callback bridge.
//!
//! Nothing inside the dispatch path escapes as a hard failure: every variant
//! here can be turned into a fault [`Value`] with [`BridgeError::to_fault`]
//! so the remote peer's call always completes.

use std::time::Duration;
use thiserror::Error;

use crate::bridge::CallbackKind;
use crate::correlation::CallerId;
use crate::value::Value;

/// Main error type for the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Malformed calls from the transport
    #[error("Wrong parameter count for {method}: expected {expected}, got {actual}.")]
    WrongParameterCount {
        method: &'static str,
        expected: &'static str,
        actual: usize,
    },

    #[error("Invalid parameter {name} for {method}: {message}")]
    InvalidParams {
        method: &'static str,
        name: &'static str,
        message: String,
    },

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    // Callback bridge
    #[error("Unknown method: no callback method specified for {kind}.")]
    NoHandler { kind: CallbackKind },

    #[error("{kind} callbacks do not return a result")]
    NotAwaitable { kind: CallbackKind },

    #[error("Callback bridge has been torn down")]
    TornDown,

    // Blocking calls
    #[error("No response received.")]
    Timeout(Duration),

    #[error("No response received.")]
    ShutdownAborted,

    #[error("Caller {caller} already has a call in flight")]
    DuplicateCall { caller: CallerId },

    #[error("No call in flight for {caller}")]
    NotPending { caller: CallerId },

    // Host-facing invoke
    #[error("method is not a String or empty.")]
    InvalidMethodName,

    #[error("{message}")]
    Remote { code: i32, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Numeric fault code reported to the remote peer.
    ///
    /// - -1: wrong parameter count, invalid method name (Homegear convention)
    /// - -32601: method not found, no callback registered
    /// - -32602: invalid params
    /// - -32000: no response (timeout or shutdown)
    /// - -32603: internal error, including protocol violations
    ///
    /// Remote faults keep the code the peer sent.
    pub fn fault_code(&self) -> i32 {
        match self {
            BridgeError::WrongParameterCount { .. } | BridgeError::InvalidMethodName => -1,

            BridgeError::MethodNotFound(_) | BridgeError::NoHandler { .. } => -32601,

            BridgeError::InvalidParams { .. } => -32602,

            BridgeError::Timeout(_) | BridgeError::ShutdownAborted => -32000,

            BridgeError::Remote { code, .. } => *code,

            BridgeError::NotAwaitable { .. }
            | BridgeError::TornDown
            | BridgeError::DuplicateCall { .. }
            | BridgeError::NotPending { .. }
            | BridgeError::Config { .. } => -32603,
        }
    }

    /// Build the fault value that carries this error back over the wire.
    pub fn to_fault(&self) -> Value {
        Value::fault(self.fault_code(), self.to_string())
    }

    /// Whether this error means a caller broke the threading contract.
    ///
    /// These are logged loudly but still resolved to a value.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, BridgeError::DuplicateCall { .. })
    }

    /// Whether the call ended without any answer from the host.
    pub fn is_no_response(&self) -> bool {
        matches!(self, BridgeError::Timeout(_) | BridgeError::ShutdownAborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::WrongParameterCount {
            method: "broadcastEvent",
            expected: "5",
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Wrong parameter count for broadcastEvent: expected 5, got 3."
        );
        assert_eq!(
            BridgeError::Timeout(Duration::from_secs(30)).to_string(),
            "No response received."
        );
    }

    #[test]
    fn test_fault_codes() {
        assert_eq!(BridgeError::InvalidMethodName.fault_code(), -1);
        assert_eq!(
            BridgeError::NoHandler {
                kind: CallbackKind::InvokeMethod
            }
            .fault_code(),
            -32601
        );
        assert_eq!(BridgeError::ShutdownAborted.fault_code(), -32000);
        assert_eq!(
            BridgeError::NotPending {
                caller: CallerId::from_raw(3)
            }
            .fault_code(),
            -32603
        );
        assert_eq!(
            BridgeError::Remote {
                code: -5,
                message: "x".into()
            }
            .fault_code(),
            -5
        );
    }

    #[test]
    fn test_to_fault_carries_message() {
        let fault = BridgeError::MethodNotFound("foo".into()).to_fault();
        let fault = fault.as_fault().unwrap();
        assert_eq!(fault.code, -32601);
        assert_eq!(fault.message, "Method not found: foo");
    }

    #[test]
    fn test_protocol_violation() {
        assert!(BridgeError::DuplicateCall {
            caller: CallerId::from_raw(7)
        }
        .is_protocol_violation());
        assert!(!BridgeError::TornDown.is_protocol_violation());
        assert!(BridgeError::Timeout(Duration::from_secs(1)).is_no_response());
    }
}
