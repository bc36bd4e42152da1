//! Local RPC methods the transport invokes on behalf of the remote peer.
//!
//! # Thread Safety
//!
//! Every entry point runs on a transport worker thread. Only
//! `invokeNodeMethod` blocks, and only the thread that issued it.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bridge::{BridgeMessage, CallbackBridge, CallbackKind};
use crate::config::{BridgeConfig, IpcDefaults, NodeInputVariant};
use crate::correlation::CallerId;
use crate::error::{BridgeError, Result};
use crate::value::Value;

const BROADCAST_EVENT: &str = "broadcastEvent";
const INVOKE_NODE_METHOD: &str = "invokeNodeMethod";

/// Entry points a transport calls into.
///
/// Implementations must answer every call with a value; failures are
/// reported as fault values, never as panics.
pub trait LocalRpc: Send + Sync {
    /// The transport established its connection.
    fn on_connect(&self);

    /// The transport lost its connection.
    fn on_disconnect(&self);

    /// Execute the named local method with positional parameters.
    fn call_local(&self, method: &str, params: Vec<Value>) -> Value;

    /// Names the transport should register as local methods.
    fn method_names(&self) -> Vec<&'static str>;
}

/// Routes incoming calls onto the callback bridge.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    bridge: Arc<CallbackBridge>,
    invoke_timeout: Duration,
    node_input: NodeInputVariant,
}

impl Dispatcher {
    pub fn new(bridge: Arc<CallbackBridge>, config: &BridgeConfig) -> Self {
        Self {
            bridge,
            invoke_timeout: config.invoke_timeout,
            node_input: config.node_input,
        }
    }

    pub fn bridge(&self) -> &Arc<CallbackBridge> {
        &self.bridge
    }

    /// `broadcastEvent(source, peer_id, channel, names, values)`.
    ///
    /// Publishes one event per name/value pair and returns void.
    pub fn broadcast_event(&self, params: Vec<Value>) -> Value {
        finish(BROADCAST_EVENT, self.try_broadcast_event(params))
    }

    /// `nodeInput(node_id, node_info, input_index, message, synchronous)`,
    /// or the four-parameter `NodeInput` form.
    pub fn node_input(&self, params: Vec<Value>) -> Value {
        finish(self.node_input.method_name(), self.try_node_input(params))
    }

    /// `invokeNodeMethod(node_id, method, parameters)`.
    ///
    /// Blocks the calling thread until the host answers, the invoke timeout
    /// elapses or shutdown is signalled.
    pub fn invoke_node_method(&self, params: Vec<Value>) -> Value {
        finish(INVOKE_NODE_METHOD, self.try_invoke_node_method(params))
    }

    fn try_broadcast_event(&self, params: Vec<Value>) -> Result<Value> {
        const METHOD: &str = BROADCAST_EVENT;
        check_arity(METHOD, &params, 5, "5")?;

        let source = expect_str(METHOD, "source", &params[0])?;
        // Peer ids are unsigned on the wire; larger ids arrive wrapped.
        let peer_id = expect_i64(METHOD, "peer id", &params[1])? as u64;
        let channel = expect_i64(METHOD, "channel", &params[2])?;
        let channel = i32::try_from(channel).map_err(|_| BridgeError::InvalidParams {
            method: METHOD,
            name: "channel",
            message: format!("{} is out of range", channel),
        })?;
        let names = expect_array(METHOD, "variable names", &params[3])?;
        let values = expect_array(METHOD, "values", &params[4])?;
        if names.len() != values.len() {
            return Err(BridgeError::InvalidParams {
                method: METHOD,
                name: "values",
                message: format!("{} names but {} values", names.len(), values.len()),
            });
        }

        let variables = names
            .iter()
            .map(|name| expect_str(METHOD, "variable name", name))
            .collect::<Result<Vec<&str>>>()?;

        for (variable, value) in variables.into_iter().zip(values) {
            self.bridge.enqueue_notify(BridgeMessage::BroadcastEvent {
                source: source.to_string(),
                peer_id,
                channel,
                variable: variable.to_string(),
                value: value.clone().into_shared(),
            });
        }
        Ok(Value::Void)
    }

    fn try_node_input(&self, mut params: Vec<Value>) -> Result<Value> {
        let method = self.node_input.method_name();
        let arity = self.node_input.arity();
        let expected = match self.node_input {
            NodeInputVariant::Legacy => "4",
            NodeInputVariant::Current => "5",
        };
        check_arity(method, &params, arity, expected)?;

        let node_id = expect_str(method, "node id", &params[0])?.to_string();
        let input_index = expect_i64(method, "input index", &params[2])?;
        let input_index = u32::try_from(input_index).map_err(|_| BridgeError::InvalidParams {
            method,
            name: "input index",
            message: format!("{} is out of range", input_index),
        })?;

        let synchronous = match self.node_input {
            NodeInputVariant::Legacy => false,
            NodeInputVariant::Current => expect_bool(method, "synchronous", &params[4])?,
        };

        let mut message = std::mem::take(&mut params[3]);
        if self.node_input == NodeInputVariant::Current {
            if let Some(map) = message.as_struct_mut() {
                map.insert(
                    IpcDefaults::INPUT_INDEX_KEY.to_string(),
                    Value::from(input_index),
                );
            }
        }
        let node_info = std::mem::take(&mut params[1]);

        self.bridge.enqueue_notify(BridgeMessage::NodeInput {
            node_id,
            node_info: node_info.into_shared(),
            input_index,
            message: message.into_shared(),
            synchronous,
        });
        Ok(Value::Void)
    }

    fn try_invoke_node_method(&self, mut params: Vec<Value>) -> Result<Value> {
        const METHOD: &str = INVOKE_NODE_METHOD;
        if params.len() < 3 {
            return Err(BridgeError::WrongParameterCount {
                method: METHOD,
                expected: "at least 3",
                actual: params.len(),
            });
        }

        let node_id = expect_str(METHOD, "node id", &params[0])?.to_string();
        let method = expect_str(METHOD, "method", &params[1])?.to_string();

        // Answer without touching the table when nobody could respond.
        if !self.bridge.is_registered(CallbackKind::InvokeMethod) {
            return Err(BridgeError::NoHandler {
                kind: CallbackKind::InvokeMethod,
            });
        }

        let pending = self.bridge.table().begin_call(CallerId::current())?;
        let message = BridgeMessage::InvokeMethod {
            ticket: pending.ticket(),
            node_id,
            method,
            parameters: std::mem::take(&mut params[2]).into_shared(),
        };
        self.bridge.enqueue_and_await(message, self.invoke_timeout)
    }
}

impl LocalRpc for Dispatcher {
    fn on_connect(&self) {
        self.bridge.enqueue_notify(BridgeMessage::Connect);
    }

    fn on_disconnect(&self) {
        self.bridge.enqueue_notify(BridgeMessage::Disconnect);
    }

    fn call_local(&self, method: &str, params: Vec<Value>) -> Value {
        match method {
            BROADCAST_EVENT => self.broadcast_event(params),
            INVOKE_NODE_METHOD => self.invoke_node_method(params),
            m if m == self.node_input.method_name() => self.node_input(params),
            _ => finish(method, Err(BridgeError::MethodNotFound(method.to_string()))),
        }
    }

    fn method_names(&self) -> Vec<&'static str> {
        vec![
            BROADCAST_EVENT,
            self.node_input.method_name(),
            INVOKE_NODE_METHOD,
        ]
    }
}

/// Resolve a dispatch result to the value returned over the wire.
fn finish(method: &str, result: Result<Value>) -> Value {
    match result {
        Ok(value) => value,
        Err(e) => {
            // Protocol violations were already logged where they were detected.
            if matches!(e, BridgeError::NoHandler { .. }) {
                debug!("{}: {}", method, e);
            } else if !e.is_protocol_violation() {
                warn!("{} failed: {}", method, e);
            }
            e.to_fault()
        }
    }
}

fn check_arity(
    method: &'static str,
    params: &[Value],
    arity: usize,
    expected: &'static str,
) -> Result<()> {
    if params.len() != arity {
        return Err(BridgeError::WrongParameterCount {
            method,
            expected,
            actual: params.len(),
        });
    }
    Ok(())
}

fn invalid_type(method: &'static str, name: &'static str, want: &str, got: &Value) -> BridgeError {
    BridgeError::InvalidParams {
        method,
        name,
        message: format!("expected {}, got {}", want, got.type_name()),
    }
}

fn expect_str<'a>(method: &'static str, name: &'static str, value: &'a Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| invalid_type(method, name, "string", value))
}

fn expect_i64(method: &'static str, name: &'static str, value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| invalid_type(method, name, "integer", value))
}

fn expect_bool(method: &'static str, name: &'static str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| invalid_type(method, name, "boolean", value))
}

fn expect_array<'a>(
    method: &'static str,
    name: &'static str,
    value: &'a Value,
) -> Result<&'a [Value]> {
    value
        .as_array()
        .ok_or_else(|| invalid_type(method, name, "array", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationTable;
    use crate::shutdown::ShutdownSignal;
    use crate::value::Struct;

    fn dispatcher(config: BridgeConfig) -> Dispatcher {
        let table = CorrelationTable::with_poll_slice(ShutdownSignal::new(), config.wait_poll_slice);
        let bridge = Arc::new(CallbackBridge::new(Arc::new(table)));
        Dispatcher::new(bridge, &config)
    }

    fn event_params(names: Vec<Value>, values: Vec<Value>) -> Vec<Value> {
        vec![
            Value::from("device"),
            Value::Integer(7),
            Value::Integer(1),
            Value::Array(names),
            Value::Array(values),
        ]
    }

    #[test]
    fn test_method_names_follow_variant() {
        let current = dispatcher(BridgeConfig::default());
        assert_eq!(
            current.method_names(),
            vec!["broadcastEvent", "nodeInput", "invokeNodeMethod"]
        );

        let legacy =
            dispatcher(BridgeConfig::default().with_node_input(NodeInputVariant::Legacy));
        assert!(legacy.method_names().contains(&"NodeInput"));
    }

    #[test]
    fn test_broadcast_event_enqueues_each_pair() {
        let dispatcher = dispatcher(BridgeConfig::default());
        let mut rx = dispatcher.bridge().attach(CallbackKind::BroadcastEvent).unwrap();

        let result = dispatcher.broadcast_event(event_params(
            vec![Value::from("STATE"), Value::from("LEVEL")],
            vec![Value::Boolean(true), Value::Float(0.5)],
        ));
        assert!(result.is_void());

        let mut seen = Vec::new();
        while let Ok(BridgeMessage::BroadcastEvent {
            source,
            peer_id,
            channel,
            variable,
            value,
        }) = rx.try_recv()
        {
            assert_eq!(source, "device");
            assert_eq!(peer_id, 7);
            assert_eq!(channel, 1);
            seen.push((variable, (*value).clone()));
        }
        assert_eq!(
            seen,
            vec![
                ("STATE".to_string(), Value::Boolean(true)),
                ("LEVEL".to_string(), Value::Float(0.5)),
            ]
        );
    }

    #[test]
    fn test_broadcast_event_wrong_arity() {
        let dispatcher = dispatcher(BridgeConfig::default());
        let mut rx = dispatcher.bridge().attach(CallbackKind::BroadcastEvent).unwrap();

        let result = dispatcher.broadcast_event(vec![
            Value::from("device"),
            Value::Integer(7),
            Value::Integer(1),
        ]);
        let fault = result.as_fault().unwrap();
        assert_eq!(fault.code, -1);
        assert!(fault.message.contains("Wrong parameter count"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_event_mismatched_lengths() {
        let dispatcher = dispatcher(BridgeConfig::default());
        let result = dispatcher.broadcast_event(event_params(
            vec![Value::from("STATE")],
            vec![],
        ));
        assert_eq!(result.as_fault().unwrap().code, -32602);
    }

    #[test]
    fn test_broadcast_event_without_handler_succeeds() {
        let dispatcher = dispatcher(BridgeConfig::default());
        let result = dispatcher.broadcast_event(event_params(
            vec![Value::from("STATE")],
            vec![Value::Boolean(false)],
        ));
        assert!(result.is_void());
    }

    #[test]
    fn test_node_input_injects_input_index() {
        let dispatcher = dispatcher(BridgeConfig::default());
        let mut rx = dispatcher.bridge().attach(CallbackKind::NodeInput).unwrap();

        let mut message = Struct::new();
        message.insert("payload".into(), Value::Integer(5));
        let result = dispatcher.node_input(vec![
            Value::from("node-1"),
            Value::Struct(Struct::new()),
            Value::Integer(2),
            Value::Struct(message),
            Value::Boolean(true),
        ]);
        assert!(result.is_void());

        match rx.try_recv().unwrap() {
            BridgeMessage::NodeInput {
                node_id,
                input_index,
                message,
                synchronous,
                ..
            } => {
                assert_eq!(node_id, "node-1");
                assert_eq!(input_index, 2);
                assert!(synchronous);
                let map = message.as_struct().unwrap();
                assert_eq!(map[IpcDefaults::INPUT_INDEX_KEY], Value::Integer(2));
                assert_eq!(map["payload"], Value::Integer(5));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_legacy_node_input_takes_four_params() {
        let dispatcher =
            dispatcher(BridgeConfig::default().with_node_input(NodeInputVariant::Legacy));
        let mut rx = dispatcher.bridge().attach(CallbackKind::NodeInput).unwrap();

        let five = dispatcher.node_input(vec![
            Value::from("n"),
            Value::Void,
            Value::Integer(0),
            Value::Void,
            Value::Boolean(false),
        ]);
        assert_eq!(five.as_fault().unwrap().code, -1);

        let four = dispatcher.call_local(
            "NodeInput",
            vec![
                Value::from("n"),
                Value::Void,
                Value::Integer(1),
                Value::from("msg"),
            ],
        );
        assert!(four.is_void());
        match rx.try_recv().unwrap() {
            BridgeMessage::NodeInput {
                message,
                synchronous,
                ..
            } => {
                assert_eq!(*message, Value::from("msg"));
                assert!(!synchronous);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_invoke_without_handler_fails_fast() {
        let dispatcher = dispatcher(BridgeConfig::default());
        let result = dispatcher.invoke_node_method(vec![
            Value::from("node-1"),
            Value::from("getState"),
            Value::Array(vec![]),
        ]);

        let fault = result.as_fault().unwrap();
        assert_eq!(fault.code, -32601);
        assert!(fault.message.contains("no callback method specified"));
        assert!(dispatcher.bridge().table().is_empty());
    }

    #[test]
    fn test_invoke_too_few_params() {
        let dispatcher = dispatcher(BridgeConfig::default());
        let result = dispatcher.invoke_node_method(vec![Value::from("node-1")]);
        assert_eq!(result.as_fault().unwrap().code, -1);
    }

    #[test]
    fn test_nested_invoke_from_same_thread_fails() {
        let dispatcher = dispatcher(BridgeConfig::default());
        let mut rx = dispatcher.bridge().attach(CallbackKind::InvokeMethod).unwrap();
        let table = dispatcher.bridge().table().clone();
        let outer = table.begin_call(CallerId::current()).unwrap();

        let result = dispatcher.invoke_node_method(vec![
            Value::from("node-1"),
            Value::from("getState"),
            Value::Array(vec![]),
        ]);

        let fault = result.as_fault().unwrap();
        assert_eq!(fault.code, -32603);
        assert!(fault.message.contains("already has a call in flight"));
        assert!(rx.try_recv().is_err());
        assert_eq!(table.len(), 1);
        assert!(!outer.is_finished());
        assert!(table.cancel_call(CallerId::current()));
    }

    #[test]
    fn test_invoke_round_trip_through_bridge() {
        let dispatcher = dispatcher(BridgeConfig::default());
        let mut rx = dispatcher.bridge().attach(CallbackKind::InvokeMethod).unwrap();
        let table = dispatcher.bridge().table().clone();

        let host = std::thread::spawn(move || loop {
            if let Ok(BridgeMessage::InvokeMethod { ticket, method, .. }) = rx.try_recv() {
                table.complete_call(ticket, Value::from(format!("{} ok", method)));
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        });

        let result = dispatcher.call_local(
            "invokeNodeMethod",
            vec![
                Value::from("node-1"),
                Value::from("getState"),
                Value::Array(vec![]),
            ],
        );
        host.join().unwrap();

        assert_eq!(result, Value::from("getState ok"));
        assert!(dispatcher.bridge().table().is_empty());
    }

    #[test]
    fn test_unknown_method() {
        let dispatcher = dispatcher(BridgeConfig::default());
        let result = dispatcher.call_local("reboot", vec![]);
        assert_eq!(result.as_fault().unwrap().code, -32601);
    }
}
