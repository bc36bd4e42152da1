//! Host-facing session object.
//!
//! A [`Session`] wires a transport to the callback bridge and owns the
//! [`HostLoop`], so it lives on the host thread. Transport threads only
//! ever see the [`Dispatcher`].

use std::sync::Arc;
use tracing::{debug, info};

use crate::bridge::{CallbackBridge, HostHandlers, HostLoop};
use crate::config::BridgeConfig;
use crate::convert::{params_from_host, to_host};
use crate::correlation::CorrelationTable;
use crate::dispatch::{Dispatcher, LocalRpc};
use crate::error::{BridgeError, Result};
use crate::shutdown::ShutdownSignal;
use crate::transport::{Connector, RemoteTransport};
use crate::value::Value;

/// Builder for [`Session`].
pub struct SessionBuilder<C> {
    connector: C,
    config: BridgeConfig,
    handlers: HostHandlers,
    shutdown: Option<ShutdownSignal>,
}

impl<C: Connector> SessionBuilder<C> {
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Shorthand for setting only the connection target.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.config = self.config.with_target(target);
        self
    }

    pub fn handlers(mut self, handlers: HostHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Use a dedicated shutdown signal instead of the process-wide one.
    pub fn shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Register the handlers and connect the transport.
    pub fn connect(self) -> Result<Session<C::Transport>> {
        self.config.validate()?;
        let config = self.config;
        let shutdown = self
            .shutdown
            .unwrap_or_else(|| ShutdownSignal::global().clone());

        let table = CorrelationTable::with_poll_slice(shutdown.clone(), config.wait_poll_slice);
        let bridge = Arc::new(CallbackBridge::new(Arc::new(table)));
        let host = HostLoop::new(bridge.clone(), self.handlers)?;
        let dispatcher = Arc::new(Dispatcher::new(bridge, &config));

        info!("Connecting to {}", config.target);
        let local: Arc<dyn LocalRpc> = dispatcher.clone();
        let transport = self.connector.connect(&config.target, local)?;

        Ok(Session {
            config,
            transport,
            dispatcher,
            host,
            shutdown,
        })
    }
}

/// A connected bridge session.
///
/// Handlers run only inside [`Session::run_pending`] or [`Session::run`].
pub struct Session<T: RemoteTransport> {
    config: BridgeConfig,
    transport: T,
    dispatcher: Arc<Dispatcher>,
    host: HostLoop,
    shutdown: ShutdownSignal,
}

impl<T: RemoteTransport> Session<T> {
    /// Start building a session on `connector`.
    pub fn builder<C: Connector<Transport = T>>(connector: C) -> SessionBuilder<C> {
        SessionBuilder {
            connector,
            config: BridgeConfig::default(),
            handlers: HostHandlers::default(),
            shutdown: None,
        }
    }

    /// Call `method` on the remote peer with host-side arguments.
    ///
    /// A non-string or empty method name is a usage error
    /// ([`BridgeError::InvalidMethodName`]); a fault returned by the peer
    /// becomes [`BridgeError::Remote`] with its code and message.
    pub fn invoke(
        &self,
        method: &serde_json::Value,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let method = method.as_str().ok_or(BridgeError::InvalidMethodName)?;
        let result = self.invoke_value(method, params_from_host(args))?;
        Ok(to_host(&result))
    }

    /// Typed form of [`Session::invoke`].
    pub fn invoke_value(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        if method.is_empty() {
            return Err(BridgeError::InvalidMethodName);
        }
        match self.transport.invoke(method, params) {
            Value::Fault(fault) => Err(BridgeError::Remote {
                code: fault.code,
                message: fault.message,
            }),
            value => Ok(value),
        }
    }

    pub fn connected(&self) -> bool {
        self.transport.connected()
    }

    pub fn target(&self) -> &str {
        &self.config.target
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Handler registration after construction.
    pub fn host_mut(&mut self) -> &mut HostLoop {
        &mut self.host
    }

    /// Execute every queued callback on the current thread.
    pub fn run_pending(&mut self) -> usize {
        self.host.run_pending()
    }

    /// Execute callbacks as they arrive until shutdown.
    pub async fn run(&mut self) -> usize {
        self.host.run(&self.shutdown).await
    }

    /// Signal shutdown and release every blocked transport thread.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        self.dispatcher.bridge().teardown();
    }
}

impl<T: RemoteTransport> Drop for Session<T> {
    fn drop(&mut self) {
        debug!("Closing session for {}", self.config.target);
        self.dispatcher.bridge().teardown();
    }
}
