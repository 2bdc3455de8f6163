//! Hub connection: public handle, builder and lifecycle types.
//!
//! # Architecture
//!
//! ```text
//!   HubConnection (handle, cheap to clone)
//!         │  Command::{Start, Stop, Invoke, Send}     (mpsc, call order)
//!         ▼
//!   ConnectionActor (one tokio task)
//!         ├── socket halves (Transport)
//!         ├── PendingInvocations (correlation id -> oneshot)
//!         ├── reconnect attempt counter + retry deadline
//!         ├── keep-alive / server-timeout deadlines
//!         └── dispatch ──► method handlers, lifecycle EventEmitter
//! ```
//!
//! The actor is the only owner of connection state; it processes one event at
//! a time. The handle reads the state through a `watch` channel and shares the
//! method-handler registry and lifecycle emitter with the actor.
//!
//! # State machine
//!
//! ```text
//! Disconnected ─start─► Connecting ─ok─► Connected ─loss─► Reconnecting
//!      ▲                    │ fail            │  ▲               │ retry ok
//!      └────────────────────┘                 │  └───────────────┘
//!      ▲                                      │ stop
//!      └──────────────── Disconnecting ◄──────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use hubsocket::{method_handler, HubConnectionBuilder};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), hubsocket::HubError> {
//! let connection = HubConnectionBuilder::new("https://example.com/chathub").build();
//! connection.on(
//!     "ReceiveMessage",
//!     method_handler(|args| {
//!         println!("message: {args:?}");
//!         Ok(json!(null))
//!     }),
//! );
//! connection.start().await?;
//! let echoed = connection.invoke("Echo", vec![json!("hi")]).await?;
//! assert_eq!(echoed, json!("hi"));
//! connection.stop().await?;
//! # Ok(())
//! # }
//! ```

// Rust guideline compliant 2026-02

mod actor;
pub(crate) mod pending;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_INVOCATION_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL,
    DEFAULT_SERVER_TIMEOUT,
};
use crate::error::HubError;
use crate::events::{listener, EventEmitter, Listener};
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::transport::{Transport, WebSocketTransport};

use actor::{Command, ConnectionActor};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, no reconnect scheduled.
    #[default]
    Disconnected,
    /// Initial connect (socket open + handshake) in progress.
    Connecting,
    /// Connected and ready for invocations.
    Connected,
    /// Connection lost; waiting for or running a reconnect attempt.
    Reconnecting,
    /// `stop()` in progress.
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
            Self::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

/// Why a connection ended up `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The application called `stop()`.
    Stopped,
    /// The retry policy gave up after a connection loss.
    RetriesExhausted {
        /// Last connection error seen.
        error: Option<String>,
    },
    /// The server sent a Close message without permission to reconnect.
    ServerClosed {
        /// Error text carried by the Close message.
        error: Option<String>,
    },
}

/// Event names used on the lifecycle emitter.
pub mod lifecycle {
    /// [`super::LifecycleEvent::Connected`].
    pub const CONNECTED: &str = "connected";
    /// [`super::LifecycleEvent::Disconnected`].
    pub const DISCONNECTED: &str = "disconnected";
    /// [`super::LifecycleEvent::Reconnecting`].
    pub const RECONNECTING: &str = "reconnecting";
    /// [`super::LifecycleEvent::Reconnected`].
    pub const RECONNECTED: &str = "reconnected";
    /// [`super::LifecycleEvent::Error`].
    pub const ERROR: &str = "error";
}

/// Payload of lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `start()` succeeded.
    Connected,
    /// The connection was lost and a reconnect is scheduled.
    Reconnecting {
        /// What ended the previous connection.
        error: Option<String>,
    },
    /// A reconnect attempt succeeded.
    Reconnected,
    /// The connection reached `Disconnected` after having been up.
    Disconnected {
        /// Whether this was a user stop or a terminal failure.
        reason: DisconnectReason,
    },
    /// The server reported an error (Close message).
    Error {
        /// Error text.
        message: String,
    },
}

impl LifecycleEvent {
    /// Emitter event name for this payload.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => lifecycle::CONNECTED,
            Self::Reconnecting { .. } => lifecycle::RECONNECTING,
            Self::Reconnected => lifecycle::RECONNECTED,
            Self::Disconnected { .. } => lifecycle::DISCONNECTED,
            Self::Error { .. } => lifecycle::ERROR,
        }
    }
}

/// Handler for server-to-client invocations.
///
/// The return value answers correlated invocations; it is ignored for
/// fire-and-forget ones.
pub type MethodHandler = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Wrap a closure as a [`MethodHandler`].
pub fn method_handler<F>(f: F) -> MethodHandler
where
    F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Method name (lowercased) -> handlers in registration order.
pub(crate) type HandlerRegistry = Arc<Mutex<HashMap<String, Vec<MethodHandler>>>>;

/// Settings the actor runs with.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionOptions {
    pub(crate) url: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    pub(crate) connect_timeout: Duration,
    pub(crate) invocation_timeout: Duration,
    pub(crate) keep_alive_interval: Duration,
    pub(crate) server_timeout: Duration,
    pub(crate) debug: bool,
}

/// Builder for [`HubConnection`].
#[derive(Debug)]
pub struct HubConnectionBuilder {
    url: String,
    transport: Option<Arc<dyn Transport>>,
    retry_policy: Arc<dyn RetryPolicy>,
    connect_timeout: Duration,
    invocation_timeout: Duration,
    keep_alive_interval: Duration,
    server_timeout: Duration,
    access_token: Option<String>,
    headers: Vec<(String, String)>,
    debug: bool,
}

impl HubConnectionBuilder {
    /// Start a builder for the hub at `url` (`http(s)://` or `ws(s)://`).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transport: None,
            retry_policy: Arc::new(ExponentialBackoff::default()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            invocation_timeout: DEFAULT_INVOCATION_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            access_token: None,
            headers: Vec::new(),
            debug: false,
        }
    }

    /// Reconnect policy. Defaults to [`ExponentialBackoff::default`].
    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    /// Reconnect policy, already shared.
    pub fn shared_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Limit on socket open plus handshake.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Limit on how long an invocation waits for its Completion.
    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    /// Outbound silence after which a Ping is sent.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Inbound silence after which the connection counts as lost.
    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    /// Bearer token for the WebSocket upgrade request.
    ///
    /// Ignored when a custom [`Self::transport`] is supplied.
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Extra header for the WebSocket upgrade request.
    ///
    /// Ignored when a custom [`Self::transport`] is supplied.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Log every inbound and outbound frame at debug level.
    pub fn debug(mut self, enable: bool) -> Self {
        self.debug = enable;
        self
    }

    /// Replace the default WebSocket transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the connection and spawn its actor task.
    ///
    /// The connection starts `Disconnected`; call [`HubConnection::start`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn build(self) -> HubConnection {
        let transport = self.transport.unwrap_or_else(|| {
            let mut ws = WebSocketTransport::new();
            for (name, value) in self.headers {
                ws = ws.with_header(name, value);
            }
            if let Some(token) = &self.access_token {
                ws = ws.with_bearer_token(token);
            }
            Arc::new(ws)
        });

        let options = ConnectionOptions {
            url: self.url,
            transport,
            retry_policy: self.retry_policy,
            connect_timeout: self.connect_timeout,
            invocation_timeout: self.invocation_timeout,
            keep_alive_interval: self.keep_alive_interval,
            server_timeout: self.server_timeout,
            debug: self.debug,
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let handlers: HandlerRegistry = Arc::new(Mutex::new(HashMap::new()));
        let lifecycle = Arc::new(EventEmitter::new());
        let reconnect_attempt = Arc::new(AtomicU32::new(0));

        let actor = ConnectionActor::new(
            options,
            command_rx,
            state_tx,
            Arc::clone(&handlers),
            Arc::clone(&lifecycle),
            Arc::clone(&reconnect_attempt),
        );
        tokio::spawn(actor.run());

        HubConnection {
            commands: command_tx,
            state: state_rx,
            handlers,
            lifecycle,
            reconnect_attempt,
        }
    }
}

/// Handle to a hub connection.
///
/// Clones share the same connection. When every handle is dropped the actor
/// shuts down: the socket is closed and pending invocations fail. A clone
/// captured by a method handler counts as a handle: the connection then lives
/// until that handler is removed.
#[derive(Clone)]
pub struct HubConnection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    handlers: HandlerRegistry,
    lifecycle: Arc<EventEmitter<LifecycleEvent>>,
    reconnect_attempt: Arc<AtomicU32>,
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("state", &*self.state.borrow())
            .field("reconnect_attempt", &self.reconnect_attempt())
            .finish_non_exhaustive()
    }
}

impl HubConnection {
    /// Connect and complete the handshake.
    ///
    /// Fails with [`HubError::AlreadyStarted`] unless `Disconnected`. On any
    /// failure the state is back to `Disconnected` when this returns.
    pub async fn start(&self) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Start { reply })?;
        rx.await.map_err(|_| HubError::Shutdown)?
    }

    /// Disconnect, cancel any scheduled reconnect and fail pending invocations
    /// with [`HubError::ConnectionClosed`]. A no-op when already `Disconnected`.
    ///
    /// Method handlers run on the connection task and cannot await this; they
    /// can `tokio::spawn` it instead.
    pub async fn stop(&self) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Stop { reply })?;
        rx.await.map_err(|_| HubError::Shutdown)
    }

    /// Call `method` on the hub and wait for its result.
    ///
    /// Fails immediately with [`HubError::NotConnected`] outside `Connected`.
    /// Otherwise settles with the hub's result, [`HubError::Server`],
    /// [`HubError::Timeout`] or [`HubError::ConnectionClosed`].
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        self.ensure_connected()?;
        let (reply, rx) = oneshot::channel();
        self.request(Command::Invoke {
            target: method.to_string(),
            args,
            reply,
        })?;
        rx.await.map_err(|_| HubError::Shutdown)?
    }

    /// Call `method` on the hub without waiting for a result.
    ///
    /// Resolves once the frame is handed to the socket. Delivery is best
    /// effort: a frame lost with the socket is not retransmitted.
    pub async fn send(&self, method: &str, args: Vec<Value>) -> Result<(), HubError> {
        self.ensure_connected()?;
        let (reply, rx) = oneshot::channel();
        self.request(Command::Send {
            target: method.to_string(),
            args,
            reply,
        })?;
        rx.await.map_err(|_| HubError::Shutdown)?
    }

    /// Register `handler` for server-to-client invocations of `method`.
    ///
    /// Method names match case-insensitively. Every handler of a method runs,
    /// in registration order.
    pub fn on(&self, method: &str, handler: MethodHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method.to_lowercase())
            .or_default()
            .push(handler);
    }

    /// Remove one registration of `handler` for `method`.
    ///
    /// Returns `false` when it was not registered.
    pub fn off(&self, method: &str, handler: &MethodHandler) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let key = method.to_lowercase();
        let Some(list) = handlers.get_mut(&key) else {
            return false;
        };
        let Some(idx) = list.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        list.remove(idx);
        if list.is_empty() {
            handlers.remove(&key);
        }
        true
    }

    /// Remove every handler for `method`.
    pub fn off_all(&self, method: &str) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&method.to_lowercase());
    }

    /// Run `f` after each successful `start()`.
    pub fn on_connected<F>(&self, f: F) -> Listener<LifecycleEvent>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribe(lifecycle::CONNECTED, move |event| {
            if matches!(event, LifecycleEvent::Connected) {
                f();
            }
        })
    }

    /// Run `f` whenever the connection reaches `Disconnected` after having
    /// been up.
    pub fn on_disconnected<F>(&self, f: F) -> Listener<LifecycleEvent>
    where
        F: Fn(&DisconnectReason) + Send + Sync + 'static,
    {
        self.subscribe(lifecycle::DISCONNECTED, move |event| {
            if let LifecycleEvent::Disconnected { reason } = event {
                f(reason);
            }
        })
    }

    /// Run `f` when a lost connection starts reconnecting.
    pub fn on_reconnecting<F>(&self, f: F) -> Listener<LifecycleEvent>
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.subscribe(lifecycle::RECONNECTING, move |event| {
            if let LifecycleEvent::Reconnecting { error } = event {
                f(error.as_deref());
            }
        })
    }

    /// Run `f` after each successful reconnect.
    pub fn on_reconnected<F>(&self, f: F) -> Listener<LifecycleEvent>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribe(lifecycle::RECONNECTED, move |event| {
            if matches!(event, LifecycleEvent::Reconnected) {
                f();
            }
        })
    }

    /// Run `f` with error text reported by the server.
    pub fn on_error<F>(&self, f: F) -> Listener<LifecycleEvent>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribe(lifecycle::ERROR, move |event| {
            if let LifecycleEvent::Error { message } = event {
                f(message);
            }
        })
    }

    /// Remove a listener returned by one of the `on_*` lifecycle methods.
    pub fn off_lifecycle(&self, event: &str, listener: &Listener<LifecycleEvent>) -> bool {
        self.lifecycle.off(event, listener)
    }

    /// The lifecycle emitter, for `once`, introspection or an error hook.
    #[must_use]
    pub fn events(&self) -> &EventEmitter<LifecycleEvent> {
        &self.lifecycle
    }

    /// Current state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Reconnect attempts made since the connection was last up.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt.load(Ordering::SeqCst)
    }

    fn subscribe<F>(&self, event: &str, f: F) -> Listener<LifecycleEvent>
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let registered = listener(move |e: &LifecycleEvent| {
            f(e);
            Ok(())
        });
        self.lifecycle.on(event, Arc::clone(&registered));
        registered
    }

    fn ensure_connected(&self) -> Result<(), HubError> {
        if self.connection_state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(HubError::NotConnected)
        }
    }

    fn request(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).map_err(|_| HubError::Shutdown)
    }
}
