//! Connection actor: the task that owns one connection's state.
//!
//! Every input (public command, inbound frame, socket closure, retry timer,
//! invocation deadline, keep-alive tick) becomes an [`Event`] and is handled
//! to completion before the next one is read. That is the whole concurrency
//! model: no locks around connection state, and re-entrant requests from
//! handlers simply queue behind the event being handled.

// Rust guideline compliant 2026-02

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use super::pending::{PendingInvocations, ResultSlot};
use super::{
    ConnectionOptions, ConnectionState, DisconnectReason, HandlerRegistry, LifecycleEvent,
};
use crate::constants::{NO_CLIENT_RESULT, SERVER_TIMEOUT_REASON, STOPPED_REASON};
use crate::error::HubError;
use crate::events::{panic_message, EventEmitter};
use crate::protocol::{
    parse_handshake_response, parse_messages, serialize_message, write_close, write_completion,
    write_handshake_request, write_invocation, write_message, write_ping, CompletionOutcome,
    InvocationMessage, Message,
};
use crate::transport::{FrameSink, FrameStream, Transport, TransportFrame};

/// Request from a [`super::HubConnection`] handle.
#[derive(Debug)]
pub(crate) enum Command {
    Start {
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Invoke {
        target: String,
        args: Vec<Value>,
        reply: ResultSlot,
    },
    Send {
        target: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
}

/// One unit of work for the actor loop.
enum Event {
    /// `None` once every handle is dropped.
    Command(Option<Command>),
    /// `None` once the socket stream has ended.
    Transport(Option<anyhow::Result<TransportFrame>>),
    RetryDue,
    InvocationDeadline,
    KeepAliveDue,
    ServerTimeout,
}

/// Why a connect attempt did not produce a socket.
enum ConnectFailure {
    Failed(HubError),
    /// `stop()` arrived mid-attempt; `None` when the handles were dropped.
    Stopped(Option<oneshot::Sender<()>>),
}

struct Socket {
    sink: Box<dyn FrameSink>,
    stream: Box<dyn FrameStream>,
}

/// Deadlines that only exist while `Connected`.
#[derive(Clone, Copy)]
struct KeepAlive {
    ping_at: Instant,
    server_deadline: Instant,
}

pub(crate) struct ConnectionActor {
    options: ConnectionOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    handlers: HandlerRegistry,
    lifecycle: Arc<EventEmitter<LifecycleEvent>>,
    reconnect_attempt: Arc<AtomicU32>,
    socket: Option<Socket>,
    pending: PendingInvocations,
    retry_at: Option<Instant>,
    keep_alive: Option<KeepAlive>,
    last_error: Option<String>,
}

impl ConnectionActor {
    pub(crate) fn new(
        options: ConnectionOptions,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        handlers: HandlerRegistry,
        lifecycle: Arc<EventEmitter<LifecycleEvent>>,
        reconnect_attempt: Arc<AtomicU32>,
    ) -> Self {
        Self {
            options,
            commands,
            state_tx,
            handlers,
            lifecycle,
            reconnect_attempt,
            socket: None,
            pending: PendingInvocations::new(),
            retry_at: None,
            keep_alive: None,
            last_error: None,
        }
    }

    /// Process events until every handle is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            match self.next_event().await {
                Event::Command(None) => {
                    log::debug!("[HubConnection] All handles dropped, shutting down");
                    self.stop().await;
                    return;
                }
                Event::Command(Some(command)) => self.handle_command(command).await,
                Event::Transport(frame) => self.handle_transport(frame).await,
                Event::RetryDue => self.reconnect().await,
                Event::InvocationDeadline => self.expire_invocations(),
                Event::KeepAliveDue => self.send_ping().await,
                Event::ServerTimeout => {
                    log::warn!("[HubConnection] {}", SERVER_TIMEOUT_REASON);
                    self.connection_lost(Some(SERVER_TIMEOUT_REASON.to_string()))
                        .await;
                }
            }
        }
    }

    async fn next_event(&mut self) -> Event {
        let retry_at = self.retry_at;
        let invocation_deadline = self.pending.next_deadline();
        let ping_at = self.keep_alive.map(|k| k.ping_at);
        let server_deadline = self.keep_alive.map(|k| k.server_deadline);
        let stream = self.socket.as_mut().map(|s| &mut s.stream);

        // Commands first so a queued stop() wins over timers that are due.
        tokio::select! {
            biased;
            command = self.commands.recv() => Event::Command(command),
            frame = recv_frame(stream) => Event::Transport(frame),
            () = sleep_until_opt(retry_at) => Event::RetryDue,
            () = sleep_until_opt(invocation_deadline) => Event::InvocationDeadline,
            () = sleep_until_opt(server_deadline) => Event::ServerTimeout,
            () = sleep_until_opt(ping_at) => Event::KeepAliveDue,
        }
    }

    // ------------------------------------------------------------------------
    // State and notifications
    // ------------------------------------------------------------------------

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            log::info!("[HubConnection] {} -> {}", previous, next);
        }
    }

    fn notify(&self, event: LifecycleEvent) {
        self.lifecycle.emit(event.name(), &event);
    }

    fn set_attempt(&self, attempt: u32) {
        self.reconnect_attempt.store(attempt, Ordering::SeqCst);
    }

    fn attempt(&self) -> u32 {
        self.reconnect_attempt.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { reply } => self.start(reply).await,
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::Invoke {
                target,
                args,
                reply,
            } => self.invoke(target, args, reply).await,
            Command::Send {
                target,
                args,
                reply,
            } => {
                if self.state() != ConnectionState::Connected {
                    let _ = reply.send(Err(HubError::NotConnected));
                    return;
                }
                let text = serialize_message(&write_message(&target, args));
                match self.transmit(&text).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(HubError::Transport(e.clone())));
                        self.connection_lost(Some(e)).await;
                    }
                }
            }
        }
    }

    async fn start(&mut self, reply: oneshot::Sender<Result<(), HubError>>) {
        if self.state() != ConnectionState::Disconnected {
            let _ = reply.send(Err(HubError::AlreadyStarted));
            return;
        }

        self.set_attempt(0);
        self.last_error = None;
        self.set_state(ConnectionState::Connecting);
        log::info!("[HubConnection] Connecting to {}", self.options.url);

        match self.connect().await {
            Ok(leftover) => {
                self.set_state(ConnectionState::Connected);
                self.notify(LifecycleEvent::Connected);
                let _ = reply.send(Ok(()));
                self.dispatch_frame(&leftover).await;
            }
            Err(ConnectFailure::Failed(e)) => {
                log::warn!("[HubConnection] Failed to start: {}", e);
                self.set_state(ConnectionState::Disconnected);
                let _ = reply.send(Err(e));
            }
            Err(ConnectFailure::Stopped(stop_reply)) => {
                // Never connected, so no Disconnected notification.
                self.set_state(ConnectionState::Disconnected);
                let _ = reply.send(Err(HubError::ConnectionClosed(Some(
                    "stopped before the connection was established".to_string(),
                ))));
                if let Some(stop_reply) = stop_reply {
                    let _ = stop_reply.send(());
                }
            }
        }
    }

    async fn stop(&mut self) {
        let previous = self.state();
        if previous == ConnectionState::Disconnected {
            return;
        }

        self.set_state(ConnectionState::Disconnecting);
        self.retry_at = None;
        self.keep_alive = None;

        if let Some(mut socket) = self.socket.take() {
            let close = serialize_message(&write_close(None));
            if let Err(e) = socket.sink.send_text(&close).await {
                log::debug!("[HubConnection] Could not send Close message: {:#}", e);
            }
            let _ = socket.sink.close().await;
        }

        let failed = self
            .pending
            .fail_all(&HubError::ConnectionClosed(Some(STOPPED_REASON.to_string())));
        if failed > 0 {
            log::info!("[HubConnection] Stop canceled {} pending invocation(s)", failed);
        }

        self.set_attempt(0);
        self.set_state(ConnectionState::Disconnected);
        if previous != ConnectionState::Connecting {
            self.notify(LifecycleEvent::Disconnected {
                reason: DisconnectReason::Stopped,
            });
        }
    }

    async fn invoke(&mut self, target: String, args: Vec<Value>, reply: ResultSlot) {
        if self.state() != ConnectionState::Connected {
            let _ = reply.send(Err(HubError::NotConnected));
            return;
        }

        let id = self.pending.next_id();
        let text = serialize_message(&write_invocation(id.clone(), &target, args));

        // Nothing else runs between the write and the insert, so a Completion
        // cannot be dispatched before its entry exists.
        match self.transmit(&text).await {
            Ok(()) => {
                let deadline = Instant::now() + self.options.invocation_timeout;
                self.pending.insert(id, target, deadline, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(HubError::Transport(e.clone())));
                self.connection_lost(Some(e)).await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    /// Open the socket and complete the handshake within the connect timeout,
    /// still answering commands meanwhile. Returns records that arrived in the
    /// same frame as the handshake response.
    async fn connect(&mut self) -> Result<String, ConnectFailure> {
        let attempt = open_and_handshake(
            Arc::clone(&self.options.transport),
            self.options.url.clone(),
            self.options.debug,
        );
        let deadline = tokio::time::sleep(self.options.connect_timeout);
        tokio::pin!(attempt);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Stop { reply }) => return Err(ConnectFailure::Stopped(Some(reply))),
                    Some(other) => reject_while_connecting(other),
                    None => return Err(ConnectFailure::Stopped(None)),
                },
                result = &mut attempt => {
                    let (socket, leftover) = result.map_err(ConnectFailure::Failed)?;
                    self.socket = Some(socket);
                    self.arm_keep_alive();
                    return Ok(leftover);
                }
                () = &mut deadline => return Err(ConnectFailure::Failed(HubError::Timeout)),
            }
        }
    }

    /// Retry timer fired.
    async fn reconnect(&mut self) {
        self.retry_at = None;
        if self.state() != ConnectionState::Reconnecting {
            return;
        }

        let attempt = self.attempt().saturating_add(1);
        self.set_attempt(attempt);
        log::info!("[HubConnection] Reconnect attempt {}", attempt);

        match self.connect().await {
            Ok(leftover) => {
                self.set_attempt(0);
                self.last_error = None;
                self.set_state(ConnectionState::Connected);
                self.notify(LifecycleEvent::Reconnected);
                self.dispatch_frame(&leftover).await;
            }
            Err(ConnectFailure::Failed(e)) => {
                log::warn!("[HubConnection] Reconnect attempt {} failed: {}", attempt, e);
                self.last_error = Some(e.to_string());
                self.schedule_retry();
            }
            Err(ConnectFailure::Stopped(stop_reply)) => {
                self.stop().await;
                if let Some(stop_reply) = stop_reply {
                    let _ = stop_reply.send(());
                }
            }
        }
    }

    /// Consult the retry policy with the current attempt counter and arm the
    /// retry timer, or give up.
    fn schedule_retry(&mut self) {
        let Some(delay) = self.options.retry_policy.next_retry_delay(self.attempt()) else {
            self.give_up();
            return;
        };
        log::info!(
            "[HubConnection] Next reconnect attempt in {}ms",
            delay.as_millis()
        );
        self.retry_at = Some(Instant::now() + delay);
    }

    fn give_up(&mut self) {
        log::warn!(
            "[HubConnection] Retry policy stopped after {} attempt(s)",
            self.attempt()
        );
        self.retry_at = None;
        self.set_attempt(0);
        self.set_state(ConnectionState::Disconnected);
        self.notify(LifecycleEvent::Disconnected {
            reason: DisconnectReason::RetriesExhausted {
                error: self.last_error.clone(),
            },
        });
    }

    /// Tear down a connection that was up, then reconnect or give up.
    async fn connection_lost(&mut self, error: Option<String>) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        self.drop_socket().await;

        let failed = self
            .pending
            .fail_all(&HubError::ConnectionClosed(error.clone()));
        log::warn!(
            "[HubConnection] Connection lost ({}), {} pending invocation(s) failed",
            error.as_deref().unwrap_or("no reason given"),
            failed
        );

        self.last_error = error.clone();
        self.set_attempt(0);
        self.set_state(ConnectionState::Reconnecting);
        self.notify(LifecycleEvent::Reconnecting { error });
        // A stop() queued by a listener is served before the retry timer.
        self.schedule_retry();
    }

    async fn drop_socket(&mut self) {
        self.keep_alive = None;
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.sink.close().await;
        }
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Write one record to the socket. Errors are returned as text so they can
    /// be shared between the caller's error and the loss notification.
    async fn transmit(&mut self, text: &str) -> Result<(), String> {
        let Some(socket) = self.socket.as_mut() else {
            return Err("socket is not open".to_string());
        };
        if self.options.debug {
            log::debug!("[HubConnection] >> {}", text.trim_end_matches('\u{1e}'));
        }
        socket
            .sink
            .send_text(text)
            .await
            .map_err(|e| format!("{e:#}"))?;

        if let Some(keep_alive) = self.keep_alive.as_mut() {
            keep_alive.ping_at = Instant::now() + self.options.keep_alive_interval;
        }
        Ok(())
    }

    async fn send_ping(&mut self) {
        log::trace!("[HubConnection] Sending keep-alive ping");
        let text = serialize_message(&write_ping());
        if let Err(e) = self.transmit(&text).await {
            self.connection_lost(Some(e)).await;
        }
    }

    fn arm_keep_alive(&mut self) {
        let now = Instant::now();
        self.keep_alive = Some(KeepAlive {
            ping_at: now + self.options.keep_alive_interval,
            server_deadline: now + self.options.server_timeout,
        });
    }

    fn expire_invocations(&mut self) {
        for target in self.pending.expire(Instant::now()) {
            log::warn!("[HubConnection] Invocation of '{}' timed out", target);
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    async fn handle_transport(&mut self, frame: Option<anyhow::Result<TransportFrame>>) {
        match frame {
            Some(Ok(TransportFrame::Text(text))) => {
                if let Some(keep_alive) = self.keep_alive.as_mut() {
                    keep_alive.server_deadline = Instant::now() + self.options.server_timeout;
                }
                self.dispatch_frame(&text).await;
            }
            Some(Ok(TransportFrame::Closed { code, reason })) => {
                let error = if reason.is_empty() {
                    format!("WebSocket closed with status code: {code}.")
                } else {
                    format!("WebSocket closed with status code: {code} ({reason}).")
                };
                self.connection_lost(Some(error)).await;
            }
            Some(Err(e)) => self.connection_lost(Some(format!("{e:#}"))).await,
            None => {
                self.connection_lost(Some("WebSocket stream ended.".to_string()))
                    .await;
            }
        }
    }

    async fn dispatch_frame(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.options.debug {
            log::debug!("[HubConnection] << {}", text.replace('\u{1e}', " "));
        }
        for parsed in parse_messages(text) {
            // A Close earlier in this frame ends the connection.
            if self.state() != ConnectionState::Connected {
                break;
            }
            match parsed {
                Ok(message) => self.dispatch(message).await,
                Err(e) => log::warn!("[HubConnection] Dropping malformed message: {}", e),
            }
        }
    }

    async fn dispatch(&mut self, message: Message) {
        match message {
            Message::Invocation(invocation) => self.dispatch_invocation(invocation).await,
            Message::Completion(completion) => {
                let outcome = match completion.outcome {
                    CompletionOutcome::Result(value) => Ok(value),
                    CompletionOutcome::Error(error) => Err(HubError::Server(error)),
                };
                if !self.pending.settle(&completion.invocation_id, outcome) {
                    log::debug!(
                        "[HubConnection] Ignoring Completion for unknown invocation {}",
                        completion.invocation_id
                    );
                }
            }
            // Receipt already pushed the server deadline out.
            Message::Ping => {}
            Message::Close(close) => {
                if let Some(error) = &close.error {
                    self.notify(LifecycleEvent::Error {
                        message: error.clone(),
                    });
                }
                if close.allow_reconnect {
                    self.connection_lost(close.error).await;
                } else {
                    self.server_closed(close.error).await;
                }
            }
        }
    }

    async fn dispatch_invocation(&mut self, invocation: InvocationMessage) {
        let outcome = self.run_handlers(&invocation.target, &invocation.arguments);

        let Some(id) = invocation.invocation_id else {
            if outcome.is_none() {
                log::warn!(
                    "[HubConnection] No client method with the name '{}' found",
                    invocation.target
                );
            }
            return;
        };

        let outcome = match outcome {
            Some(Ok(value)) => CompletionOutcome::Result(value),
            Some(Err(error)) => CompletionOutcome::Error(error),
            None => CompletionOutcome::Error(NO_CLIENT_RESULT.to_string()),
        };
        let text = serialize_message(&write_completion(id, outcome));
        if let Err(e) = self.transmit(&text).await {
            self.connection_lost(Some(e)).await;
        }
    }

    /// Run every handler of `target` in order.
    ///
    /// `None` when no handler is registered; otherwise the first handler error,
    /// or the last handler's value.
    fn run_handlers(&self, target: &str, args: &[Value]) -> Option<Result<Value, String>> {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target.to_lowercase())
            .cloned()?;

        let mut last_value = Value::Null;
        let mut first_error = None;
        for handler in handlers {
            let error = match catch_unwind(AssertUnwindSafe(|| handler(args))) {
                Ok(Ok(value)) => {
                    last_value = value;
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            };
            log::warn!(
                "[HubConnection] A callback for the method '{}' failed: {}",
                target,
                error
            );
            first_error.get_or_insert(error);
        }

        Some(match first_error {
            Some(error) => Err(error),
            None => Ok(last_value),
        })
    }

    /// Server closed without allowing a reconnect.
    async fn server_closed(&mut self, error: Option<String>) {
        self.drop_socket().await;
        self.retry_at = None;
        self.pending.fail_all(&HubError::ConnectionClosed(error.clone()));
        self.set_attempt(0);
        self.set_state(ConnectionState::Disconnected);
        self.notify(LifecycleEvent::Disconnected {
            reason: DisconnectReason::ServerClosed { error },
        });
    }
}

/// Open `url` and run the JSON handshake on the new socket.
async fn open_and_handshake(
    transport: Arc<dyn Transport>,
    url: String,
    debug: bool,
) -> Result<(Socket, String), HubError> {
    let (mut sink, mut stream) = transport
        .open(&url)
        .await
        .map_err(|e| HubError::Transport(format!("{e:#}")))?;

    let request = write_handshake_request();
    if debug {
        log::debug!("[HubConnection] >> {}", request.trim_end_matches('\u{1e}'));
    }
    sink.send_text(&request)
        .await
        .map_err(|e| HubError::Transport(format!("{e:#}")))?;

    match stream.recv().await {
        Some(Ok(TransportFrame::Text(text))) => {
            if debug {
                log::debug!("[HubConnection] << {}", text.replace('\u{1e}', " "));
            }
            let (_response, rest) = parse_handshake_response(&text)?;
            let leftover = rest.to_string();
            Ok((Socket { sink, stream }, leftover))
        }
        Some(Ok(TransportFrame::Closed { code, reason })) => Err(HubError::ConnectionClosed(Some(
            format!("closed during handshake with status code {code} {reason}")
                .trim_end()
                .to_string(),
        ))),
        Some(Err(e)) => Err(HubError::Transport(format!("{e:#}"))),
        None => Err(HubError::ConnectionClosed(None)),
    }
}

fn reject_while_connecting(command: Command) {
    match command {
        Command::Start { reply } => {
            let _ = reply.send(Err(HubError::AlreadyStarted));
        }
        Command::Invoke { reply, .. } => {
            let _ = reply.send(Err(HubError::NotConnected));
        }
        Command::Send { reply, .. } => {
            let _ = reply.send(Err(HubError::NotConnected));
        }
        Command::Stop { reply } => {
            let _ = reply.send(());
        }
    }
}

async fn recv_frame(
    stream: Option<&mut Box<dyn FrameStream>>,
) -> Option<anyhow::Result<TransportFrame>> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
