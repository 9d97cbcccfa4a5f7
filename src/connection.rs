//! Connection management: message stream, command pipeline, event routing
//!
//! A [`Connection`] owns one TCP socket, one background reader task, the
//! single-in-flight command gate and the monotonic event-subscription sets.
//! Clones share the same underlying connection.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::timeout;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{
    DISCONNECT_NOTICE_TIMEOUT, HEADER_TERMINATOR, MESSAGE_QUEUE_SIZE, RESPONSE_TIMEOUT,
};
use crate::error::{validate_no_newlines, EslError, EslResult};
use crate::event::{EventMessage, EventName};
use crate::message::{ApiResponse, CommandReply, ContentType, EslMessage};
use crate::transport::{self, Transport};

/// Connection status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// The ESL session is active.
    Connected,
    /// The ESL session ended.
    Disconnected(DisconnectReason),
}

/// Why a connection terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// The server sent a `text/disconnect-notice`.
    ServerNotice,
    /// Clean EOF on the TCP connection.
    ConnectionClosed,
    /// The client called [`Connection::dispose`].
    ClientRequested,
    /// TCP I/O error (`io::Error` is not `Clone`, so we store the message).
    IoError(String),
    /// The byte stream was ill-formed beyond recovery.
    ProtocolViolation(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ServerNotice => write!(f, "server sent disconnect notice"),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

/// Parameters fixed at connection time.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long each command transaction waits for its correlated reply.
    /// Default: 5 seconds.
    pub response_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            response_timeout: RESPONSE_TIMEOUT,
        }
    }
}

/// State shared between the connection handle and its reader task.
pub(crate) struct ConnectionShared {
    status_tx: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
    dead: AtomicBool,
}

impl ConnectionShared {
    /// Mark the connection terminated. The first caller's reason wins;
    /// repeated calls are no-ops. Cancels every pending transaction and
    /// observer.
    pub(crate) fn mark_dead(&self, reason: DisconnectReason) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.status_tx.send(ConnectionStatus::Disconnected(reason));
        self.cancel.cancel();
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Per-connection monotonic subscription sets.
///
/// Subscriptions only grow: FreeSWITCH replaces the full set on each
/// `event plain` command, so emitting a subtracted set would silently
/// unsubscribe earlier names.
#[derive(Debug, Default, Clone)]
struct SubscriptionState {
    events: BTreeSet<EventName>,
    custom: BTreeSet<String>,
}

impl SubscriptionState {
    /// Serialize the full set as an `event plain …` command.
    fn to_command(&self) -> String {
        let mut command = String::from("event plain");
        for name in &self.events {
            if *name == EventName::Custom {
                continue;
            }
            command.push(' ');
            command.push_str(name.as_str());
        }
        if !self.custom.is_empty() || self.events.contains(&EventName::Custom) {
            command.push_str(" CUSTOM");
            for subclass in &self.custom {
                command.push(' ');
                command.push_str(subclass);
            }
        }
        command
    }
}

struct ConnectionInner {
    transport: Transport,
    /// Template receiver; every subscription is a `resubscribe()` of it.
    /// The only `Sender` lives in the reader task, so its exit closes the
    /// stream for all subscribers.
    message_rx: broadcast::Receiver<EslMessage>,
    gate: Mutex<()>,
    subscriptions: Mutex<SubscriptionState>,
    shared: Arc<ConnectionShared>,
    status_rx: watch::Receiver<ConnectionStatus>,
    response_timeout: Duration,
}

/// A live ESL connection (inbound or outbound). Clone + Send; clones share
/// the socket, reader task, command gate and subscription sets.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection {
    /// Wrap an established TCP stream and spawn its reader task.
    ///
    /// The returned receiver was subscribed before the reader started, so
    /// the caller cannot miss the first message (the inbound handshake
    /// depends on this).
    pub(crate) fn start(
        stream: TcpStream,
        config: ConnectionConfig,
    ) -> (Self, broadcast::Receiver<EslMessage>) {
        let (read_half, write_half) = stream.into_split();

        let (message_tx, message_rx) = broadcast::channel(MESSAGE_QUEUE_SIZE);
        let handshake_rx = message_tx.subscribe();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);

        let shared = Arc::new(ConnectionShared {
            status_tx,
            cancel: CancellationToken::new(),
            dead: AtomicBool::new(false),
        });

        let transport = Transport::new(write_half, shared.cancel.clone());
        tokio::spawn(transport::reader_loop(
            read_half,
            shared.clone(),
            message_tx,
        ));

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                transport,
                message_rx,
                gate: Mutex::new(()),
                subscriptions: Mutex::new(SubscriptionState::default()),
                shared,
                status_rx,
                response_timeout: config.response_timeout,
            }),
        };

        (connection, handshake_rx)
    }

    /// Send a raw ESL command (e.g. `event plain HEARTBEAT`) and await its
    /// `command/reply`.
    pub async fn send_command(&self, command: &str) -> EslResult<CommandReply> {
        validate_no_newlines(command, "command")?;
        let wire = format!("{}{}", command, HEADER_TERMINATOR);
        let message = self.transact(wire, ContentType::CommandReply).await?;
        Ok(CommandReply::new(message))
    }

    /// Execute an API command (`api <command>`) and await its
    /// `api/response`. Blocks the socket until FreeSWITCH completes it.
    pub async fn send_api(&self, command: &str) -> EslResult<ApiResponse> {
        validate_no_newlines(command, "api command")?;
        let wire = format!("api {}{}", command, HEADER_TERMINATOR);
        let message = self.transact(wire, ContentType::ApiResponse).await?;
        Ok(ApiResponse::new(message))
    }

    /// Send pre-framed wire bytes (sendmsg / bgapi) and await the
    /// `command/reply`.
    pub(crate) async fn send_command_wire(&self, wire: String) -> EslResult<CommandReply> {
        let message = self.transact(wire, ContentType::CommandReply).await?;
        Ok(CommandReply::new(message))
    }

    /// One command transaction: acquire the gate, subscribe, write, await
    /// the next message of the expected kind.
    ///
    /// The gate is held through the entire exchange - ESL replies carry no
    /// request identifier, so correlation requires at most one command in
    /// flight. Callers queue FIFO on the gate.
    async fn transact(&self, wire: String, expect: ContentType) -> EslResult<EslMessage> {
        self.ensure_alive()?;
        let gate = self.inner.gate.lock().await;
        self.ensure_alive()?;

        // Subscribe before writing so the reply cannot slip past.
        let mut rx = self.inner.message_rx.resubscribe();
        log_outgoing(&wire);
        self.inner.transport.send(&wire).await?;

        let timeout_ms = self.inner.response_timeout.as_millis() as u64;
        let reply = tokio::select! {
            _ = self.inner.shared.cancelled() => Err(EslError::Cancelled),
            result = timeout(self.inner.response_timeout, next_of_kind(&mut rx, &expect)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(EslError::Timeout { timeout_ms }),
                }
            }
        };
        drop(gate);
        reply
    }

    /// Send `exit` and await the reply plus the server's disconnect notice.
    ///
    /// The notice wait is capped at 2 seconds and expiry counts as success.
    /// Unlike other transactions, `exit` ignores the cancellation signal:
    /// the teardown it provokes must not fail it.
    pub async fn exit(&self) -> EslResult<CommandReply> {
        self.ensure_alive()?;
        let _gate = self.inner.gate.lock().await;
        self.ensure_alive()?;

        let mut rx = self.inner.message_rx.resubscribe();
        debug!("sending command: exit");
        self.inner
            .transport
            .send(&format!("exit{}", HEADER_TERMINATOR))
            .await?;

        let timeout_ms = self.inner.response_timeout.as_millis() as u64;
        let reply = match timeout(
            self.inner.response_timeout,
            next_of_kind(&mut rx, &ContentType::CommandReply),
        )
        .await
        {
            Ok(Ok(message)) => CommandReply::new(message),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(EslError::Timeout { timeout_ms }),
        };

        match timeout(
            DISCONNECT_NOTICE_TIMEOUT,
            next_of_kind(&mut rx, &ContentType::DisconnectNotice),
        )
        .await
        {
            Ok(Ok(_)) => debug!("disconnect notice received after exit"),
            Ok(Err(_)) | Err(_) => debug!("no disconnect notice after exit; treating as clean"),
        }
        Ok(reply)
    }

    /// Subscribe to the given event names, unioned with every earlier
    /// subscription. Re-issues the full `event plain …` command only when
    /// the union actually grew.
    pub async fn subscribe_events(
        &self,
        names: impl IntoIterator<Item = EventName>,
    ) -> EslResult<()> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let mut candidate = subscriptions.clone();
        let mut added = false;
        for name in names {
            added |= candidate.events.insert(name);
        }
        if !added {
            return Ok(());
        }
        self.push_subscriptions(&candidate).await?;
        *subscriptions = candidate;
        Ok(())
    }

    /// Subscribe to `CUSTOM` event subclasses, unioned with every earlier
    /// subscription. No command is issued when nothing new was added.
    pub async fn subscribe_custom_events(
        &self,
        subclasses: impl IntoIterator<Item = impl Into<String>>,
    ) -> EslResult<()> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let mut candidate = subscriptions.clone();
        let mut added = false;
        for subclass in subclasses {
            let subclass = subclass.into();
            validate_no_newlines(&subclass, "event subclass")?;
            added |= candidate.custom.insert(subclass);
        }
        if !added {
            return Ok(());
        }
        self.push_subscriptions(&candidate).await?;
        *subscriptions = candidate;
        Ok(())
    }

    async fn push_subscriptions(&self, subscriptions: &SubscriptionState) -> EslResult<()> {
        let command = subscriptions.to_command();
        let reply = self.send_command(&command).await?;
        if !reply.success() {
            return Err(EslError::CommandFailed {
                reply_text: reply.reply_text().unwrap_or("-ERR").to_string(),
            });
        }
        info!(command = %command, "event subscriptions updated");
        Ok(())
    }

    /// Resolve with the first event matching `predicate`, or `None` when
    /// the connection terminates first.
    ///
    /// The observer is armed at call time (before the returned future is
    /// polled), so callers can arm it ahead of writing the command that
    /// provokes the event.
    pub(crate) fn first_event<F>(
        &self,
        mut predicate: F,
    ) -> impl Future<Output = Option<EventMessage>> + Send + 'static
    where
        F: FnMut(&EventMessage) -> bool + Send + 'static,
    {
        let mut rx = self.inner.message_rx.resubscribe();
        async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if message.content_type() != Some(ContentType::EventPlain) {
                            continue;
                        }
                        match EventMessage::from_message(message) {
                            Ok(event) if predicate(&event) => return Some(event),
                            Ok(_) => {}
                            Err(e) => warn!("dropping unparseable event: {e}"),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event observer lagged behind the stream");
                    }
                }
            }
        }
    }

    /// Resolve with the first `CHANNEL_HANGUP` for the given channel UUID,
    /// at most once; `None` when the connection terminates first.
    pub fn on_hangup(
        &self,
        channel_uuid: &str,
    ) -> impl Future<Output = Option<EventMessage>> + Send + 'static {
        let uuid = channel_uuid.to_string();
        self.first_event(move |event| {
            event.event_name() == EventName::ChannelHangup
                && event.unique_id() == Some(uuid.as_str())
        })
    }

    /// Hot stream of every framed message on this connection, in arrival
    /// order. Late subscribers do not see history.
    pub fn messages(&self) -> MessageStream {
        MessageStream {
            inner: BroadcastStream::new(self.inner.message_rx.resubscribe()),
        }
    }

    /// Hot stream of `text/event-plain` messages as [`EventMessage`]s.
    pub fn events(&self) -> EventStream {
        EventStream {
            inner: self.messages(),
            channel_only: false,
        }
    }

    /// Hot stream of events carrying a `Unique-ID` (channel events).
    pub fn channel_events(&self) -> EventStream {
        EventStream {
            inner: self.messages(),
            channel_only: true,
        }
    }

    /// Whether the connection is still alive.
    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.status_rx.borrow(), ConnectionStatus::Connected)
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status_rx.borrow().clone()
    }

    /// Terminate the connection: close the socket, stop the reader, fail
    /// every pending transaction with cancellation and complete the message
    /// stream. Idempotent.
    pub async fn dispose(&self) {
        if !self.inner.shared.is_dead() {
            info!("disposing connection");
        }
        self.inner
            .shared
            .mark_dead(DisconnectReason::ClientRequested);
        self.inner.transport.dispose().await;
    }

    fn ensure_alive(&self) -> EslResult<()> {
        if self.inner.shared.is_dead() {
            return Err(EslError::Disposed);
        }
        Ok(())
    }
}

fn log_outgoing(wire: &str) {
    if wire.starts_with("auth ") {
        debug!("sending command: auth [REDACTED]");
    } else {
        let first_line = wire.lines().next().unwrap_or("");
        debug!(command = first_line, "sending command");
    }
}

/// Wait for the next message of the expected content type, skipping
/// everything else. With at most one command in flight, that message is the
/// correlated reply.
async fn next_of_kind(
    rx: &mut broadcast::Receiver<EslMessage>,
    expect: &ContentType,
) -> EslResult<EslMessage> {
    loop {
        match rx.recv().await {
            Ok(message) => {
                if message.content_type().as_ref() == Some(expect) {
                    return Ok(message);
                }
            }
            Err(broadcast::error::RecvError::Closed) => return Err(EslError::Cancelled),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "reply subscriber lagged behind the stream");
            }
        }
    }
}

/// Hot stream of framed messages. Completes when the connection terminates.
pub struct MessageStream {
    inner: BroadcastStream<EslMessage>,
}

impl futures_util::Stream for MessageStream {
    type Item = EslMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => return Poll::Ready(Some(message)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped, "message subscriber lagged behind the stream");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream").finish_non_exhaustive()
    }
}

/// Hot stream of parsed events, optionally restricted to channel events.
/// Completes when the connection terminates.
pub struct EventStream {
    inner: MessageStream,
    channel_only: bool,
}

impl futures_util::Stream for EventStream {
    type Item = EventMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(message)) => {
                    if message.content_type() != Some(ContentType::EventPlain) {
                        continue;
                    }
                    match EventMessage::from_message(message) {
                        Ok(event) => {
                            if self.channel_only && event.unique_id().is_none() {
                                continue;
                            }
                            return Poll::Ready(Some(event));
                        }
                        Err(e) => warn!("dropping unparseable event: {e}"),
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("channel_only", &self.channel_only)
            .finish()
    }
}
