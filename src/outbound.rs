//! Outbound mode: accept connections initiated by FreeSWITCH
//!
//! The dialplan `socket` application makes FreeSWITCH dial the listener,
//! one TCP connection per call, already bound to a channel. Each accepted
//! connection becomes an [`OutboundSession`]; sending `connect` retrieves
//! the channel data and marks the session ready.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig};
use crate::error::{EslError, EslResult};
use crate::event::EventMessage;
use crate::headers::EventHeader;
use crate::message::{ContentType, EslMessage, Headers};

/// Capacity of the listener's session broadcast channels.
const SESSION_QUEUE_SIZE: usize = 64;

/// Channel state delivered in answer to the outbound `connect` command.
///
/// Depending on the FreeSWITCH version this arrives either as the
/// `command/reply` itself (channel variables in the reply headers) or as a
/// `CHANNEL_DATA` event; both shapes end up here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    headers: Headers,
    body: Option<String>,
}

impl ChannelData {
    fn from_parts(headers: Headers, body: Option<String>) -> Self {
        Self { headers, body }
    }

    /// Look up a channel variable or header by name.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers.get(name)
    }

    /// All headers in wire order.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// `Channel-Call-UUID`: the UUID of the channel bound to this session.
    pub fn channel_uuid(&self) -> Option<&str> {
        self.headers.get(EventHeader::ChannelCallUuid)
    }

    /// `Channel-Name` (e.g. `sofia/internal/1000@example.com`).
    pub fn channel_name(&self) -> Option<&str> {
        self.headers.get(EventHeader::ChannelName)
    }

    /// Any body accompanying the channel data.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }
}

/// Extract channel data from a framed message, whichever shape it takes.
fn channel_data_from(message: EslMessage) -> Option<ChannelData> {
    if message.content_type() == Some(ContentType::EventPlain) {
        let event = EventMessage::from_message(message).ok()?;
        if event.header(EventHeader::ChannelCallUuid).is_some() {
            let body = event.body().map(|s| s.to_string());
            return Some(ChannelData::from_parts(event.headers().clone(), body));
        }
        return None;
    }
    if message.header(EventHeader::ChannelCallUuid).is_some() {
        let body = message.body().map(|s| s.to_string());
        return Some(ChannelData::from_parts(message.headers().clone(), body));
    }
    None
}

/// One call-bound connection accepted from FreeSWITCH.
///
/// Clones share the connection and the channel data. The session is usable
/// as a plain [`Connection`] once [`connect()`](Self::connect) completed.
#[derive(Clone)]
pub struct OutboundSession {
    connection: Connection,
    channel_data: Arc<OnceCell<ChannelData>>,
    remote_addr: SocketAddr,
}

impl std::fmt::Debug for OutboundSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundSession")
            .field("remote_addr", &self.remote_addr)
            .field("connected", &self.channel_data.get().is_some())
            .finish()
    }
}

impl OutboundSession {
    fn new(connection: Connection, remote_addr: SocketAddr) -> Self {
        Self {
            connection,
            channel_data: Arc::new(OnceCell::new()),
            remote_addr,
        }
    }

    /// The underlying ESL connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Peer address of the FreeSWITCH instance that dialed in.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Send the ESL `connect` command and await the channel data.
    ///
    /// Idempotent: concurrent and repeated calls share one wire exchange
    /// and observe the same result. Fails with
    /// [`EslError::Cancelled`] when the peer disconnects before the channel
    /// data arrives.
    pub async fn connect(&self) -> EslResult<ChannelData> {
        self.channel_data
            .get_or_try_init(|| self.request_channel_data())
            .await
            .cloned()
    }

    /// Channel data, if [`connect()`](Self::connect) already completed.
    pub fn channel_data(&self) -> Option<&ChannelData> {
        self.channel_data.get()
    }

    async fn request_channel_data(&self) -> EslResult<ChannelData> {
        // Arm the fallback observer before writing `connect`, in case the
        // channel data arrives as an event rather than in the reply.
        let mut messages = self.connection.messages();

        let reply = self.connection.send_command("connect").await?;
        if let Some(data) = channel_data_from(reply.into_message()) {
            return Ok(data);
        }

        debug!("connect reply carried no channel data; waiting for event");
        loop {
            match messages.next().await {
                Some(message) => {
                    if let Some(data) = channel_data_from(message) {
                        return Ok(data);
                    }
                }
                None => return Err(EslError::Cancelled),
            }
        }
    }
}

/// TCP listener accepting outbound connections from FreeSWITCH.
///
/// `start` is idempotent; `stop` stops accepting without touching sessions
/// already handed out; `dispose` stops and disposes every session ever
/// produced.
pub struct OutboundListener {
    requested_port: u16,
    config: ConnectionConfig,
    started: AtomicBool,
    stopped: AtomicBool,
    disposed: AtomicBool,
    bound_port: AtomicU16,
    lifecycle: Mutex<()>,
    accept_cancel: StdMutex<Option<CancellationToken>>,
    sessions: Arc<StdMutex<Vec<OutboundSession>>>,
    connections_tx: broadcast::Sender<OutboundSession>,
    channels_tx: broadcast::Sender<OutboundSession>,
}

impl std::fmt::Debug for OutboundListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundListener")
            .field("port", &self.port())
            .field("started", &self.is_started())
            .finish()
    }
}

impl OutboundListener {
    /// Create a listener for the given port. Port 0 picks an ephemeral port
    /// at [`start()`](Self::start) time.
    pub fn new(port: u16) -> Self {
        Self::with_config(port, ConnectionConfig::default())
    }

    /// Create a listener whose sessions use the given connection
    /// configuration.
    pub fn with_config(port: u16, config: ConnectionConfig) -> Self {
        let (connections_tx, _) = broadcast::channel(SESSION_QUEUE_SIZE);
        let (channels_tx, _) = broadcast::channel(SESSION_QUEUE_SIZE);
        Self {
            requested_port: port,
            config,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            bound_port: AtomicU16::new(0),
            lifecycle: Mutex::new(()),
            accept_cancel: StdMutex::new(None),
            sessions: Arc::new(StdMutex::new(Vec::new())),
            connections_tx,
            channels_tx,
        }
    }

    /// Bind the port and start accepting. Idempotent while running;
    /// restarts after [`stop()`](Self::stop) (the port may change when
    /// ephemeral).
    pub async fn start(&self) -> EslResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EslError::Disposed);
        }
        if self.is_started() {
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", self.requested_port)).await?;
        let port = listener.local_addr()?.port();
        self.bound_port.store(port, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        *self.accept_cancel.lock().expect("accept cancel lock") = Some(cancel.clone());

        tokio::spawn(accept_loop(
            listener,
            cancel,
            self.config.clone(),
            self.sessions.clone(),
            self.connections_tx.clone(),
            self.channels_tx.clone(),
        ));

        self.started.store(true, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        info!(port, "outbound listener started");
        Ok(())
    }

    /// Stop accepting new connections. Sessions already produced keep
    /// running.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_started() {
            return;
        }
        if let Some(cancel) = self.accept_cancel.lock().expect("accept cancel lock").take() {
            cancel.cancel();
        }
        self.stopped.store(true, Ordering::SeqCst);
        info!("outbound listener stopped");
    }

    /// Stop accepting and dispose every session this listener ever
    /// produced. Idempotent.
    pub async fn dispose(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = self.accept_cancel.lock().expect("accept cancel lock").take() {
            cancel.cancel();
        }
        self.stopped.store(true, Ordering::SeqCst);

        let sessions: Vec<OutboundSession> = {
            let mut guard = self.sessions.lock().expect("sessions lock");
            guard.drain(..).collect()
        };
        for session in sessions {
            session.connection().dispose().await;
        }
        info!("outbound listener disposed");
    }

    /// `started AND NOT stopped AND NOT disposed`.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && !self.stopped.load(Ordering::SeqCst)
            && !self.disposed.load(Ordering::SeqCst)
    }

    /// The bound port, once started. Reflects the ephemeral port when the
    /// listener was created with port 0.
    pub fn port(&self) -> Option<u16> {
        match self.bound_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    /// Hot stream of accepted sessions. Late subscribers do not see
    /// sessions accepted earlier.
    pub fn connections(&self) -> SessionStream {
        SessionStream {
            inner: BroadcastStream::new(self.connections_tx.subscribe()),
        }
    }

    /// Hot stream of sessions whose [`connect()`](OutboundSession::connect)
    /// completed and whose channel data arrived. Sessions that disconnect
    /// first never appear here.
    pub fn channels(&self) -> SessionStream {
        SessionStream {
            inner: BroadcastStream::new(self.channels_tx.subscribe()),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    cancel: CancellationToken,
    config: ConnectionConfig,
    sessions: Arc<StdMutex<Vec<OutboundSession>>>,
    connections_tx: broadcast::Sender<OutboundSession>,
    channels_tx: broadcast::Sender<OutboundSession>,
) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("accept loop stopping");
                return;
            }
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                // One bad accept must not kill the listener stream.
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            }
        };

        info!(%remote_addr, "accepted outbound connection from FreeSWITCH");
        let (connection, _) = Connection::start(stream, config.clone());
        let session = OutboundSession::new(connection, remote_addr);

        sessions
            .lock()
            .expect("sessions lock")
            .push(session.clone());
        let _ = connections_tx.send(session.clone());

        // Drive the session's connect() so the channels() projection fills
        // without the caller's help; the OnceCell shares the result with
        // callers that also invoke connect() themselves.
        let channels_tx = channels_tx.clone();
        tokio::spawn(async move {
            match session.connect().await {
                Ok(data) => {
                    debug!(
                        channel = data.channel_uuid().unwrap_or("?"),
                        "outbound session ready"
                    );
                    let _ = channels_tx.send(session);
                }
                Err(e) => debug!("outbound session ended before channel data: {e}"),
            }
        });
    }
}

/// Hot stream of outbound sessions.
pub struct SessionStream {
    inner: BroadcastStream<OutboundSession>,
}

impl futures_util::Stream for SessionStream {
    type Item = OutboundSession;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(session))) => return Poll::Ready(Some(session)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped, "session subscriber lagged behind the stream");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStream").finish_non_exhaustive()
    }
}
