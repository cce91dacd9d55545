//! # Session Connector
//!
//! Persistent, authenticated WebSocket connection to the remote service with
//! request/response and event-subscription primitives.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Session Connection States                            │
//! │                                                                         │
//! │  establish()                                                            │
//! │      │  first attempt, no retry                                         │
//! │      ├──── unreachable ────► RequestFailed (returned to caller)         │
//! │      ├──── 401 ────────────► Forbidden     (returned to caller)         │
//! │      ▼                                                                  │
//! │  ┌────────────┐   drop / error   ┌────────────┐                         │
//! │  │ Connected  │ ───────────────► │  Backoff   │ ◄───────┐               │
//! │  └─────┬──────┘   "disconnected" └─────┬──────┘         │               │
//! │        ▲                               │ timer          │ failure       │
//! │        │                               ▼                │ "reconnect-   │
//! │        │  "reconnected"          ┌────────────┐         │  Failed"      │
//! │        └──────────────────────── │Reconnecting│ ────────┘               │
//! │           re-auth, resubscribe,  └─────┬──────┘                         │
//! │           re-issue pending             │ 401 / retries exhausted        │
//! │                                        ▼                                │
//! │                                  ┌────────────┐                         │
//! │                                  │   Closed   │                         │
//! │                                  └────────────┘                         │
//! │                                                                         │
//! │  While in Backoff/Reconnecting the handle keeps accepting requests and  │
//! │  subscriptions; they are sent as soon as the connection is back.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use driftline_core::{Credential, EventKind};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::DevConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::EventSink;
use crate::protocol::{PushFrame, RequestFrame, ResponseFrame, WireMessage, FORBIDDEN_CODE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;

// =============================================================================
// Connection State
// =============================================================================

/// Connection state as observed through a [`ConnectionHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected and authenticated.
    Connected,
    /// Waiting before a reconnection attempt.
    Backoff,
    /// Reconnection attempt in progress.
    Reconnecting,
    /// Stopped for good (shutdown, forbidden, or retries exhausted).
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

// =============================================================================
// Connector Configuration
// =============================================================================

/// Configuration for the session connector.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// WebSocket URL to connect to.
    pub url: String,

    /// Timeout for the TCP/WS handshake and for authentication.
    pub connect_timeout: Duration,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Maximum consecutive reconnection attempts (0 = infinite).
    pub max_retries: u32,

    /// Ping interval for keepalive.
    pub ping_interval: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            url: String::new(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_retries: 0, // Infinite
            ping_interval: Duration::from_secs(25),
        }
    }
}

impl ConnectorConfig {
    /// Builds the connector configuration from the dev config.
    pub fn from_config(config: &DevConfig) -> SyncResult<Self> {
        Ok(ConnectorConfig {
            url: config.socket_url()?.to_string(),
            connect_timeout: config.connect_timeout(),
            initial_backoff: Duration::from_millis(config.session.initial_backoff_ms),
            max_backoff: Duration::from_secs(config.session.max_backoff_secs),
            max_retries: config.session.max_retries,
            ping_interval: Duration::from_secs(config.session.ping_interval_secs),
        })
    }
}

// =============================================================================
// Connection Handle
// =============================================================================

enum Command {
    Request {
        method: String,
        path: String,
        headers: BTreeMap<String, String>,
        params: Value,
        reply: oneshot::Sender<SyncResult<ResponseFrame>>,
    },
    Subscribe {
        event: String,
        room: String,
        sink: mpsc::UnboundedSender<PushFrame>,
        ack: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle for interacting with the connection from other components.
///
/// Cheap to clone; every clone talks to the same background task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    identity: String,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Request { method, path, .. } => write!(f, "Request({method} {path})"),
            Command::Subscribe { event, room, .. } => write!(f, "Subscribe({event}@{room})"),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl ConnectionHandle {
    /// Identity the remote reported for our credential.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Sends a request and waits for the matching response.
    ///
    /// There is no per-request timeout. A request in flight when the
    /// transport drops is re-issued after reconnecting.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        headers: BTreeMap<String, String>,
        params: Value,
    ) -> SyncResult<ResponseFrame> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                method: method.to_string(),
                path: path.to_string(),
                headers,
                params,
                reply,
            })
            .map_err(|_| SyncError::ShuttingDown)?;

        rx.await.map_err(|_| SyncError::ShuttingDown)?
    }

    /// Subscribes to `event` pushes for `room`.
    ///
    /// The subscription survives reconnects; callers never resubscribe.
    /// Dropping the receiver ends it locally.
    pub async fn subscribe(
        &self,
        event: &str,
        room: &str,
    ) -> SyncResult<mpsc::UnboundedReceiver<PushFrame>> {
        let (sink, pushes) = mpsc::unbounded_channel();
        let (ack, acked) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                event: event.to_string(),
                room: room.to_string(),
                sink,
                ack,
            })
            .map_err(|_| SyncError::ShuttingDown)?;

        acked.await.map_err(|_| SyncError::ShuttingDown)?;
        Ok(pushes)
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns true if currently connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Waits until the connection has closed for good.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // An Err means the task is gone, which is closed too.
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Triggers graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

// =============================================================================
// Establish
// =============================================================================

/// Opens and authenticates the session connection, then hands it to a
/// background task that keeps it alive.
///
/// The first attempt is not retried: an unreachable endpoint yields
/// [`SyncError::RequestFailed`] and a rejected credential yields
/// [`SyncError::Forbidden`].
pub async fn establish(
    credential: &Credential,
    config: ConnectorConfig,
    events: EventSink,
) -> SyncResult<ConnectionHandle> {
    events.emit_with(EventKind::Connecting, config.url.clone());

    let (ws, identity) = open(&config, &credential.secret)
        .await
        .map_err(|e| match e {
            SyncError::Forbidden => SyncError::Forbidden,
            other if other.is_retryable() || matches!(other, SyncError::TlsError(_)) => {
                SyncError::RequestFailed {
                    url: config.url.clone(),
                    reason: other.to_string(),
                }
            }
            other => other,
        })?;

    info!(url = %config.url, identity = %identity, "Session connected");
    events.emit_with(EventKind::Connected, identity.clone());

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);

    let connector = Connector {
        config,
        secret: credential.secret.clone(),
        events,
        commands: commands_rx,
        state: state_tx,
        next_id: 1,
        pending: BTreeMap::new(),
        subscriptions: Vec::new(),
    };
    tokio::spawn(connector.run(ws));

    Ok(ConnectionHandle {
        commands: commands_tx,
        state: state_rx,
        identity,
    })
}

/// Connects and authenticates, each step bounded by the connect timeout.
async fn open(config: &ConnectorConfig, secret: &str) -> SyncResult<(WsStream, String)> {
    let mut ws = match timeout(config.connect_timeout, connect_async(config.url.as_str())).await {
        Ok(Ok((ws, response))) => {
            debug!(status = ?response.status(), "WebSocket handshake complete");
            ws
        }
        Ok(Err(e)) => return Err(SyncError::from(e)),
        Err(_) => return Err(SyncError::Timeout(config.connect_timeout.as_secs())),
    };

    let identity = match timeout(config.connect_timeout, authenticate(&mut ws, secret)).await {
        Ok(result) => result?,
        Err(_) => return Err(SyncError::Timeout(config.connect_timeout.as_secs())),
    };

    Ok((ws, identity))
}

async fn authenticate(ws: &mut WsStream, secret: &str) -> SyncResult<String> {
    let hello = WireMessage::authenticate(secret).to_json()?;
    ws.send(WsMessage::Text(hello.into())).await?;

    while let Some(frame) = ws.next().await {
        match frame? {
            WsMessage::Text(text) => match WireMessage::from_json(&text) {
                Ok(WireMessage::Authenticated { identity }) => return Ok(identity),
                Ok(WireMessage::Error { code, .. }) if code == FORBIDDEN_CODE => {
                    return Err(SyncError::Forbidden)
                }
                Ok(WireMessage::Error { code, message }) => {
                    return Err(SyncError::InvalidMessage(format!(
                        "authentication failed ({code}): {message}"
                    )))
                }
                Ok(other) => {
                    debug!(msg_type = %other.type_name(), "Ignoring frame before authentication")
                }
                Err(e) => return Err(SyncError::DeserializationFailed(e.to_string())),
            },
            WsMessage::Close(_) => return Err(SyncError::Disconnected),
            _ => {}
        }
    }

    Err(SyncError::Disconnected)
}

// =============================================================================
// Background Task
// =============================================================================

struct PendingRequest {
    frame: RequestFrame,
    reply: oneshot::Sender<SyncResult<ResponseFrame>>,
}

struct Subscription {
    event: String,
    room: String,
    sinks: Vec<mpsc::UnboundedSender<PushFrame>>,
}

/// Why a connection loop returned without error.
enum Exit {
    Shutdown,
}

struct Connector {
    config: ConnectorConfig,
    secret: String,
    events: EventSink,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    next_id: u64,
    pending: BTreeMap<u64, PendingRequest>,
    subscriptions: Vec<Subscription>,
}

impl Connector {
    /// Main connector loop.
    async fn run(mut self, first: WsStream) {
        let mut next = Some(first);
        let mut resumed = false;

        loop {
            let ws = match next.take() {
                Some(ws) => ws,
                None => match self.reconnect().await {
                    Some(ws) => ws,
                    None => break,
                },
            };

            self.set_state(ConnectionState::Connected);
            match self.connection_loop(ws, resumed).await {
                Ok(Exit::Shutdown) => break,
                Err(e) => {
                    warn!(error = %e, "Connection lost");
                    self.events.emit_with(EventKind::Disconnected, e.to_string());
                    resumed = true;
                }
            }
        }

        self.set_state(ConnectionState::Closed);
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(SyncError::ShuttingDown));
        }
        self.subscriptions.clear();
        info!("Connector stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Connection loop: restores remote state, then handles traffic.
    async fn connection_loop(&mut self, ws: WsStream, resumed: bool) -> SyncResult<Exit> {
        let (mut write, mut read) = ws.split();

        if resumed {
            self.restore(&mut write).await?;
            self.events.emit_with(
                EventKind::Reconnected,
                format!(
                    "{} subscription(s), {} request(s) re-issued",
                    self.subscriptions.len(),
                    self.pending.len()
                ),
            );
        }

        let period = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All connection handles dropped");
                        let _ = write.send(WsMessage::Close(None)).await;
                        return Ok(Exit::Shutdown);
                    };
                    if self.handle_command(command, &mut write).await? {
                        return Ok(Exit::Shutdown);
                    }
                }

                frame = read.next() => {
                    self.handle_frame(frame, &mut write).await?;
                }

                _ = ping.tick() => {
                    write.send(WsMessage::Ping(Vec::new().into())).await?;
                    debug!("Sent ping");
                }
            }
        }
    }

    /// Handles one command. Returns true on shutdown.
    async fn handle_command(&mut self, command: Command, write: &mut WsWriter) -> SyncResult<bool> {
        match command {
            Command::Shutdown => {
                info!("Shutdown signal received, closing connection");
                let _ = write.send(WsMessage::Close(None)).await;
                Ok(true)
            }
            Command::Request {
                method,
                path,
                headers,
                params,
                reply,
            } => {
                let frame = self.enqueue_request(method, path, headers, params, reply);
                debug!(id = frame.id, path = %frame.path, "Sending request");
                send_frame(write, &WireMessage::Request(frame)).await?;
                Ok(false)
            }
            Command::Subscribe {
                event,
                room,
                sink,
                ack,
            } => {
                let is_new = self.register_subscription(&event, &room, sink);
                let _ = ack.send(());
                if is_new {
                    info!(event = %event, room = %room, "Subscribing");
                    send_frame(write, &WireMessage::subscribe(&event, &room)).await?;
                }
                Ok(false)
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>,
        write: &mut WsWriter,
    ) -> SyncResult<()> {
        match frame {
            None => Err(SyncError::Disconnected),
            Some(Err(e)) => Err(SyncError::from(e)),
            Some(Ok(WsMessage::Text(text))) => {
                match WireMessage::from_json(&text) {
                    Ok(msg) => self.dispatch(msg),
                    Err(e) => warn!(error = %e, "Failed to parse frame"),
                }
                Ok(())
            }
            Some(Ok(WsMessage::Ping(data))) => {
                write.send(WsMessage::Pong(data)).await?;
                Ok(())
            }
            Some(Ok(WsMessage::Pong(_))) => {
                debug!("Received pong");
                Ok(())
            }
            Some(Ok(WsMessage::Close(frame))) => {
                info!(?frame, "Received close frame");
                Err(SyncError::Disconnected)
            }
            Some(Ok(WsMessage::Binary(_))) => {
                warn!("Received unexpected binary frame");
                Ok(())
            }
            Some(Ok(WsMessage::Frame(_))) => Ok(()),
        }
    }

    /// Routes an inbound protocol message.
    fn dispatch(&mut self, msg: WireMessage) {
        match msg {
            WireMessage::Response(response) => match self.pending.remove(&response.id) {
                Some(pending) => {
                    debug!(id = response.id, status = response.status, "Received response");
                    let _ = pending.reply.send(Ok(response));
                }
                None => debug!(id = response.id, "Response for unknown request"),
            },
            WireMessage::Event(push) => self.route_push(push),
            WireMessage::Error { code, message } => {
                warn!(code, message = %message, "Remote reported an error");
            }
            other => debug!(msg_type = %other.type_name(), "Ignoring frame"),
        }
    }

    fn route_push(&mut self, push: PushFrame) {
        let mut delivered = false;
        for sub in self
            .subscriptions
            .iter_mut()
            .filter(|s| s.event == push.event && s.room == push.room)
        {
            sub.sinks.retain(|sink| sink.send(push.clone()).is_ok());
            delivered = true;
        }
        self.subscriptions.retain(|s| !s.sinks.is_empty());

        if !delivered {
            debug!(event = %push.event, room = %push.room, "Push without subscriber");
        }
    }

    fn enqueue_request(
        &mut self,
        method: String,
        path: String,
        headers: BTreeMap<String, String>,
        params: Value,
        reply: oneshot::Sender<SyncResult<ResponseFrame>>,
    ) -> RequestFrame {
        let id = self.next_id;
        self.next_id += 1;
        let frame = RequestFrame {
            id,
            method,
            path,
            headers,
            params,
        };
        self.pending.insert(
            id,
            PendingRequest {
                frame: frame.clone(),
                reply,
            },
        );
        frame
    }

    /// Records a subscription. Returns true if the remote must be told.
    fn register_subscription(
        &mut self,
        event: &str,
        room: &str,
        sink: mpsc::UnboundedSender<PushFrame>,
    ) -> bool {
        if let Some(existing) = self
            .subscriptions
            .iter_mut()
            .find(|s| s.event == event && s.room == room)
        {
            existing.sinks.push(sink);
            return false;
        }
        self.subscriptions.push(Subscription {
            event: event.to_string(),
            room: room.to_string(),
            sinks: vec![sink],
        });
        true
    }

    /// Re-issues every active subscription and every unanswered request.
    async fn restore(&mut self, write: &mut WsWriter) -> SyncResult<()> {
        for sub in &self.subscriptions {
            debug!(event = %sub.event, room = %sub.room, "Resubscribing");
            send_frame(write, &WireMessage::subscribe(&sub.event, &sub.room)).await?;
        }
        for pending in self.pending.values() {
            debug!(id = pending.frame.id, path = %pending.frame.path, "Re-issuing request");
            send_frame(write, &WireMessage::Request(pending.frame.clone())).await?;
        }
        Ok(())
    }

    /// Reconnects with exponential backoff.
    ///
    /// Returns `None` when the connector should stop: shutdown requested,
    /// credentials rejected, or retries exhausted.
    async fn reconnect(&mut self) -> Option<WsStream> {
        let mut backoff = self.create_backoff();
        let mut attempts = 0u32;

        loop {
            self.set_state(ConnectionState::Backoff);
            let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
            debug!(?delay, attempt = attempts + 1, "Waiting before reconnect");
            if !self.wait_accepting_commands(delay).await {
                info!("Shutdown during backoff");
                return None;
            }

            self.set_state(ConnectionState::Reconnecting);
            attempts += 1;

            match open(&self.config, &self.secret).await {
                Ok((ws, identity)) => {
                    info!(attempt = attempts, identity = %identity, "Reconnected");
                    return Some(ws);
                }
                Err(e) if e.is_terminal() => {
                    error!(error = %e, "Reconnect refused, giving up");
                    self.events.emit_with(EventKind::ReconnectFailed, e.to_string());
                    return None;
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Reconnect attempt failed");
                    self.events.emit_with(
                        EventKind::ReconnectFailed,
                        format!("attempt {attempts}: {e}"),
                    );
                    if self.config.max_retries > 0 && attempts >= self.config.max_retries {
                        error!(
                            max_retries = self.config.max_retries,
                            "Max reconnection attempts reached"
                        );
                        return None;
                    }
                }
            }
        }
    }

    /// Sleeps for `delay` while queueing requests and subscriptions.
    /// Returns false if shutdown was requested.
    async fn wait_accepting_commands(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return false,
                    Some(Command::Request { method, path, headers, params, reply }) => {
                        let frame = self.enqueue_request(method, path, headers, params, reply);
                        debug!(id = frame.id, "Queued request while disconnected");
                    }
                    Some(Command::Subscribe { event, room, sink, ack }) => {
                        self.register_subscription(&event, &room, sink);
                        let _ = ack.send(());
                    }
                },
            }
        }
    }

    /// Creates the exponential backoff configuration.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None, // No limit on total time
            ..Default::default()
        }
    }
}

async fn send_frame(write: &mut WsWriter, msg: &WireMessage) -> SyncResult<()> {
    let json = msg.to_json()?;
    write.send(WsMessage::Text(json.into())).await?;
    Ok(())
}
