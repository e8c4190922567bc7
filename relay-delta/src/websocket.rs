//! Delta WebSocket client for the realtime feed
//!
//! One background task owns the socket. The public handle talks to it over
//! a command channel, so connect, reconnect and subscription changes are
//! serialized by construction. Events (state changes, relayed frames,
//! errors) come back on a bounded event channel.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use relay_core::{
    group_keys, ChannelSpec, ConnectionErrorKind, ConnectionState, RelayError, RelayResult,
    SubscriptionKey,
};

use crate::auth::DeltaCredentials;
use crate::config::DeltaWebSocketConfig;
use crate::protocol::{InboundFrame, OutboundFrame, UpstreamFrame};
use crate::reconnect::ReconnectPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Capacity of the event channel towards the relay
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Commands and Events
// ============================================================================

/// Command sent to the connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCommand {
    Subscribe(Vec<ChannelSpec>),
    Unsubscribe(Vec<ChannelSpec>),
    /// Reset the retry counter and connect again
    Reconnect,
    Shutdown,
}

/// Event emitted by the connection task
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Connection state change
    State {
        state: ConnectionState,
        authenticated: bool,
    },
    /// Channel data to relay
    Frame(UpstreamFrame),
    /// Connection lost
    Closed { reason: String },
    /// Connection attempt or live connection failed
    Error {
        kind: ConnectionErrorKind,
        message: String,
    },
    /// Automatic reconnection stopped after this many consecutive failures
    ReconnectExhausted { attempts: u32 },
}

/// Point-in-time view of the connector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeltaStatus {
    pub state: ConnectionState,
    pub authenticated: bool,
    pub reconnect_attempts: u32,
    pub subscriptions: usize,
    pub exhausted: bool,
}

// ============================================================================
// Delta WebSocket Client
// ============================================================================

/// Channels handed to the connection task when it starts
struct TaskChannels {
    command_rx: mpsc::UnboundedReceiver<UpstreamCommand>,
    event_tx: mpsc::Sender<UpstreamEvent>,
}

/// Delta WebSocket client handle
pub struct DeltaWebSocket {
    config: DeltaWebSocketConfig,
    command_tx: mpsc::UnboundedSender<UpstreamCommand>,
    /// Taken by the first `start()`; `None` afterwards
    pending: Mutex<Option<TaskChannels>>,
    status: Arc<RwLock<DeltaStatus>>,
    /// Guard against starting a second connection task
    started: AtomicBool,
}

impl DeltaWebSocket {
    /// Create a new Delta WebSocket client. Does not connect yet.
    ///
    /// Subscriptions issued before `start()` are queued and flushed once
    /// the connection opens.
    pub fn new(config: DeltaWebSocketConfig) -> (Self, mpsc::Receiver<UpstreamEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        (
            Self {
                config,
                command_tx,
                pending: Mutex::new(Some(TaskChannels {
                    command_rx,
                    event_tx,
                })),
                status: Arc::new(RwLock::new(DeltaStatus::default())),
                started: AtomicBool::new(false),
            },
            event_rx,
        )
    }

    /// Start the connection task. Calling it again is a no-op.
    pub fn start(&self) -> RelayResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("[Delta WS] Connection task already started");
            return Ok(());
        }

        self.config.validate()?;

        let channels = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| RelayError::internal("connection task channels already taken"))?;

        let task = ConnectionTask {
            policy: self.config.reconnect_policy(),
            config: self.config.clone(),
            command_rx: channels.command_rx,
            event_tx: channels.event_tx,
            status: Arc::clone(&self.status),
            desired: BTreeSet::new(),
        };

        tokio::spawn(task.run());
        Ok(())
    }

    fn send(&self, command: UpstreamCommand) -> RelayResult<()> {
        self.command_tx
            .send(command)
            .map_err(|_| RelayError::internal("Delta connection task has stopped"))
    }

    /// Subscribe to channels upstream (queued while disconnected)
    pub fn subscribe(&self, channels: Vec<ChannelSpec>) -> RelayResult<()> {
        if channels.is_empty() {
            return Ok(());
        }
        self.send(UpstreamCommand::Subscribe(channels))
    }

    /// Unsubscribe from channels upstream
    pub fn unsubscribe(&self, channels: Vec<ChannelSpec>) -> RelayResult<()> {
        if channels.is_empty() {
            return Ok(());
        }
        self.send(UpstreamCommand::Unsubscribe(channels))
    }

    /// Connect again now instead of waiting out the backoff, resetting the
    /// retry counter. This is how a connector that exhausted its retries
    /// is revived.
    ///
    /// Ignored while a connection attempt is in flight or the connection is
    /// already open.
    pub fn reconnect(&self) -> RelayResult<()> {
        if self.status.read().state.is_in_flight() {
            info!("[Delta WS] Already connecting, skipping manual reconnect");
            return Ok(());
        }
        info!("[Delta WS] Manual reconnection requested");
        self.send(UpstreamCommand::Reconnect)
    }

    /// Close the connection and stop the task, cancelling any pending reconnect
    pub fn shutdown(&self) -> RelayResult<()> {
        self.send(UpstreamCommand::Shutdown)
    }

    pub fn status(&self) -> DeltaStatus {
        self.status.read().clone()
    }

    pub fn is_open(&self) -> bool {
        self.status.read().state == ConnectionState::Open
    }

    pub fn config(&self) -> &DeltaWebSocketConfig {
        &self.config
    }
}

impl std::fmt::Debug for DeltaWebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaWebSocket")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

// ============================================================================
// Connection Task
// ============================================================================

/// How a connected session ended
enum SessionEnd {
    /// Shutdown requested
    Shutdown,
    /// Connection failed or dropped; the reconnect policy decides what's next
    Lost,
}

struct ConnectionTask {
    config: DeltaWebSocketConfig,
    command_rx: mpsc::UnboundedReceiver<UpstreamCommand>,
    event_tx: mpsc::Sender<UpstreamEvent>,
    status: Arc<RwLock<DeltaStatus>>,
    policy: ReconnectPolicy,
    /// Upstream subscriptions we want, re-sent on every (re)connect
    desired: BTreeSet<SubscriptionKey>,
}

impl ConnectionTask {
    async fn emit(&self, event: UpstreamEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("[Delta WS] Event receiver dropped");
        }
    }

    async fn transition(&self, state: ConnectionState, authenticated: bool) {
        {
            let mut status = self.status.write();
            status.state = state;
            status.authenticated = authenticated;
        }
        self.emit(UpstreamEvent::State {
            state,
            authenticated,
        })
        .await;
    }

    async fn fail(&self, kind: ConnectionErrorKind, message: String) {
        self.emit(UpstreamEvent::Error { kind, message }).await;
        self.transition(ConnectionState::Disconnected, false).await;
    }

    async fn closed(&self, reason: String) {
        self.emit(UpstreamEvent::Closed { reason }).await;
        self.transition(ConnectionState::Disconnected, false).await;
    }

    /// Main loop with reconnection logic
    async fn run(mut self) {
        loop {
            if let SessionEnd::Shutdown = self.run_session().await {
                break;
            }
            if !self.wait_before_reconnect().await {
                break;
            }
        }

        self.transition(ConnectionState::Disconnected, false).await;
        info!("[Delta WS] Connection task stopped");
    }

    /// Apply a subscription change to the desired set.
    ///
    /// Returns the frame to send upstream, or `None` if nothing changed.
    fn update_desired(&mut self, command: UpstreamCommand) -> Option<OutboundFrame> {
        let frame = match command {
            UpstreamCommand::Subscribe(channels) => {
                let added: Vec<SubscriptionKey> = channels
                    .iter()
                    .flat_map(ChannelSpec::keys)
                    .filter(|key| self.desired.insert(key.clone()))
                    .collect();
                (!added.is_empty()).then(|| OutboundFrame::subscribe(group_keys(&added)))
            }
            UpstreamCommand::Unsubscribe(channels) => {
                let removed: Vec<SubscriptionKey> = channels
                    .iter()
                    .flat_map(ChannelSpec::keys)
                    .filter(|key| self.desired.remove(key))
                    .collect();
                (!removed.is_empty()).then(|| OutboundFrame::unsubscribe(group_keys(&removed)))
            }
            UpstreamCommand::Reconnect | UpstreamCommand::Shutdown => None,
        };

        self.status.write().subscriptions = self.desired.len();
        frame
    }

    /// Wait out the backoff delay, or for a manual reconnect once retries
    /// are exhausted. Returns `false` when the task should stop.
    async fn wait_before_reconnect(&mut self) -> bool {
        let Some(delay) = self.policy.next_delay() else {
            return self.wait_for_manual_reconnect().await;
        };

        self.status.write().reconnect_attempts = self.policy.attempts();
        info!(
            "[Delta WS] Reconnecting in {:?} (attempt {}/{})",
            delay,
            self.policy.attempts(),
            self.policy.max_attempts()
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.command_rx.recv() => match command {
                    Some(UpstreamCommand::Shutdown) | None => {
                        info!("[Delta WS] Shutdown during backoff, cancelling reconnect");
                        return false;
                    }
                    Some(UpstreamCommand::Reconnect) => {
                        self.policy.reset();
                        return true;
                    }
                    Some(command) => {
                        self.update_desired(command);
                    }
                },
            }
        }
    }

    async fn wait_for_manual_reconnect(&mut self) -> bool {
        let attempts = self.policy.attempts();
        error!(
            "[Delta WS] Max reconnect attempts reached ({}), waiting for manual reconnect",
            attempts
        );
        {
            let mut status = self.status.write();
            status.exhausted = true;
            status.reconnect_attempts = attempts;
        }
        self.emit(UpstreamEvent::ReconnectExhausted { attempts }).await;

        loop {
            match self.command_rx.recv().await {
                Some(UpstreamCommand::Shutdown) | None => return false,
                Some(UpstreamCommand::Reconnect) => {
                    self.policy.reset();
                    let mut status = self.status.write();
                    status.exhausted = false;
                    status.reconnect_attempts = 0;
                    return true;
                }
                Some(command) => {
                    self.update_desired(command);
                }
            }
        }
    }

    /// One connection: open, authenticate, stream until it breaks
    async fn run_session(&mut self) -> SessionEnd {
        self.transition(ConnectionState::Connecting, false).await;
        info!("[Delta WS] Connecting to {}", self.config.ws_url);

        let connect = timeout(
            self.config.connect_timeout,
            connect_async(self.config.ws_url.clone()),
        );
        tokio::pin!(connect);

        let result = loop {
            tokio::select! {
                result = &mut connect => break result,
                command = self.command_rx.recv() => {
                    if !self.on_command_while_connecting(command) {
                        return SessionEnd::Shutdown;
                    }
                }
            }
        };

        let ws_stream = match result {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                error!("[Delta WS] Connection failed: {}", e);
                self.fail(ConnectionErrorKind::Network, format!("Connection failed: {}", e))
                    .await;
                return SessionEnd::Lost;
            }
            Err(_) => {
                error!(
                    "[Delta WS] Connection timed out after {:?}",
                    self.config.connect_timeout
                );
                self.fail(
                    ConnectionErrorKind::Network,
                    "Connection timed out".to_string(),
                )
                .await;
                return SessionEnd::Lost;
            }
        };

        let (mut write, mut read) = ws_stream.split();

        let authenticated = match self.config.credentials.clone() {
            Some(credentials) => {
                match self.authenticate(&credentials, &mut write, &mut read).await {
                    Ok(authenticated) => authenticated,
                    Err(end) => return end,
                }
            }
            None => {
                info!("[Delta WS] No credentials configured, public channels only");
                false
            }
        };

        self.policy.reset();
        {
            let mut status = self.status.write();
            status.reconnect_attempts = 0;
            status.exhausted = false;
        }
        self.transition(ConnectionState::Open, authenticated).await;
        info!(
            "[Delta WS] Connected successfully (authenticated: {})",
            authenticated
        );

        // Re-subscribe to everything we want
        if !self.desired.is_empty() {
            let frame = OutboundFrame::subscribe(group_keys(&self.desired));
            if let Err(e) = send_frame(&mut write, &frame).await {
                warn!("[Delta WS] Failed to re-subscribe: {}", e);
                self.fail(ConnectionErrorKind::Network, e.to_string()).await;
                return SessionEnd::Lost;
            }
        }

        self.stream_until_closed(authenticated, write, read).await
    }

    /// Send the auth frame and wait a bounded time for the result.
    ///
    /// Returns `Ok(true)` when authenticated and `Ok(false)` when the wait
    /// timed out (continue unauthenticated). `Err` ends the session.
    async fn authenticate(
        &mut self,
        credentials: &DeltaCredentials,
        write: &mut WsSink,
        read: &mut WsSource,
    ) -> Result<bool, SessionEnd> {
        self.transition(ConnectionState::Authenticating, false).await;

        let frame = match credentials.auth_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("[Delta WS] Failed to sign auth request: {}", e);
                self.fail(ConnectionErrorKind::Auth, e.to_string()).await;
                return Err(SessionEnd::Lost);
            }
        };

        if let Err(e) = send_frame(write, &frame).await {
            error!("[Delta WS] Failed to send auth request: {}", e);
            self.fail(ConnectionErrorKind::Network, e.to_string()).await;
            return Err(SessionEnd::Lost);
        }

        let deadline = Instant::now() + self.config.auth_timeout;

        loop {
            let message = tokio::select! {
                message = timeout_at(deadline, read.next()) => match message {
                    Ok(message) => message,
                    Err(_) => {
                        warn!(
                            "[Delta WS] No auth response within {:?}, continuing unauthenticated",
                            self.config.auth_timeout
                        );
                        return Ok(false);
                    }
                },
                command = self.command_rx.recv() => {
                    if !self.on_command_while_connecting(command) {
                        self.transition(ConnectionState::Closing, false).await;
                        let _ = write.send(Message::Close(None)).await;
                        return Err(SessionEnd::Shutdown);
                    }
                    continue;
                }
            };

            match message {
                Some(Ok(Message::Text(text))) => match InboundFrame::parse(text.as_str()) {
                    Ok(InboundFrame::AuthResult { success: true, .. }) => {
                        info!("[Delta WS] Authenticated");
                        return Ok(true);
                    }
                    Ok(InboundFrame::AuthResult {
                        success: false,
                        message,
                    }) => {
                        let reason = message.unwrap_or_else(|| "authentication rejected".to_string());
                        self.auth_failed(write, reason).await;
                        return Err(SessionEnd::Lost);
                    }
                    Ok(InboundFrame::Error { message }) => {
                        self.auth_failed(write, message).await;
                        return Err(SessionEnd::Lost);
                    }
                    Ok(frame) => self.handle_frame(frame).await,
                    Err(e) => debug!("[Delta WS] Unparseable message during auth: {}", e),
                },
                Some(Ok(Message::Ping(data))) => {
                    if write.send(Message::Pong(data)).await.is_err() {
                        self.closed("Failed to answer ping during auth".to_string())
                            .await;
                        return Err(SessionEnd::Lost);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .unwrap_or_else(|| "closed by server during auth".to_string());
                    info!("[Delta WS] Connection closed during auth: {}", reason);
                    self.closed(reason).await;
                    return Err(SessionEnd::Lost);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("[Delta WS] Error during auth: {}", e);
                    self.fail(ConnectionErrorKind::Network, e.to_string()).await;
                    return Err(SessionEnd::Lost);
                }
                None => {
                    self.closed("stream ended during auth".to_string()).await;
                    return Err(SessionEnd::Lost);
                }
            }
        }
    }

    /// Apply a command that arrived before the connection opened.
    ///
    /// Returns `false` when the task should shut down.
    fn on_command_while_connecting(&mut self, command: Option<UpstreamCommand>) -> bool {
        match command {
            Some(UpstreamCommand::Shutdown) | None => {
                info!("[Delta WS] Shutdown while connecting, abandoning attempt");
                false
            }
            Some(UpstreamCommand::Reconnect) => {
                debug!("[Delta WS] Already connecting, ignoring reconnect");
                true
            }
            Some(command) => {
                // Flushed with the rest of the desired set once open
                self.update_desired(command);
                true
            }
        }
    }

    async fn auth_failed(&mut self, write: &mut WsSink, reason: String) {
        error!("[Delta WS] Authentication failed: {}", reason);
        let _ = write.send(Message::Close(None)).await;
        self.fail(
            ConnectionErrorKind::Auth,
            RelayError::auth(reason).to_string(),
        )
        .await;
    }

    async fn stream_until_closed(
        &mut self,
        mut authenticated: bool,
        mut write: WsSink,
        mut read: WsSource,
    ) -> SessionEnd {
        let mut heartbeat = interval(self.config.ping_interval);
        heartbeat.reset();

        loop {
            tokio::select! {
                // Handle incoming messages
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match InboundFrame::parse(text.as_str()) {
                                // Late auth result after we gave up waiting
                                Ok(InboundFrame::AuthResult { success, message }) => {
                                    if success && !authenticated {
                                        info!("[Delta WS] Late auth success, connection now authenticated");
                                        authenticated = true;
                                        self.transition(ConnectionState::Open, true).await;
                                    } else if !success {
                                        let reason = message.unwrap_or_else(|| "authentication rejected".to_string());
                                        warn!("[Delta WS] Late auth failure: {}", reason);
                                        self.emit(UpstreamEvent::Error {
                                            kind: ConnectionErrorKind::Auth,
                                            message: reason,
                                        })
                                        .await;
                                    }
                                }
                                Ok(frame) => self.handle_frame(frame).await,
                                Err(e) => debug!("[Delta WS] Unparseable message: {}", e),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                warn!("[Delta WS] Failed to send pong: {}", e);
                                self.closed(format!("Failed to send pong: {}", e)).await;
                                return SessionEnd::Lost;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.as_str().to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by server".to_string());
                            info!("[Delta WS] Connection closed by server: {}", reason);
                            self.closed(reason).await;
                            return SessionEnd::Lost;
                        }
                        Some(Err(e)) => {
                            error!("[Delta WS] Error: {}", e);
                            self.fail(ConnectionErrorKind::Network, e.to_string()).await;
                            return SessionEnd::Lost;
                        }
                        None => {
                            info!("[Delta WS] Stream ended");
                            self.closed("stream ended".to_string()).await;
                            return SessionEnd::Lost;
                        }
                        _ => {}
                    }
                }

                // Handle outgoing commands
                command = self.command_rx.recv() => {
                    match command {
                        Some(UpstreamCommand::Shutdown) | None => {
                            info!("[Delta WS] Shutting down connection");
                            self.transition(ConnectionState::Closing, authenticated).await;
                            let _ = write.send(Message::Close(None)).await;
                            let _ = write.close().await;
                            return SessionEnd::Shutdown;
                        }
                        Some(UpstreamCommand::Reconnect) => {
                            debug!("[Delta WS] Already connected, ignoring reconnect");
                        }
                        Some(command) => {
                            if let Some(frame) = self.update_desired(command) {
                                if let Err(e) = send_frame(&mut write, &frame).await {
                                    warn!("[Delta WS] Failed to send command: {}", e);
                                    self.fail(ConnectionErrorKind::Network, e.to_string()).await;
                                    return SessionEnd::Lost;
                                }
                            }
                        }
                    }
                }

                // Keep the connection alive
                _ = heartbeat.tick() => {
                    debug!("[Delta WS] Heartbeat tick");
                    if let Err(e) = write.send(Message::Ping(Default::default())).await {
                        warn!("[Delta WS] Failed to send ping: {}", e);
                        self.closed(format!("Failed to send ping: {}", e)).await;
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }

    /// Handle a classified non-auth frame
    async fn handle_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Data(data) => {
                self.emit(UpstreamEvent::Frame(data)).await;
            }
            InboundFrame::Heartbeat => {
                debug!("[Delta WS] Heartbeat");
            }
            InboundFrame::SubscriptionsAck { channels } => {
                info!("[Delta WS] Subscriptions confirmed: {}", channels);
            }
            InboundFrame::Error { message } => {
                warn!("[Delta WS] Upstream error: {}", message);
                self.emit(UpstreamEvent::Error {
                    kind: ConnectionErrorKind::Upstream,
                    message,
                })
                .await;
            }
            InboundFrame::AuthResult { success, .. } => {
                debug!("[Delta WS] Ignoring auth result (success: {})", success);
            }
            InboundFrame::Unknown(value) => {
                debug!("[Delta WS] Unknown message: {}", value);
            }
        }
    }
}

async fn send_frame(write: &mut WsSink, frame: &OutboundFrame) -> RelayResult<()> {
    let json = frame.to_json()?;
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| RelayError::network(e.to_string()))
}
