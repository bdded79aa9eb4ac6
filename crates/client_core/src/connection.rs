//! Session-scoped WebSocket transport.
//!
//! One actor task owns the socket, the subscription registry, the heartbeat
//! monitor and the reconnect timer. Everything else talks to it through a
//! cloneable [`ConnectionHandle`] and observes it through a `watch` channel.
//! Heartbeat callbacks are tagged with the epoch of the socket they were
//! started for, so a late event from a previous socket is ignored. Reconnect
//! timers carry a generation instead, so a timer that fired just before it
//! was cancelled cannot start a second attempt.

use std::{borrow::Cow, time::Duration};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use shared::{
    domain::DeviceType,
    protocol::{CallSignal, TypingIndicator, UserActivity},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::{
    auth::{ensure_token_fresh, Credentials},
    destinations,
    error::ConnectionError,
    event_bus::BusEvent,
    frame::{encode_send, encode_subscribe, Command, Frame},
    heartbeat::{HeartbeatConfig, HeartbeatMonitor, HeartbeatSink, Liveness},
    router::TopicRouter,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const COMMAND_QUEUE_DEPTH: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Close code the client uses when the server has gone silent.
pub const HEARTBEAT_TIMEOUT_CLOSE_CODE: u16 = 4000;
pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Read-only view of the connection state published after every change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub should_stop_retrying: bool,
    pub is_connecting: bool,
    pub is_cleaning_up: bool,
    pub is_intentional_close: bool,
    pub last_message_time: Option<DateTime<Utc>>,
    /// Counts sockets that reached `Connected`; changes on every reconnect.
    pub connected_epoch: u64,
}

impl ConnectionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub ws_url: String,
    pub device_id: String,
    pub device_type: DeviceType,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    pub fn new(ws_url: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            device_id: device_id.into(),
            device_type: DeviceType::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

enum Request {
    Connect {
        credentials: Credentials,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Send {
        destination: String,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Subscribe {
        destination: String,
        device_type: DeviceType,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disconnect {
        intentional: bool,
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum InternalEvent {
    HeartbeatDue { epoch: u64 },
    HeartbeatTimedOut { epoch: u64, silent_for: Duration },
    ReconnectDue { generation: u64 },
}

struct EpochHeartbeatSink {
    epoch: u64,
    events: mpsc::UnboundedSender<InternalEvent>,
}

impl HeartbeatSink for EpochHeartbeatSink {
    fn send_heartbeat(&self) {
        let _ = self
            .events
            .send(InternalEvent::HeartbeatDue { epoch: self.epoch });
    }

    fn heartbeat_timed_out(&self, silent_for: Duration) {
        let _ = self.events.send(InternalEvent::HeartbeatTimedOut {
            epoch: self.epoch,
            silent_for,
        });
    }
}

/// Cloneable front door to the connection task. Dropping every clone shuts the
/// task down as if `disconnect(true)` had been called.
#[derive(Clone)]
pub struct ConnectionHandle {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionSnapshot>,
}

impl ConnectionHandle {
    /// Spawns the connection task on the current runtime. No socket is opened
    /// until [`ConnectionHandle::connect`].
    pub fn spawn(config: ConnectionConfig, router: TopicRouter) -> Self {
        let (actor, handle) = ConnectionActor::new(config, router);
        tokio::spawn(actor.run());
        handle
    }

    /// Opens the socket. Only an unusable token is reported as an error;
    /// network failures show up in the status and are retried with backoff.
    pub async fn connect(&self, credentials: Credentials) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Connect { credentials, reply }).await?;
        rx.await.map_err(|_| ConnectionError::ActorGone)?
    }

    pub async fn send<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &T,
    ) -> Result<(), ConnectionError> {
        let body = serde_json::to_vec(payload)?;
        self.send_raw(destination, body).await
    }

    pub async fn send_raw(
        &self,
        destination: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Send {
            destination: destination.to_string(),
            body: body.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ConnectionError::ActorGone)?
    }

    /// Registers the destination for every future socket and subscribes right
    /// away when connected.
    pub async fn subscribe(
        &self,
        destination: &str,
        device_type: DeviceType,
    ) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Subscribe {
            destination: destination.to_string(),
            device_type,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ConnectionError::ActorGone)?
    }

    /// Closes the socket. A non-intentional disconnect behaves like a dropped
    /// network and reconnects with backoff.
    pub async fn disconnect(&self, intentional: bool) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Disconnect { intentional, reply })
            .await?;
        rx.await.map_err(|_| ConnectionError::ActorGone)
    }

    pub async fn send_typing(&self, indicator: &TypingIndicator) -> Result<(), ConnectionError> {
        self.send(destinations::TYPING, indicator).await
    }

    pub async fn send_user_activity(&self, activity: &UserActivity) -> Result<(), ConnectionError> {
        self.send(destinations::USER_ACTIVITY, activity).await
    }

    pub async fn send_call_signal(&self, signal: &CallSignal) -> Result<(), ConnectionError> {
        self.send(destinations::CALL_SIGNAL, signal).await
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.clone()
    }

    async fn request(&self, request: Request) -> Result<(), ConnectionError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ConnectionError::ActorGone)
    }
}

struct ConnectionActor {
    config: ConnectionConfig,
    router: TopicRouter,
    state: watch::Sender<ConnectionSnapshot>,
    requests: mpsc::Receiver<Request>,
    events_tx: mpsc::UnboundedSender<InternalEvent>,
    events_rx: mpsc::UnboundedReceiver<InternalEvent>,
    socket: Option<WsStream>,
    /// Incremented for every socket that opens.
    epoch: u64,
    credentials: Option<Credentials>,
    subscriptions: Vec<(String, DeviceType)>,
    heartbeat: HeartbeatMonitor,
    liveness: Liveness,
    reconnect_task: Option<JoinHandle<()>>,
    /// Bumped whenever a reconnect timer is scheduled or cancelled.
    reconnect_generation: u64,
}

async fn next_inbound(socket: &mut Option<WsStream>) -> Option<Result<WsMessage, WsError>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

fn to_ws_message(bytes: Vec<u8>) -> WsMessage {
    match String::from_utf8(bytes) {
        Ok(text) => WsMessage::Text(text),
        Err(err) => WsMessage::Binary(err.into_bytes()),
    }
}

impl ConnectionActor {
    fn new(config: ConnectionConfig, router: TopicRouter) -> (Self, ConnectionHandle) {
        let (requests_tx, requests_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(ConnectionSnapshot::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = Self {
            heartbeat: HeartbeatMonitor::new(config.heartbeat),
            config,
            router,
            state: state_tx,
            requests: requests_rx,
            events_tx,
            events_rx,
            socket: None,
            epoch: 0,
            credentials: None,
            subscriptions: Vec::new(),
            liveness: Liveness::new(),
            reconnect_task: None,
            reconnect_generation: 0,
        };
        let handle = ConnectionHandle {
            requests: requests_tx,
            state: state_rx,
        };
        (actor, handle)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_internal(event).await,
                inbound = next_inbound(&mut self.socket) => self.handle_inbound(inbound).await,
            }
        }
        debug!("transport: connection task stopped");
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.state.send_if_modified(|state| {
            let changed = state.status != status;
            state.status = status;
            changed
        });
        if changed {
            info!(?status, "transport: status changed");
            self.router
                .bus()
                .emit(BusEvent::ConnectionStatusChanged(status));
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { credentials, reply } => {
                self.credentials = Some(credentials);
                let result = self.connect_explicitly().await;
                let _ = reply.send(result);
            }
            Request::Send {
                destination,
                body,
                reply,
            } => {
                let result = self.send_frame(&destination, body).await;
                let _ = reply.send(result);
            }
            Request::Subscribe {
                destination,
                device_type,
                reply,
            } => {
                let result = self.register_subscription(destination, device_type).await;
                let _ = reply.send(result);
            }
            Request::Disconnect { intentional, reply } => {
                if intentional {
                    self.close_intentionally().await;
                } else if self.socket.is_some() {
                    self.close_socket(CloseCode::Normal, "client disconnect").await;
                    self.on_socket_closed("client requested reconnect");
                }
                let _ = reply.send(());
            }
        }
    }

    async fn connect_explicitly(&mut self) -> Result<(), ConnectionError> {
        if self.socket.is_some() {
            debug!("transport: already connected");
            return Ok(());
        }
        self.cancel_reconnect();
        self.state.send_modify(|state| {
            state.is_intentional_close = false;
            state.should_stop_retrying = false;
            state.reconnect_attempts = 0;
        });
        self.open(false).await
    }

    async fn open(&mut self, reconnecting: bool) -> Result<(), ConnectionError> {
        let Some(credentials) = self.credentials.clone() else {
            return Err(ConnectionError::NotConnected);
        };

        if let Err(err) = ensure_token_fresh(&credentials.access_token, Utc::now()) {
            warn!(error = %err, reconnecting, "transport: refusing to connect with unusable token");
            self.state.send_modify(|state| {
                state.should_stop_retrying = true;
                state.is_connecting = false;
            });
            self.set_status(ConnectionStatus::Error);
            if reconnecting {
                self.router.bus().emit(BusEvent::AuthenticationRequired);
            }
            return Err(ConnectionError::InvalidToken(err));
        }

        self.state.send_modify(|state| state.is_connecting = true);
        self.set_status(ConnectionStatus::Connecting);

        match self.open_socket(&credentials).await {
            Ok(socket) => {
                self.socket = Some(socket);
                self.on_socket_opened().await;
            }
            Err(err) => {
                warn!(error = %err, url = %self.config.ws_url, "transport: connect failed");
                self.state.send_modify(|state| state.is_connecting = false);
                self.set_status(ConnectionStatus::Disconnected);
                self.schedule_reconnect();
            }
        }
        Ok(())
    }

    async fn open_socket(&self, credentials: &Credentials) -> Result<WsStream, ConnectionError> {
        let mut request = self
            .config
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectionError::Transport(format!("invalid url: {err}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.access_token))
            .map_err(|err| ConnectionError::Transport(format!("invalid token header: {err}")))?;
        request.headers_mut().insert("Authorization", bearer);

        let (socket, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| ConnectionError::Transport("timed out opening socket".to_string()))?
            .map_err(|err| ConnectionError::Transport(err.to_string()))?;
        Ok(socket)
    }

    async fn on_socket_opened(&mut self) {
        self.epoch += 1;
        self.liveness.touch();
        self.state.send_modify(|state| {
            state.is_connecting = false;
            state.reconnect_attempts = 0;
            state.should_stop_retrying = false;
            state.last_message_time = Some(Utc::now());
        });
        self.heartbeat.stop();
        self.heartbeat.start(
            self.liveness.clone(),
            EpochHeartbeatSink {
                epoch: self.epoch,
                events: self.events_tx.clone(),
            },
        );
        info!(epoch = self.epoch, url = %self.config.ws_url, "transport: connected");

        // Ids restart with every socket; the server forgets them on close.
        let subscriptions = self.subscriptions.clone();
        for (index, (destination, device_type)) in subscriptions.iter().enumerate() {
            if let Err(err) = self
                .write_subscribe(destination, &format!("sub-{index}"), *device_type)
                .await
            {
                warn!(destination, error = %err, "transport: failed to replay subscription");
            }
            if self.socket.is_none() {
                return;
            }
        }
        let epoch = self.epoch;
        self.state
            .send_modify(|state| state.connected_epoch = epoch);
        self.set_status(ConnectionStatus::Connected);
    }

    async fn register_subscription(
        &mut self,
        destination: String,
        device_type: DeviceType,
    ) -> Result<(), ConnectionError> {
        let index = match self
            .subscriptions
            .iter()
            .position(|(existing, _)| *existing == destination)
        {
            Some(index) => {
                self.subscriptions[index].1 = device_type;
                index
            }
            None => {
                self.subscriptions.push((destination.clone(), device_type));
                self.subscriptions.len() - 1
            }
        };
        if self.socket.is_none() {
            debug!(destination, "transport: subscription queued until connected");
            return Ok(());
        }
        self.write_subscribe(&destination, &format!("sub-{index}"), device_type)
            .await
    }

    async fn write_subscribe(
        &mut self,
        destination: &str,
        subscription_id: &str,
        device_type: DeviceType,
    ) -> Result<(), ConnectionError> {
        let bytes = encode_subscribe(destination, subscription_id, device_type)?;
        debug!(destination, subscription_id, "transport: subscribing");
        self.write(bytes).await
    }

    async fn send_frame(&mut self, destination: &str, body: Vec<u8>) -> Result<(), ConnectionError> {
        if self.socket.is_none() {
            return Err(ConnectionError::NotConnected);
        }
        let bytes = encode_send(
            destination,
            &body,
            self.config.device_type,
            &self.config.device_id,
        )?;
        self.write(bytes).await
    }

    async fn write(&mut self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(ConnectionError::NotConnected);
        };
        if let Err(err) = socket.send(to_ws_message(bytes)).await {
            warn!(error = %err, "transport: write failed");
            self.on_socket_closed("write failed");
            return Err(ConnectionError::Transport(err.to_string()));
        }
        Ok(())
    }

    async fn handle_inbound(&mut self, inbound: Option<Result<WsMessage, WsError>>) {
        let message = match inbound {
            None => {
                self.on_socket_closed("stream ended");
                return;
            }
            Some(Err(err)) => {
                warn!(error = %err, "transport: socket error");
                self.on_socket_closed("socket error");
                return;
            }
            Some(Ok(message)) => message,
        };

        self.liveness.touch();
        self.state
            .send_modify(|state| state.last_message_time = Some(Utc::now()));

        match message {
            WsMessage::Text(text) => self.handle_frames(text.as_bytes()),
            WsMessage::Binary(bytes) => self.handle_frames(&bytes),
            WsMessage::Close(frame) => {
                info!(?frame, "transport: closed by server");
                self.socket = None;
                self.on_socket_closed("closed by server");
            }
            _ => {}
        }
    }

    /// One socket message may carry several frames; bare EOLs carry none.
    fn handle_frames(&self, bytes: &[u8]) {
        for decoded in Frame::decode_all(bytes) {
            match decoded {
                Ok(frame) => self.handle_frame(frame),
                Err(err) => warn!(error = %err, "transport: dropping undecodable frame"),
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame.command {
            Command::Message => match frame.destination() {
                // Router failures are logged there and never stop the read loop.
                Some(destination) => {
                    let _ = self.router.dispatch(destination, frame.body_bytes());
                }
                None => warn!("transport: MESSAGE frame without destination"),
            },
            Command::Error => warn!(
                message = frame.header_value("message").unwrap_or_default(),
                body = %String::from_utf8_lossy(frame.body_bytes()),
                "transport: server reported an error"
            ),
            other => debug!(command = other.as_str(), "transport: ignoring client-only frame"),
        }
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::HeartbeatDue { epoch } => {
                if epoch != self.epoch || self.socket.is_none() {
                    return;
                }
                if let Err(err) = self.send_frame(destinations::HEARTBEAT, Vec::new()).await {
                    debug!(error = %err, "heartbeat: send failed");
                }
            }
            InternalEvent::HeartbeatTimedOut { epoch, silent_for } => {
                if epoch != self.epoch || self.socket.is_none() {
                    return;
                }
                warn!(
                    epoch,
                    silent_for_ms = silent_for.as_millis() as u64,
                    "transport: closing silent socket"
                );
                self.close_socket(
                    CloseCode::Library(HEARTBEAT_TIMEOUT_CLOSE_CODE),
                    HEARTBEAT_TIMEOUT_REASON,
                )
                .await;
                self.on_socket_closed(HEARTBEAT_TIMEOUT_REASON);
            }
            InternalEvent::ReconnectDue { generation } => {
                // A timer that was cancelled or replaced may still have fired.
                if generation != self.reconnect_generation {
                    debug!(generation, "transport: ignoring stale reconnect timer");
                    return;
                }
                self.reconnect_task = None;
                let state = self.snapshot();
                if self.socket.is_some()
                    || state.is_intentional_close
                    || state.should_stop_retrying
                {
                    return;
                }
                debug!(attempt = state.reconnect_attempts, "transport: reconnecting");
                // Token problems are reported through the bus from `open`.
                let _ = self.open(true).await;
            }
        }
    }

    /// Common path for every way a socket can go away.
    fn on_socket_closed(&mut self, reason: &str) {
        self.heartbeat.stop();
        self.socket = None;
        self.state.send_modify(|state| state.is_connecting = false);
        if self.snapshot().status != ConnectionStatus::Error {
            self.set_status(ConnectionStatus::Disconnected);
        }
        info!(reason, epoch = self.epoch, "transport: socket closed");
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let state = self.snapshot();
        if state.is_intentional_close || state.should_stop_retrying || self.reconnect_task.is_some()
        {
            return;
        }
        let policy = self.config.reconnect;
        if state.reconnect_attempts >= policy.max_attempts {
            warn!(
                attempts = state.reconnect_attempts,
                "transport: giving up after repeated failures"
            );
            self.state
                .send_modify(|state| state.should_stop_retrying = true);
            self.set_status(ConnectionStatus::Error);
            return;
        }

        let delay = policy.delay_for(state.reconnect_attempts);
        self.state
            .send_modify(|state| state.reconnect_attempts += 1);
        info!(
            attempt = state.reconnect_attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "transport: reconnect scheduled"
        );
        self.reconnect_generation += 1;
        let generation = self.reconnect_generation;
        let events = self.events_tx.clone();
        self.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(InternalEvent::ReconnectDue { generation });
        }));
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect_generation += 1;
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
            debug!("transport: pending reconnect cancelled");
        }
    }

    async fn close_socket(&mut self, code: CloseCode, reason: &'static str) {
        if let Some(mut socket) = self.socket.take() {
            let frame = CloseFrame {
                code,
                reason: Cow::Borrowed(reason),
            };
            if let Err(err) = socket.close(Some(frame)).await {
                debug!(error = %err, "transport: close handshake failed");
            }
        }
    }

    async fn close_intentionally(&mut self) {
        self.state.send_modify(|state| {
            state.is_intentional_close = true;
            state.is_cleaning_up = true;
        });
        self.cancel_reconnect();
        self.heartbeat.stop();
        self.close_socket(CloseCode::Normal, "client disconnect").await;
        self.state.send_modify(|state| {
            state.is_cleaning_up = false;
            state.is_connecting = false;
        });
        self.set_status(ConnectionStatus::Disconnected);
        info!("transport: disconnected");
    }

    async fn teardown(&mut self) {
        debug!("transport: all handles dropped, tearing down");
        self.close_intentionally().await;
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
