//! Single relay connection management
//!
//! Each relay is driven by one background task that owns the WebSocket and
//! walks the connection state machine:
//!
//! ```text
//! initialized -> connecting -> connected -> closed            (peer close 1000)
//!                                        -> dormant           (pool no longer needs it)
//!                                        -> rejected          (peer close 4000)
//!                                        -> waiting-for-reconnection -> reconnecting -> connected
//!                                                                                    -> error (retries exhausted)
//! any non-terminal -> terminated (dispose)
//! ```
//!
//! The [`RelayConnection`] handle talks to the task through a command channel,
//! so every call is synchronous. Frames sent while the socket is unavailable
//! are queued and flushed in order once it opens. REQs that were live on a
//! socket that went away are replayed ahead of later sends.

use crate::message::ClientMessage;
use crate::packet::{ConnectionState, ConnectionStatePacket, ErrorPacket};
use crate::recovery::{BackoffConfig, ExponentialBackoff};
use crate::req::{LazyFilter, evaluate_filters};
use crate::url::RelayUrl;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

/// WebSocket close codes with meaning for the pool.
pub mod close_code {
    /// Peer closed cleanly; the relay becomes `closed`.
    pub const NORMAL: u16 = 1000;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Relay asks not to be retried; the relay becomes `rejected`.
    pub const DONT_RETRY: u16 = 4000;
    /// Sent by the pool when a relay goes dormant.
    pub const CLOSED_BY_CLIENT: u16 = 4537;
    /// Sent by the pool on dispose. Always terminal, in either direction.
    pub const DISPOSED_BY_CLIENT: u16 = 4538;
}

/// Relay connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RelayConfig {
    /// Connection timeout
    #[serde(with = "crate::duration_ms")]
    pub connect_timeout: Duration,
    /// Reconnection policy
    pub backoff: BackoffConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Raw text frame received from a relay, in wire order.
#[derive(Debug, Clone)]
pub(crate) struct InboundFrame {
    pub from: RelayUrl,
    pub text: String,
}

/// Channels shared by every connection of a pool.
#[derive(Debug, Clone)]
pub(crate) struct RelayChannels {
    pub inbound: mpsc::UnboundedSender<InboundFrame>,
    pub states: broadcast::Sender<ConnectionStatePacket>,
    pub errors: broadcast::Sender<ErrorPacket>,
}

#[derive(Debug)]
enum Command {
    Connect,
    /// A frame, plus the lazy filters a REQ was evaluated from.
    Send(ClientMessage, Option<Vec<LazyFilter>>),
    Dormant,
    Reconnect,
    Dispose,
}

/// Handle to one relay's connection task.
#[derive(Debug)]
pub struct RelayConnection {
    url: RelayUrl,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl RelayConnection {
    /// Spawn the connection task in `initialized` state. Must run inside a tokio runtime.
    pub(crate) fn spawn(url: RelayUrl, config: RelayConfig, channels: RelayChannels) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Initialized);

        let task = ConnectionTask {
            url: url.clone(),
            backoff: ExponentialBackoff::from_config(&config.backoff),
            config,
            commands: command_rx,
            state: state_tx,
            channels,
            outbox: Outbox::default(),
        };
        let task = tokio::spawn(task.run());

        Self {
            url,
            commands,
            state,
            task,
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Open the socket unless it is live already. `error` and `rejected` are
    /// left alone; they need [`RelayConnection::reconnect`].
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Send a frame now, or queue it until the socket opens.
    pub fn send(&self, message: ClientMessage) {
        self.command(Command::Send(message, None));
    }

    /// Send a REQ evaluated from `lazy`. If the REQ has to be replayed on a
    /// later socket, its time bounds are evaluated again.
    pub(crate) fn send_req(&self, message: ClientMessage, lazy: Vec<LazyFilter>) {
        self.command(Command::Send(message, Some(lazy)));
    }

    /// Close the socket because nothing needs it. Queued frames are dropped.
    pub fn dormant(&self) {
        self.command(Command::Dormant);
    }

    /// Reopen from any non-live state, including `error` and `rejected`.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Close for good. The state becomes `terminated`.
    pub fn dispose(&self) {
        self.command(Command::Dispose);
    }

    /// Wait until the connection reaches `state`. Returns `false` on timeout.
    pub async fn wait_for(&self, state: ConnectionState, limit: Duration) -> bool {
        wait_for_state(self.state.clone(), state, limit).await
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Connection task for {} has exited", self.url);
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if !self.task.is_finished() && !self.commands.is_closed() {
            let _ = self.commands.send(Command::Dispose);
        }
    }
}

pub(crate) async fn wait_for_state(
    mut rx: watch::Receiver<ConnectionState>,
    state: ConnectionState,
    limit: Duration,
) -> bool {
    matches!(timeout(limit, rx.wait_for(|s| *s == state)).await, Ok(Ok(_)))
}

/// Frames waiting for a socket, plus the REQs live on the current one.
#[derive(Debug, Default)]
struct Outbox {
    pending: VecDeque<ClientMessage>,
    active: Vec<(String, ClientMessage)>,
    /// Lazy filters behind queued or active REQs, by wire id
    lazy: HashMap<String, Vec<LazyFilter>>,
}

impl Outbox {
    /// Track the lazy filters of a frame that is about to be queued or written.
    fn note(&mut self, message: &ClientMessage, lazy: Option<Vec<LazyFilter>>) {
        let Some(id) = message.subscription_id() else {
            return;
        };
        match lazy {
            Some(lazy) if matches!(message, ClientMessage::Req { .. }) => {
                self.lazy.insert(id.to_string(), lazy);
            }
            _ => {
                self.lazy.remove(id);
            }
        }
    }

    /// Queue a frame while no socket is open.
    fn enqueue(&mut self, message: ClientMessage) {
        match &message {
            ClientMessage::Req {
                subscription_id, ..
            } => {
                self.drop_pending_req(subscription_id);
                self.pending.push_back(message);
            }
            ClientMessage::Close { subscription_id } => {
                // The next socket has never seen the REQ, so neither frame is needed.
                if !self.drop_pending_req(subscription_id) {
                    self.pending.push_back(message);
                }
            }
            ClientMessage::Event(_) => self.pending.push_back(message),
        }
    }

    fn drop_pending_req(&mut self, id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|m| {
            !matches!(m, ClientMessage::Req { subscription_id, .. } if subscription_id == id)
        });
        before != self.pending.len()
    }

    /// Track a frame that went out on the open socket.
    fn record_sent(&mut self, message: &ClientMessage) {
        match message {
            ClientMessage::Req {
                subscription_id, ..
            } => {
                if let Some(slot) = self.active.iter_mut().find(|(id, _)| id == subscription_id) {
                    slot.1 = message.clone();
                } else {
                    self.active.push((subscription_id.clone(), message.clone()));
                }
            }
            ClientMessage::Close { subscription_id } => {
                self.active.retain(|(id, _)| id != subscription_id);
            }
            ClientMessage::Event(_) => {}
        }
    }

    /// The socket went away: replay its REQs first, in the order they were sent.
    fn requeue_active(&mut self) {
        let active = std::mem::take(&mut self.active);
        let later = std::mem::take(&mut self.pending);
        for (id, req) in active {
            if later.iter().any(|m| m.subscription_id() == Some(id.as_str())) {
                continue;
            }
            let req = match self.lazy.get(&id) {
                Some(lazy) => ClientMessage::req(id, evaluate_filters(lazy)),
                None => req,
            };
            self.pending.push_back(req);
        }
        self.pending.extend(later);
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.active.clear();
        self.lazy.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseOutcome {
    Closed,
    Rejected,
    Terminated,
    Lost,
}

fn close_outcome(code: Option<u16>) -> CloseOutcome {
    match code {
        Some(close_code::NORMAL) => CloseOutcome::Closed,
        Some(close_code::DONT_RETRY) => CloseOutcome::Rejected,
        Some(close_code::DISPOSED_BY_CLIENT) => CloseOutcome::Terminated,
        _ => CloseOutcome::Lost,
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

enum Phase {
    Idle,
    Connect,
    Backoff(Duration),
    Terminate,
}

struct ConnectionTask {
    url: RelayUrl,
    config: RelayConfig,
    backoff: ExponentialBackoff,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    channels: RelayChannels,
    outbox: Outbox,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connect => self.connect().await,
                Phase::Backoff(delay) => self.wait_backoff(delay).await,
                Phase::Terminate => break,
            };
        }
        self.outbox.clear();
        self.transition(ConnectionState::Terminated);
        debug!("Connection task for {} finished", self.url);
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        debug!("Relay {}: {} -> {}", self.url, previous, next);
        let _ = self.channels.states.send(ConnectionStatePacket {
            from: self.url.clone(),
            state: next,
        });
    }

    fn report_error(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Relay {}: {}", self.url, reason);
        let _ = self.channels.errors.send(ErrorPacket {
            from: self.url.clone(),
            reason,
        });
    }

    /// Socket closed: wait for the pool to ask for it again.
    async fn idle(&mut self) -> Phase {
        loop {
            let Some(command) = self.commands.recv().await else {
                return Phase::Terminate;
            };
            match command {
                Command::Connect => {
                    if self.current().needs_manual_recovery() {
                        debug!("Relay {} is {}, waiting for reconnect", self.url, self.current());
                        continue;
                    }
                    self.transition(ConnectionState::Connecting);
                    return Phase::Connect;
                }
                Command::Reconnect => {
                    self.backoff.reset();
                    self.transition(ConnectionState::Connecting);
                    return Phase::Connect;
                }
                Command::Send(message, lazy) => {
                    self.outbox.note(&message, lazy);
                    self.outbox.enqueue(message);
                }
                Command::Dormant => {
                    self.outbox.clear();
                    if matches!(
                        self.current(),
                        ConnectionState::Closed | ConnectionState::Initialized
                    ) {
                        self.transition(ConnectionState::Dormant);
                    }
                }
                Command::Dispose => return Phase::Terminate,
            }
        }
    }

    /// Open a socket, staying responsive to commands while the handshake runs.
    async fn connect(&mut self) -> Phase {
        info!("Connecting to relay: {}", self.url);
        let started = Instant::now();
        let target = self.url.to_string();
        let attempt = timeout(self.config.connect_timeout, connect_async(target));
        tokio::pin!(attempt);

        let result = loop {
            tokio::select! {
                result = &mut attempt => break result,
                command = self.commands.recv() => match command {
                    None | Some(Command::Dispose) => return Phase::Terminate,
                    Some(Command::Send(message, lazy)) => {
                        self.outbox.note(&message, lazy);
                        self.outbox.enqueue(message);
                    }
                    Some(Command::Dormant) => {
                        self.outbox.clear();
                        self.transition(ConnectionState::Dormant);
                        return Phase::Idle;
                    }
                    Some(Command::Connect) | Some(Command::Reconnect) => {}
                },
            }
        };

        match result {
            Ok(Ok((ws, _response))) => {
                info!("Connected to relay: {} (took {:?})", self.url, started.elapsed());
                self.session(ws).await
            }
            Ok(Err(e)) => {
                self.report_error(format!("connection failed: {}", e));
                self.schedule_retry()
            }
            Err(_) => {
                self.report_error(format!(
                    "connection timeout after {:?}",
                    self.config.connect_timeout
                ));
                self.schedule_retry()
            }
        }
    }

    fn schedule_retry(&mut self) -> Phase {
        match self.backoff.next_delay() {
            Some(delay) => {
                debug!(
                    "Relay {}: retry {} in {:?}",
                    self.url,
                    self.backoff.attempt(),
                    delay
                );
                self.transition(ConnectionState::WaitingForReconnection);
                Phase::Backoff(delay)
            }
            None => {
                self.report_error("reconnection attempts exhausted");
                self.transition(ConnectionState::Error);
                Phase::Idle
            }
        }
    }

    async fn wait_backoff(&mut self, delay: Duration) -> Phase {
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => break,
                command = self.commands.recv() => match command {
                    None | Some(Command::Dispose) => return Phase::Terminate,
                    Some(Command::Send(message, lazy)) => {
                        self.outbox.note(&message, lazy);
                        self.outbox.enqueue(message);
                    }
                    Some(Command::Dormant) => {
                        self.outbox.clear();
                        self.transition(ConnectionState::Dormant);
                        return Phase::Idle;
                    }
                    Some(Command::Reconnect) => break,
                    Some(Command::Connect) => {}
                },
            }
        }

        self.transition(ConnectionState::Reconnecting);
        Phase::Connect
    }

    /// Drive an open socket until it closes.
    async fn session(&mut self, ws: WsStream) -> Phase {
        let (mut sink, mut stream): (WsSink, SplitStream<WsStream>) = ws.split();
        self.transition(ConnectionState::Connected);
        self.backoff.reset();

        while let Some(message) = self.outbox.pending.pop_front() {
            if let Err(e) = self.write(&mut sink, &message).await {
                self.outbox.pending.push_front(message);
                return self.socket_lost(format!("send failed: {}", e));
            }
        }

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let frame = InboundFrame {
                            from: self.url.clone(),
                            text: text.to_string(),
                        };
                        if self.channels.inbound.send(frame).is_err() {
                            return Phase::Terminate;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        return self.peer_closed(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return self.socket_lost(format!("websocket error: {}", e)),
                    None => return self.socket_lost("connection closed without close frame"),
                },
                command = self.commands.recv() => match command {
                    None | Some(Command::Dispose) => {
                        close_socket(&mut sink, close_code::DISPOSED_BY_CLIENT, "disposed").await;
                        return Phase::Terminate;
                    }
                    Some(Command::Send(message, lazy)) => {
                        self.outbox.note(&message, lazy);
                        if let Err(e) = self.write(&mut sink, &message).await {
                            self.outbox.pending.push_back(message);
                            return self.socket_lost(format!("send failed: {}", e));
                        }
                    }
                    Some(Command::Dormant) => {
                        info!("Relay {} is no longer needed, closing", self.url);
                        close_socket(&mut sink, close_code::CLOSED_BY_CLIENT, "dormant").await;
                        self.outbox.clear();
                        self.transition(ConnectionState::Dormant);
                        return Phase::Idle;
                    }
                    Some(Command::Connect) | Some(Command::Reconnect) => {}
                },
            }
        }
    }

    async fn write(
        &mut self,
        sink: &mut WsSink,
        message: &ClientMessage,
    ) -> std::result::Result<(), String> {
        let json = message.to_json().map_err(|e| e.to_string())?;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(|e| e.to_string())?;
        self.outbox.record_sent(message);
        Ok(())
    }

    fn peer_closed(&mut self, code: Option<u16>) -> Phase {
        match close_outcome(code) {
            CloseOutcome::Terminated => Phase::Terminate,
            CloseOutcome::Closed => {
                info!("Relay {} closed the connection", self.url);
                self.outbox.requeue_active();
                self.transition(ConnectionState::Closed);
                Phase::Idle
            }
            CloseOutcome::Rejected => {
                self.report_error("relay rejected the connection (close code 4000)");
                self.outbox.requeue_active();
                self.transition(ConnectionState::Rejected);
                Phase::Idle
            }
            CloseOutcome::Lost => self.socket_lost(format!(
                "connection closed with code {}",
                code.unwrap_or(close_code::ABNORMAL)
            )),
        }
    }

    fn socket_lost(&mut self, reason: impl Into<String>) -> Phase {
        self.report_error(reason);
        self.outbox.requeue_active();
        self.schedule_retry()
    }
}

async fn close_socket(sink: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: Utf8Bytes::from_static(reason),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}
