//! # Realtime Transport
//!
//! The persistent bidirectional connection the engine talks through. A
//! transport owns its reconnection loop and reports everything that happens
//! on the wire as a [`TransportEvent`].
//!
//! ## Implementations
//!
//! - [`WebSocketTransport`]: JSON text frames over `tokio-tungstenite`,
//!   `wss://` through rustls with the webpki root store
//! - [`LoopbackTransport`]: in-process transport driven by a [`LoopbackPeer`],
//!   for embedding the engine next to an in-process authority and for tests

use crate::shared::config::ReconnectPolicy;
use crate::shared::error::{Result, SyncError};
use crate::shared::event::{AckPayload, ClientMessage, HeartbeatPayload, ServerMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// Something that happened on the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection (re-)established
    Connected,
    /// Waiting before reconnection attempt `attempt` (1-based)
    Reconnecting { attempt: u32 },
    /// An established connection dropped
    Disconnected { reason: String },
    /// Every reconnection attempt failed; the transport has stopped
    ReconnectFailed,
    /// Transport-level error (refused, timed out, protocol failure)
    Error(String),
    /// Inbound server frame
    Message(ServerMessage),
}

/// Persistent connection to the sync server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting; events arrive on the returned channel until the
    /// transport is closed or gives up
    async fn open(&self, policy: &ReconnectPolicy) -> Result<UnboundedReceiver<TransportEvent>>;

    /// Send one message over the established connection
    async fn send(&self, message: ClientMessage) -> Result<()>;

    /// Tear the connection down; no further events are delivered
    async fn close(&self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install ring as the process-wide rustls provider unless the host
/// application already chose one
fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider().install_default().is_err() {
            tracing::debug!("[Transport] rustls crypto provider already installed");
        }
    });
}

/// WebSocket transport speaking `{"event", "data"}` JSON text frames
pub struct WebSocketTransport {
    url: Url,
    outgoing: Arc<tokio::sync::Mutex<Option<UnboundedSender<Message>>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl WebSocketTransport {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| SyncError::transport(format!("invalid ws url: {}", e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SyncError::transport(format!(
                    "unsupported scheme '{}', expected ws or wss",
                    other
                )))
            }
        }
        if url.scheme() == "wss" {
            install_crypto_provider();
        }
        Ok(Self {
            url,
            outgoing: Arc::new(tokio::sync::Mutex::new(None)),
            task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, policy: &ReconnectPolicy) -> Result<UnboundedReceiver<TransportEvent>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(tokio::spawn(supervise(
            self.url.clone(),
            policy.clone(),
            events_tx,
            self.outgoing.clone(),
        )));

        Ok(events_rx)
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        let outgoing = self.outgoing.lock().await;
        let sender = outgoing.as_ref().ok_or(SyncError::NotConnected)?;
        sender
            .send(Message::Text(text.into()))
            .map_err(|_| SyncError::transport("connection closed while sending"))
    }

    async fn close(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        *self.outgoing.lock().await = None;
        tracing::debug!("[Transport] Closed {}", self.url);
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Connect, pump frames, and reconnect with backoff until attempts run out
async fn supervise(
    url: Url,
    policy: ReconnectPolicy,
    events: UnboundedSender<TransportEvent>,
    outgoing: Arc<tokio::sync::Mutex<Option<UnboundedSender<Message>>>>,
) {
    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 {
            if attempt > policy.max_attempts {
                tracing::error!(
                    "[Transport] Giving up on {} after {} attempts",
                    url,
                    policy.max_attempts
                );
                let _ = events.send(TransportEvent::ReconnectFailed);
                return;
            }
            if events.send(TransportEvent::Reconnecting { attempt }).is_err() {
                return;
            }
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }

        let connected = tokio::time::timeout(
            policy.timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await;

        let error = match connected {
            Ok(Ok((stream, _response))) => {
                tracing::info!("[Transport] Connected to {}", url);
                let reason = pump(stream, &events, &outgoing).await;
                *outgoing.lock().await = None;
                tracing::warn!("[Transport] Connection to {} lost: {}", url, reason);
                if events.send(TransportEvent::Disconnected { reason }).is_err() {
                    return;
                }
                attempt = 1;
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect timed out after {:?}", policy.timeout),
        };

        if attempt == 0 {
            if events.send(TransportEvent::Error(error.clone())).is_err() {
                return;
            }
        }
        tracing::debug!("[Transport] Attempt {} to {} failed: {}", attempt, url, error);
        attempt += 1;
    }
}

/// Shuttle frames until the socket closes; returns the close reason
async fn pump(
    stream: WsStream,
    events: &UnboundedSender<TransportEvent>,
    outgoing: &tokio::sync::Mutex<Option<UnboundedSender<Message>>>,
) -> String {
    let (mut ws_tx, mut ws_rx) = stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    *outgoing.lock().await = Some(out_tx);

    if events.send(TransportEvent::Connected).is_err() {
        return "event receiver dropped".to_string();
    }

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::from_json(text.as_str()) {
                    Ok(message) => {
                        if events.send(TransportEvent::Message(message)).is_err() {
                            return "event receiver dropped".to_string();
                        }
                    }
                    Err(e) => tracing::warn!("[Transport] Dropping malformed frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    return frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "server closed the connection".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return e.to_string(),
                None => return "stream ended".to_string(),
            },
            outbound = out_rx.recv() => match outbound {
                Some(message) => {
                    if let Err(e) = ws_tx.send(message).await {
                        return e.to_string();
                    }
                }
                None => return "sender dropped".to_string(),
            },
        }
    }
}

/// How the loopback peer fails client sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// Transport-level failure (retryable)
    Transport(String),
    /// Server answered with a status code
    Server(u16, String),
}

impl SendFailure {
    fn to_error(&self) -> SyncError {
        match self {
            SendFailure::Transport(message) => SyncError::transport(message.clone()),
            SendFailure::Server(status, message) => SyncError::server(*status, message.clone()),
        }
    }
}

#[derive(Debug)]
struct LoopbackState {
    events: Option<UnboundedSender<TransportEvent>>,
    accepting: bool,
    connected: bool,
    failure: Option<SendFailure>,
    auto_pong: bool,
    auto_ack: bool,
    echo_updates: bool,
    sent: Vec<ClientMessage>,
    sent_tx: UnboundedSender<ClientMessage>,
    opens: u32,
}

#[derive(Debug)]
struct LoopbackShared {
    state: Mutex<LoopbackState>,
    sent_rx: tokio::sync::Mutex<UnboundedReceiver<ClientMessage>>,
}

impl LoopbackShared {
    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process transport; the other end is a [`LoopbackPeer`]
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    shared: Arc<LoopbackShared>,
}

/// Server side of a [`LoopbackTransport`]
#[derive(Debug, Clone)]
pub struct LoopbackPeer {
    shared: Arc<LoopbackShared>,
}

impl LoopbackTransport {
    /// A connected transport/peer pair. The peer accepts connections,
    /// answers pings, acknowledges updates carrying an operation id and does
    /// not echo updates until told otherwise.
    pub fn pair() -> (LoopbackTransport, LoopbackPeer) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(LoopbackShared {
            state: Mutex::new(LoopbackState {
                events: None,
                accepting: true,
                connected: false,
                failure: None,
                auto_pong: true,
                auto_ack: true,
                echo_updates: false,
                sent: Vec::new(),
                sent_tx,
                opens: 0,
            }),
            sent_rx: tokio::sync::Mutex::new(sent_rx),
        });
        (
            LoopbackTransport {
                shared: shared.clone(),
            },
            LoopbackPeer { shared },
        )
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self, _policy: &ReconnectPolicy) -> Result<UnboundedReceiver<TransportEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state();
        state.opens += 1;
        if state.accepting {
            state.connected = true;
            let _ = tx.send(TransportEvent::Connected);
        } else {
            state.connected = false;
            let _ = tx.send(TransportEvent::Error("connection refused".to_string()));
        }
        state.events = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        let mut state = self.shared.state();
        if !state.connected {
            return Err(SyncError::NotConnected);
        }
        if let ClientMessage::Ping(payload) = &message {
            if state.auto_pong {
                if let Some(events) = &state.events {
                    let _ = events.send(TransportEvent::Message(ServerMessage::Pong(
                        HeartbeatPayload {
                            timestamp: payload.timestamp,
                        },
                    )));
                }
                return Ok(());
            }
        }
        if let Some(failure) = &state.failure {
            return Err(failure.to_error());
        }

        let echo = match &message {
            ClientMessage::CalendarUpdate(payload) if state.echo_updates => {
                Some(ServerMessage::CalendarUpdate(payload.clone()))
            }
            ClientMessage::ProjectUpdate(payload) if state.echo_updates => {
                Some(ServerMessage::ProjectUpdate(payload.clone()))
            }
            _ => None,
        };
        let ack = message
            .update_payload()
            .and_then(|payload| payload.operation_id.clone())
            .filter(|_| state.auto_ack)
            .map(|operation_id| ServerMessage::Ack(AckPayload { operation_id }));
        state.sent.push(message.clone());
        let _ = state.sent_tx.send(message);
        if let Some(events) = &state.events {
            for reply in echo.into_iter().chain(ack) {
                let _ = events.send(TransportEvent::Message(reply));
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.shared.state();
        state.connected = false;
        state.events = None;
    }
}

impl LoopbackPeer {
    /// Accept or refuse future `open` calls
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.state().accepting = accepting;
    }

    /// Fail every client send (pings excluded) until cleared with `None`
    pub fn fail_sends(&self, failure: Option<SendFailure>) {
        self.shared.state().failure = failure;
    }

    /// Answer pings automatically
    pub fn set_auto_pong(&self, enabled: bool) {
        self.shared.state().auto_pong = enabled;
    }

    /// Acknowledge updates that carry an operation id with `update:ack`
    pub fn set_auto_ack(&self, enabled: bool) {
        self.shared.state().auto_ack = enabled;
    }

    /// Echo calendar/project updates back as server confirmations
    pub fn set_echo_updates(&self, enabled: bool) {
        self.shared.state().echo_updates = enabled;
    }

    /// Simulate a successful (re)connection
    pub fn connect(&self) {
        let mut state = self.shared.state();
        state.accepting = true;
        state.connected = true;
        if let Some(events) = &state.events {
            let _ = events.send(TransportEvent::Connected);
        }
    }

    /// Simulate a dropped connection followed by the first reconnection attempt
    pub fn drop_connection(&self, reason: &str) {
        let mut state = self.shared.state();
        state.connected = false;
        if let Some(events) = &state.events {
            let _ = events.send(TransportEvent::Disconnected {
                reason: reason.to_string(),
            });
            let _ = events.send(TransportEvent::Reconnecting { attempt: 1 });
        }
    }

    /// Simulate running out of reconnection attempts
    pub fn exhaust_reconnects(&self) {
        let mut state = self.shared.state();
        state.connected = false;
        if let Some(events) = state.events.take() {
            let _ = events.send(TransportEvent::ReconnectFailed);
        }
    }

    /// Push a server frame to the client
    pub fn push(&self, message: ServerMessage) {
        if let Some(events) = &self.shared.state().events {
            let _ = events.send(TransportEvent::Message(message));
        }
    }

    /// Whether the client side currently holds an open connection
    pub fn is_connected(&self) -> bool {
        self.shared.state().connected
    }

    /// How many times the client opened the transport
    pub fn open_count(&self) -> u32 {
        self.shared.state().opens
    }

    /// Every message the client sent, pings excluded
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.shared.state().sent.clone()
    }

    /// Calendar and project updates the client sent
    pub fn sent_updates(&self) -> Vec<ClientMessage> {
        self.sent()
            .into_iter()
            .filter(|message| {
                matches!(
                    message,
                    ClientMessage::CalendarUpdate(_) | ClientMessage::ProjectUpdate(_)
                )
            })
            .collect()
    }

    /// Wait for the next message the client sends
    pub async fn recv(&self) -> Option<ClientMessage> {
        self.shared.sent_rx.lock().await.recv().await
    }

    pub fn clear_sent(&self) {
        self.shared.state().sent.clear();
    }
}
