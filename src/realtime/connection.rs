//! # Connection Manager
//!
//! Owns the persistent connection: lifecycle status, room membership,
//! heartbeat latency and connection metrics. Everything it observes is
//! published as a [`ConnectionEvent`].
//!
//! ## State Machine
//!
//! ```text
//! disconnected -> connecting -> connected | error
//! connected    -> disconnected | reconnecting
//! reconnecting -> connected | error
//! error        -> reconnecting (until attempts are exhausted)
//! ```
//!
//! Reconnection itself is the transport's job; this component only tracks
//! where the transport is and re-joins rooms after every reconnect.
//!
//! ## Delivery
//!
//! [`ConnectionManager::subscribe`] hands out bounded broadcast receivers
//! that skip events when they fall behind. The engine's own event loop uses
//! [`ConnectionManager::attach`] instead, an unbounded single-consumer stream
//! that never drops an event.

use crate::realtime::heartbeat::HeartbeatMonitor;
use crate::realtime::transport::{Transport, TransportEvent};
use crate::shared::config::{EngineConfig, ReconnectPolicy};
use crate::shared::error::Result;
use crate::shared::event::{ClientMessage, RoomPayload, ServerMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const EVENT_CAPACITY: usize = 1024;

/// Connection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection health snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetrics {
    /// Last heartbeat round-trip
    pub latency: Option<Duration>,
    /// Pings that got no pong plus pings that could not be sent
    pub packets_lost: u64,
    /// Successful reconnections
    pub reconnection_count: u64,
    /// Time spent connected, including the current session
    pub total_uptime: Duration,
    /// When the last pong arrived
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Pings still unanswered when the next interval began
    pub stale_heartbeats: u64,
}

/// Published by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StatusChanged {
        previous: ConnectionStatus,
        current: ConnectionStatus,
    },
    /// Inbound server message (pongs are consumed internally)
    Message(ServerMessage),
    Error(String),
}

#[derive(Debug)]
struct ConnectionState {
    status: ConnectionStatus,
    metrics: ConnectionMetrics,
    connected_since: Option<Instant>,
    rooms: BTreeSet<String>,
    heartbeat: HeartbeatMonitor,
    /// The transport is open (connected or retrying)
    open: bool,
    ever_connected: bool,
}

impl ConnectionState {
    fn leave_connected(&mut self) {
        if let Some(since) = self.connected_since.take() {
            self.metrics.total_uptime += since.elapsed();
        }
        self.heartbeat.reset();
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    /// Lossless consumer installed by `attach`
    sink: StdMutex<Option<UnboundedSender<ConnectionEvent>>>,
}

impl Shared {
    fn publish(&self, event: ConnectionEvent) {
        {
            let mut sink = self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(tx) = sink.as_ref() {
                if tx.send(event.clone()).is_err() {
                    *sink = None;
                }
            }
        }
        let _ = self.events.send(event);
    }

    fn transition(&self, state: &mut ConnectionState, next: ConnectionStatus) {
        let previous = state.status;
        if previous == next {
            return;
        }
        state.status = next;
        tracing::info!("[Connection] {} -> {}", previous, next);
        self.publish(ConnectionEvent::StatusChanged {
            previous,
            current: next,
        });
    }

    fn publish_error(&self, message: String) {
        self.publish(ConnectionEvent::Error(message));
    }

    async fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                let rooms: Vec<String> = self.state.read().await.rooms.iter().cloned().collect();
                for room_id in rooms {
                    if let Err(e) = self
                        .transport
                        .send(ClientMessage::JoinRoom(RoomPayload {
                            room_id: room_id.clone(),
                        }))
                        .await
                    {
                        tracing::warn!("[Connection] Failed to re-join {}: {}", room_id, e);
                    }
                }

                let mut state = self.state.write().await;
                if state.ever_connected && state.status != ConnectionStatus::Connected {
                    state.metrics.reconnection_count += 1;
                }
                state.ever_connected = true;
                state.connected_since.get_or_insert_with(Instant::now);
                state.heartbeat.reset();
                self.transition(&mut state, ConnectionStatus::Connected);
            }
            TransportEvent::Reconnecting { attempt } => {
                tracing::info!("[Connection] Reconnection attempt {}", attempt);
                let mut state = self.state.write().await;
                state.leave_connected();
                self.transition(&mut state, ConnectionStatus::Reconnecting);
            }
            TransportEvent::Disconnected { reason } => {
                tracing::warn!("[Connection] Disconnected: {}", reason);
                let mut state = self.state.write().await;
                state.leave_connected();
                self.transition(&mut state, ConnectionStatus::Disconnected);
            }
            TransportEvent::ReconnectFailed => {
                let mut state = self.state.write().await;
                state.open = false;
                state.leave_connected();
                self.transition(&mut state, ConnectionStatus::Error);
                drop(state);
                self.publish_error("reconnection attempts exhausted".to_string());
            }
            TransportEvent::Error(message) => {
                tracing::error!("[Connection] Transport error: {}", message);
                let mut state = self.state.write().await;
                state.leave_connected();
                self.transition(&mut state, ConnectionStatus::Error);
                drop(state);
                self.publish_error(message);
            }
            TransportEvent::Message(ServerMessage::Pong(pong)) => {
                let mut state = self.state.write().await;
                if let Some(latency) = state.heartbeat.on_pong(pong, Utc::now().timestamp_millis()) {
                    state.metrics.latency = Some(latency);
                    state.metrics.last_heartbeat_at = Some(Utc::now());
                }
            }
            TransportEvent::Message(message) => {
                self.publish(ConnectionEvent::Message(message));
            }
        }
    }
}

async fn run_events(shared: Arc<Shared>, mut events: UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        shared.handle(event).await;
    }

    let mut state = shared.state.write().await;
    if state.open {
        state.open = false;
        state.leave_connected();
        shared.transition(&mut state, ConnectionStatus::Disconnected);
    }
}

async fn run_heartbeat(shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let ping = {
            let mut state = shared.state.write().await;
            if state.status != ConnectionStatus::Connected {
                continue;
            }
            let tick = state.heartbeat.on_tick(Utc::now().timestamp_millis());
            if tick.stale {
                state.metrics.packets_lost += 1;
                state.metrics.stale_heartbeats += 1;
                tracing::warn!("[Connection] Heartbeat went unanswered for {:?}", interval);
            }
            tick.ping
        };

        if let Err(e) = shared.transport.send(ClientMessage::Ping(ping)).await {
            tracing::debug!("[Connection] Heartbeat ping failed: {}", e);
            shared.state.write().await.metrics.packets_lost += 1;
        }
    }
}

/// Connection lifecycle manager
pub struct ConnectionManager {
    shared: Arc<Shared>,
    policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("policy", &self.policy)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        heartbeat_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                transport,
                state: RwLock::new(ConnectionState {
                    status: ConnectionStatus::Disconnected,
                    metrics: ConnectionMetrics::default(),
                    connected_since: None,
                    rooms: BTreeSet::new(),
                    heartbeat: HeartbeatMonitor::new(),
                    open: false,
                    ever_connected: false,
                }),
                events,
                sink: StdMutex::new(None),
            }),
            policy,
            heartbeat_interval,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(transport: Arc<dyn Transport>, config: &EngineConfig) -> Self {
        Self::new(transport, config.reconnection.clone(), config.heartbeat_interval)
    }

    /// Subscribe to status changes, inbound messages and errors
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Attach the single lossless consumer.
    ///
    /// Every event published afterwards is delivered in order, however far
    /// the consumer falls behind. Attaching again detaches the previous
    /// receiver.
    pub fn attach(&self) -> UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .shared
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);
        rx
    }

    /// Open the transport and start the heartbeat.
    ///
    /// A no-op while connecting, connected or while the transport is still
    /// retrying.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write().await;
            if state.open
                || matches!(
                    state.status,
                    ConnectionStatus::Connecting | ConnectionStatus::Connected
                )
            {
                return Ok(());
            }
            state.open = true;
            self.shared.transition(&mut state, ConnectionStatus::Connecting);
        }

        let events = match self.shared.transport.open(&self.policy).await {
            Ok(events) => events,
            Err(e) => {
                let mut state = self.shared.state.write().await;
                state.open = false;
                self.shared.transition(&mut state, ConnectionStatus::Error);
                drop(state);
                self.shared.publish_error(e.to_string());
                return Err(e);
            }
        };

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        tasks.push(tokio::spawn(run_events(self.shared.clone(), events)));
        tasks.push(tokio::spawn(run_heartbeat(
            self.shared.clone(),
            self.heartbeat_interval,
        )));
        Ok(())
    }

    /// Tear down the transport and heartbeat
    pub async fn disconnect(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.shared.transport.close().await;

        let mut state = self.shared.state.write().await;
        state.open = false;
        state.leave_connected();
        self.shared.transition(&mut state, ConnectionStatus::Disconnected);
    }

    /// Send a message if connected.
    ///
    /// Returns `Ok(false)` without touching the transport when not
    /// connected; queuing is the caller's job.
    pub async fn emit(&self, message: ClientMessage) -> Result<bool> {
        if self.status().await != ConnectionStatus::Connected {
            tracing::debug!(
                "[Connection] Not connected, skipping {}",
                message.event_name()
            );
            return Ok(false);
        }
        self.shared.transport.send(message).await?;
        Ok(true)
    }

    /// Join a room; returns `false` if already joined
    pub async fn join_room(&self, room_id: &str) -> Result<bool> {
        let connected = {
            let mut state = self.shared.state.write().await;
            if !state.rooms.insert(room_id.to_string()) {
                return Ok(false);
            }
            state.status == ConnectionStatus::Connected
        };
        tracing::debug!("[Connection] Joining {}", room_id);
        if connected {
            self.shared
                .transport
                .send(ClientMessage::JoinRoom(RoomPayload {
                    room_id: room_id.to_string(),
                }))
                .await?;
        }
        Ok(true)
    }

    /// Leave a room; returns `false` if not joined
    pub async fn leave_room(&self, room_id: &str) -> Result<bool> {
        let connected = {
            let mut state = self.shared.state.write().await;
            if !state.rooms.remove(room_id) {
                return Ok(false);
            }
            state.status == ConnectionStatus::Connected
        };
        tracing::debug!("[Connection] Leaving {}", room_id);
        if connected {
            self.shared
                .transport
                .send(ClientMessage::LeaveRoom(RoomPayload {
                    room_id: room_id.to_string(),
                }))
                .await?;
        }
        Ok(true)
    }

    /// Rooms currently joined
    pub async fn rooms(&self) -> Vec<String> {
        self.shared.state.read().await.rooms.iter().cloned().collect()
    }

    pub async fn is_in_room(&self, room_id: &str) -> bool {
        self.shared.state.read().await.rooms.contains(room_id)
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.shared.state.read().await.status
    }

    pub async fn is_connected(&self) -> bool {
        self.status().await == ConnectionStatus::Connected
    }

    /// Metrics snapshot with uptime recomputed now
    pub async fn get_metrics(&self) -> ConnectionMetrics {
        let state = self.shared.state.read().await;
        let mut metrics = state.metrics.clone();
        if let Some(since) = state.connected_since {
            metrics.total_uptime += since.elapsed();
        }
        metrics
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
