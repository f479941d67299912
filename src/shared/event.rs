//! Realtime Wire Protocol
//!
//! Every frame on the persistent connection is a JSON object of the form
//! `{"event": "<name>", "data": {...}}`. Payload field names are camelCase.
//!
//! # Events
//!
//! | name                | direction        | payload                |
//! |---------------------|------------------|------------------------|
//! | `calendar:update`   | both             | [`UpdatePayload`]      |
//! | `project:update`    | both             | [`UpdatePayload`]      |
//! | `conflict:detected` | server -> client | [`ConflictEvent`]      |
//! | `join:room`         | client -> server | [`RoomPayload`]        |
//! | `leave:room`        | client -> server | [`RoomPayload`]        |
//! | `ping` / `pong`     | both             | [`HeartbeatPayload`]   |
//! | `resource:fetch`    | client -> server | [`FetchPayload`]       |
//! | `resource:snapshot` | server -> client | [`SnapshotPayload`]    |
//! | `update:ack`        | server -> client | [`AckPayload`]         |
//! | `error`             | server -> client | [`ServerErrorPayload`] |
//!
//! An update the client sends carries an `operationId`. It stays undelivered
//! until the server answers with `update:ack`, echoes the update with the same
//! id, or rejects it with an `error` naming the id.

use crate::shared::error::SyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Kind of resource a mutation or conflict refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    /// Calendar/schedule entries
    Calendar,
    /// Projects
    Project,
    /// Any other kind registered by the application
    Custom(String),
}

impl ResourceKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Calendar => "calendar",
            ResourceKind::Project => "project",
            ResourceKind::Custom(name) => name,
        }
    }
}

impl From<String> for ResourceKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "calendar" | "schedule" => ResourceKind::Calendar,
            "project" => ResourceKind::Project,
            _ => ResourceKind::Custom(value),
        }
    }
}

impl From<&str> for ResourceKind {
    fn from(value: &str) -> Self {
        ResourceKind::from(value.to_string())
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of conflict reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConflictKind {
    /// Both sides edited the same resource concurrently
    ConcurrentEdit,
    /// The client's base version is behind the server's
    VersionMismatch,
    /// Application-defined conflict kind
    Custom(String),
}

impl ConflictKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &str {
        match self {
            ConflictKind::ConcurrentEdit => "concurrent_edit",
            ConflictKind::VersionMismatch => "version_mismatch",
            ConflictKind::Custom(name) => name,
        }
    }
}

impl From<String> for ConflictKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "concurrent_edit" => ConflictKind::ConcurrentEdit,
            "version_mismatch" => ConflictKind::VersionMismatch,
            _ => ConflictKind::Custom(value),
        }
    }
}

impl From<&str> for ConflictKind {
    fn from(value: &str) -> Self {
        ConflictKind::from(value.to_string())
    }
}

impl From<ConflictKind> for String {
    fn from(kind: ConflictKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateAction {
    Create,
    Update,
    Delete,
}

impl UpdateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateAction::Create => "create",
            UpdateAction::Update => "update",
            UpdateAction::Delete => "delete",
        }
    }
}

impl std::str::FromStr for UpdateAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(UpdateAction::Create),
            "update" => Ok(UpdateAction::Update),
            "delete" => Ok(UpdateAction::Delete),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Payload of `calendar:update` / `project:update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    /// Id of the mutated resource
    pub resource_id: String,
    /// Owning project, used for room scoping of calendar entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// What happened to the resource
    pub action: UpdateAction,
    /// Full resource snapshot (ignored for deletes). Updates are not
    /// patches: the receiver replaces the stored value with it.
    #[serde(default)]
    pub data: Value,
    /// Resource version the payload is based on (client) or produced (server)
    #[serde(default)]
    pub version: u64,
    /// When the mutation was made
    pub timestamp: DateTime<Utc>,
    /// Client-chosen id the server acknowledges with `update:ack`; echoed on
    /// the broadcast of the applied update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

impl UpdatePayload {
    /// Create a payload stamped with the current time
    pub fn new(resource_id: impl Into<String>, action: UpdateAction, data: Value) -> Self {
        Self {
            resource_id: resource_id.into(),
            project_id: None,
            action,
            data,
            version: 0,
            timestamp: Utc::now(),
            operation_id: None,
        }
    }

    /// Set the owning project
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Set the version
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Tag the payload with the id its acknowledgment will carry
    pub fn with_operation(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }
}

/// Payload of `conflict:detected`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEvent {
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub conflict_kind: ConflictKind,
    pub local_version: u64,
    pub server_version: u64,
    #[serde(default)]
    pub local_changes: Map<String, Value>,
    #[serde(default)]
    pub server_changes: Map<String, Value>,
}

impl ConflictEvent {
    /// Fields changed on both sides to different values.
    ///
    /// A field edited identically on both sides is not a conflict.
    pub fn divergent_fields(&self) -> Vec<&str> {
        self.local_changes
            .iter()
            .filter(|(field, local)| {
                self.server_changes
                    .get(field.as_str())
                    .map_or(false, |server| server != *local)
            })
            .map(|(field, _)| field.as_str())
            .collect()
    }

    /// Whether any field genuinely diverges
    pub fn has_divergence(&self) -> bool {
        !self.divergent_fields().is_empty()
    }
}

/// Payload of `join:room` / `leave:room`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub room_id: String,
}

/// Payload of `ping` / `pong`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Milliseconds since the Unix epoch, echoed back by the server
    pub timestamp: i64,
}

/// Payload of `resource:fetch`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchPayload {
    pub resource_kind: ResourceKind,
    pub resource_id: String,
}

/// Payload of `resource:snapshot`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    /// Authoritative resource state; `null` when the resource no longer exists
    #[serde(default)]
    pub data: Value,
    pub version: u64,
}

/// Payload of `update:ack`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub operation_id: String,
}

/// Payload of `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Set when the error rejects one operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

impl ServerErrorPayload {
    /// Error type for the failure, classified by status
    pub fn to_error(&self) -> SyncError {
        match self.status {
            Some(status) => SyncError::server(status, self.message.clone()),
            None => SyncError::rejected(self.message.clone()),
        }
    }
}

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "calendar:update")]
    CalendarUpdate(UpdatePayload),
    #[serde(rename = "project:update")]
    ProjectUpdate(UpdatePayload),
    #[serde(rename = "join:room")]
    JoinRoom(RoomPayload),
    #[serde(rename = "leave:room")]
    LeaveRoom(RoomPayload),
    #[serde(rename = "ping")]
    Ping(HeartbeatPayload),
    #[serde(rename = "resource:fetch")]
    Fetch(FetchPayload),
}

impl ClientMessage {
    /// Build the update message for a resource kind.
    ///
    /// Only calendar and project mutations travel over the wire; other kinds
    /// return `None`.
    pub fn update(kind: &ResourceKind, payload: UpdatePayload) -> Option<Self> {
        match kind {
            ResourceKind::Calendar => Some(ClientMessage::CalendarUpdate(payload)),
            ResourceKind::Project => Some(ClientMessage::ProjectUpdate(payload)),
            ResourceKind::Custom(_) => None,
        }
    }

    /// The update payload, for calendar and project updates
    pub fn update_payload(&self) -> Option<&UpdatePayload> {
        match self {
            ClientMessage::CalendarUpdate(payload) | ClientMessage::ProjectUpdate(payload) => {
                Some(payload)
            }
            _ => None,
        }
    }

    /// Logical event name
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::CalendarUpdate(_) => "calendar:update",
            ClientMessage::ProjectUpdate(_) => "project:update",
            ClientMessage::JoinRoom(_) => "join:room",
            ClientMessage::LeaveRoom(_) => "leave:room",
            ClientMessage::Ping(_) => "ping",
            ClientMessage::Fetch(_) => "resource:fetch",
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "calendar:update")]
    CalendarUpdate(UpdatePayload),
    #[serde(rename = "project:update")]
    ProjectUpdate(UpdatePayload),
    #[serde(rename = "conflict:detected")]
    ConflictDetected(ConflictEvent),
    #[serde(rename = "pong")]
    Pong(HeartbeatPayload),
    #[serde(rename = "resource:snapshot")]
    Snapshot(SnapshotPayload),
    /// The server accepted the operation with this id
    #[serde(rename = "update:ack")]
    Ack(AckPayload),
    #[serde(rename = "error")]
    Error(ServerErrorPayload),
}

impl ServerMessage {
    /// Decode a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Room id for a project
pub fn project_room(project_id: &str) -> String {
    format!("project:{}", project_id)
}

/// Room id for a calendar
pub fn calendar_room(calendar_id: &str) -> String {
    format!("calendar:{}", calendar_id)
}
