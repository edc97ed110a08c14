// Per-workspace rooms of live sockets and the per-connection metadata table.
//
// Metadata is keyed by a stable connection id and lives exactly as long as
// the `insert`/`remove` pair issued by the socket task.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tessera_common::protocol::ws::PresenceStatus;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Pre-encoded JSON text frame, shared by every recipient of a broadcast.
pub type OutboundFrame = Utf8Bytes;

pub type OutboundSender = mpsc::UnboundedSender<OutboundFrame>;

/// Identity fixed at upgrade time. `user_id` is only absent for anonymous
/// development-bypass sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub user_id: Option<String>,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub workspace_id: String,
    pub user_id: Option<String>,
    pub display_name: String,
    pub status: PresenceStatus,
    pub last_activity: DateTime<Utc>,
    pub canvas_id: Option<String>,
    pub focused_frame_id: Option<String>,
}

struct ConnectionEntry {
    workspace_id: String,
    identity: ConnectionIdentity,
    status: PresenceStatus,
    last_activity: DateTime<Utc>,
    canvas_id: Option<String>,
    focused_frame_id: Option<String>,
    sender: OutboundSender,
}

impl ConnectionEntry {
    fn snapshot(&self, connection_id: ConnectionId) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connection_id,
            workspace_id: self.workspace_id.clone(),
            user_id: self.identity.user_id.clone(),
            display_name: self.identity.display_name.clone(),
            status: self.status,
            last_activity: self.last_activity,
            canvas_id: self.canvas_id.clone(),
            focused_frame_id: self.focused_frame_id.clone(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<String, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

impl RegistryState {
    fn room_entries<'a>(
        &'a self,
        workspace_id: &str,
    ) -> impl Iterator<Item = (ConnectionId, &'a ConnectionEntry)> + 'a {
        self.rooms
            .get(workspace_id)
            .into_iter()
            .flatten()
            .filter_map(|connection_id| {
                self.connections.get(connection_id).map(|entry| (*connection_id, entry))
            })
    }
}

/// Room membership plus per-connection metadata behind one lock.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        workspace_id: &str,
        connection_id: ConnectionId,
        identity: ConnectionIdentity,
        sender: OutboundSender,
    ) -> ConnectionSnapshot {
        let entry = ConnectionEntry {
            workspace_id: workspace_id.to_string(),
            identity,
            status: PresenceStatus::Online,
            last_activity: Utc::now(),
            canvas_id: None,
            focused_frame_id: None,
            sender,
        };
        let snapshot = entry.snapshot(connection_id);

        let mut state = self.state.write().await;
        state.rooms.entry(workspace_id.to_string()).or_default().insert(connection_id);
        state.connections.insert(connection_id, entry);

        snapshot
    }

    /// Drop a connection from its room. Returns its final metadata.
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<ConnectionSnapshot> {
        let mut state = self.state.write().await;
        let entry = state.connections.remove(&connection_id)?;

        let room_is_empty = match state.rooms.get_mut(&entry.workspace_id) {
            Some(room) => {
                room.remove(&connection_id);
                room.is_empty()
            }
            None => false,
        };
        if room_is_empty {
            state.rooms.remove(&entry.workspace_id);
        }

        Some(entry.snapshot(connection_id))
    }

    pub async fn snapshot(&self, connection_id: ConnectionId) -> Option<ConnectionSnapshot> {
        let state = self.state.read().await;
        state.connections.get(&connection_id).map(|entry| entry.snapshot(connection_id))
    }

    pub async fn touch(&self, connection_id: ConnectionId) -> Option<ConnectionSnapshot> {
        self.update(connection_id, |_| {}).await
    }

    pub async fn set_status(
        &self,
        connection_id: ConnectionId,
        status: PresenceStatus,
    ) -> Option<ConnectionSnapshot> {
        self.update(connection_id, |entry| entry.status = status).await
    }

    /// Move the connection onto `canvas_id` and clear its focus.
    ///
    /// Returns the canvas it was previously viewing, if any.
    pub async fn enter_canvas(
        &self,
        connection_id: ConnectionId,
        canvas_id: &str,
    ) -> Option<Option<String>> {
        let mut previous = None;
        self.update(connection_id, |entry| {
            previous = entry.canvas_id.replace(canvas_id.to_string());
            entry.focused_frame_id = None;
        })
        .await?;

        Some(previous)
    }

    /// Clear canvas and focus. Returns the canvas that was left, if any.
    pub async fn exit_canvas(&self, connection_id: ConnectionId) -> Option<String> {
        let mut previous = None;
        self.update(connection_id, |entry| {
            previous = entry.canvas_id.take();
            entry.focused_frame_id = None;
        })
        .await?;

        previous
    }

    pub async fn set_focus(
        &self,
        connection_id: ConnectionId,
        frame_id: Option<String>,
    ) -> Option<ConnectionSnapshot> {
        self.update(connection_id, |entry| entry.focused_frame_id = frame_id).await
    }

    pub async fn members(&self, workspace_id: &str) -> Vec<ConnectionSnapshot> {
        let state = self.state.read().await;
        sorted(state.room_entries(workspace_id).map(|(id, entry)| entry.snapshot(id)).collect())
    }

    pub async fn canvas_viewers(&self, workspace_id: &str, canvas_id: &str) -> Vec<ConnectionSnapshot> {
        let state = self.state.read().await;
        sorted(
            state
                .room_entries(workspace_id)
                .filter(|(_, entry)| entry.canvas_id.as_deref() == Some(canvas_id))
                .map(|(id, entry)| entry.snapshot(id))
                .collect(),
        )
    }

    /// Queue `frame` on every open socket of the room, optionally restricted
    /// to one canvas and skipping `except`. Returns the number queued.
    pub async fn send_to_room(
        &self,
        workspace_id: &str,
        canvas_id: Option<&str>,
        frame: &OutboundFrame,
        except: Option<ConnectionId>,
    ) -> usize {
        let recipients: Vec<OutboundSender> = {
            let state = self.state.read().await;
            state
                .room_entries(workspace_id)
                .filter(|(id, _)| Some(*id) != except)
                .filter(|(_, entry)| match canvas_id {
                    Some(canvas_id) => entry.canvas_id.as_deref() == Some(canvas_id),
                    None => true,
                })
                .map(|(_, entry)| entry.sender.clone())
                .collect()
        };

        deliver(&recipients, frame)
    }

    /// Queue `frame` on every socket in `workspace_id` owned by `user_id`.
    pub async fn send_to_user(&self, workspace_id: &str, user_id: &str, frame: &OutboundFrame) -> usize {
        let recipients: Vec<OutboundSender> = {
            let state = self.state.read().await;
            state
                .room_entries(workspace_id)
                .filter(|(_, entry)| entry.identity.user_id.as_deref() == Some(user_id))
                .map(|(_, entry)| entry.sender.clone())
                .collect()
        };

        deliver(&recipients, frame)
    }

    pub async fn send_to_connection(&self, connection_id: ConnectionId, frame: &OutboundFrame) -> bool {
        let sender = {
            let state = self.state.read().await;
            state.connections.get(&connection_id).map(|entry| entry.sender.clone())
        };

        sender.is_some_and(|sender| sender.send(frame.clone()).is_ok())
    }

    async fn update<F>(&self, connection_id: ConnectionId, mutate: F) -> Option<ConnectionSnapshot>
    where
        F: FnOnce(&mut ConnectionEntry),
    {
        let mut state = self.state.write().await;
        let entry = state.connections.get_mut(&connection_id)?;
        mutate(entry);
        entry.last_activity = Utc::now();

        Some(entry.snapshot(connection_id))
    }
}

// Closed sockets have dropped their receiver; those sends fail and are skipped.
fn deliver(recipients: &[OutboundSender], frame: &OutboundFrame) -> usize {
    recipients.iter().filter(|sender| sender.send(frame.clone()).is_ok()).count()
}

fn sorted(mut snapshots: Vec<ConnectionSnapshot>) -> Vec<ConnectionSnapshot> {
    snapshots.sort_by(|left, right| {
        left.display_name
            .cmp(&right.display_name)
            .then_with(|| left.connection_id.cmp(&right.connection_id))
    });
    snapshots
}
