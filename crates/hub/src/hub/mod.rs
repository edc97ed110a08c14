// Collaboration hub: connection lifecycle, client message dispatch and
// collaborator fan-out on top of the registry, presence index and lock table.

pub mod locks;
pub mod presence;
pub mod registry;
pub mod router;
pub mod sweeper;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tessera_common::protocol::ws::{
    normalize_chat_text, CanvasLockAction, CanvasPresenceAction, ClientMessage,
    LockRequestAction, PresenceStatus, ServerMessage, SystemLevel,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::HubMetrics;
use locks::{AcquireOutcome, FrameLock, FrameLockManager};
use presence::PresenceTracker;
use registry::{
    ConnectionId, ConnectionIdentity, ConnectionRegistry, ConnectionSnapshot, OutboundFrame,
    OutboundSender,
};

#[derive(Clone)]
pub struct Hub {
    registry: ConnectionRegistry,
    presence: PresenceTracker,
    locks: FrameLockManager,
    metrics: Arc<HubMetrics>,
}

impl Hub {
    pub fn new(lock_timeout: std::time::Duration, metrics: Arc<HubMetrics>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            presence: PresenceTracker::new(),
            locks: FrameLockManager::new(lock_timeout),
            metrics,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn locks(&self) -> &FrameLockManager {
        &self.locks
    }

    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    /// Admit a socket into its workspace room and announce it.
    pub async fn join(
        &self,
        workspace_id: &str,
        identity: ConnectionIdentity,
        sender: OutboundSender,
    ) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        let snapshot = self.registry.insert(workspace_id, connection_id, identity, sender).await;
        if let Some(user_id) = snapshot.user_id.as_deref() {
            self.presence.track(user_id, workspace_id).await;
        }
        self.metrics.connection_opened();

        info!(
            workspace_id = %workspace_id,
            connection_id = %connection_id,
            user_id = snapshot.user_id.as_deref().unwrap_or("anonymous"),
            "websocket connection joined"
        );

        self.broadcast(
            workspace_id,
            &presence_message(&snapshot, PresenceStatus::Online),
            Some(connection_id),
        )
        .await;

        connection_id
    }

    /// Tear down a connection: release its owner's locks, leave its canvas,
    /// drop it from the room and the presence index, announce it offline.
    pub async fn leave(&self, connection_id: ConnectionId) {
        let Some(snapshot) = self.registry.snapshot(connection_id).await else {
            return;
        };
        let workspace_id = snapshot.workspace_id.as_str();

        if let Some(user_id) = snapshot.user_id.as_deref() {
            self.release_all_locks(workspace_id, user_id, connection_id).await;
        }

        if let Some(canvas_id) = snapshot.canvas_id.as_deref() {
            self.broadcast_to_canvas(
                workspace_id,
                canvas_id,
                &canvas_presence_message(&snapshot, CanvasPresenceAction::Left, canvas_id, None),
                Some(connection_id),
            )
            .await;
        }

        if self.registry.remove(connection_id).await.is_none() {
            return;
        }
        if let Some(user_id) = snapshot.user_id.as_deref() {
            self.presence.untrack(user_id, workspace_id).await;
        }
        self.metrics.connection_closed();

        info!(
            workspace_id = %workspace_id,
            connection_id = %connection_id,
            user_id = snapshot.user_id.as_deref().unwrap_or("anonymous"),
            "websocket connection left"
        );

        self.broadcast(workspace_id, &presence_message(&snapshot, PresenceStatus::Offline), None)
            .await;
    }

    /// Apply one inbound client message. Messages from unknown connections
    /// are ignored.
    pub async fn handle_client_message(&self, connection_id: ConnectionId, message: ClientMessage) {
        self.metrics.record_inbound(message.kind());

        match message {
            ClientMessage::Chat { text } => self.on_chat(connection_id, &text).await,
            ClientMessage::Hello { .. } => {
                self.registry.touch(connection_id).await;
            }
            ClientMessage::Presence { status } => self.on_presence(connection_id, status).await,
            ClientMessage::Typing { target, is_typing } => {
                self.on_typing(connection_id, target, is_typing).await;
            }
            ClientMessage::CanvasJoin { canvas_id } => {
                self.on_canvas_join(connection_id, &canvas_id).await;
            }
            ClientMessage::CanvasLeave { .. } => self.on_canvas_leave(connection_id).await,
            ClientMessage::CanvasFrameFocus { frame_id } => {
                self.on_frame_focus(connection_id, frame_id).await;
            }
            ClientMessage::CanvasLockRequest { action, frame_id } => {
                self.on_lock_request(connection_id, action, &frame_id).await;
            }
        }
    }

    /// Send to every open socket in the room except `except`.
    pub async fn broadcast<T: Serialize>(
        &self,
        workspace_id: &str,
        message: &T,
        except: Option<ConnectionId>,
    ) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };
        let delivered = self.registry.send_to_room(workspace_id, None, &frame, except).await;
        self.metrics.record_broadcast(delivered);
        delivered
    }

    /// Send to the sockets in the room currently viewing `canvas_id`.
    pub async fn broadcast_to_canvas<T: Serialize>(
        &self,
        workspace_id: &str,
        canvas_id: &str,
        message: &T,
        except: Option<ConnectionId>,
    ) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };
        let delivered =
            self.registry.send_to_room(workspace_id, Some(canvas_id), &frame, except).await;
        self.metrics.record_broadcast(delivered);
        delivered
    }

    /// Send to every socket of `user_id` in every workspace they are in.
    pub async fn broadcast_to_user<T: Serialize>(&self, user_id: &str, message: &T) -> usize {
        let workspaces = self.presence.workspaces_for(user_id).await;
        if workspaces.is_empty() {
            return 0;
        }
        let Some(frame) = encode(message) else {
            return 0;
        };

        let mut delivered = 0;
        for workspace_id in &workspaces {
            delivered += self.registry.send_to_user(workspace_id, user_id, &frame).await;
        }
        self.metrics.record_broadcast(delivered);
        delivered
    }

    pub async fn send_to<T: Serialize>(&self, connection_id: ConnectionId, message: &T) -> bool {
        match encode(message) {
            Some(frame) => self.registry.send_to_connection(connection_id, &frame).await,
            None => false,
        }
    }

    pub async fn members(&self, workspace_id: &str) -> Vec<ConnectionSnapshot> {
        self.registry.members(workspace_id).await
    }

    pub async fn canvas_viewers(&self, workspace_id: &str, canvas_id: &str) -> Vec<ConnectionSnapshot> {
        self.registry.canvas_viewers(workspace_id, canvas_id).await
    }

    pub async fn canvas_locks(&self, workspace_id: &str, canvas_id: &str) -> Vec<FrameLock> {
        self.locks.locks_for_canvas(workspace_id, canvas_id).await
    }

    /// Force-release leases past the timeout and announce each release to
    /// its canvas. Returns the number of locks released.
    pub async fn sweep_expired_locks(&self, now: DateTime<Utc>) -> usize {
        let expired = self.locks.sweep_expired(now).await;
        self.metrics.record_lock_event("expired", expired.len() as u64);

        for lock in &expired {
            info!(
                workspace_id = %lock.workspace_id,
                canvas_id = %lock.canvas_id,
                frame_id = %lock.frame_id,
                user_id = %lock.owner_id,
                "frame lock expired"
            );
            let message = released_message(lock);
            self.broadcast_to_canvas(&lock.workspace_id, &lock.canvas_id, &message, None).await;
        }

        expired.len()
    }

    async fn on_chat(&self, connection_id: ConnectionId, text: &str) {
        let Some(text) = normalize_chat_text(text) else {
            return;
        };
        let Some(snapshot) = self.registry.snapshot(connection_id).await else {
            return;
        };

        let message = ServerMessage::System {
            level: SystemLevel::Info,
            message: format!("{}: {text}", snapshot.display_name),
        };
        self.broadcast(&snapshot.workspace_id, &message, Some(connection_id)).await;
    }

    async fn on_presence(&self, connection_id: ConnectionId, status: PresenceStatus) {
        let Some(snapshot) = self.registry.set_status(connection_id, status).await else {
            return;
        };
        debug!(
            workspace_id = %snapshot.workspace_id,
            connection_id = %connection_id,
            status = status.as_str(),
            "presence updated"
        );

        self.broadcast(
            &snapshot.workspace_id,
            &presence_message(&snapshot, status),
            Some(connection_id),
        )
        .await;
    }

    async fn on_typing(&self, connection_id: ConnectionId, target: Option<String>, is_typing: bool) {
        let Some(snapshot) = self.registry.touch(connection_id).await else {
            return;
        };

        let message = ServerMessage::Typing {
            user_id: snapshot.user_id.clone(),
            display_name: snapshot.display_name.clone(),
            target,
            is_typing,
            at: Utc::now(),
        };
        self.broadcast(&snapshot.workspace_id, &message, Some(connection_id)).await;
    }

    async fn on_canvas_join(&self, connection_id: ConnectionId, canvas_id: &str) {
        let canvas_id = canvas_id.trim();
        if canvas_id.is_empty() {
            return;
        }
        let Some(previous) = self.registry.enter_canvas(connection_id, canvas_id).await else {
            return;
        };
        let Some(snapshot) = self.registry.snapshot(connection_id).await else {
            return;
        };
        let workspace_id = snapshot.workspace_id.as_str();

        if let Some(previous) = previous.as_deref().filter(|previous| *previous != canvas_id) {
            self.broadcast_to_canvas(
                workspace_id,
                previous,
                &canvas_presence_message(&snapshot, CanvasPresenceAction::Left, previous, None),
                Some(connection_id),
            )
            .await;
        }

        self.broadcast_to_canvas(
            workspace_id,
            canvas_id,
            &canvas_presence_message(&snapshot, CanvasPresenceAction::Viewing, canvas_id, None),
            Some(connection_id),
        )
        .await;

        debug!(
            workspace_id = %workspace_id,
            connection_id = %connection_id,
            canvas_id = %canvas_id,
            "canvas joined"
        );

        // Snapshot for the joiner only: who else is here and what is locked.
        for viewer in self.registry.canvas_viewers(workspace_id, canvas_id).await {
            if viewer.connection_id == connection_id {
                continue;
            }
            let message = canvas_presence_message(
                &viewer,
                CanvasPresenceAction::Viewing,
                canvas_id,
                viewer.focused_frame_id.clone(),
            );
            self.send_to(connection_id, &message).await;
        }
        for lock in self.locks.locks_for_canvas(workspace_id, canvas_id).await {
            self.send_to(connection_id, &lock_message(CanvasLockAction::Acquired, &lock)).await;
        }
    }

    async fn on_canvas_leave(&self, connection_id: ConnectionId) {
        let Some(snapshot) = self.registry.snapshot(connection_id).await else {
            return;
        };
        let workspace_id = snapshot.workspace_id.as_str();

        if let Some(user_id) = snapshot.user_id.as_deref() {
            self.release_all_locks(workspace_id, user_id, connection_id).await;
        }

        if let Some(canvas_id) = self.registry.exit_canvas(connection_id).await {
            self.broadcast_to_canvas(
                workspace_id,
                &canvas_id,
                &canvas_presence_message(&snapshot, CanvasPresenceAction::Left, &canvas_id, None),
                Some(connection_id),
            )
            .await;
        }
    }

    async fn on_frame_focus(&self, connection_id: ConnectionId, frame_id: Option<String>) {
        let frame_id = frame_id.filter(|frame_id| !frame_id.trim().is_empty());
        let Some(snapshot) = self.registry.set_focus(connection_id, frame_id.clone()).await else {
            return;
        };
        let Some(canvas_id) = snapshot.canvas_id.as_deref() else {
            return;
        };

        self.broadcast_to_canvas(
            &snapshot.workspace_id,
            canvas_id,
            &canvas_presence_message(&snapshot, CanvasPresenceAction::Viewing, canvas_id, frame_id),
            Some(connection_id),
        )
        .await;
    }

    async fn on_lock_request(
        &self,
        connection_id: ConnectionId,
        action: LockRequestAction,
        frame_id: &str,
    ) {
        let Some(snapshot) = self.registry.snapshot(connection_id).await else {
            return;
        };
        let (Some(user_id), Some(canvas_id)) =
            (snapshot.user_id.as_deref(), snapshot.canvas_id.as_deref())
        else {
            debug!(
                connection_id = %connection_id,
                frame_id = %frame_id,
                "ignoring lock request without identity or canvas"
            );
            return;
        };
        if frame_id.trim().is_empty() {
            return;
        }
        let workspace_id = snapshot.workspace_id.as_str();

        match action {
            LockRequestAction::Acquire => {
                let outcome = self
                    .locks
                    .acquire(
                        workspace_id,
                        canvas_id,
                        frame_id,
                        user_id,
                        &snapshot.display_name,
                        Utc::now(),
                    )
                    .await;

                match outcome {
                    AcquireOutcome::Granted { lock, refreshed } => {
                        self.metrics.record_lock_event("granted", 1);
                        debug!(
                            workspace_id = %workspace_id,
                            canvas_id = %canvas_id,
                            frame_id = %frame_id,
                            user_id = %user_id,
                            refreshed,
                            "frame lock granted"
                        );
                        self.broadcast_to_canvas(
                            workspace_id,
                            canvas_id,
                            &lock_message(CanvasLockAction::Acquired, &lock),
                            None,
                        )
                        .await;
                        self.broadcast_to_canvas(
                            workspace_id,
                            canvas_id,
                            &canvas_presence_message(
                                &snapshot,
                                CanvasPresenceAction::Editing,
                                canvas_id,
                                Some(frame_id.to_string()),
                            ),
                            Some(connection_id),
                        )
                        .await;
                    }
                    AcquireOutcome::Denied { holder } => {
                        self.metrics.record_lock_event("denied", 1);
                        debug!(
                            workspace_id = %workspace_id,
                            canvas_id = %canvas_id,
                            frame_id = %frame_id,
                            user_id = %user_id,
                            holder_id = %holder.owner_id,
                            "frame lock denied"
                        );
                        let mut denied = lock_message(CanvasLockAction::Denied, &holder);
                        if let ServerMessage::CanvasLock { acquired_at, .. } = &mut denied {
                            *acquired_at = None;
                        }
                        self.send_to(connection_id, &denied).await;
                    }
                }
            }
            LockRequestAction::Release => {
                let Some(lock) = self.locks.release(workspace_id, canvas_id, frame_id, user_id).await
                else {
                    return;
                };
                self.metrics.record_lock_event("released", 1);
                debug!(
                    workspace_id = %workspace_id,
                    canvas_id = %canvas_id,
                    frame_id = %frame_id,
                    user_id = %user_id,
                    "frame lock released"
                );

                self.broadcast_to_canvas(workspace_id, canvas_id, &released_message(&lock), None)
                    .await;
                self.broadcast_to_canvas(
                    workspace_id,
                    canvas_id,
                    &canvas_presence_message(
                        &snapshot,
                        CanvasPresenceAction::Viewing,
                        canvas_id,
                        snapshot.focused_frame_id.clone(),
                    ),
                    Some(connection_id),
                )
                .await;
            }
        }
    }

    async fn release_all_locks(&self, workspace_id: &str, user_id: &str, connection_id: ConnectionId) {
        let released = self.locks.release_all_for_owner(workspace_id, user_id).await;
        if released.is_empty() {
            return;
        }
        self.metrics.record_lock_event("released", released.len() as u64);

        for lock in &released {
            debug!(
                workspace_id = %workspace_id,
                canvas_id = %lock.canvas_id,
                frame_id = %lock.frame_id,
                user_id = %user_id,
                "frame lock released on leave"
            );
            self.broadcast_to_canvas(
                workspace_id,
                &lock.canvas_id,
                &released_message(lock),
                Some(connection_id),
            )
            .await;
        }
    }
}

fn encode<T: Serialize>(message: &T) -> Option<OutboundFrame> {
    match serde_json::to_string(message) {
        Ok(text) => Some(OutboundFrame::from(text)),
        Err(error) => {
            warn!(error = %error, "failed to encode outbound websocket message");
            None
        }
    }
}

fn presence_message(snapshot: &ConnectionSnapshot, status: PresenceStatus) -> ServerMessage {
    ServerMessage::Presence {
        user_id: snapshot.user_id.clone(),
        display_name: snapshot.display_name.clone(),
        status,
        at: Utc::now(),
    }
}

fn canvas_presence_message(
    snapshot: &ConnectionSnapshot,
    action: CanvasPresenceAction,
    canvas_id: &str,
    frame_id: Option<String>,
) -> ServerMessage {
    ServerMessage::CanvasPresence {
        action,
        canvas_id: canvas_id.to_string(),
        user_id: snapshot.user_id.clone(),
        display_name: snapshot.display_name.clone(),
        frame_id,
    }
}

fn lock_message(action: CanvasLockAction, lock: &FrameLock) -> ServerMessage {
    ServerMessage::CanvasLock {
        action,
        canvas_id: lock.canvas_id.clone(),
        frame_id: lock.frame_id.clone(),
        user_id: Some(lock.owner_id.clone()),
        display_name: Some(lock.owner_name.clone()),
        acquired_at: Some(lock.acquired_at),
    }
}

// Explicit release, leave cleanup and expiry all share this shape. It is
// sent after the lock table guard is dropped, so a `released` for the old
// holder can reach viewers after the next holder's `acquired`; clients match
// it on `userId` as well as `frameId`.
fn released_message(lock: &FrameLock) -> ServerMessage {
    ServerMessage::CanvasLock {
        action: CanvasLockAction::Released,
        canvas_id: lock.canvas_id.clone(),
        frame_id: lock.frame_id.clone(),
        user_id: Some(lock.owner_id.clone()),
        display_name: Some(lock.owner_name.clone()),
        acquired_at: None,
    }
}
