use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tracing::debug;

use super::Hub;

/// Handle through which route handlers and background jobs push events to
/// connected clients.
///
/// Created detached at the composition root and handed to every consumer;
/// the hub is installed once it is running. Until then every call is a
/// no-op returning zero deliveries. Delivery never fails the caller.
#[derive(Clone, Default)]
pub struct EventRouter {
    hub: Arc<OnceLock<Hub>>,
}

impl EventRouter {
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn with_hub(hub: Hub) -> Self {
        let router = Self::detached();
        router.install(hub);
        router
    }

    /// Install the hub. Returns false if one was already installed.
    pub fn install(&self, hub: Hub) -> bool {
        self.hub.set(hub).is_ok()
    }

    pub fn is_installed(&self) -> bool {
        self.hub.get().is_some()
    }

    pub fn hub(&self) -> Option<&Hub> {
        self.hub.get()
    }

    pub async fn ws_broadcast(&self, workspace_id: &str, event: &Value) -> usize {
        let Some(hub) = self.hub.get() else {
            debug!(workspace_id = %workspace_id, "dropping workspace event; hub not installed");
            return 0;
        };
        hub.broadcast(workspace_id, event, None).await
    }

    pub async fn ws_broadcast_to_canvas(
        &self,
        workspace_id: &str,
        canvas_id: &str,
        event: &Value,
    ) -> usize {
        let Some(hub) = self.hub.get() else {
            debug!(
                workspace_id = %workspace_id,
                canvas_id = %canvas_id,
                "dropping canvas event; hub not installed"
            );
            return 0;
        };
        hub.broadcast_to_canvas(workspace_id, canvas_id, event, None).await
    }

    pub async fn broadcast_to_user(&self, user_id: &str, event: &Value) -> usize {
        let Some(hub) = self.hub.get() else {
            debug!(user_id = %user_id, "dropping user event; hub not installed");
            return 0;
        };
        hub.broadcast_to_user(user_id, event).await
    }
}
