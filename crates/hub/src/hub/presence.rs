use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

/// Index of `user -> workspace -> open connection count`.
///
/// A workspace disappears from a user's set when its count reaches zero, and
/// the user entry disappears with its last workspace.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    users: Arc<RwLock<HashMap<String, HashMap<String, usize>>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, user_id: &str, workspace_id: &str) {
        let mut users = self.users.write().await;
        *users
            .entry(user_id.to_string())
            .or_default()
            .entry(workspace_id.to_string())
            .or_insert(0) += 1;
    }

    /// Returns true when this was the user's last connection to the workspace.
    pub async fn untrack(&self, user_id: &str, workspace_id: &str) -> bool {
        let mut users = self.users.write().await;
        let Some(workspaces) = users.get_mut(user_id) else {
            return false;
        };
        let Some(count) = workspaces.get_mut(workspace_id) else {
            return false;
        };

        *count = count.saturating_sub(1);
        if *count > 0 {
            return false;
        }

        workspaces.remove(workspace_id);
        if workspaces.is_empty() {
            users.remove(user_id);
        }
        true
    }

    pub async fn workspaces_for(&self, user_id: &str) -> Vec<String> {
        let users = self.users.read().await;
        let mut workspaces: Vec<String> =
            users.get(user_id).map(|entry| entry.keys().cloned().collect()).unwrap_or_default();
        workspaces.sort();
        workspaces
    }

    pub async fn tracked_users(&self) -> usize {
        self.users.read().await.len()
    }
}
