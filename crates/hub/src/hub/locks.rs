// Frame lock leases.
//
// - acquire grants a free frame or renews the caller's own lease
// - a frame held by someone else is denied, never queued
// - release only succeeds for the current owner
// - leases older than the timeout are removed by `sweep_expired`

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameLock {
    pub workspace_id: String,
    pub canvas_id: String,
    pub frame_id: String,
    pub owner_id: String,
    pub owner_name: String,
    pub acquired_at: DateTime<Utc>,
}

impl FrameLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.acquired_at > timeout
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted { lock: FrameLock, refreshed: bool },
    Denied { holder: FrameLock },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FrameLockKey {
    workspace_id: String,
    canvas_id: String,
    frame_id: String,
}

/// Single-writer lease table for canvas frames.
#[derive(Clone)]
pub struct FrameLockManager {
    locks: Arc<RwLock<HashMap<FrameLockKey, FrameLock>>>,
    timeout: Duration,
}

impl FrameLockManager {
    pub fn new(timeout: std::time::Duration) -> Self {
        let timeout = Duration::from_std(timeout).unwrap_or_else(|_| Duration::seconds(60));
        Self { locks: Arc::new(RwLock::new(HashMap::new())), timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn acquire(
        &self,
        workspace_id: &str,
        canvas_id: &str,
        frame_id: &str,
        owner_id: &str,
        owner_name: &str,
        now: DateTime<Utc>,
    ) -> AcquireOutcome {
        let key = FrameLockKey {
            workspace_id: workspace_id.to_string(),
            canvas_id: canvas_id.to_string(),
            frame_id: frame_id.to_string(),
        };

        let mut locks = self.locks.write().await;
        if let Some(existing) = locks.get_mut(&key) {
            if existing.owner_id != owner_id {
                return AcquireOutcome::Denied { holder: existing.clone() };
            }

            existing.acquired_at = now;
            existing.owner_name = owner_name.to_string();
            return AcquireOutcome::Granted { lock: existing.clone(), refreshed: true };
        }

        let lock = FrameLock {
            workspace_id: key.workspace_id.clone(),
            canvas_id: key.canvas_id.clone(),
            frame_id: key.frame_id.clone(),
            owner_id: owner_id.to_string(),
            owner_name: owner_name.to_string(),
            acquired_at: now,
        };
        locks.insert(key, lock.clone());

        AcquireOutcome::Granted { lock, refreshed: false }
    }

    /// Release a lock if `owner_id` holds it. Returns the released lock.
    pub async fn release(
        &self,
        workspace_id: &str,
        canvas_id: &str,
        frame_id: &str,
        owner_id: &str,
    ) -> Option<FrameLock> {
        let key = FrameLockKey {
            workspace_id: workspace_id.to_string(),
            canvas_id: canvas_id.to_string(),
            frame_id: frame_id.to_string(),
        };

        let mut locks = self.locks.write().await;
        if locks.get(&key)?.owner_id != owner_id {
            return None;
        }
        locks.remove(&key)
    }

    /// Release every lock `owner_id` holds anywhere in the workspace.
    pub async fn release_all_for_owner(&self, workspace_id: &str, owner_id: &str) -> Vec<FrameLock> {
        let mut locks = self.locks.write().await;
        let keys: Vec<FrameLockKey> = locks
            .iter()
            .filter(|(key, lock)| key.workspace_id == workspace_id && lock.owner_id == owner_id)
            .map(|(key, _)| key.clone())
            .collect();

        sorted(keys.iter().filter_map(|key| locks.remove(key)).collect())
    }

    pub async fn locks_for_canvas(&self, workspace_id: &str, canvas_id: &str) -> Vec<FrameLock> {
        let locks = self.locks.read().await;
        sorted(
            locks
                .values()
                .filter(|lock| lock.workspace_id == workspace_id && lock.canvas_id == canvas_id)
                .cloned()
                .collect(),
        )
    }

    /// Remove leases older than the timeout. Returns what was removed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<FrameLock> {
        let mut locks = self.locks.write().await;
        let mut expired = Vec::new();
        locks.retain(|_, lock| {
            if lock.is_expired_at(now, self.timeout) {
                expired.push(lock.clone());
                false
            } else {
                true
            }
        });

        sorted(expired)
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }
}

fn sorted(mut locks: Vec<FrameLock>) -> Vec<FrameLock> {
    locks.sort_by(|left, right| {
        (&left.workspace_id, &left.canvas_id, &left.frame_id).cmp(&(
            &right.workspace_id,
            &right.canvas_id,
            &right.frame_id,
        ))
    });
    locks
}
