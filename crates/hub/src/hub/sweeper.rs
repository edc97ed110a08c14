use std::time::Duration;

use chrono::Utc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

use super::Hub;

/// Periodically force-release frame locks whose lease has run out.
///
/// The returned handle is aborted on shutdown.
pub fn spawn_lock_sweeper(hub: Hub, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let released = hub.sweep_expired_locks(Utc::now()).await;
            if released > 0 {
                debug!(released, "lock sweep released expired frame locks");
            }
        }
    })
}
