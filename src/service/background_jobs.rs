// service/background_jobs.rs
use std::sync::Arc;

use tokio::time::{interval, Duration};

use crate::AppState;

/// Drops realtime connections that stopped sending frames.
pub async fn start_heartbeat_job(app_state: Arc<AppState>) {
    let mut interval = interval(Duration::from_secs(app_state.env.heartbeat_sweep_secs.max(1)));
    interval.tick().await;

    loop {
        interval.tick().await;

        let dropped = app_state.live_chat.sweep_heartbeats().await;
        if dropped > 0 {
            tracing::info!("heartbeat sweep dropped {} stale connections", dropped);
        }
    }
}

/// Ends waits that exceeded the configured maximum and retries matching for
/// businesses that still have customers waiting.
pub async fn start_queue_expiry_job(app_state: Arc<AppState>) {
    let mut interval = interval(Duration::from_secs(30));
    interval.tick().await;

    loop {
        interval.tick().await;

        let expired = app_state
            .live_chat
            .expire_abandoned(chrono::Utc::now())
            .await;
        if expired > 0 {
            tracing::info!("queue sweep ended {} abandoned waits", expired);
        }

        for business_id in app_state.queue.businesses_with_waiting() {
            let matched = app_state.live_chat.run_matching(business_id).await;
            if matched > 0 {
                tracing::info!("queue sweep matched {} waiting customers for {}", matched, business_id);
            }
        }
    }
}
