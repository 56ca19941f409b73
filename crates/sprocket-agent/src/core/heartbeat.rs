use std::sync::{Arc, Mutex};
use std::time::Duration;

use sprocket_proto::HeartbeatRequest;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::ControlClient;
use super::io::IoStats;

/// Periodically signals liveness with a snapshot of the in-flight input.
/// Failures are logged and swallowed: the server reaps a container by
/// missing heartbeats, the loop itself never kills the process.
pub async fn run_heartbeat_loop(
    client: Arc<ControlClient>,
    task_id: String,
    stats: Arc<Mutex<IoStats>>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so heartbeats start one
    // interval after the loop does.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("heartbeat loop stopping");
                break;
            }
            _ = ticker.tick() => {
                let (current_input_id, current_input_started_at) = {
                    let stats = stats.lock().expect("stats lock poisoned");
                    (
                        stats.current_input_id.clone(),
                        stats.current_input_started_at,
                    )
                };
                let request = HeartbeatRequest {
                    task_id: task_id.clone(),
                    current_input_id,
                    current_input_started_at,
                };
                if let Err(err) = client.heartbeat(&request).await {
                    warn!("heartbeat failed: error={err}");
                }
            }
        }
    }
}
