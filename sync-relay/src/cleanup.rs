//! Background liveness sweep.
//!
//! Runs periodically to evict devices that stopped heartbeating and to drop
//! expired pairing tokens.

use crate::config::LivenessConfig;
use crate::server::{Command, RelayHandle};
use tokio::time::interval;

/// Spawn the liveness sweep task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_liveness_sweep(
    relay: RelayHandle,
    config: LivenessConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Liveness sweep disabled");
            return;
        }

        let period = config.sweep_interval();
        tracing::info!(
            "Liveness sweep started (interval: {}s, timeout: {}s)",
            period.as_secs(),
            config.timeout_secs
        );

        let mut timer = interval(period);
        // The first tick completes immediately
        timer.tick().await;

        loop {
            timer.tick().await;
            if relay.send(Command::Sweep).is_err() {
                tracing::error!("Liveness sweep stopping: coordinator gone");
                return;
            }
        }
    })
}
