use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::config::MinionConfig;
use crate::protocol::{Heartbeat, JobId, Message, MinionId};

/// Periodically tells the master a job is still running.
#[derive(Debug, Clone)]
pub struct HeartbeatSender {
    interval: Duration,
    extend_by: Duration,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64, extension_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            extend_by: Duration::from_millis(extension_ms),
        }
    }

    pub fn from_config(config: &MinionConfig) -> Self {
        Self::new(config.heartbeat_interval_ms, config.heartbeat_extension_ms)
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Sends a heartbeat for `job_id` every interval until the receiver is
    /// dropped or the task is aborted. The first one goes out after one
    /// full interval.
    pub async fn run(
        &self,
        job_id: JobId,
        minion_id: MinionId,
        clock: Arc<dyn Clock>,
        tx: mpsc::Sender<Message>,
    ) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);

        loop {
            interval.tick().await;
            let heartbeat = Heartbeat {
                job_id: job_id.clone(),
                minion_id: minion_id.clone(),
                sent_at: clock.now(),
                extend_by: self.extend_by,
            };
            if tx.send(Message::Heartbeat(heartbeat)).await.is_err() {
                // Receiver dropped, stop sending
                break;
            }
        }
    }
}
