use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::{add_duration, Clock};
use crate::error::RegistryError;
use crate::events::{EventEmitter, LifecycleEvent};
use crate::protocol::{decode, ControlAck, Heartbeat, Message, MinionResult};
use crate::returner::ReturnerSink;
use crate::scheduler::job::{JobRecord, JobState};
use crate::scheduler::registry::{JobRegistry, SweepReport};
use crate::session::SessionLayer;
use crate::transport::Inbound;

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Result recorded, job still open
    Accepted,
    /// Result recorded and it completed the job
    Completed,
    /// Job already terminal; nothing changed
    Late,
    Duplicate,
    UnknownJob,
    /// Sender is not a target of the job, or spoofs another minion
    Unexpected,
    HeartbeatApplied,
    HeartbeatIgnored,
    AckForwarded,
    RejectedDecrypt,
    RejectedCodec,
    /// A kind the master never expects to receive
    Ignored,
}

#[derive(Debug, Default)]
pub struct CollectorStats {
    accepted: AtomicU64,
    late: AtomicU64,
    duplicates: AtomicU64,
    unknown_job: AtomicU64,
    unexpected: AtomicU64,
    heartbeats: AtomicU64,
    acks: AtomicU64,
    rejected_decrypt: AtomicU64,
    rejected_codec: AtomicU64,
    sunk: AtomicU64,
    sink_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub late: u64,
    pub duplicates: u64,
    pub unknown_job: u64,
    pub unexpected: u64,
    pub heartbeats: u64,
    pub acks: u64,
    pub rejected_decrypt: u64,
    pub rejected_codec: u64,
    pub sunk: u64,
    pub sink_failures: u64,
}

impl StatsSnapshot {
    /// Frames dropped before reaching the registry.
    pub fn rejected(&self) -> u64 {
        self.rejected_decrypt + self.rejected_codec
    }
}

impl CollectorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            accepted: load(&self.accepted),
            late: load(&self.late),
            duplicates: load(&self.duplicates),
            unknown_job: load(&self.unknown_job),
            unexpected: load(&self.unexpected),
            heartbeats: load(&self.heartbeats),
            acks: load(&self.acks),
            rejected_decrypt: load(&self.rejected_decrypt),
            rejected_codec: load(&self.rejected_codec),
            sunk: load(&self.sunk),
            sink_failures: load(&self.sink_failures),
        }
    }
}

/// Receives minion replies and folds them into the registry.
///
/// A bad frame is dropped and counted; nothing here can stop the receive
/// loop. Returner calls run on spawned tasks, so [`Collector::on_message`]
/// and [`Collector::sweep`] must be called inside a tokio runtime.
pub struct Collector {
    registry: Arc<JobRegistry>,
    sessions: Arc<SessionLayer>,
    returner: Option<Arc<dyn ReturnerSink>>,
    acks: Option<mpsc::UnboundedSender<ControlAck>>,
    clock: Arc<dyn Clock>,
    events: EventEmitter,
    returner_retry_delay: Duration,
    stats: Arc<CollectorStats>,
}

impl Collector {
    pub fn new(
        registry: Arc<JobRegistry>,
        sessions: Arc<SessionLayer>,
        clock: Arc<dyn Clock>,
        events: EventEmitter,
    ) -> Self {
        Self {
            registry,
            sessions,
            returner: None,
            acks: None,
            clock,
            events,
            returner_retry_delay: Duration::from_millis(500),
            stats: Arc::new(CollectorStats::default()),
        }
    }

    pub fn with_returner(mut self, returner: Arc<dyn ReturnerSink>, retry_delay: Duration) -> Self {
        self.returner = Some(returner);
        self.returner_retry_delay = retry_delay;
        self
    }

    /// Control acknowledgements are forwarded here.
    pub fn with_ack_sink(mut self, acks: mpsc::UnboundedSender<ControlAck>) -> Self {
        self.acks = Some(acks);
        self
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn on_message(&self, peer: &str, raw: &[u8]) -> Disposition {
        let plaintext = match self.sessions.decrypt(peer, raw) {
            Ok(p) => p,
            Err(e) => {
                CollectorStats::bump(&self.stats.rejected_decrypt);
                tracing::warn!(peer, error = %e, "Dropped undecryptable frame");
                return Disposition::RejectedDecrypt;
            }
        };
        let message = match decode(&plaintext) {
            Ok((_, message)) => message,
            Err(e) => {
                CollectorStats::bump(&self.stats.rejected_codec);
                tracing::warn!(peer, error = %e, "Dropped malformed frame");
                return Disposition::RejectedCodec;
            }
        };

        match message {
            Message::Result(result) => self.on_result(peer, result),
            Message::Heartbeat(heartbeat) => self.on_heartbeat(peer, heartbeat),
            Message::ControlAck(ack) => self.on_ack(peer, ack),
            other => {
                tracing::debug!(peer, kind = %other.kind(), "Ignoring unexpected message kind");
                Disposition::Ignored
            }
        }
    }

    fn on_result(&self, peer: &str, mut result: MinionResult) -> Disposition {
        if result.minion_id != peer {
            CollectorStats::bump(&self.stats.unexpected);
            tracing::warn!(peer, claimed = %result.minion_id, job_id = %result.job_id, "Result claims another minion");
            return Disposition::Unexpected;
        }
        let job_id = result.job_id.clone();
        result.received_at = self.clock.now();

        match self.registry.record_result(result) {
            Ok(updated) if !updated.accepted => {
                CollectorStats::bump(&self.stats.late);
                tracing::debug!(job_id = %job_id, minion_id = peer, state = %updated.state, "Late result");
                Disposition::Late
            }
            Ok(updated) => {
                CollectorStats::bump(&self.stats.accepted);
                tracing::debug!(job_id = %job_id, minion_id = peer, state = %updated.state, "Result recorded");
                if updated.first_result {
                    self.events
                        .emit(LifecycleEvent::job_results_start(&job_id, peer, self.clock.now()));
                }
                match updated.finalized {
                    Some(record) => {
                        self.finish(record);
                        Disposition::Completed
                    }
                    None => Disposition::Accepted,
                }
            }
            Err(RegistryError::DuplicateResult { .. }) => {
                CollectorStats::bump(&self.stats.duplicates);
                tracing::info!(job_id = %job_id, minion_id = peer, "Duplicate result ignored");
                Disposition::Duplicate
            }
            Err(RegistryError::UnknownJob(_)) => {
                CollectorStats::bump(&self.stats.unknown_job);
                tracing::debug!(job_id = %job_id, minion_id = peer, "Result for unknown job");
                Disposition::UnknownJob
            }
            Err(e) => {
                CollectorStats::bump(&self.stats.unexpected);
                tracing::warn!(job_id = %job_id, minion_id = peer, error = %e, "Result rejected");
                Disposition::Unexpected
            }
        }
    }

    fn on_heartbeat(&self, peer: &str, heartbeat: Heartbeat) -> Disposition {
        if heartbeat.minion_id != peer {
            CollectorStats::bump(&self.stats.unexpected);
            return Disposition::Unexpected;
        }
        let new_deadline = add_duration(self.clock.now(), heartbeat.extend_by);
        match self
            .registry
            .extend_deadline(&heartbeat.job_id, peer, new_deadline)
        {
            Ok(true) => {
                CollectorStats::bump(&self.stats.heartbeats);
                tracing::trace!(job_id = %heartbeat.job_id, minion_id = peer, deadline = %new_deadline, "Deadline extended");
                Disposition::HeartbeatApplied
            }
            Ok(false) => Disposition::HeartbeatIgnored,
            Err(RegistryError::UnknownJob(_)) => {
                CollectorStats::bump(&self.stats.unknown_job);
                Disposition::UnknownJob
            }
            Err(e) => {
                CollectorStats::bump(&self.stats.unexpected);
                tracing::warn!(job_id = %heartbeat.job_id, minion_id = peer, error = %e, "Heartbeat rejected");
                Disposition::Unexpected
            }
        }
    }

    fn on_ack(&self, peer: &str, ack: ControlAck) -> Disposition {
        if ack.minion_id != peer {
            CollectorStats::bump(&self.stats.unexpected);
            return Disposition::Unexpected;
        }
        CollectorStats::bump(&self.stats.acks);
        tracing::debug!(job_id = %ack.job_id, minion_id = peer, was_running = ack.was_running, "Control ack");
        if let Some(acks) = &self.acks {
            if acks.send(ack).is_err() {
                tracing::debug!(minion_id = peer, "Ack receiver dropped");
            }
        }
        Disposition::AckForwarded
    }

    /// Closes expired jobs and hands newly completed ones to the returner.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let report = self.registry.sweep(now);
        for record in &report.completed {
            self.finish(record.clone());
        }
        for record in &report.timed_out {
            self.events.emit(LifecycleEvent::job_results_end(
                record.job_id(),
                &JobState::TimedOut.to_string(),
                0,
                now,
            ));
            tracing::info!(job_id = %record.job_id(), targets = record.request.tgt_minions.len(), "Job timed out with no results");
        }
        report
    }

    fn finish(&self, record: JobRecord) {
        tracing::info!(
            job_id = %record.job_id(),
            results = record.results.len(),
            missing = record.missing().len(),
            partial = record.is_partial(),
            "Job complete"
        );
        self.events.emit(LifecycleEvent::job_results_end(
            record.job_id(),
            &record.state.to_string(),
            record.results.len(),
            self.clock.now(),
        ));
        self.sink(record);
    }

    fn sink(&self, record: JobRecord) {
        let Some(returner) = self.returner.clone() else {
            CollectorStats::bump(&self.stats.sunk);
            return;
        };
        let stats = self.stats.clone();
        let retry_delay = self.returner_retry_delay;

        tokio::spawn(async move {
            let job_id = record.job_id().clone();
            let first = match returner.store(&record).await {
                Ok(()) => {
                    CollectorStats::bump(&stats.sunk);
                    return;
                }
                Err(e) => e,
            };
            tracing::warn!(job_id = %job_id, error = %first, "Returner failed, retrying once");
            tokio::time::sleep(retry_delay).await;
            match returner.store(&record).await {
                Ok(()) => CollectorStats::bump(&stats.sunk),
                Err(e) => {
                    CollectorStats::bump(&stats.sink_failures);
                    tracing::error!(job_id = %job_id, error = %e, "Returner failed, record dropped");
                }
            }
        });
    }

    /// Drains inbound frames until the token is cancelled or the channel closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Inbound>, token: CancellationToken) {
        tracing::info!("Collector started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Collector stopping");
                    break;
                }
                frame = inbound.recv() => {
                    match frame {
                        Some(frame) => {
                            self.on_message(&frame.peer, &frame.payload);
                        }
                        None => {
                            tracing::info!("Inbound channel closed, collector stopping");
                            break;
                        }
                    }
                }
            }
        }
    }
}
