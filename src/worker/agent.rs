//! Minion receive loop.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::MinionConfig;
use crate::error::{Error, ExecutionError, SessionError};
use crate::events::{EventEmitter, LifecycleEvent};
use crate::protocol::{
    decode, encode_message, AckKind, CancelNotice, ControlAck, JobId, JobRequest, Message, MinionResult,
};
use crate::session::{Handshake, SessionLayer};
use crate::transport::{Inbound, ReplyChannel};
use crate::worker::capability::{CallContext, CapabilityRegistry};
use crate::worker::heartbeat::HeartbeatSender;

const QUEUE_DEPTH: usize = 256;

/// Recently seen job ids, bounded at the high-water mark.
#[derive(Debug)]
struct RecentJobs {
    order: VecDeque<JobId>,
    seen: HashSet<JobId>,
    hwm: usize,
}

impl RecentJobs {
    fn new(hwm: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            hwm: hwm.max(1),
        }
    }

    /// Returns false if the id was already seen.
    fn insert(&mut self, job_id: &JobId) -> bool {
        if self.seen.contains(job_id) {
            return false;
        }
        self.order.push_back(job_id.clone());
        self.seen.insert(job_id.clone());
        while self.order.len() > self.hwm {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

struct AgentInner {
    config: Arc<MinionConfig>,
    sessions: Arc<SessionLayer>,
    channel: Arc<dyn ReplyChannel>,
    capabilities: Arc<CapabilityRegistry>,
    grains: Arc<Value>,
    clock: Arc<dyn Clock>,
    events: EventEmitter,
    handshake: Option<Arc<dyn Handshake>>,
    heartbeat: HeartbeatSender,
    recent: Mutex<RecentJobs>,
    running: DashSet<JobId>,
}

/// Runs jobs published to this minion and sends back results, heartbeats
/// and control acknowledgements.
#[derive(Clone)]
pub struct MinionAgent {
    inner: Arc<AgentInner>,
}

impl MinionAgent {
    pub fn new(
        config: MinionConfig,
        sessions: Arc<SessionLayer>,
        channel: Arc<dyn ReplyChannel>,
        capabilities: Arc<CapabilityRegistry>,
        grains: Value,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let heartbeat = HeartbeatSender::from_config(&config);
        let hwm = config.jid_queue_hwm;
        Self {
            inner: Arc::new(AgentInner {
                config: Arc::new(config),
                sessions,
                channel,
                capabilities,
                grains: Arc::new(grains),
                clock,
                events: EventEmitter::default(),
                handshake: None,
                heartbeat,
                recent: Mutex::new(RecentJobs::new(hwm)),
                running: DashSet::new(),
            }),
        }
    }

    /// Must be applied before the agent is cloned or started.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.events = events;
        }
        self
    }

    /// Used to re-authenticate once when the session expires while replying.
    /// Must be applied before the agent is cloned or started.
    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.handshake = Some(handshake);
        }
        self
    }

    pub fn minion_id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.inner.running.iter().map(|j| j.key().clone()).collect()
    }

    /// Registers for inbound frames and processes them until cancelled.
    pub async fn run(self, token: CancellationToken) {
        let (tx, mut inbound) = mpsc::channel(QUEUE_DEPTH);
        self.inner.channel.on_receive(tx);

        let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
        let writer = tokio::spawn(Self::write_loop(self.inner.clone(), out_rx));

        tracing::info!(minion_id = %self.inner.config.id, "Minion agent started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(frame, &out_tx),
                    None => break,
                },
            }
        }
        drop(out_tx);
        let _ = writer.await;
        tracing::info!(minion_id = %self.inner.config.id, "Minion agent stopped");
    }

    fn handle_frame(&self, frame: Inbound, out: &mpsc::Sender<Message>) {
        let inner = &self.inner;
        if frame.peer != inner.config.master_id {
            tracing::warn!(peer = %frame.peer, "Frame from unknown master dropped");
            return;
        }
        let plaintext = match inner.sessions.decrypt(&frame.peer, &frame.payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Dropped undecryptable frame");
                return;
            }
        };
        match decode(&plaintext) {
            Ok((_, Message::Job(request))) => self.accept_job(request, out),
            Ok((_, Message::Cancel(notice))) => self.acknowledge_cancel(notice, out),
            Ok((_, other)) => {
                tracing::debug!(kind = %other.kind(), "Ignoring unexpected message kind");
            }
            Err(e) => tracing::warn!(error = %e, "Dropped malformed frame"),
        }
    }

    fn accept_job(&self, request: JobRequest, out: &mpsc::Sender<Message>) {
        let inner = &self.inner;
        if !request.targets(&inner.config.id) {
            tracing::debug!(job_id = %request.job_id, "Job not targeted at this minion");
            return;
        }
        if !inner.recent.lock().insert(&request.job_id) {
            tracing::debug!(job_id = %request.job_id, "Duplicate job ignored");
            return;
        }

        inner.events.emit(LifecycleEvent::job_taken_by_minion(
            &request.job_id,
            &inner.config.id,
            inner.clock.now(),
        ));
        inner.running.insert(request.job_id.clone());

        let inner = inner.clone();
        let out = out.clone();
        tokio::spawn(async move {
            let heartbeat = inner.heartbeat.is_enabled().then(|| {
                let sender = inner.heartbeat.clone();
                let job_id = request.job_id.clone();
                let minion_id = inner.config.id.clone();
                let clock = inner.clock.clone();
                let out = out.clone();
                tokio::spawn(async move { sender.run(job_id, minion_id, clock, out).await })
            });

            let result = execute(&inner, &request).await;

            if let Some(handle) = heartbeat {
                handle.abort();
            }
            inner.running.remove(&request.job_id);
            inner.events.emit(LifecycleEvent::job_fulfilled_by_minion(
                &result.job_id,
                &result.minion_id,
                result.retcode,
                inner.clock.now(),
            ));
            if out.send(Message::Result(result)).await.is_err() {
                tracing::warn!(job_id = %request.job_id, "Agent stopped before result was sent");
            }
        });
    }

    fn acknowledge_cancel(&self, notice: CancelNotice, out: &mpsc::Sender<Message>) {
        let inner = &self.inner;
        let was_running = inner.running.contains(&notice.job_id);
        tracing::info!(job_id = %notice.job_id, was_running, "Cancel notice received");
        let ack = ControlAck {
            job_id: notice.job_id,
            minion_id: inner.config.id.clone(),
            kind: AckKind::Cancel,
            was_running,
        };
        if out.try_send(Message::ControlAck(ack)).is_err() {
            tracing::warn!("Outbound queue full, cancel ack dropped");
        }
    }

    async fn write_loop(inner: Arc<AgentInner>, mut rx: mpsc::Receiver<Message>) {
        while let Some(message) = rx.recv().await {
            if let Err(e) = send(&inner, &message).await {
                tracing::warn!(job_id = %message.job_id(), kind = %message.kind(), error = %e, "Reply not sent");
            }
        }
    }
}

/// Runs the requested capability and turns the outcome into a result.
async fn execute(inner: &AgentInner, request: &JobRequest) -> MinionResult {
    tracing::info!(job_id = %request.job_id, fun = %request.function_name, "Executing job");
    let ctx = CallContext::new(
        inner.config.id.clone(),
        inner.config.clone(),
        inner.grains.clone(),
        inner.capabilities.clone(),
    )
    .for_job(request.job_id.clone());

    let (return_value, retcode) = match inner
        .capabilities
        .invoke(
            &ctx,
            &request.function_name,
            &request.arguments,
            &request.keyword_arguments,
        )
        .await
    {
        Ok(output) => {
            let retcode = output.effective_retcode();
            (output.value, retcode)
        }
        Err(e @ ExecutionError::NotAvailable { .. }) => (Value::String(e.to_string()), 1),
        Err(e) => {
            tracing::warn!(job_id = %request.job_id, error = %e, "Capability failed");
            (Value::String(format!("ERROR: {e}")), 1)
        }
    };

    MinionResult {
        job_id: request.job_id.clone(),
        minion_id: inner.config.id.clone(),
        return_value,
        retcode,
        success: retcode == 0,
        received_at: inner.clock.now(),
    }
}

/// Encodes, seals and sends one reply, re-authenticating once on expiry.
async fn send(inner: &AgentInner, message: &Message) -> Result<(), Error> {
    let plaintext = encode_message(message)?;
    let master = &inner.config.master_id;
    let sealed = match inner.sessions.encrypt(master, &plaintext) {
        Err(SessionError::SessionExpired(_)) if inner.handshake.is_some() => {
            if let Some(handshake) = &inner.handshake {
                tracing::info!(minion_id = %inner.config.id, "Session expired, re-authenticating");
                inner.sessions.connect(handshake.as_ref())?;
            }
            inner.sessions.encrypt(master, &plaintext)?
        }
        other => other?,
    };
    inner.channel.send_reply(sealed).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_jobs_dedup_and_bound() {
        let mut recent = RecentJobs::new(2);
        let (a, b, c) = (JobId::new("a"), JobId::new("b"), JobId::new("c"));
        assert!(recent.insert(&a));
        assert!(!recent.insert(&a));
        assert!(recent.insert(&b));
        assert!(recent.insert(&c));
        // `a` fell off the queue
        assert!(recent.insert(&a));
        assert!(!recent.insert(&c));
    }
}
