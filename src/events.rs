//! Job lifecycle instrumentation.
//!
//! Events are fire-and-forget: a failing sink is logged at debug level and
//! otherwise ignored.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::EmitError;
use crate::protocol::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobEnqueued,
    JobTakenByMaster,
    JobTakenByMinion,
    JobFulfilledByMinion,
    JobResultsStart,
    JobResultsEnd,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobEnqueued => "job_enqueued",
            EventType::JobTakenByMaster => "job_taken_by_master",
            EventType::JobTakenByMinion => "job_taken_by_minion",
            EventType::JobFulfilledByMinion => "job_fulfilled_by_minion",
            EventType::JobResultsStart => "job_results_start",
            EventType::JobResultsEnd => "job_results_end",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub message_type: EventType,
    pub ts: DateTime<Utc>,
    pub meta: Value,
    /// Event bus tag, e.g. `job/<jid>/new`
    pub tag: String,
}

impl LifecycleEvent {
    fn new(message_type: EventType, tag: String, ts: DateTime<Utc>, meta: Value) -> Self {
        Self {
            message_type,
            ts,
            meta,
            tag,
        }
    }

    pub fn job_taken_by_master(job_id: &JobId, function_name: &str, ts: DateTime<Utc>) -> Self {
        Self::new(
            EventType::JobTakenByMaster,
            format!("job/{job_id}/master"),
            ts,
            json!({ "jid": job_id, "fun": function_name }),
        )
    }

    pub fn job_enqueued<'a>(
        job_id: &JobId,
        function_name: &str,
        minions: impl IntoIterator<Item = &'a String>,
        ts: DateTime<Utc>,
    ) -> Self {
        let minions: Vec<&String> = minions.into_iter().collect();
        Self::new(
            EventType::JobEnqueued,
            format!("job/{job_id}/new"),
            ts,
            json!({ "jid": job_id, "fun": function_name, "minions": minions }),
        )
    }

    pub fn job_taken_by_minion(job_id: &JobId, minion_id: &str, ts: DateTime<Utc>) -> Self {
        Self::new(
            EventType::JobTakenByMinion,
            format!("job/{job_id}/minion/{minion_id}"),
            ts,
            json!({ "jid": job_id, "id": minion_id }),
        )
    }

    pub fn job_fulfilled_by_minion(
        job_id: &JobId,
        minion_id: &str,
        retcode: i32,
        ts: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventType::JobFulfilledByMinion,
            format!("job/{job_id}/ret/{minion_id}"),
            ts,
            json!({ "jid": job_id, "id": minion_id, "retcode": retcode }),
        )
    }

    pub fn job_results_start(job_id: &JobId, minion_id: &str, ts: DateTime<Utc>) -> Self {
        Self::new(
            EventType::JobResultsStart,
            format!("job/{job_id}/results/start"),
            ts,
            json!({ "jid": job_id, "first": minion_id }),
        )
    }

    pub fn job_results_end(job_id: &JobId, state: &str, results: usize, ts: DateTime<Utc>) -> Self {
        Self::new(
            EventType::JobResultsEnd,
            format!("job/{job_id}/results/end"),
            ts,
            json!({ "jid": job_id, "state": state, "results": results }),
        )
    }
}

pub trait InstrumentationSink: Send + Sync + fmt::Debug {
    fn emit(&self, event: &LifecycleEvent) -> Result<(), EmitError>;
}

/// Writes events to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl InstrumentationSink for TracingSink {
    fn emit(&self, event: &LifecycleEvent) -> Result<(), EmitError> {
        tracing::info!(
            target: "salt_dispatch::events",
            message_type = %event.message_type,
            tag = %event.tag,
            meta = %event.meta,
            "Lifecycle event"
        );
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, message_type: EventType) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.message_type == message_type)
            .cloned()
            .collect()
    }
}

impl InstrumentationSink for MemorySink {
    fn emit(&self, event: &LifecycleEvent) -> Result<(), EmitError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Forwards events onto a broadcast channel (the event bus).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl InstrumentationSink for ChannelSink {
    fn emit(&self, event: &LifecycleEvent) -> Result<(), EmitError> {
        self.tx
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| EmitError::NoSubscribers)
    }
}

/// Cheap handle the dispatcher, collector and minion agent emit through.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sink: Arc<dyn InstrumentationSink>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn InstrumentationSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, event: LifecycleEvent) {
        if let Err(e) = self.sink.emit(&event) {
            tracing::debug!(tag = %event.tag, error = %e, "Dropped lifecycle event");
        }
    }
}
