use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::add_duration;
use crate::protocol::envelope::MessageKind;
use crate::protocol::JobId;
use crate::targeting::TargetType;

pub type MinionId = String;

/// A published job: run `function_name` with the given arguments on the
/// resolved minions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub function_name: String,
    pub arguments: Vec<Value>,
    pub keyword_arguments: BTreeMap<String, Value>,
    pub target_expression: String,
    pub target_type: TargetType,
    pub issued_at: DateTime<Utc>,
    pub timeout: Duration,
    /// Minion ids resolved at dispatch time (snapshot semantics)
    pub tgt_minions: BTreeSet<MinionId>,
}

impl JobRequest {
    pub fn deadline(&self) -> DateTime<Utc> {
        add_duration(self.issued_at, self.timeout)
    }

    pub fn targets(&self, minion_id: &str) -> bool {
        self.tgt_minions.contains(minion_id)
    }
}

/// One minion's answer to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinionResult {
    pub job_id: JobId,
    pub minion_id: MinionId,
    pub return_value: Value,
    pub retcode: i32,
    pub success: bool,
    pub received_at: DateTime<Utc>,
}

/// "Still running" notice from a minion working on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub job_id: JobId,
    pub minion_id: MinionId,
    pub sent_at: DateTime<Utc>,
    /// How long past its arrival the master should keep waiting
    pub extend_by: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckKind {
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlAck {
    pub job_id: JobId,
    pub minion_id: MinionId,
    pub kind: AckKind,
    /// Whether the minion was still running the job when the notice arrived
    pub was_running: bool,
}

/// Best-effort cancellation notice published to a job's targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelNotice {
    pub job_id: JobId,
    pub issued_at: DateTime<Utc>,
}

/// Body of a protocol message. The variant is selected by the envelope kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Job(JobRequest),
    Result(MinionResult),
    Heartbeat(Heartbeat),
    ControlAck(ControlAck),
    Cancel(CancelNotice),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Job(_) => MessageKind::Job,
            Message::Result(_) => MessageKind::Result,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::ControlAck(_) => MessageKind::ControlAck,
            Message::Cancel(_) => MessageKind::Cancel,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Message::Job(m) => &m.job_id,
            Message::Result(m) => &m.job_id,
            Message::Heartbeat(m) => &m.job_id,
            Message::ControlAck(m) => &m.job_id,
            Message::Cancel(m) => &m.job_id,
        }
    }
}
