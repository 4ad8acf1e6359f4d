use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{JobId, JobRequest, MinionId, MinionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Dispatched,
    Collecting,
    Complete,
    TimedOut,
    Cancelled,
}

impl JobState {
    /// No further results are accepted once a job is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::TimedOut | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Dispatched => write!(f, "dispatched"),
            JobState::Collecting => write!(f, "collecting"),
            JobState::Complete => write!(f, "complete"),
            JobState::TimedOut => write!(f, "timed_out"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A job and everything collected for it so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub request: JobRequest,
    pub results: BTreeMap<MinionId, MinionResult>,
    pub state: JobState,
    /// Starts at `issued_at + timeout`; heartbeats may push it later
    pub deadline: DateTime<Utc>,
    /// Targets the transport never delivered to, with the reason
    pub unreached: BTreeMap<MinionId, String>,
    /// Latest deadline each still-running minion asked for
    pub extended_until: BTreeMap<MinionId, DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set in the same critical section as the transition to Complete so
    /// the returner sees each job at most once
    #[serde(skip)]
    pub(crate) sunk: bool,
}

impl JobRecord {
    pub fn new(request: JobRequest) -> Self {
        let deadline = request.deadline();
        Self {
            request,
            results: BTreeMap::new(),
            state: JobState::Dispatched,
            deadline,
            unreached: BTreeMap::new(),
            extended_until: BTreeMap::new(),
            finished_at: None,
            sunk: false,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.request.job_id
    }

    /// Targets that have not produced a result.
    pub fn missing(&self) -> BTreeSet<MinionId> {
        self.request
            .tgt_minions
            .iter()
            .filter(|id| !self.results.contains_key(*id))
            .cloned()
            .collect()
    }

    pub fn all_responded(&self) -> bool {
        self.request
            .tgt_minions
            .iter()
            .all(|id| self.results.contains_key(id))
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Complete because the window closed, not because everyone answered.
    pub fn is_partial(&self) -> bool {
        self.state == JobState::Complete && !self.all_responded()
    }
}
