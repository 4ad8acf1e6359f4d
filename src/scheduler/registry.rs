use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::sub_duration;
use crate::config::MasterConfig;
use crate::error::RegistryError;
use crate::protocol::{JobId, JobRequest, MinionId, MinionResult};
use crate::scheduler::job::{JobRecord, JobState};

const DEFAULT_MAX_JOBS: usize = 10_000;
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of [`JobRegistry::record_result`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedState {
    pub state: JobState,
    /// False when the job was already terminal and the result was ignored
    pub accepted: bool,
    /// This was the first result recorded for the job
    pub first_result: bool,
    /// Snapshot to hand to the returner, present exactly once per job
    pub finalized: Option<JobRecord>,
}

/// Records finalised by one [`JobRegistry::sweep`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Newly Complete records not yet handed to the returner
    pub completed: Vec<JobRecord>,
    pub timed_out: Vec<JobRecord>,
    pub evicted: Vec<JobId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.timed_out.is_empty() && self.evicted.is_empty()
    }
}

/// Every job the master knows about, keyed by job id.
///
/// Each operation on a job runs under that job's shard lock, so concurrent
/// dispatch, collection and sweeping stay linearizable per job id.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: DashMap<JobId, JobRecord>,
    max_jobs: usize,
    retention: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_JOBS, DEFAULT_RETENTION)
    }
}

impl JobRegistry {
    pub fn new(max_jobs: usize, retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            max_jobs,
            retention,
        }
    }

    pub fn from_config(config: &MasterConfig) -> Self {
        Self::new(config.max_jobs, config.retention())
    }

    /// Adds a job. A job with no targets is Complete immediately.
    pub fn create(&self, request: JobRequest) -> Result<JobRecord, RegistryError> {
        if request.timeout.is_zero() {
            return Err(RegistryError::InvalidTimeout);
        }
        if self.jobs.len() >= self.max_jobs {
            return Err(RegistryError::RegistryFull(self.max_jobs));
        }

        match self.jobs.entry(request.job_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateJobId(request.job_id)),
            Entry::Vacant(slot) => {
                let mut record = JobRecord::new(request);
                if record.request.tgt_minions.is_empty() {
                    record.state = JobState::Complete;
                    record.finished_at = Some(record.request.issued_at);
                }
                tracing::debug!(
                    job_id = %record.job_id(),
                    targets = record.request.tgt_minions.len(),
                    state = %record.state,
                    "Job created"
                );
                Ok(slot.insert(record).clone())
            }
        }
    }

    pub fn record_result(&self, result: MinionResult) -> Result<UpdatedState, RegistryError> {
        let mut entry = self
            .jobs
            .get_mut(&result.job_id)
            .ok_or_else(|| RegistryError::UnknownJob(result.job_id.clone()))?;
        let record = entry.value_mut();

        if record.is_terminal() {
            tracing::debug!(
                job_id = %result.job_id,
                minion_id = %result.minion_id,
                state = %record.state,
                "Late result ignored"
            );
            return Ok(UpdatedState {
                state: record.state,
                accepted: false,
                first_result: false,
                finalized: None,
            });
        }
        if !record.request.targets(&result.minion_id) {
            return Err(RegistryError::UnexpectedMinion {
                job_id: result.job_id,
                minion_id: result.minion_id,
            });
        }
        if record.results.contains_key(&result.minion_id) {
            return Err(RegistryError::DuplicateResult {
                job_id: result.job_id,
                minion_id: result.minion_id,
            });
        }

        let first_result = record.results.is_empty();
        let received_at = result.received_at;
        record.extended_until.remove(&result.minion_id);
        record.results.insert(result.minion_id.clone(), result);
        if record.state == JobState::Dispatched {
            record.state = JobState::Collecting;
        }

        let mut finalized = None;
        if record.all_responded() {
            record.state = JobState::Complete;
            record.finished_at = Some(received_at);
            record.sunk = true;
            finalized = Some(record.clone());
        }

        Ok(UpdatedState {
            state: record.state,
            accepted: true,
            first_result,
            finalized,
        })
    }

    /// Pushes the deadline out for a minion that reported it is still
    /// running. Returns false when there was nothing to extend.
    pub fn extend_deadline(
        &self,
        job_id: &JobId,
        minion_id: &str,
        new_deadline: DateTime<Utc>,
    ) -> Result<bool, RegistryError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::UnknownJob(job_id.clone()))?;
        let record = entry.value_mut();

        if record.is_terminal() || record.results.contains_key(minion_id) {
            return Ok(false);
        }
        if !record.request.targets(minion_id) {
            return Err(RegistryError::UnexpectedMinion {
                job_id: job_id.clone(),
                minion_id: minion_id.to_string(),
            });
        }

        if new_deadline > record.deadline {
            record.deadline = new_deadline;
        }
        record
            .extended_until
            .insert(minion_id.to_string(), new_deadline);
        Ok(true)
    }

    pub fn status(&self, job_id: &JobId) -> Result<JobRecord, RegistryError> {
        self.jobs
            .get(job_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| RegistryError::UnknownJob(job_id.clone()))
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.iter().map(|r| r.value().clone()).collect();
        jobs.sort_by(|a, b| {
            a.request
                .issued_at
                .cmp(&b.request.issued_at)
                .then_with(|| a.job_id().cmp(b.job_id()))
        });
        jobs
    }

    pub fn purge(&self, job_id: &JobId) -> Result<JobRecord, RegistryError> {
        self.jobs
            .remove(job_id)
            .map(|(_, record)| record)
            .ok_or_else(|| RegistryError::UnknownJob(job_id.clone()))
    }

    pub fn missing(&self, job_id: &JobId) -> Result<BTreeSet<MinionId>, RegistryError> {
        self.jobs
            .get(job_id)
            .map(|r| r.missing())
            .ok_or_else(|| RegistryError::UnknownJob(job_id.clone()))
    }

    /// Notes targets the transport could not deliver to.
    pub fn mark_unreached(
        &self,
        job_id: &JobId,
        unreached: BTreeMap<MinionId, String>,
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::UnknownJob(job_id.clone()))?;
        entry.value_mut().unreached.extend(unreached);
        Ok(())
    }

    /// Moves a job to Cancelled. Returns false if it was already terminal.
    pub fn cancel(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<bool, RegistryError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::UnknownJob(job_id.clone()))?;
        let record = entry.value_mut();
        if record.is_terminal() {
            return Ok(false);
        }
        record.state = JobState::Cancelled;
        record.finished_at = Some(now);
        tracing::info!(job_id = %job_id, results = record.results.len(), "Job cancelled");
        Ok(true)
    }

    /// Closes every open job whose deadline has passed and evicts terminal
    /// jobs that finished before the retention window.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for mut entry in self.jobs.iter_mut() {
            let record = entry.value_mut();
            match record.state {
                JobState::Dispatched | JobState::Collecting if now >= record.deadline => {
                    record.finished_at = Some(now);
                    if record.results.is_empty() {
                        record.state = JobState::TimedOut;
                        report.timed_out.push(record.clone());
                    } else {
                        record.state = JobState::Complete;
                        record.sunk = true;
                        report.completed.push(record.clone());
                    }
                }
                JobState::Complete if !record.sunk => {
                    record.sunk = true;
                    report.completed.push(record.clone());
                }
                _ => {}
            }
        }

        let horizon = sub_duration(now, self.retention);
        let mut evicted = Vec::new();
        self.jobs.retain(|job_id, record| {
            let expired = record.is_terminal()
                && record.sunk_or_unsinkable()
                && record.finished_at.is_some_and(|t| t <= horizon);
            if expired {
                evicted.push(job_id.clone());
            }
            !expired
        });
        report.evicted = evicted;

        if !report.is_empty() {
            tracing::debug!(
                completed = report.completed.len(),
                timed_out = report.timed_out.len(),
                evicted = report.evicted.len(),
                "Registry sweep"
            );
        }
        report
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}

impl JobRecord {
    /// Complete records are only evicted after they were handed out for sinking.
    fn sunk_or_unsinkable(&self) -> bool {
        self.state != JobState::Complete || self.sunk
    }
}
