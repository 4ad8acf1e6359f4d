use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::clock::Clock;
use crate::error::{DispatchError, RegistryError, SessionError};
use crate::events::{EventEmitter, LifecycleEvent};
use crate::protocol::{encode_message, CancelNotice, JidGenerator, JobId, JobRequest, Message, MinionId};
use crate::scheduler::registry::JobRegistry;
use crate::session::SessionLayer;
use crate::targeting::{TargetResolver, TargetType};
use crate::transport::PublishChannel;

/// What to run and where.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub function_name: String,
    pub arguments: Vec<Value>,
    pub keyword_arguments: BTreeMap<String, Value>,
    pub target_expression: String,
    pub target_type: TargetType,
    /// Falls back to the master's default timeout when unset
    pub timeout: Option<Duration>,
}

impl JobSpec {
    /// Targets every minion (`*` glob) until told otherwise.
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            arguments: Vec::new(),
            keyword_arguments: BTreeMap::new(),
            target_expression: "*".to_string(),
            target_type: TargetType::Glob,
            timeout: None,
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.arguments.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword_arguments.insert(key.into(), value.into());
        self
    }

    pub fn target(mut self, expression: impl Into<String>, target_type: TargetType) -> Self {
        self.target_expression = expression.into();
        self.target_type = target_type;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a dispatch, including partial fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub job_id: JobId,
    /// Resolved target set recorded on the job
    pub targets: BTreeSet<MinionId>,
    /// Minions that were never reached, with the reason
    pub unreached: BTreeMap<MinionId, String>,
}

/// Issues jobs: resolves targets, records the job, seals one copy per
/// minion session and publishes. Never waits for results.
pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    resolver: Arc<dyn TargetResolver>,
    sessions: Arc<SessionLayer>,
    channel: Arc<dyn PublishChannel>,
    clock: Arc<dyn Clock>,
    events: EventEmitter,
    jids: JidGenerator,
    default_timeout: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<JobRegistry>,
        resolver: Arc<dyn TargetResolver>,
        sessions: Arc<SessionLayer>,
        channel: Arc<dyn PublishChannel>,
        clock: Arc<dyn Clock>,
        events: EventEmitter,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            resolver,
            sessions,
            channel,
            clock,
            events,
            jids: JidGenerator::new(),
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub async fn dispatch(&self, spec: JobSpec) -> Result<JobId, DispatchError> {
        self.dispatch_with_report(spec).await.map(|o| o.job_id)
    }

    pub async fn dispatch_with_report(&self, spec: JobSpec) -> Result<DispatchOutcome, DispatchError> {
        let issued_at = self.clock.now();
        let job_id = self.jids.next(issued_at);
        self.events.emit(LifecycleEvent::job_taken_by_master(
            &job_id,
            &spec.function_name,
            issued_at,
        ));

        let resolution = self
            .resolver
            .resolve(&spec.target_expression, spec.target_type)?;

        let mut request = JobRequest {
            job_id,
            function_name: spec.function_name,
            arguments: spec.arguments,
            keyword_arguments: spec.keyword_arguments,
            target_expression: spec.target_expression,
            target_type: spec.target_type,
            issued_at,
            timeout: spec.timeout.unwrap_or(self.default_timeout),
            tgt_minions: resolution.minions,
        };

        match self.registry.create(request.clone()) {
            Ok(_) => {}
            Err(RegistryError::DuplicateJobId(dup)) => {
                request.job_id = self.jids.next(self.clock.now());
                tracing::warn!(duplicate = %dup, job_id = %request.job_id, "Job id collision, regenerated");
                self.registry.create(request.clone())?;
            }
            Err(e) => return Err(e.into()),
        }
        let job_id = request.job_id.clone();
        self.events.emit(LifecycleEvent::job_enqueued(
            &job_id,
            &request.function_name,
            &request.tgt_minions,
            self.clock.now(),
        ));

        let payload = match encode_message(&Message::Job(request.clone())) {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(purge) = self.registry.purge(&job_id) {
                    tracing::debug!(job_id = %job_id, error = %purge, "Could not purge unencodable job");
                }
                return Err(e.into());
            }
        };

        let mut unreached: BTreeMap<MinionId, String> = resolution
            .missing
            .into_iter()
            .map(|id| (id, "unknown minion".to_string()))
            .collect();

        let mut frames = Vec::with_capacity(request.tgt_minions.len());
        for minion_id in &request.tgt_minions {
            match self.seal_for(minion_id, &payload) {
                Ok(sealed) => frames.push((minion_id.clone(), sealed)),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, minion_id = %minion_id, error = %e, "Cannot seal job for minion");
                    unreached.insert(minion_id.clone(), e.to_string());
                }
            }
        }

        let report = self.channel.publish_each(frames).await;
        for (minion_id, err) in report.failed {
            tracing::warn!(job_id = %job_id, minion_id = %minion_id, error = %err, "Publish failed");
            unreached.insert(minion_id, err.to_string());
        }

        if !unreached.is_empty() {
            if let Err(e) = self.registry.mark_unreached(&job_id, unreached.clone()) {
                tracing::debug!(job_id = %job_id, error = %e, "Could not record unreached minions");
            }
        }

        tracing::info!(
            job_id = %job_id,
            fun = %request.function_name,
            targets = request.tgt_minions.len(),
            delivered = report.delivered.len(),
            unreached = unreached.len(),
            "Job dispatched"
        );

        Ok(DispatchOutcome {
            job_id,
            targets: request.tgt_minions,
            unreached,
        })
    }

    /// Encrypts for one minion, re-authenticating once if its session expired.
    fn seal_for(&self, minion_id: &str, payload: &[u8]) -> Result<Bytes, SessionError> {
        match self.sessions.encrypt(minion_id, payload) {
            Err(e) if e.is_expired() => {
                tracing::info!(minion_id, "Session expired, re-authenticating");
                self.sessions
                    .reauthenticate(minion_id)
                    .map_err(|auth| SessionError::Encrypt {
                        peer: minion_id.to_string(),
                        reason: auth.to_string(),
                    })?;
                self.sessions.encrypt(minion_id, payload)
            }
            other => other,
        }
    }

    /// Cancels a job and sends a best-effort notice to the minions that have
    /// not answered. Returns false if the job had already finished.
    pub async fn cancel(&self, job_id: &JobId) -> Result<bool, DispatchError> {
        let now = self.clock.now();
        if !self.registry.cancel(job_id, now)? {
            return Ok(false);
        }
        let record = self.registry.status(job_id)?;
        let payload = encode_message(&Message::Cancel(CancelNotice {
            job_id: job_id.clone(),
            issued_at: now,
        }))?;

        let frames: Vec<_> = record
            .missing()
            .into_iter()
            .filter(|id| !record.unreached.contains_key(id))
            .filter_map(|id| match self.seal_for(&id, &payload) {
                Ok(sealed) => Some((id, sealed)),
                Err(e) => {
                    tracing::debug!(job_id = %job_id, minion_id = %id, error = %e, "Cancel notice not sealed");
                    None
                }
            })
            .collect();
        let report = self.channel.publish_each(frames).await;
        tracing::info!(
            job_id = %job_id,
            notified = report.delivered.len(),
            failed = report.failed.len(),
            "Cancel notice published"
        );
        Ok(true)
    }

    /// Re-issues a job as a NEW job id scoped to the minions that have not
    /// answered. Returns `None` when nobody is missing.
    pub async fn retry_missing(&self, job_id: &JobId) -> Result<Option<JobId>, DispatchError> {
        let record = self.registry.status(job_id)?;
        let missing = record.missing();
        if missing.is_empty() {
            return Ok(None);
        }
        let request = record.request;
        let spec = JobSpec {
            function_name: request.function_name,
            arguments: request.arguments,
            keyword_arguments: request.keyword_arguments,
            target_expression: missing.into_iter().collect::<Vec<_>>().join(","),
            target_type: TargetType::List,
            timeout: Some(request.timeout),
        };
        let retried = self.dispatch(spec).await?;
        tracing::info!(job_id = %job_id, retry = %retried, "Retried missing minions");
        Ok(Some(retried))
    }
}
