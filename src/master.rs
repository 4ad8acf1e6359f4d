use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::MasterConfig;
use crate::error::{DispatchError, RegistryError};
use crate::events::EventEmitter;
use crate::protocol::{ControlAck, JobId};
use crate::returner::ReturnerSink;
use crate::scheduler::{Collector, DispatchOutcome, Dispatcher, JobRecord, JobRegistry, JobSpec};
use crate::session::{AuthBackend, Handshake, SessionLayer, SharedSecretBackend};
use crate::targeting::{RosterResolver, TargetResolver};
use crate::transport::{Inbound, PublishChannel};

const MIN_POLL: Duration = Duration::from_millis(10);

/// Master process wiring: registry, dispatcher, collector and sweeper.
pub struct Master {
    pub config: MasterConfig,
    pub registry: Arc<JobRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub collector: Arc<Collector>,
    pub sessions: Arc<SessionLayer>,
    roster: Arc<RosterResolver>,
    channel: Arc<dyn PublishChannel>,
    clock: Arc<dyn Clock>,
}

pub struct MasterBuilder {
    config: MasterConfig,
    channel: Arc<dyn PublishChannel>,
    auth: Option<Arc<dyn AuthBackend>>,
    resolver: Option<Arc<dyn TargetResolver>>,
    returner: Option<Arc<dyn ReturnerSink>>,
    acks: Option<mpsc::UnboundedSender<ControlAck>>,
    clock: Arc<dyn Clock>,
    events: EventEmitter,
}

impl MasterBuilder {
    pub fn auth(mut self, backend: Arc<dyn AuthBackend>) -> Self {
        self.auth = Some(backend);
        self
    }

    /// Replaces the built-in roster resolver.
    pub fn resolver(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn returner(mut self, returner: Arc<dyn ReturnerSink>) -> Self {
        self.returner = Some(returner);
        self
    }

    pub fn ack_sink(mut self, acks: mpsc::UnboundedSender<ControlAck>) -> Self {
        self.acks = Some(acks);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Master {
        let config = self.config;
        let auth = self
            .auth
            .unwrap_or_else(|| Arc::new(SharedSecretBackend::new()));
        let sessions = Arc::new(SessionLayer::master(
            config.id.clone(),
            auth,
            &config.session,
            self.clock.clone(),
        ));
        let registry = Arc::new(JobRegistry::from_config(&config));
        let roster = Arc::new(RosterResolver::new(config.nodegroups.clone()));
        let resolver = self
            .resolver
            .unwrap_or_else(|| roster.clone() as Arc<dyn TargetResolver>);

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            resolver,
            sessions.clone(),
            self.channel.clone(),
            self.clock.clone(),
            self.events.clone(),
            config.default_timeout(),
        ));

        let mut collector = Collector::new(
            registry.clone(),
            sessions.clone(),
            self.clock.clone(),
            self.events,
        );
        if let Some(returner) = self.returner {
            collector = collector.with_returner(returner, config.returner_retry_delay());
        }
        if let Some(acks) = self.acks {
            collector = collector.with_ack_sink(acks);
        }

        Master {
            config,
            registry,
            dispatcher,
            collector: Arc::new(collector),
            sessions,
            roster,
            channel: self.channel,
            clock: self.clock,
        }
    }
}

impl Master {
    pub fn builder(config: MasterConfig, channel: Arc<dyn PublishChannel>) -> MasterBuilder {
        MasterBuilder {
            config,
            channel,
            auth: None,
            resolver: None,
            returner: None,
            acks: None,
            clock: Arc::new(SystemClock),
            events: EventEmitter::default(),
        }
    }

    /// Minions known for targeting (unless a custom resolver was supplied).
    pub fn roster(&self) -> &Arc<RosterResolver> {
        &self.roster
    }

    /// Endpoint minions authenticate against.
    pub fn handshake(&self) -> Arc<dyn Handshake> {
        self.sessions.clone()
    }

    pub async fn dispatch(&self, spec: JobSpec) -> Result<JobId, DispatchError> {
        self.dispatcher.dispatch(spec).await
    }

    pub async fn dispatch_with_report(&self, spec: JobSpec) -> Result<DispatchOutcome, DispatchError> {
        self.dispatcher.dispatch_with_report(spec).await
    }

    pub fn status(&self, job_id: &JobId) -> Result<JobRecord, RegistryError> {
        self.registry.status(job_id)
    }

    /// Polls until the job is terminal or `timeout` elapses, then returns the
    /// latest snapshot either way. A timeout past the clock's range never elapses.
    pub async fn wait(&self, job_id: &JobId, timeout: Duration) -> Result<JobRecord, RegistryError> {
        let poll = self.config.sweep_interval().clamp(MIN_POLL, Duration::from_millis(100));
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            let record = self.registry.status(job_id)?;
            let elapsed = deadline.is_some_and(|d| tokio::time::Instant::now() >= d);
            if record.is_terminal() || elapsed {
                return Ok(record);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Registers for minion replies, then spawns the collector receive loop
    /// and the periodic sweeper. The task ends once `token` is cancelled.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(self.config.inbound_queue.max(1));
        self.channel.on_receive(tx);

        let master = self.clone();
        tokio::spawn(async move { master.run(rx, token).await })
    }

    async fn run(self: Arc<Self>, inbound: mpsc::Receiver<Inbound>, token: CancellationToken) {
        let collector = self.collector.clone();
        let collector_handle = tokio::spawn(collector.run(inbound, token.clone()));

        tracing::info!(master = %self.config.id, "Master started");
        let mut sweep = tokio::time::interval(self.config.sweep_interval().max(MIN_POLL));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sweep.tick() => {
                    self.collector.sweep(self.clock.now());
                }
            }
        }

        let _ = collector_handle.await;
        tracing::info!(master = %self.config.id, "Master stopped");
    }
}
