//! Collector tests driven by a manual clock.
//!
//! Frames are sealed by real minion-side session layers and fed straight
//! into `Collector::on_message`, so deadlines move only when the test says.


use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::mpsc;

use salt_dispatch::clock::{add_duration, Clock, ManualClock};
use salt_dispatch::config::SessionConfig;
use salt_dispatch::error::StoreError;
use salt_dispatch::events::{EventEmitter, EventType, MemorySink};
use salt_dispatch::protocol::{
    encode_message, AckKind, ControlAck, Heartbeat, JobId, JobRequest, Message, MinionResult,
};
use salt_dispatch::returner::{LocalCacheReturner, MemoryReturner, ReturnerSink};
use salt_dispatch::scheduler::{Collector, Disposition, JobRecord, JobRegistry, JobState};
use salt_dispatch::session::{SessionLayer, SharedSecretBackend};
use salt_dispatch::targeting::TargetType;
use test_harness::{assert_eventually, secret_for};

const JID: &str = "20240101000000000001";

struct Fixture {
    clock: Arc<ManualClock>,
    master: Arc<SessionLayer>,
    minions: BTreeMap<String, SessionLayer>,
    registry: Arc<JobRegistry>,
    events: Arc<MemorySink>,
}

impl Fixture {
    /// Master plus authenticated minions `a`, `b` and `c`
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let names = ["minion-a", "minion-b", "minion-c"];
        let backend = names.iter().fold(SharedSecretBackend::new(), |b, id| {
            b.with_secret(*id, &secret_for(id))
        });
        let master = Arc::new(SessionLayer::master(
            "master",
            Arc::new(backend),
            &SessionConfig::default(),
            clock.clone(),
        ));

        let mut minions = BTreeMap::new();
        for id in names {
            let layer = SessionLayer::minion(
                id,
                "master",
                &secret_for(id),
                &SessionConfig::default(),
                clock.clone(),
            );
            layer.connect(master.as_ref()).unwrap();
            minions.insert(id.to_string(), layer);
        }

        Self {
            clock,
            master,
            minions,
            registry: Arc::new(JobRegistry::new(100, Duration::from_secs(3600))),
            events: Arc::new(MemorySink::new()),
        }
    }

    fn collector(&self) -> Collector {
        Collector::new(
            self.registry.clone(),
            self.master.clone(),
            self.clock.clone(),
            EventEmitter::new(self.events.clone()),
        )
    }

    /// `test.ping` to minion-a and minion-b with a 5 second timeout
    fn create_job(&self) -> JobId {
        let request = JobRequest {
            job_id: JobId::new(JID),
            function_name: "test.ping".to_string(),
            arguments: vec![],
            keyword_arguments: BTreeMap::new(),
            target_expression: "minion-a,minion-b".to_string(),
            target_type: TargetType::List,
            issued_at: self.clock.now(),
            timeout: Duration::from_secs(5),
            tgt_minions: BTreeSet::from(["minion-a".to_string(), "minion-b".to_string()]),
        };
        self.registry.create(request).unwrap().job_id().clone()
    }

    fn result(&self, minion_id: &str, retcode: i32) -> Message {
        Message::Result(MinionResult {
            job_id: JobId::new(JID),
            minion_id: minion_id.to_string(),
            return_value: json!(true),
            retcode,
            success: retcode == 0,
            received_at: self.clock.now(),
        })
    }

    /// Seals `message` the way `sender` would on the wire
    fn seal(&self, sender: &str, message: &Message) -> Bytes {
        let plaintext = encode_message(message).unwrap();
        self.minions[sender].encrypt("master", &plaintext).unwrap()
    }

    fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }
}

/// Fails the first `failures` stores, then records.
struct FlakyReturner {
    failures: usize,
    calls: AtomicUsize,
    inner: MemoryReturner,
}

impl FlakyReturner {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
            inner: MemoryReturner::new(),
        }
    }
}

#[async_trait]
impl ReturnerSink for FlakyReturner {
    async fn store(&self, record: &JobRecord) -> Result<(), StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(StoreError::Backend("database unavailable".to_string()));
        }
        self.inner.store(record).await
    }
}

#[tokio::test]
async fn test_partial_results_complete_at_deadline() {
    let fx = Fixture::new();
    let returner = Arc::new(MemoryReturner::new());
    let collector = fx
        .collector()
        .with_returner(returner.clone(), Duration::from_millis(10));
    let job_id = fx.create_job();

    fx.advance(1);
    let frame = fx.seal("minion-a", &fx.result("minion-a", 0));
    assert_eq!(collector.on_message("minion-a", &frame), Disposition::Accepted);
    assert_eq!(fx.registry.status(&job_id).unwrap().state, JobState::Collecting);

    // Nothing closes before the deadline
    fx.advance(3);
    assert!(collector.sweep(fx.clock.now()).completed.is_empty());

    fx.advance(2);
    let report = collector.sweep(fx.clock.now());
    assert_eq!(report.completed.len(), 1);

    let record = fx.registry.status(&job_id).unwrap();
    assert_eq!(record.state, JobState::Complete);
    assert_eq!(record.results.len(), 1);
    assert!(record.is_partial());
    assert_eq!(record.missing(), BTreeSet::from(["minion-b".to_string()]));
    assert_eq!(record.finished_at, Some(fx.clock.now()));

    let sink = returner.clone();
    let jid = job_id.clone();
    assert_eventually(
        || {
            let sink = sink.clone();
            let jid = jid.clone();
            async move { sink.get(&jid).is_some() }
        },
        Duration::from_secs(1),
        "partial job should be stored",
    )
    .await;

    // Later sweeps do not hand it out again
    fx.advance(1);
    assert!(collector.sweep(fx.clock.now()).completed.is_empty());
}

#[tokio::test]
async fn test_all_results_complete_immediately() {
    let fx = Fixture::new();
    let collector = fx.collector();
    let job_id = fx.create_job();

    let a = fx.seal("minion-a", &fx.result("minion-a", 0));
    let b = fx.seal("minion-b", &fx.result("minion-b", 2));
    assert_eq!(collector.on_message("minion-a", &a), Disposition::Accepted);
    assert_eq!(collector.on_message("minion-b", &b), Disposition::Completed);

    let record = fx.registry.status(&job_id).unwrap();
    assert_eq!(record.state, JobState::Complete);
    assert!(!record.is_partial());
    assert_eq!(record.results["minion-b"].retcode, 2);

    let starts = fx.events.of_type(EventType::JobResultsStart);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].meta["first"], json!("minion-a"));
    assert_eq!(fx.events.of_type(EventType::JobResultsEnd).len(), 1);
}

#[tokio::test]
async fn test_duplicate_result_leaves_record_unchanged() {
    let fx = Fixture::new();
    let collector = fx.collector();
    let job_id = fx.create_job();

    let first = fx.seal("minion-a", &fx.result("minion-a", 0));
    assert_eq!(collector.on_message("minion-a", &first), Disposition::Accepted);
    let before = fx.registry.status(&job_id).unwrap();

    fx.advance(1);
    let second = fx.seal("minion-a", &fx.result("minion-a", 1));
    assert_eq!(collector.on_message("minion-a", &second), Disposition::Duplicate);

    let after = fx.registry.status(&job_id).unwrap();
    assert_eq!(after, before);
    assert_eq!(after.results["minion-a"].retcode, 0);
    assert_eq!(collector.stats().duplicates, 1);
}

#[tokio::test]
async fn test_received_at_uses_master_clock() {
    let fx = Fixture::new();
    let collector = fx.collector();
    let job_id = fx.create_job();

    let mut message = fx.result("minion-a", 0);
    if let Message::Result(result) = &mut message {
        result.received_at = Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap();
    }
    fx.advance(2);
    let frame = fx.seal("minion-a", &message);
    collector.on_message("minion-a", &frame);

    let record = fx.registry.status(&job_id).unwrap();
    assert_eq!(record.results["minion-a"].received_at, fx.clock.now());
}

#[tokio::test]
async fn test_rejects_spoofed_and_untargeted_results() {
    let fx = Fixture::new();
    let collector = fx.collector();
    let job_id = fx.create_job();

    // minion-a claims to be minion-b
    let spoofed = fx.seal("minion-a", &fx.result("minion-b", 0));
    assert_eq!(collector.on_message("minion-a", &spoofed), Disposition::Unexpected);

    // minion-a's frame presented as coming from minion-b does not open
    let frame = fx.seal("minion-a", &fx.result("minion-a", 0));
    assert_eq!(
        collector.on_message("minion-b", &frame),
        Disposition::RejectedDecrypt
    );

    // minion-c is authenticated but not a target
    let untargeted = fx.seal("minion-c", &fx.result("minion-c", 0));
    assert_eq!(
        collector.on_message("minion-c", &untargeted),
        Disposition::Unexpected
    );

    let record = fx.registry.status(&job_id).unwrap();
    assert!(record.results.is_empty());
    assert_eq!(record.state, JobState::Dispatched);
    assert_eq!(collector.stats().unexpected, 2);
}

#[tokio::test]
async fn test_rejects_bad_frames() {
    let fx = Fixture::new();
    let collector = fx.collector();
    fx.create_job();

    assert_eq!(
        collector.on_message("minion-a", b"garbage"),
        Disposition::RejectedDecrypt
    );
    assert_eq!(
        collector.on_message("stranger", b"garbage"),
        Disposition::RejectedDecrypt
    );

    // Sealed correctly, but the plaintext is not a protocol message
    let sealed = fx.minions["minion-a"]
        .encrypt("master", b"not a protocol frame")
        .unwrap();
    assert_eq!(
        collector.on_message("minion-a", &sealed),
        Disposition::RejectedCodec
    );

    // Replaying an accepted frame is rejected
    let frame = fx.seal("minion-a", &fx.result("minion-a", 0));
    assert_eq!(collector.on_message("minion-a", &frame), Disposition::Accepted);
    assert_eq!(
        collector.on_message("minion-a", &frame),
        Disposition::RejectedDecrypt
    );

    let stats = collector.stats();
    assert_eq!(stats.rejected_decrypt, 3);
    assert_eq!(stats.rejected_codec, 1);
    assert_eq!(stats.rejected(), 4);
    assert_eq!(stats.accepted, 1);
}

#[tokio::test]
async fn test_unknown_job_and_late_results() {
    let fx = Fixture::new();
    let collector = fx.collector();

    let frame = fx.seal("minion-a", &fx.result("minion-a", 0));
    assert_eq!(collector.on_message("minion-a", &frame), Disposition::UnknownJob);

    let job_id = fx.create_job();
    fx.advance(5);
    let report = collector.sweep(fx.clock.now());
    assert_eq!(report.timed_out.len(), 1);
    assert_eq!(fx.registry.status(&job_id).unwrap().state, JobState::TimedOut);

    let late = fx.seal("minion-b", &fx.result("minion-b", 0));
    assert_eq!(collector.on_message("minion-b", &late), Disposition::Late);
    let record = fx.registry.status(&job_id).unwrap();
    assert_eq!(record.state, JobState::TimedOut);
    assert!(record.results.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweep_racing_final_results_sinks_each_job_once() {
    const JOBS: u64 = 64;
    let fx = Fixture::new();
    let returner = Arc::new(MemoryReturner::new());
    let collector = Arc::new(
        fx.collector()
            .with_returner(returner.clone(), Duration::from_millis(10)),
    );

    let mut finals = Vec::new();
    for n in 0..JOBS {
        let job_id = JobId::new(format!("2024010100000000{n:04}"));
        fx.registry
            .create(JobRequest {
                job_id: job_id.clone(),
                function_name: "test.ping".to_string(),
                arguments: vec![],
                keyword_arguments: BTreeMap::new(),
                target_expression: "minion-a,minion-b".to_string(),
                target_type: TargetType::List,
                issued_at: fx.clock.now(),
                timeout: Duration::from_secs(5),
                tgt_minions: BTreeSet::from(["minion-a".to_string(), "minion-b".to_string()]),
            })
            .unwrap();

        let result = |minion_id: &str| {
            Message::Result(MinionResult {
                job_id: job_id.clone(),
                minion_id: minion_id.to_string(),
                return_value: json!(true),
                retcode: 0,
                success: true,
                received_at: fx.clock.now(),
            })
        };
        let first = fx.seal("minion-a", &result("minion-a"));
        assert_eq!(collector.on_message("minion-a", &first), Disposition::Accepted);
        finals.push(fx.seal("minion-b", &result("minion-b")));
    }

    // Every job is past its deadline while its last result is in flight
    fx.advance(6);
    let now = fx.clock.now();
    let barrier = Arc::new(tokio::sync::Barrier::new(2));

    let sweeper = {
        let (collector, barrier) = (collector.clone(), barrier.clone());
        tokio::spawn(async move {
            barrier.wait().await;
            for _ in 0..JOBS {
                collector.sweep(now);
                tokio::task::yield_now().await;
            }
        })
    };
    let receiver = {
        let (collector, barrier) = (collector.clone(), barrier.clone());
        tokio::spawn(async move {
            barrier.wait().await;
            let mut dispositions = Vec::new();
            for frame in finals {
                dispositions.push(collector.on_message("minion-b", &frame));
                tokio::task::yield_now().await;
            }
            dispositions
        })
    };
    sweeper.await.unwrap();
    let dispositions = receiver.await.unwrap();
    assert!(dispositions
        .iter()
        .all(|d| matches!(d, Disposition::Completed | Disposition::Late)));

    let records = fx.registry.list();
    assert_eq!(records.len(), JOBS as usize);
    assert!(records.iter().all(|r| r.state == JobState::Complete));

    let sink = returner.clone();
    assert_eventually(
        || {
            let sink = sink.clone();
            async move { sink.records().len() >= JOBS as usize }
        },
        Duration::from_secs(5),
        "every job should reach the returner",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stored = returner.records();
    let unique: BTreeSet<_> = stored.iter().map(|r| r.job_id().clone()).collect();
    assert_eq!(stored.len(), JOBS as usize);
    assert_eq!(unique.len(), JOBS as usize);
    assert_eq!(
        fx.events.of_type(EventType::JobResultsEnd).len(),
        JOBS as usize
    );
}

#[tokio::test]
async fn test_timed_out_jobs_are_not_sunk() {
    let fx = Fixture::new();
    let returner = Arc::new(MemoryReturner::new());
    let collector = fx
        .collector()
        .with_returner(returner.clone(), Duration::from_millis(10));
    fx.create_job();

    fx.advance(6);
    collector.sweep(fx.clock.now());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(returner.records().is_empty());
    let end = fx.events.of_type(EventType::JobResultsEnd);
    assert_eq!(end[0].meta["state"], json!("timed_out"));
}

#[tokio::test]
async fn test_heartbeat_extends_deadline() {
    let fx = Fixture::new();
    let collector = fx.collector();
    let job_id = fx.create_job();
    let original = fx.registry.status(&job_id).unwrap().deadline;

    fx.advance(1);
    let done = fx.seal("minion-a", &fx.result("minion-a", 0));
    collector.on_message("minion-a", &done);

    fx.advance(3);
    let heartbeat = Message::Heartbeat(Heartbeat {
        job_id: job_id.clone(),
        minion_id: "minion-b".to_string(),
        sent_at: fx.clock.now(),
        extend_by: Duration::from_secs(5),
    });
    let frame = fx.seal("minion-b", &heartbeat);
    assert_eq!(
        collector.on_message("minion-b", &frame),
        Disposition::HeartbeatApplied
    );
    let record = fx.registry.status(&job_id).unwrap();
    assert_eq!(record.deadline, add_duration(fx.clock.now(), Duration::from_secs(5)));
    assert!(record.deadline > original);
    assert!(record.extended_until.contains_key("minion-b"));

    // The original deadline passes without closing the job
    fx.advance(2);
    assert!(collector.sweep(fx.clock.now()).completed.is_empty());
    assert_eq!(fx.registry.status(&job_id).unwrap().state, JobState::Collecting);

    // A heartbeat from a minion that already answered changes nothing
    let stale = Message::Heartbeat(Heartbeat {
        job_id: job_id.clone(),
        minion_id: "minion-a".to_string(),
        sent_at: fx.clock.now(),
        extend_by: Duration::from_secs(60),
    });
    let frame = fx.seal("minion-a", &stale);
    assert_eq!(
        collector.on_message("minion-a", &frame),
        Disposition::HeartbeatIgnored
    );

    fx.advance(3);
    let report = collector.sweep(fx.clock.now());
    assert_eq!(report.completed.len(), 1);
    assert!(fx.registry.status(&job_id).unwrap().is_partial());
}

#[tokio::test]
async fn test_control_acks_are_forwarded() {
    let fx = Fixture::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let collector = fx.collector().with_ack_sink(tx);
    let job_id = fx.create_job();

    let ack = ControlAck {
        job_id: job_id.clone(),
        minion_id: "minion-b".to_string(),
        kind: AckKind::Cancel,
        was_running: false,
    };
    let frame = fx.seal("minion-b", &Message::ControlAck(ack.clone()));
    assert_eq!(
        collector.on_message("minion-b", &frame),
        Disposition::AckForwarded
    );
    assert_eq!(rx.recv().await, Some(ack));
}

#[tokio::test]
async fn test_returner_retries_once() {
    let fx = Fixture::new();
    let flaky = Arc::new(FlakyReturner::new(1));
    let collector = fx
        .collector()
        .with_returner(flaky.clone(), Duration::from_millis(10));
    let job_id = fx.create_job();

    for id in ["minion-a", "minion-b"] {
        let frame = fx.seal(id, &fx.result(id, 0));
        collector.on_message(id, &frame);
    }

    let sink = flaky.clone();
    let jid = job_id.clone();
    assert_eventually(
        || {
            let sink = sink.clone();
            let jid = jid.clone();
            async move { sink.inner.get(&jid).is_some() }
        },
        Duration::from_secs(1),
        "retry should store the record",
    )
    .await;
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    assert_eq!(collector.stats().sunk, 1);
    assert_eq!(collector.stats().sink_failures, 0);
}

#[tokio::test]
async fn test_returner_failure_is_dropped_after_retry() {
    let fx = Fixture::new();
    let flaky = Arc::new(FlakyReturner::new(usize::MAX));
    let collector = Arc::new(
        fx.collector()
            .with_returner(flaky.clone(), Duration::from_millis(10)),
    );
    let job_id = fx.create_job();

    for id in ["minion-a", "minion-b"] {
        let frame = fx.seal(id, &fx.result(id, 0));
        collector.on_message(id, &frame);
    }

    let c = collector.clone();
    assert_eventually(
        || {
            let c = c.clone();
            async move { c.stats().sink_failures == 1 }
        },
        Duration::from_secs(1),
        "second failure should be counted",
    )
    .await;
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    // The job itself is unaffected
    assert_eq!(fx.registry.status(&job_id).unwrap().state, JobState::Complete);
}

#[tokio::test]
async fn test_retention_evicts_finished_jobs() {
    let fx = Fixture::new();
    let collector = fx.collector();
    let job_id = fx.create_job();

    for id in ["minion-a", "minion-b"] {
        let frame = fx.seal(id, &fx.result(id, 0));
        collector.on_message(id, &frame);
    }

    fx.advance(30 * 60);
    assert!(collector.sweep(fx.clock.now()).evicted.is_empty());

    fx.advance(31 * 60);
    let report = collector.sweep(fx.clock.now());
    assert_eq!(report.evicted, vec![job_id.clone()]);
    assert!(fx.registry.status(&job_id).is_err());
}

#[tokio::test]
async fn test_expired_session_frames_are_rejected() {
    let fx = Fixture::new();
    let collector = fx.collector();
    fx.create_job();

    let frame = fx.seal("minion-a", &fx.result("minion-a", 0));
    fx.advance(2 * 60 * 60);
    assert_eq!(
        collector.on_message("minion-a", &frame),
        Disposition::RejectedDecrypt
    );
    assert!(fx.minions["minion-a"].encrypt("master", b"x").is_err());
}

#[tokio::test]
async fn test_local_cache_returner_persists_records() {
    let fx = Fixture::new();
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(LocalCacheReturner::new(dir.path()));
    let collector = fx
        .collector()
        .with_returner(cache.clone(), Duration::from_millis(10));
    let job_id = fx.create_job();

    for id in ["minion-a", "minion-b"] {
        let frame = fx.seal(id, &fx.result(id, 0));
        collector.on_message(id, &frame);
    }

    let path = cache.path_for(&job_id);
    assert_eventually(
        || {
            let path = path.clone();
            async move { path.exists() }
        },
        Duration::from_secs(1),
        "record file should be written",
    )
    .await;

    let stored = cache.load(&job_id).await.unwrap();
    assert_eq!(stored.job_id(), &job_id);
    assert_eq!(stored.state, JobState::Complete);
    assert_eq!(stored.results.len(), 2);
    assert_eq!(cache.job_ids().await.unwrap(), vec![job_id]);
}
