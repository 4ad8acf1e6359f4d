//! Transport channel abstraction.
//!
//! The master publishes sealed frames to minions and receives their
//! replies; a minion receives published frames and sends replies back.
//! Frames are opaque bytes at this layer.

mod local;

pub use local::{LocalBus, MasterEndpoint, MinionEndpoint};

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::MinionId;

/// A frame received from `peer`.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub peer: String,
    pub payload: Bytes,
}

/// Per-target delivery outcome of a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: BTreeSet<MinionId>,
    pub failed: BTreeMap<MinionId, TransportError>,
}

impl PublishReport {
    pub fn merge(&mut self, other: PublishReport) {
        self.delivered.extend(other.delivered);
        self.failed.extend(other.failed);
    }
}

/// Master side of the channel.
#[async_trait]
pub trait PublishChannel: Send + Sync {
    /// Publishes the same frame to every target. Failures are per target.
    async fn publish(&self, targets: &BTreeSet<MinionId>, payload: Bytes) -> PublishReport;

    /// Publishes a distinct frame to each minion (one sealed copy per session).
    async fn publish_each(&self, frames: Vec<(MinionId, Bytes)>) -> PublishReport {
        let mut report = PublishReport::default();
        for (minion_id, payload) in frames {
            let targets = BTreeSet::from([minion_id]);
            report.merge(self.publish(&targets, payload).await);
        }
        report
    }

    /// Registers the queue inbound replies are delivered to.
    fn on_receive(&self, handler: mpsc::Sender<Inbound>);
}

/// Minion side of the channel.
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    async fn send_reply(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Registers the queue published frames are delivered to.
    fn on_receive(&self, handler: mpsc::Sender<Inbound>);
}
