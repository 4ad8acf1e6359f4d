//! In-process transport over tokio channels. Each connection is FIFO.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::TransportError;
use crate::protocol::MinionId;
use crate::transport::{Inbound, PublishChannel, PublishReport, ReplyChannel};

#[derive(Debug)]
struct BusInner {
    master_id: String,
    master_inbox: RwLock<Option<mpsc::Sender<Inbound>>>,
    minions: DashMap<MinionId, mpsc::Sender<Inbound>>,
}

/// A master and any number of minions wired together in memory.
#[derive(Debug, Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    pub fn new(master_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                master_id: master_id.into(),
                master_inbox: RwLock::new(None),
                minions: DashMap::new(),
            }),
        }
    }

    pub fn master_endpoint(&self) -> MasterEndpoint {
        MasterEndpoint {
            inner: self.inner.clone(),
        }
    }

    /// Endpoint for `minion_id`. Frames reach it once it registers a handler.
    pub fn connect(&self, minion_id: impl Into<MinionId>) -> MinionEndpoint {
        MinionEndpoint {
            minion_id: minion_id.into(),
            inner: self.inner.clone(),
        }
    }

    /// Drops the minion's inbound queue; later publishes to it fail.
    pub fn disconnect(&self, minion_id: &str) -> bool {
        let removed = self.inner.minions.remove(minion_id).is_some();
        if removed {
            tracing::info!(minion_id, "Minion disconnected from bus");
        }
        removed
    }

    pub fn connected(&self) -> Vec<MinionId> {
        let mut ids: Vec<_> = self.inner.minions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone)]
pub struct MasterEndpoint {
    inner: Arc<BusInner>,
}

#[async_trait]
impl PublishChannel for MasterEndpoint {
    async fn publish(&self, targets: &BTreeSet<MinionId>, payload: Bytes) -> PublishReport {
        let mut report = PublishReport::default();
        for minion_id in targets {
            let Some(tx) = self.inner.minions.get(minion_id).map(|e| e.value().clone()) else {
                report
                    .failed
                    .insert(minion_id.clone(), TransportError::NotConnected(minion_id.clone()));
                continue;
            };
            let frame = Inbound {
                peer: self.inner.master_id.clone(),
                payload: payload.clone(),
            };
            match tx.try_send(frame) {
                Ok(()) => {
                    report.delivered.insert(minion_id.clone());
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(minion_id = %minion_id, "Minion queue full, frame dropped");
                    report
                        .failed
                        .insert(minion_id.clone(), TransportError::QueueFull(minion_id.clone()));
                }
                Err(TrySendError::Closed(_)) => {
                    self.inner.minions.remove(minion_id);
                    report
                        .failed
                        .insert(minion_id.clone(), TransportError::NotConnected(minion_id.clone()));
                }
            }
        }
        report
    }

    fn on_receive(&self, handler: mpsc::Sender<Inbound>) {
        *self.inner.master_inbox.write() = Some(handler);
    }
}

#[derive(Debug, Clone)]
pub struct MinionEndpoint {
    minion_id: MinionId,
    inner: Arc<BusInner>,
}

impl MinionEndpoint {
    pub fn minion_id(&self) -> &str {
        &self.minion_id
    }
}

#[async_trait]
impl ReplyChannel for MinionEndpoint {
    async fn send_reply(&self, payload: Bytes) -> Result<(), TransportError> {
        let tx = self
            .inner
            .master_inbox
            .read()
            .clone()
            .ok_or_else(|| TransportError::NotConnected(self.inner.master_id.clone()))?;
        tx.send(Inbound {
            peer: self.minion_id.clone(),
            payload,
        })
        .await
        .map_err(|_| TransportError::Closed)
    }

    fn on_receive(&self, handler: mpsc::Sender<Inbound>) {
        self.inner.minions.insert(self.minion_id.clone(), handler);
        tracing::debug!(minion_id = %self.minion_id, "Minion connected to bus");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reports_unconnected_targets() {
        let bus = LocalBus::new("master");
        let master = bus.master_endpoint();
        let web1 = bus.connect("web1");
        let (tx, mut rx) = mpsc::channel(4);
        web1.on_receive(tx);

        let targets = BTreeSet::from(["web1".to_string(), "web2".to_string()]);
        let report = master.publish(&targets, Bytes::from_static(b"frame")).await;
        assert_eq!(report.delivered, BTreeSet::from(["web1".to_string()]));
        assert_eq!(
            report.failed.get("web2"),
            Some(&TransportError::NotConnected("web2".to_string()))
        );

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.peer, "master");
        assert_eq!(&frame.payload[..], b"frame");
    }

    #[tokio::test]
    async fn full_queue_is_a_per_target_failure() {
        let bus = LocalBus::new("master");
        let master = bus.master_endpoint();
        let (tx, _rx) = mpsc::channel(1);
        bus.connect("web1").on_receive(tx);

        let targets = BTreeSet::from(["web1".to_string()]);
        master.publish(&targets, Bytes::from_static(b"1")).await;
        let report = master.publish(&targets, Bytes::from_static(b"2")).await;
        assert!(matches!(
            report.failed.get("web1"),
            Some(TransportError::QueueFull(_))
        ));
    }

    #[tokio::test]
    async fn replies_reach_master_in_order() {
        let bus = LocalBus::new("master");
        let (tx, mut rx) = mpsc::channel(8);
        bus.master_endpoint().on_receive(tx);
        let web1 = bus.connect("web1");

        web1.send_reply(Bytes::from_static(b"a")).await.unwrap();
        web1.send_reply(Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"a");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.peer, "web1");
        assert_eq!(&second.payload[..], b"b");
    }

    #[tokio::test]
    async fn disconnect_and_missing_master() {
        let bus = LocalBus::new("master");
        let web1 = bus.connect("web1");
        assert_eq!(
            web1.send_reply(Bytes::new()).await,
            Err(TransportError::NotConnected("master".to_string()))
        );

        let (tx, _rx) = mpsc::channel(1);
        web1.on_receive(tx);
        assert_eq!(bus.connected(), vec!["web1".to_string()]);
        assert!(bus.disconnect("web1"));
        assert!(bus.connected().is_empty());
    }
}
