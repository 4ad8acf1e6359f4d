//! Returner sinks: where finalised job records are persisted.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::protocol::JobId;
use crate::scheduler::JobRecord;

#[async_trait]
pub trait ReturnerSink: Send + Sync {
    async fn store(&self, record: &JobRecord) -> Result<(), StoreError>;
}

/// Keeps stored records in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryReturner {
    records: Mutex<Vec<JobRecord>>,
}

impl MemoryReturner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JobRecord> {
        self.records.lock().clone()
    }

    pub fn get(&self, job_id: &JobId) -> Option<JobRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.job_id() == job_id)
            .cloned()
    }
}

#[async_trait]
impl ReturnerSink for MemoryReturner {
    async fn store(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Writes each record to `<cachedir>/jobs/<jid>.json`.
#[derive(Debug, Clone)]
pub struct LocalCacheReturner {
    cachedir: PathBuf,
}

impl LocalCacheReturner {
    pub fn new(cachedir: impl Into<PathBuf>) -> Self {
        Self {
            cachedir: cachedir.into(),
        }
    }

    fn jobs_dir(&self) -> PathBuf {
        self.cachedir.join("jobs")
    }

    pub fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.jobs_dir().join(format!("{job_id}.json"))
    }

    pub async fn load(&self, job_id: &JobId) -> Result<JobRecord, StoreError> {
        let bytes = tokio::fs::read(self.path_for(job_id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Job ids with a stored record, sorted.
    pub async fn job_ids(&self) -> Result<Vec<JobId>, StoreError> {
        let dir = self.jobs_dir();
        if !Path::new(&dir).exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(JobId::new(stem));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl ReturnerSink for LocalCacheReturner {
    async fn store(&self, record: &JobRecord) -> Result<(), StoreError> {
        let dir = self.jobs_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let body = serde_json::to_vec_pretty(record)?;
        let path = self.path_for(record.job_id());
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(job_id = %record.job_id(), path = %path.display(), "Job record stored");
        Ok(())
    }
}
