use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::Mutex as AsyncMutex;

use crate::models::job::{JobId, JobStatus, SheetJob};
use crate::services::storage::StoreError;

/// Descriptor file name inside each job directory.
pub const DESCRIPTOR_FILE: &str = "details.json";
/// Interchange (MusicXML) document produced by the pipeline.
pub const INTERCHANGE_FILE: &str = "output.xml";
/// Final compressed MusicXML package.
pub const PACKAGE_FILE: &str = "output.mxl";
/// Failure detail written when a conversion fails.
pub const ERROR_FILE: &str = "error.log";

/// Reads and updates job descriptors under the data root.
///
/// Status writes for one job id are serialized by an in-process lock, and each
/// write replaces `details.json` through a rename so readers only ever see a
/// complete record.
pub struct JobStore {
    root: PathBuf,
    locks: Mutex<HashMap<JobId, Weak<AsyncMutex<()>>>>,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, id: &JobId) -> PathBuf {
        self.root.join(id)
    }

    pub fn artifact_path(&self, id: &JobId, file_name: &str) -> PathBuf {
        self.job_dir(id).join(file_name)
    }

    /// Current descriptor snapshot of `id`.
    pub async fn load(&self, id: &JobId) -> Result<SheetJob, StoreError> {
        read_descriptor(&self.root, id).await
    }

    /// Move `id` to `status`, rejecting edges the state machine does not allow.
    pub async fn save(&self, id: &JobId, status: JobStatus) -> Result<SheetJob, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut job = self.load(id).await?;
        if !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from: job.status,
                to: status,
            });
        }
        job.status = status;
        write_descriptor(&self.job_dir(id), &job).await?;

        tracing::debug!(job_id = %id, status = %status, "Descriptor updated");
        Ok(job)
    }

    /// Persist the failure detail of a conversion next to its descriptor.
    pub async fn write_error(&self, id: &JobId, detail: &str) -> Result<(), StoreError> {
        tokio::fs::write(self.artifact_path(id, ERROR_FILE), detail)
            .await
            .map_err(StoreError::io("write error log"))
    }

    pub async fn read_error(&self, id: &JobId) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.artifact_path(id, ERROR_FILE)).await {
            Ok(detail) => Ok(Some(detail)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io {
                context: "read error log",
                source: e,
            }),
        }
    }

    fn lock_for(&self, id: &JobId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(id).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(id.clone(), Arc::downgrade(&lock));
        lock
    }
}

pub(crate) async fn read_descriptor(root: &Path, id: &JobId) -> Result<SheetJob, StoreError> {
    let path = root.join(id).join(DESCRIPTOR_FILE);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(id.clone()))
        }
        Err(e) => {
            return Err(StoreError::Io {
                context: "read descriptor",
                source: e,
            })
        }
    };
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
        id: id.clone(),
        source,
    })
}

/// Write `job` as the descriptor of `dir`, replacing any previous one atomically.
pub(crate) async fn write_descriptor(dir: &Path, job: &SheetJob) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(job).map_err(|source| StoreError::Encode {
        id: job.id.clone(),
        source,
    })?;
    let staging = dir.join(format!("{DESCRIPTOR_FILE}.tmp"));
    tokio::fs::write(&staging, bytes)
        .await
        .map_err(StoreError::io("write descriptor"))?;
    tokio::fs::rename(&staging, dir.join(DESCRIPTOR_FILE))
        .await
        .map_err(StoreError::io("replace descriptor"))
}
