use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::models::job::{ImageType, JobId, JobStatus, SheetJob};
use crate::services::descriptor;
use crate::services::validation::{self, ValidationError, SNIFF_LEN};

/// Prefix of in-flight upload directories under the data root.
pub const INCOMING_PREFIX: &str = ".incoming-";

const CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of storing an upload.
#[derive(Debug, Clone)]
pub struct Stored {
    pub job: SheetJob,
    /// `false` when identical bytes were already stored; the existing job is returned.
    pub created: bool,
}

/// Content-addressed store for uploaded sheet images.
///
/// Each upload is written to a private temporary directory under the data root
/// while it is hashed, then promoted to `<root>/<sha256>` with a single rename.
/// A directory already holding that hash is never replaced.
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Stream `reader` into the store, deduplicating by content hash.
    pub async fn store<R>(&self, content_type: ImageType, mut reader: R) -> Result<Stored, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let incoming = tempfile::Builder::new()
            .prefix(INCOMING_PREFIX)
            .tempdir_in(&self.root)
            .map_err(StoreError::io("create incoming directory"))?;

        let input_path = incoming.path().join(content_type.input_file_name());
        let mut file = tokio::fs::File::create(&input_path)
            .await
            .map_err(StoreError::io("create input file"))?;

        let mut hasher = Sha256::new();
        let mut head = Vec::with_capacity(SNIFF_LEN);
        let mut received: u64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = reader.read(&mut buf).await.map_err(read_failure)?;
            if n == 0 {
                break;
            }
            received += n as u64;
            validation::check_size(received)?;

            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(n);
                head.extend_from_slice(&buf[..take]);
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .await
                .map_err(StoreError::io("write input file"))?;
        }
        file.flush().await.map_err(StoreError::io("flush input file"))?;
        drop(file);

        validation::check_signature(content_type, &head)?;

        let id = JobId::from_digest(hasher.finalize());
        let target = self.root.join(&id);

        if exists(&target).await? {
            tracing::info!(job_id = %id, "Upload matches an existing sheet, discarding copy");
            return self.existing(id).await;
        }

        let job = SheetJob::new(id.clone(), content_type);
        descriptor::write_descriptor(incoming.path(), &job).await?;

        if let Err(e) = tokio::fs::rename(incoming.path(), &target).await {
            // Lost a race against an identical upload; the winner's directory stays.
            if exists(&target).await? {
                tracing::info!(job_id = %id, "Concurrent identical upload won promotion");
                return self.existing(id).await;
            }
            return Err(StoreError::Io {
                context: "promote upload",
                source: e,
            });
        }
        let _promoted = incoming.keep();

        tracing::info!(job_id = %id, bytes = received, "Stored new sheet upload");
        Ok(Stored { job, created: true })
    }

    async fn existing(&self, id: JobId) -> Result<Stored, StoreError> {
        let job = descriptor::read_descriptor(&self.root, &id).await?;
        Ok(Stored {
            job,
            created: false,
        })
    }
}

/// Readers may fail with a [`ValidationError`] (the request body cap); keep that a rejection.
fn read_failure(source: io::Error) -> StoreError {
    match source
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<ValidationError>())
    {
        Some(rejected) => StoreError::Rejected(rejected.clone()),
        None => StoreError::Io {
            context: "read upload",
            source,
        },
    }
}

async fn exists(path: &Path) -> Result<bool, StoreError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(StoreError::io("check job directory"))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sheet {0} not found")]
    NotFound(JobId),

    #[error("sheet {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("descriptor of sheet {id} is unreadable: {source}")]
    Corrupt {
        id: JobId,
        #[source]
        source: serde_json::Error,
    },

    #[error("descriptor of sheet {id} could not be encoded: {source}")]
    Encode {
        id: JobId,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Rejected(#[from] ValidationError),

    #[error("failed to {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> StoreError {
        move |source| StoreError::Io { context, source }
    }
}
