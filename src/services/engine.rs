use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Instant;

/// Bytes kept from the end of each of stdout and stderr.
pub const DIAGNOSTICS_TAIL: usize = 32 * 1024;

/// An external conversion tool the pipeline can drive.
///
/// Implementations run to completion in `working_dir` or give up at `deadline`.
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        working_dir: &Path,
        args: &[OsString],
        deadline: Instant,
    ) -> Result<(), EngineFailure>;
}

#[derive(Debug, thiserror::Error)]
pub enum EngineFailure {
    #[error("{engine} could not be run: {source}")]
    Launch {
        engine: String,
        #[source]
        source: io::Error,
    },

    #[error("{engine} exited with {status}\n{diagnostics}")]
    Exit {
        engine: String,
        status: String,
        diagnostics: String,
    },

    #[error("{engine} was still running at the deadline and was killed")]
    DeadlineExceeded { engine: String },
}

/// Runs an executable as a child process, capturing its output for diagnostics.
pub struct ProcessEngine {
    name: String,
    program: PathBuf,
}

impl ProcessEngine {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
        }
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        working_dir: &Path,
        args: &[OsString],
        deadline: Instant,
    ) -> Result<(), EngineFailure> {
        tracing::debug!(engine = %self.name, program = ?self.program, ?args, "Launching engine");

        let mut child = Command::new(&self.program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineFailure::Launch {
                engine: self.name.clone(),
                source,
            })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Dropping the timed-out future leaves `child` to be dropped, which kills it.
        let (status, stderr, stdout) = tokio::time::timeout_at(deadline, async {
            tokio::try_join!(child.wait(), read_tail(stderr), read_tail(stdout))
        })
        .await
        .map_err(|_| EngineFailure::DeadlineExceeded {
            engine: self.name.clone(),
        })?
        .map_err(|source| EngineFailure::Launch {
            engine: self.name.clone(),
            source,
        })?;

        if status.success() {
            return Ok(());
        }

        let mut diagnostics = String::from_utf8_lossy(&stderr).into_owned();
        diagnostics.push_str(&String::from_utf8_lossy(&stdout));
        Err(EngineFailure::Exit {
            engine: self.name.clone(),
            status: status.to_string(),
            diagnostics,
        })
    }
}

/// Drain `pipe` to the end, keeping only its last [`DIAGNOSTICS_TAIL`] bytes.
async fn read_tail<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let Some(mut pipe) = pipe else {
        return Ok(Vec::new());
    };
    let mut tail = Vec::with_capacity(DIAGNOSTICS_TAIL);
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            return Ok(tail);
        }
        tail.extend_from_slice(&buf[..n]);
        if tail.len() > DIAGNOSTICS_TAIL {
            tail.drain(..tail.len() - DIAGNOSTICS_TAIL);
        }
    }
}
