use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::models::job::{JobStatus, SheetJob};
use crate::services::descriptor::JobStore;
use crate::services::pipeline::Pipeline;

/// Drives freshly stored jobs through the conversion pipeline in the background.
///
/// Each job gets its own task, and that task is the only writer of the job's
/// status. Failures after the task starts are only visible through the
/// descriptor and `error.log`.
pub struct JobRunner {
    jobs: Arc<JobStore>,
    pipeline: Arc<Pipeline>,
}

impl JobRunner {
    pub fn new(jobs: Arc<JobStore>, pipeline: Arc<Pipeline>) -> Self {
        Self { jobs, pipeline }
    }

    /// Fire-and-forget conversion of a `pending` job.
    pub fn spawn(self: &Arc<Self>, job: SheetJob) -> JoinHandle<Option<JobStatus>> {
        let runner = Arc::clone(self);
        let span = tracing::info_span!("job", job_id = %job.id);
        tokio::spawn(async move { runner.run(&job).await }.instrument(span))
    }

    /// Run the job to a terminal status.
    ///
    /// Returns the last status this run persisted, or `None` if it could not
    /// write any.
    pub async fn run(&self, job: &SheetJob) -> Option<JobStatus> {
        let id = &job.id;

        if let Err(e) = self.jobs.save(id, JobStatus::InProgress).await {
            tracing::error!(error = %e, "Failed to mark sheet in progress");
            metrics::counter!("sheet_jobs_failed").increment(1);
            return match self.jobs.save(id, JobStatus::Fail).await {
                Ok(_) => Some(JobStatus::Fail),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to mark sheet as failed");
                    None
                }
            };
        }
        tracing::info!("Conversion started");

        let started = Instant::now();
        let outcome = self
            .pipeline
            .convert(&self.jobs.job_dir(id), job.content_type.input_file_name())
            .await;
        metrics::histogram!("sheet_conversion_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(()) => {
                metrics::counter!("sheet_jobs_completed").increment(1);
                self.finish(job, JobStatus::Done).await
            }
            Err(e) => {
                tracing::error!(error = %e, stage = %e.stage(), "Conversion failed");
                metrics::counter!("sheet_jobs_failed").increment(1);
                if let Err(write_err) = self.jobs.write_error(id, &e.to_string()).await {
                    tracing::error!(error = %write_err, "Failed to write error log");
                }
                self.finish(job, JobStatus::Fail).await
            }
        }
    }

    async fn finish(&self, job: &SheetJob, status: JobStatus) -> Option<JobStatus> {
        match self.jobs.save(&job.id, status).await {
            Ok(_) => {
                tracing::info!(%status, "Conversion finished");
                Some(status)
            }
            Err(e) => {
                // Left at in-progress: degraded, but never a false terminal status.
                tracing::error!(error = %e, %status, "Failed to record final status");
                Some(JobStatus::InProgress)
            }
        }
    }
}
