use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use strum::Display;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::services::descriptor::{INTERCHANGE_FILE, PACKAGE_FILE};
use crate::services::engine::{Engine, EngineFailure, ProcessEngine};

/// Fingerprint the recognition engine leaves in movement titles.
pub const RECOGNIZER_MARKER: &str = "[Audiveris detected movement]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Recognize,
    Interchange,
    Clean,
    Package,
}

/// Image → MusicXML conversion: recognize, export to `output.xml`, strip the
/// recognizer marker, then package to `output.mxl`.
///
/// All stages share one deadline, so a slow early stage leaves less time for
/// the later ones.
pub struct Pipeline {
    recognizer: Arc<dyn Engine>,
    converter: Arc<dyn Engine>,
    timeout: Duration,
}

impl Pipeline {
    pub fn new(recognizer: Arc<dyn Engine>, converter: Arc<dyn Engine>, timeout: Duration) -> Self {
        Self {
            recognizer,
            converter,
            timeout,
        }
    }

    /// Audiveris for recognition, MuseScore for conversion, as configured.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Arc::new(ProcessEngine::new("audiveris", &config.audiveris_bin)),
            Arc::new(ProcessEngine::new("mscore", &config.mscore_bin)),
            config.pipeline_timeout(),
        )
    }

    /// Convert `job_dir/input_file`, leaving `output.xml` and `output.mxl` in `job_dir`.
    pub async fn convert(&self, job_dir: &Path, input_file: &str) -> Result<(), PipelineError> {
        let deadline = Instant::now() + self.timeout;
        let export = recognizer_export(input_file);

        self.invoke(
            Stage::Recognize,
            self.recognizer.as_ref(),
            job_dir,
            vec![
                "-batch".into(),
                "-export".into(),
                "-output".into(),
                job_dir.into(),
                job_dir.join(input_file).into(),
            ],
            deadline,
            &export,
        )
        .await?;

        self.invoke(
            Stage::Interchange,
            self.converter.as_ref(),
            job_dir,
            vec!["-o".into(), INTERCHANGE_FILE.into(), export.into()],
            deadline,
            Path::new(INTERCHANGE_FILE),
        )
        .await?;

        self.check_deadline(Stage::Clean, deadline)?;
        tokio::time::timeout_at(deadline, strip_marker(&job_dir.join(INTERCHANGE_FILE)))
            .await
            .map_err(|_| self.timed_out(Stage::Clean))?
            .map_err(|source| PipelineError::Io {
                stage: Stage::Clean,
                source,
            })?;

        self.invoke(
            Stage::Package,
            self.converter.as_ref(),
            job_dir,
            vec!["-o".into(), PACKAGE_FILE.into(), INTERCHANGE_FILE.into()],
            deadline,
            Path::new(PACKAGE_FILE),
        )
        .await
    }

    async fn invoke(
        &self,
        stage: Stage,
        engine: &dyn Engine,
        job_dir: &Path,
        args: Vec<OsString>,
        deadline: Instant,
        expected: &Path,
    ) -> Result<(), PipelineError> {
        self.check_deadline(stage, deadline)?;

        let started = Instant::now();
        tracing::info!(%stage, engine = engine.name(), "Pipeline stage started");

        engine
            .run(job_dir, &args, deadline)
            .await
            .map_err(|failure| match failure {
                EngineFailure::DeadlineExceeded { .. } => self.timed_out(stage),
                source => PipelineError::Engine { stage, source },
            })?;

        let produced = job_dir.join(expected);
        let present = tokio::fs::try_exists(&produced)
            .await
            .map_err(|source| PipelineError::Io { stage, source })?;
        if !present {
            return Err(PipelineError::MissingOutput {
                stage,
                path: expected.to_path_buf(),
            });
        }

        tracing::info!(
            %stage,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline stage finished"
        );
        Ok(())
    }

    fn check_deadline(&self, stage: Stage, deadline: Instant) -> Result<(), PipelineError> {
        if Instant::now() >= deadline {
            return Err(self.timed_out(stage));
        }
        Ok(())
    }

    fn timed_out(&self, stage: Stage) -> PipelineError {
        PipelineError::Timeout {
            stage,
            timeout: self.timeout,
        }
    }
}

/// Where the recognition engine exports `input.png`: `input/input.mxl`.
fn recognizer_export(input_file: &str) -> PathBuf {
    let stem = Path::new(input_file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| input_file.to_string());
    PathBuf::from(&stem).join(format!("{stem}.mxl"))
}

/// Remove every occurrence of the recognizer marker from `path`, in place.
async fn strip_marker(path: &Path) -> io::Result<()> {
    let original = String::from_utf8(tokio::fs::read(path).await?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if !original.contains(RECOGNIZER_MARKER) {
        return Ok(());
    }
    let cleaned = original.replace(RECOGNIZER_MARKER, "");

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    tokio::fs::write(&staging, cleaned).await?;
    tokio::fs::rename(&staging, path).await
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{stage} stage failed: {source}")]
    Engine {
        stage: Stage,
        #[source]
        source: EngineFailure,
    },

    #[error("conversion timed out after {}s during {stage} stage", timeout.as_secs_f64())]
    Timeout { stage: Stage, timeout: Duration },

    #[error("{stage} stage finished without producing {}", path.display())]
    MissingOutput { stage: Stage, path: PathBuf },

    #[error("{stage} stage I/O error: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Engine { stage, .. }
            | PipelineError::Timeout { stage, .. }
            | PipelineError::MissingOutput { stage, .. }
            | PipelineError::Io { stage, .. } => *stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Writes the file named after `-o` (or the recognizer export) like the real tools.
    struct FakeEngine {
        name: &'static str,
        delay: Duration,
        fail_on_call: Option<usize>,
        skip_output: bool,
        calls: Mutex<Vec<Vec<OsString>>>,
    }

    impl FakeEngine {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                delay: Duration::ZERO,
                fail_on_call: None,
                skip_output: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<OsString>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Engine for FakeEngine {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(
            &self,
            working_dir: &Path,
            args: &[OsString],
            deadline: Instant,
        ) -> Result<(), EngineFailure> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(args.to_vec());
                calls.len()
            };
            if tokio::time::timeout_at(deadline, tokio::time::sleep(self.delay))
                .await
                .is_err()
            {
                return Err(EngineFailure::DeadlineExceeded {
                    engine: self.name.to_string(),
                });
            }
            if self.fail_on_call == Some(call) {
                return Err(EngineFailure::Exit {
                    engine: self.name.to_string(),
                    status: "exit status: 1".to_string(),
                    diagnostics: "could not read image".to_string(),
                });
            }
            if self.skip_output {
                return Ok(());
            }

            if args[0] == "-batch" {
                let export = working_dir.join("input");
                tokio::fs::create_dir_all(&export).await.unwrap();
                tokio::fs::write(export.join("input.mxl"), b"native").await.unwrap();
            } else {
                let out = working_dir.join(&args[1]);
                let body = if out.extension().is_some_and(|e| e == "xml") {
                    format!("<work-title>{RECOGNIZER_MARKER}</work-title><part/>")
                } else {
                    "PK-package".to_string()
                };
                tokio::fs::write(out, body).await.unwrap();
            }
            Ok(())
        }
    }

    fn pipeline(recognizer: Arc<FakeEngine>, converter: Arc<FakeEngine>, timeout: Duration) -> Pipeline {
        Pipeline::new(recognizer, converter, timeout)
    }

    #[tokio::test]
    async fn runs_all_stages_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let recognizer = Arc::new(FakeEngine::new("audiveris"));
        let converter = Arc::new(FakeEngine::new("mscore"));
        let p = pipeline(recognizer.clone(), converter.clone(), Duration::from_secs(5));

        p.convert(tmp.path(), "input.png").await.unwrap();

        let recognized = recognizer.calls();
        assert_eq!(recognized.len(), 1);
        assert_eq!(recognized[0][4], OsString::from(tmp.path().join("input.png")));

        let converted = converter.calls();
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0], vec![OsString::from("-o"), "output.xml".into(), "input/input.mxl".into()]);
        assert_eq!(converted[1], vec![OsString::from("-o"), "output.mxl".into(), "output.xml".into()]);

        let xml = tokio::fs::read_to_string(tmp.path().join(INTERCHANGE_FILE)).await.unwrap();
        assert!(!xml.contains(RECOGNIZER_MARKER));
        assert_eq!(xml, "<work-title></work-title><part/>");
        assert!(tmp.path().join(PACKAGE_FILE).is_file());
    }

    #[tokio::test]
    async fn recognition_failure_stops_the_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let recognizer = Arc::new(FakeEngine {
            fail_on_call: Some(1),
            ..FakeEngine::new("audiveris")
        });
        let converter = Arc::new(FakeEngine::new("mscore"));
        let p = pipeline(recognizer, converter.clone(), Duration::from_secs(5));

        let err = p.convert(tmp.path(), "input.jpg").await.unwrap_err();

        assert_eq!(err.stage(), Stage::Recognize);
        assert!(err.to_string().contains("could not read image"));
        assert!(converter.calls().is_empty());
        assert!(!tmp.path().join(INTERCHANGE_FILE).exists());
        assert!(!tmp.path().join(PACKAGE_FILE).exists());
    }

    #[tokio::test]
    async fn packaging_failure_is_reported_with_its_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let converter = Arc::new(FakeEngine {
            fail_on_call: Some(2),
            ..FakeEngine::new("mscore")
        });
        let p = pipeline(Arc::new(FakeEngine::new("audiveris")), converter, Duration::from_secs(5));

        let err = p.convert(tmp.path(), "input.png").await.unwrap_err();
        assert_eq!(err.stage(), Stage::Package);
        assert!(!tmp.path().join(PACKAGE_FILE).exists());
    }

    #[tokio::test]
    async fn clean_exit_without_output_is_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let recognizer = Arc::new(FakeEngine {
            skip_output: true,
            ..FakeEngine::new("audiveris")
        });
        let p = pipeline(recognizer, Arc::new(FakeEngine::new("mscore")), Duration::from_secs(5));

        let err = p.convert(tmp.path(), "input.png").await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingOutput { stage: Stage::Recognize, .. }));
    }

    #[tokio::test]
    async fn deadline_is_shared_across_stages() {
        let tmp = tempfile::tempdir().unwrap();
        // Each stage alone fits in the budget; together they do not.
        let recognizer = Arc::new(FakeEngine {
            delay: Duration::from_millis(150),
            ..FakeEngine::new("audiveris")
        });
        let converter = Arc::new(FakeEngine {
            delay: Duration::from_millis(150),
            ..FakeEngine::new("mscore")
        });
        let p = pipeline(recognizer, converter, Duration::from_millis(250));

        let err = p.convert(tmp.path(), "input.png").await.unwrap_err();

        assert!(matches!(err, PipelineError::Timeout { stage: Stage::Interchange, .. }));
        assert!(err.to_string().contains("timed out"));
        assert!(!tmp.path().join(PACKAGE_FILE).exists());
    }

    #[test]
    fn export_path_follows_input_stem() {
        assert_eq!(recognizer_export("input.png"), PathBuf::from("input/input.mxl"));
        assert_eq!(recognizer_export("input.jpg"), PathBuf::from("input/input.mxl"));
    }

    #[tokio::test]
    async fn strip_marker_removes_every_occurrence() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(INTERCHANGE_FILE);
        tokio::fs::write(&path, format!("a{RECOGNIZER_MARKER}b{RECOGNIZER_MARKER}"))
            .await
            .unwrap();

        strip_marker(&path).await.unwrap();

        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn strip_marker_leaves_clean_document_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(INTERCHANGE_FILE);
        tokio::fs::write(&path, "untouched").await.unwrap();

        strip_marker(&path).await.unwrap();

        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "untouched");
    }

    #[tokio::test]
    async fn strip_marker_rejects_non_utf8_document() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(INTERCHANGE_FILE);
        tokio::fs::write(&path, [0xff, 0xfe, 0x00]).await.unwrap();

        let err = strip_marker(&path).await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
