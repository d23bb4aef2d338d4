//! Test helper utilities for API tests

use std::ffi::OsString;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tower::ServiceExt;

use sheet_scan::services::engine::{Engine, EngineFailure};
use sheet_scan::services::pipeline::{Pipeline, RECOGNIZER_MARKER};
use sheet_scan::{build_router, AppState};

pub const BOUNDARY: &str = "sheet-scan-test-boundary";

/// Recognizer/converter stand-in that writes what the real tools would.
///
/// The recognizer creates `input/input.mxl`; the converter writes the file
/// named after `-o`. Interchange output carries the recognizer marker so the
/// cleanup step has something to strip.
pub struct FakeEngine {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub fail: bool,
}

impl FakeEngine {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: true,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            fail: false,
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn run(
        &self,
        working_dir: &Path,
        args: &[OsString],
        deadline: Instant,
    ) -> Result<(), EngineFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if tokio::time::timeout_at(deadline, sleep(self.delay)).await.is_err() {
            return Err(EngineFailure::DeadlineExceeded {
                engine: "fake".to_string(),
            });
        }
        if self.fail {
            return Err(EngineFailure::Exit {
                engine: "fake".to_string(),
                status: "exit status: 1".to_string(),
                diagnostics: "no staff lines detected".to_string(),
            });
        }

        if args[0] == "-batch" {
            let export = working_dir.join("input");
            tokio::fs::create_dir_all(&export).await.unwrap();
            tokio::fs::write(export.join("input.mxl"), b"native export").await.unwrap();
        } else {
            let out = working_dir.join(&args[1]);
            let body = if out.extension().is_some_and(|e| e == "xml") {
                format!("<score-partwise><work><work-title>{RECOGNIZER_MARKER}</work-title></work></score-partwise>")
            } else {
                "PK\u{3}\u{4}packaged-score".to_string()
            };
            tokio::fs::write(out, body).await.unwrap();
        }
        Ok(())
    }
}

/// A router over a fresh storage root.
pub struct TestApp {
    pub router: Router,
    pub data_dir: tempfile::TempDir,
}

impl TestApp {
    pub fn new(recognizer: Arc<FakeEngine>, converter: Arc<FakeEngine>) -> Self {
        Self::with_timeout(recognizer, converter, Duration::from_secs(10))
    }

    pub fn with_timeout(
        recognizer: Arc<FakeEngine>,
        converter: Arc<FakeEngine>,
        timeout: Duration,
    ) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(recognizer, converter, timeout);
        let state = AppState::new(data_dir.path(), pipeline);
        Self {
            router: build_router(state),
            data_dir,
        }
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    pub async fn upload(&self, content_type: &str, bytes: &[u8]) -> Response<Body> {
        self.send(upload_request(content_type, bytes)).await
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Entries directly under the storage root.
    pub fn stored_entries(&self) -> Vec<String> {
        std::fs::read_dir(self.data_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    /// Poll `GET /sheet/{id}` until the job reaches `done` or `fail`.
    pub async fn wait_for_terminal(&self, id: &str) -> String {
        for _ in 0..500 {
            let response = self.get(&format!("/sheet/{id}")).await;
            assert_eq!(response.status(), StatusCode::OK);
            let status = body_json(response).await["status"]
                .as_str()
                .unwrap()
                .to_string();
            if status == "done" || status == "fail" {
                return status;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("sheet {id} did not finish converting");
    }
}

/// Multipart POST /upload with a single `file` field.
pub fn upload_request(content_type: &str, bytes: &[u8]) -> Request<Body> {
    upload_builder().body(Body::from(upload_body(content_type, bytes))).unwrap()
}

/// Like [`upload_request`], declaring the body size up front.
pub fn sized_upload_request(content_type: &str, bytes: &[u8]) -> Request<Body> {
    let body = upload_body(content_type, bytes);
    upload_builder()
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

/// Like [`upload_request`], sent as a stream of `chunk`-sized pieces with no
/// declared length.
pub fn streamed_upload_request(content_type: &str, bytes: &[u8], chunk: usize) -> Request<Body> {
    let pieces: Vec<Result<Vec<u8>, std::io::Error>> = upload_body(content_type, bytes)
        .chunks(chunk)
        .map(|piece| Ok(piece.to_vec()))
        .collect();
    upload_builder()
        .body(Body::from_stream(futures::stream::iter(pieces)))
        .unwrap()
}

/// Multipart body with a single `file` field.
pub fn upload_body(content_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 256);
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"scan\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn upload_builder() -> axum::http::request::Builder {
    Request::builder().method("POST").uri("/upload").header(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={BOUNDARY}"),
    )
}

/// Job id from a `303 See Other` upload response.
pub fn redirected_id(response: &Response<Body>) -> String {
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    location
        .strip_prefix("/sheet/")
        .expect("redirect to a sheet page")
        .to_string()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// PNG signature followed by filler, `len` bytes total.
pub fn png(len: usize, fill: u8) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec();
    bytes.resize(len, fill);
    bytes
}

/// JPEG signature followed by filler, `len` bytes total.
pub fn jpeg(len: usize, fill: u8) -> Vec<u8> {
    let mut bytes = b"\xFF\xD8\xFF\xE0\0\x10JFIF\0".to_vec();
    bytes.resize(len, fill);
    bytes
}
