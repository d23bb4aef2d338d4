use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Status of a sheet conversion job.
///
/// A successful run goes `pending → in-progress → done`. A failing run ends in
/// `fail`, normally from `in-progress`, or straight from `pending` when the
/// in-progress write itself could not be persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Done,
    Fail,
}

impl JobStatus {
    /// Whether the job has reached a status nothing may move it out of.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Fail)
    }

    /// Whether `self → next` is an edge of the job state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Fail) | (InProgress, Done) | (InProgress, Fail)
        )
    }
}

/// Content-derived job identity: the lowercase hex SHA-256 of the uploaded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub const LEN: usize = 64;

    /// Hex-encode a finished SHA-256 digest.
    pub fn from_digest(digest: impl fmt::LowerHex) -> Self {
        Self(format!("{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = InvalidJobId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == Self::LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidJobId(s.to_string()))
        }
    }
}

impl TryFrom<String> for JobId {
    type Error = InvalidJobId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<std::path::Path> for JobId {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("not a job id: {0:?}")]
pub struct InvalidJobId(pub String);

/// Supported upload image types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
pub enum ImageType {
    #[serde(rename = "image/png")]
    #[strum(serialize = "image/png")]
    Png,
    #[serde(rename = "image/jpeg")]
    #[strum(serialize = "image/jpeg")]
    Jpeg,
}

impl ImageType {
    pub fn mime(self) -> &'static str {
        match self {
            ImageType::Png => "image/png",
            ImageType::Jpeg => "image/jpeg",
        }
    }

    /// Name of the raw input file inside the job directory.
    pub fn input_file_name(self) -> &'static str {
        match self {
            ImageType::Png => "input.png",
            ImageType::Jpeg => "input.jpg",
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            ImageType::Png => image::ImageFormat::Png,
            ImageType::Jpeg => image::ImageFormat::Jpeg,
        }
    }
}

/// Persisted descriptor of a sheet conversion job (`details.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SheetJob {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub content_type: ImageType,
    pub status: JobStatus,
}

impl SheetJob {
    pub fn new(id: JobId, content_type: ImageType) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            content_type,
            status: JobStatus::Pending,
        }
    }
}
