use serde::Serialize;

use crate::models::job::SheetJob;

/// Body of `GET /sheet/{id}`: the descriptor plus links to its artifacts.
#[derive(Debug, Serialize)]
pub struct SheetResponse {
    #[serde(flatten)]
    pub job: SheetJob,
    pub links: SheetLinks,
}

#[derive(Debug, Serialize)]
pub struct SheetLinks {
    pub data: String,
    pub input: String,
    pub download: String,
}

impl From<SheetJob> for SheetResponse {
    fn from(job: SheetJob) -> Self {
        let base = format!("/sheet/{}", job.id);
        Self {
            links: SheetLinks {
                data: format!("{base}/data"),
                input: format!("{base}/input"),
                download: format!("{base}/download"),
            },
            job,
        }
    }
}
