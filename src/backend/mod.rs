//! Collaborators the submission controller talks to.
//!
//! The controller only sees these traits; `HttpBackend` is the production
//! implementation and tests supply scripted stubs.

mod http;

use crate::model::{StatusResponse, Submission, UploadResponse};
use async_trait::async_trait;

pub use http::HttpBackend;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    /// Non-2xx response, with the server's `detail` text when it sent one.
    #[error("HTTP error! status: {code}{}", detail_suffix(.detail))]
    Status { code: u16, detail: Option<String> },
    #[error("invalid response body: {0}")]
    Decode(String),
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

#[async_trait]
pub trait UploadService: Send + Sync {
    async fn upload(&self, submission: &Submission) -> Result<UploadResponse, ServiceError>;
}

#[async_trait]
pub trait StatusService: Send + Sync {
    async fn get_status(&self, job_id: &str) -> Result<StatusResponse, ServiceError>;
}
