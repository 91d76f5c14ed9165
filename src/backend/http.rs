use super::{ServiceError, StatusService, UploadService};
use crate::model::{ControllerConfig, StatusResponse, Submission, UploadResponse};
use async_trait::async_trait;
use reqwest::{multipart, Url};
use serde::de::DeserializeOwned;

/// reqwest-backed client for the NeuroNav scan API.
pub struct HttpBackend {
    http: reqwest::Client,
    api_root: Url,
}

impl HttpBackend {
    pub fn new(cfg: &ControllerConfig) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self {
            http,
            api_root: api_root(&cfg.base_url, &cfg.api_prefix)?,
        })
    }

    pub fn upload_url(&self) -> Result<Url, ServiceError> {
        endpoint(&self.api_root, &["upload"])
    }

    pub fn results_url(&self, job_id: &str) -> Result<Url, ServiceError> {
        endpoint(&self.api_root, &["results", job_id])
    }
}

fn api_root(base_url: &str, api_prefix: &str) -> Result<Url, ServiceError> {
    let joined = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        api_prefix.trim_matches('/')
    );
    Url::parse(&joined).map_err(|e| ServiceError::InvalidUrl(format!("{joined}: {e}")))
}

fn endpoint(root: &Url, segments: &[&str]) -> Result<Url, ServiceError> {
    let mut url = root.clone();
    url.path_segments_mut()
        .map_err(|_| ServiceError::InvalidUrl(root.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Pull a human-readable message out of an error body.
/// FastAPI reports `{"detail": "..."}`, validation errors use a list.
fn error_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ServiceError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ServiceError::Status {
            code: status.as_u16(),
            detail: error_detail(&body),
        });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ServiceError::Decode(e.to_string()))
}

#[async_trait]
impl UploadService for HttpBackend {
    async fn upload(&self, submission: &Submission) -> Result<UploadResponse, ServiceError> {
        let part = multipart::Part::bytes(submission.data.to_vec())
            .file_name(submission.file_name.clone())
            .mime_str(&submission.mime_type)?;
        let form = multipart::Form::new().part("file", part);
        let url = self.upload_url()?;
        tracing::debug!(%url, file = %submission.file_name, bytes = submission.size_bytes, "uploading scan");
        let resp = self.http.post(url).multipart(form).send().await?;
        decode(resp).await
    }
}

#[async_trait]
impl StatusService for HttpBackend {
    async fn get_status(&self, job_id: &str) -> Result<StatusResponse, ServiceError> {
        let url = self.results_url(job_id)?;
        tracing::debug!(%url, "polling scan status");
        let resp = self.http.get(url).send().await?;
        decode(resp).await
    }
}
