use std::collections::HashSet;
use std::fmt;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::UploadError;

pub const TOKEN_ENV: &str = "SAMPLE_UPLOAD_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputFileSpec {
    pub name: String,
    pub source: String,
    pub source_type: String,
    pub parts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleRegistration {
    pub name: String,
    pub project_id: Option<u64>,
    pub host_genome_name: Option<String>,
    pub input_files_attributes: Vec<InputFileSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredInputFile {
    pub name: String,
    pub s3_bucket: String,
    pub s3_file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredSample {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub input_files: Vec<RegisteredInputFile>,
}

impl RegisteredSample {
    pub fn input_file(&self, name: &str) -> Option<&RegisteredInputFile> {
        self.input_files.iter().find(|file| file.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationOutcome {
    #[serde(default)]
    pub samples: Vec<RegisteredSample>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub errored_sample_names: Vec<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UploadCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub aws_region: String,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl fmt::Debug for UploadCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("aws_region", &self.aws_region)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

pub trait SampleBackend: Send + Sync {
    /// Creates sample records. Per-sample rejections are reported in the
    /// outcome; `Err` means the request as a whole failed.
    fn register_samples(
        &self,
        samples: &[SampleRegistration],
    ) -> Result<RegistrationOutcome, UploadError>;
    fn upload_credentials(&self, sample_id: u64) -> Result<UploadCredentials, UploadError>;
    fn complete_sample_upload(&self, sample_id: u64) -> Result<(), UploadError>;
    fn heartbeat(&self, sample_ids: &[u64]) -> Result<(), UploadError>;
    fn existing_sample_names(
        &self,
        project_id: u64,
        names: &[String],
    ) -> Result<HashSet<String>, UploadError>;
}

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, UploadError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("sample-upload/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| UploadError::BackendHttp(err.to_string()))?,
        );
        if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| UploadError::BackendHttp(err.to_string()))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| UploadError::BackendHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_env(base_url: &str) -> Result<Self, UploadError> {
        let token = std::env::var(TOKEN_ENV).ok();
        Self::new(base_url, token.as_deref())
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, UploadError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(status, attempt, "retrying backend request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(UploadError::BackendHttp(err.to_string()));
                }
            }
        }
    }

    fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, UploadError> {
        let response = Self::check_status(response)?;
        response
            .json::<T>()
            .map_err(|err| UploadError::BackendHttp(err.to_string()))
    }

    fn check_status(response: Response) -> Result<Response, UploadError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "backend request failed".to_string());
        Err(UploadError::BackendStatus { status, message })
    }
}

impl SampleBackend for HttpBackend {
    fn register_samples(
        &self,
        samples: &[SampleRegistration],
    ) -> Result<RegistrationOutcome, UploadError> {
        let url = format!("{}/samples/bulk_upload_with_metadata.json", self.base_url);
        let body = json!({ "samples": samples, "client": "cli" });
        let response = self
            .send_with_retries(|| self.client.post(&url).json(&body))
            .map_err(|err| UploadError::Registration(err.to_string()))?;
        Self::json(response).map_err(|err| UploadError::Registration(err.to_string()))
    }

    fn upload_credentials(&self, sample_id: u64) -> Result<UploadCredentials, UploadError> {
        let url = format!("{}/samples/{sample_id}/upload_credentials.json", self.base_url);
        let response = self
            .send_with_retries(|| self.client.get(&url))
            .map_err(|err| UploadError::Credential(err.to_string()))?;
        Self::json(response).map_err(|err| UploadError::Credential(err.to_string()))
    }

    fn complete_sample_upload(&self, sample_id: u64) -> Result<(), UploadError> {
        let url = format!("{}/samples/{sample_id}.json", self.base_url);
        let body = json!({ "sample": { "id": sample_id, "status": "uploaded" } });
        let response = self
            .send_with_retries(|| self.client.put(&url).json(&body))
            .map_err(|err| UploadError::MarkComplete(err.to_string()))?;
        Self::check_status(response)
            .map(|_| ())
            .map_err(|err| UploadError::MarkComplete(err.to_string()))
    }

    fn heartbeat(&self, sample_ids: &[u64]) -> Result<(), UploadError> {
        let url = format!("{}/samples/upload_heartbeat.json", self.base_url);
        let body = json!({ "sample_ids": sample_ids });
        // One attempt only; the next tick is the retry.
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|err| UploadError::Heartbeat(err.to_string()))?;
        Self::check_status(response)
            .map(|_| ())
            .map_err(|err| UploadError::Heartbeat(err.to_string()))
    }

    fn existing_sample_names(
        &self,
        project_id: u64,
        names: &[String],
    ) -> Result<HashSet<String>, UploadError> {
        let url = format!(
            "{}/projects/{project_id}/validate_sample_names.json",
            self.base_url
        );
        let body = json!({ "sample_names": names });
        let response = self.send_with_retries(|| self.client.post(&url).json(&body))?;
        let accepted: Vec<String> = Self::json(response)?;
        Ok(taken_names(names, &accepted))
    }
}

// The server answers with the names it would accept, in request order; any
// name it had to change is already taken.
fn taken_names(requested: &[String], accepted: &[String]) -> HashSet<String> {
    requested
        .iter()
        .zip(accepted)
        .filter(|(requested, accepted)| requested != accepted)
        .map(|(requested, _)| requested.clone())
        .collect()
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

pub(crate) fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renamed_names_are_taken() {
        let requested = vec!["a".to_string(), "b".to_string()];
        let accepted = vec!["a_1".to_string(), "b".to_string()];
        assert_eq!(taken_names(&requested, &accepted), HashSet::from(["a".to_string()]));
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let creds = UploadCredentials {
            access_key_id: "AKIA".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: Some("token".to_string()),
            aws_region: "us-west-2".to_string(),
            expiration: None,
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("secret\""));
        assert!(!debug.contains("token\""));
    }
}
