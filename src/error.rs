use std::path::PathBuf;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::SampleStatus;

#[derive(Debug, Error, Diagnostic)]
pub enum UploadError {
    #[error("invalid sequencing technology: {0}")]
    InvalidTechnology(String),

    #[error("unsupported file name: {0}")]
    UnsupportedFile(String),

    #[error("ambiguous file grouping: {0}")]
    GroupingAmbiguity(String),

    #[error("missing config file sample-upload.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    ConfigValue(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("format inspection failed: {0}")]
    Inspector(String),

    #[error("sample registration failed: {0}")]
    Registration(String),

    #[error("backend returned status {status}: {message}")]
    BackendStatus { status: u16, message: String },

    #[error("backend request failed: {0}")]
    BackendHttp(String),

    #[error("could not obtain upload credentials: {0}")]
    Credential(String),

    #[error("object storage transfer failed: {0}")]
    Transfer(String),

    #[error("object storage returned status {status}: {message}")]
    TransferStatus { status: u16, message: String },

    #[error("backend rejected upload completion: {0}")]
    MarkComplete(String),

    #[error("heartbeat failed: {0}")]
    Heartbeat(String),

    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    #[error("sample {name} is {status} and cannot be uploaded")]
    NotUploadable { name: String, status: SampleStatus },

    #[error("sample not part of this upload session: {0}")]
    UnknownSample(String),

    #[error("there are no valid samples available for upload")]
    NoValidSamples,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadErrorKind {
    RegistrationError,
    CredentialError,
    TransferError,
    MarkCompleteError,
}

impl UploadError {
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            UploadError::Registration(_) => UploadErrorKind::RegistrationError,
            UploadError::Credential(_) => UploadErrorKind::CredentialError,
            UploadError::MarkComplete(_) => UploadErrorKind::MarkCompleteError,
            _ => UploadErrorKind::TransferError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        assert_eq!(
            UploadError::Credential("expired".to_string()).kind(),
            UploadErrorKind::CredentialError
        );
        assert_eq!(
            UploadError::TransferStatus {
                status: 503,
                message: "slow down".to_string()
            }
            .kind(),
            UploadErrorKind::TransferError
        );
        assert_eq!(
            UploadError::MarkComplete("409".to_string()).kind(),
            UploadErrorKind::MarkCompleteError
        );
    }
}
