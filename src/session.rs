use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::concat::ConcatenatedFile;
use crate::domain::SampleStatus;
use crate::error::{UploadError, UploadErrorKind};
use crate::s3::CompletedPart;
use crate::sample::{FileGroup, LogicalSample};
use crate::source::RawFile;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFailure {
    pub kind: UploadErrorKind,
    pub message: String,
}

impl SampleFailure {
    pub fn from_error(err: &UploadError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    pub name: String,
    /// Names of the selected files this upload was built from.
    pub parts: Vec<String>,
    /// Local files whose concatenation is the uploaded object.
    pub sources: Vec<Utf8PathBuf>,
    pub size: u64,
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub bytes_uploaded: u64,
}

impl SessionFile {
    fn from_group(group: &FileGroup) -> Option<Self> {
        let file = group.upload_file()?;
        Some(Self {
            name: file.name().to_string(),
            parts: group.member_names(),
            sources: file.local_paths(),
            size: file.len(),
            bucket: None,
            key: None,
            bytes_uploaded: 0,
        })
    }

    /// Reopens the local sources. Fails when they are gone or changed size.
    pub fn reopen(&self) -> Result<RawFile, UploadError> {
        let file = match self.sources.as_slice() {
            [] => {
                return Err(UploadError::Filesystem(format!(
                    "{} has no local source to resume from",
                    self.name
                )));
            }
            [single] => RawFile::open(single)?,
            parts => {
                let parts = parts
                    .iter()
                    .map(|path| RawFile::open(path))
                    .collect::<Result<Vec<_>, _>>()?;
                RawFile::new(ConcatenatedFile::new(self.name.clone(), parts))
            }
        };
        if file.len() != self.size {
            return Err(UploadError::Filesystem(format!(
                "{} changed size since the upload started ({} -> {} bytes)",
                self.name,
                self.size,
                file.len()
            )));
        }
        Ok(file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSample {
    pub name: String,
    pub project_id: Option<u64>,
    pub host_genome: Option<String>,
    pub sample_id: Option<u64>,
    pub status: SampleStatus,
    pub failure: Option<SampleFailure>,
    pub files: Vec<SessionFile>,
}

impl SessionSample {
    pub fn bytes_uploaded(&self) -> u64 {
        self.files.iter().map(|file| file.bytes_uploaded).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartState {
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
}

impl MultipartState {
    pub fn has_part(&self, part_number: u32) -> bool {
        self.parts.iter().any(|part| part.part_number == part_number)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub part_size: u64,
    pub samples: Vec<SessionSample>,
    // Keyed by object key; sample names can change through deduplication.
    #[serde(default)]
    pub multipart: BTreeMap<String, MultipartState>,
    #[serde(default)]
    pub completed_files: BTreeSet<String>,
}

impl UploadSession {
    pub fn new(samples: &[LogicalSample], part_size: u64) -> Self {
        let created_at = Utc::now();
        Self {
            batch_id: created_at.format("%Y%m%d-%H%M%S-%3f").to_string(),
            created_at,
            part_size,
            samples: samples
                .iter()
                .map(|sample| SessionSample {
                    name: sample.name.clone(),
                    project_id: sample.project_id,
                    host_genome: sample.host_genome.clone(),
                    sample_id: None,
                    status: SampleStatus::Valid,
                    failure: None,
                    files: sample
                        .groups()
                        .into_iter()
                        .filter_map(SessionFile::from_group)
                        .collect(),
                })
                .collect(),
            multipart: BTreeMap::new(),
            completed_files: BTreeSet::new(),
        }
    }

    pub fn sample(&self, name: &str) -> Option<&SessionSample> {
        self.samples.iter().find(|sample| sample.name == name)
    }

    pub fn sample_mut(&mut self, name: &str) -> Option<&mut SessionSample> {
        self.samples.iter_mut().find(|sample| sample.name == name)
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.samples
            .iter()
            .filter(|sample| sample.status == SampleStatus::Error)
            .map(|sample| sample.name.clone())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.samples.iter().all(|sample| sample.status.is_terminal())
    }

    pub fn mark_failed(&mut self, name: &str, err: &UploadError) {
        if let Some(sample) = self.sample_mut(name) {
            sample.status = SampleStatus::Error;
            sample.failure = Some(SampleFailure::from_error(err));
        }
    }

    pub fn mark_status(&mut self, name: &str, status: SampleStatus) {
        if let Some(sample) = self.sample_mut(name) {
            sample.status = status;
            if status != SampleStatus::Error {
                sample.failure = None;
            }
        }
    }

    pub fn record_multipart(&mut self, key: &str, upload_id: &str) {
        self.multipart
            .entry(key.to_string())
            .or_insert_with(|| MultipartState {
                upload_id: upload_id.to_string(),
                parts: Vec::new(),
            });
    }

    pub fn record_part(&mut self, key: &str, part: CompletedPart) {
        if let Some(state) = self.multipart.get_mut(key) {
            state.parts.retain(|existing| existing.part_number != part.part_number);
            state.parts.push(part);
            state.parts.sort_by_key(|part| part.part_number);
        }
    }

    pub fn record_file_complete(&mut self, key: &str) {
        self.multipart.remove(key);
        self.completed_files.insert(key.to_string());
    }

    pub fn set_bytes_uploaded(&mut self, sample: &str, file: &str, bytes: u64) {
        if let Some(entry) = self
            .sample_mut(sample)
            .and_then(|sample| sample.files.iter_mut().find(|entry| entry.name == file))
        {
            entry.bytes_uploaded = bytes;
        }
    }
}
