use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::SampleStatus;
use crate::error::UploadErrorKind;
use crate::manager::SampleUploadEvent;
use crate::session::UploadSession;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Percentage {
    /// No file of the sample has reported a size yet.
    Waiting,
    Fraction(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FileProgress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleProgress {
    pub name: String,
    pub status: SampleStatus,
    pub files: BTreeMap<String, FileProgress>,
    pub error: Option<(UploadErrorKind, String)>,
}

impl SampleProgress {
    fn new(name: &str, status: SampleStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            files: BTreeMap::new(),
            error: None,
        }
    }

    pub fn percentage(&self) -> Percentage {
        let total = self.files.values().map(|file| file.total_bytes).sum::<u64>();
        if total == 0 {
            return Percentage::Waiting;
        }
        let uploaded = self
            .files
            .values()
            .map(|file| file.bytes_uploaded.min(file.total_bytes))
            .sum::<u64>();
        Percentage::Fraction(uploaded as f64 / total as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSummary {
    InProgress,
    AllSucceeded,
    PartialFailure,
    AllFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchState {
    samples: Vec<SampleProgress>,
}

impl BatchState {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            samples: names
                .into_iter()
                .map(|name| SampleProgress::new(name.as_ref(), SampleStatus::Valid))
                .collect(),
        }
    }

    pub fn from_session(session: &UploadSession) -> Self {
        Self {
            samples: session
                .samples
                .iter()
                .map(|sample| {
                    let mut progress = SampleProgress::new(&sample.name, sample.status);
                    progress.error = sample
                        .failure
                        .as_ref()
                        .map(|failure| (failure.kind, failure.message.clone()));
                    for file in &sample.files {
                        progress.files.insert(
                            file.name.clone(),
                            FileProgress {
                                bytes_uploaded: file.bytes_uploaded,
                                total_bytes: file.size,
                            },
                        );
                    }
                    progress
                })
                .collect(),
        }
    }

    pub fn samples(&self) -> &[SampleProgress] {
        &self.samples
    }

    pub fn sample(&self, name: &str) -> Option<&SampleProgress> {
        self.samples.iter().find(|sample| sample.name == name)
    }

    pub fn percentage(&self, name: &str) -> Option<Percentage> {
        self.sample(name).map(SampleProgress::percentage)
    }

    pub fn apply(&self, event: &SampleUploadEvent) -> Self {
        let mut next = self.clone();
        match event {
            SampleUploadEvent::Registered { sample, .. } => {
                next.entry(sample);
            }
            SampleUploadEvent::Started { sample, files } => {
                let entry = next.entry(sample);
                entry.status = SampleStatus::Uploading;
                entry.error = None;
                for (file, total_bytes) in files {
                    entry.files.entry(file.clone()).or_default().total_bytes = *total_bytes;
                }
            }
            SampleUploadEvent::FileProgress {
                sample,
                file,
                bytes_uploaded,
                total_bytes,
            } => {
                let entry = next.entry(sample).files.entry(file.clone()).or_default();
                entry.total_bytes = *total_bytes;
                entry.bytes_uploaded = entry.bytes_uploaded.max(*bytes_uploaded);
            }
            SampleUploadEvent::FileCompleted { sample, file } => {
                let entry = next.entry(sample).files.entry(file.clone()).or_default();
                entry.bytes_uploaded = entry.total_bytes;
            }
            SampleUploadEvent::SampleSucceeded { sample, .. } => {
                next.entry(sample).status = SampleStatus::Success;
            }
            SampleUploadEvent::SampleFailed {
                sample,
                kind,
                message,
            } => {
                let entry = next.entry(sample);
                entry.status = SampleStatus::Error;
                entry.error = Some((*kind, message.clone()));
            }
            SampleUploadEvent::BatchComplete { .. } => {}
        }
        next
    }

    fn entry(&mut self, name: &str) -> &mut SampleProgress {
        if let Some(idx) = self.samples.iter().position(|sample| sample.name == name) {
            return &mut self.samples[idx];
        }
        self.samples
            .push(SampleProgress::new(name, SampleStatus::Valid));
        let last = self.samples.len() - 1;
        &mut self.samples[last]
    }

    pub fn is_complete(&self) -> bool {
        self.samples.iter().all(|sample| sample.status.is_terminal())
    }

    pub fn in_progress(&self) -> usize {
        self.samples
            .iter()
            .filter(|sample| !sample.status.is_terminal())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.count(SampleStatus::Error)
    }

    pub fn succeeded(&self) -> usize {
        self.count(SampleStatus::Success)
    }

    fn count(&self, status: SampleStatus) -> usize {
        self.samples
            .iter()
            .filter(|sample| sample.status == status)
            .count()
    }

    pub fn failed_samples(&self) -> Vec<String> {
        self.samples
            .iter()
            .filter(|sample| sample.status == SampleStatus::Error)
            .map(|sample| sample.name.clone())
            .collect()
    }

    pub fn summary(&self) -> BatchSummary {
        if !self.is_complete() {
            BatchSummary::InProgress
        } else if self.failed() == 0 {
            BatchSummary::AllSucceeded
        } else if self.succeeded() == 0 {
            BatchSummary::AllFailed
        } else {
            BatchSummary::PartialFailure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(sample: &str, file: &str, uploaded: u64, total: u64) -> SampleUploadEvent {
        SampleUploadEvent::FileProgress {
            sample: sample.to_string(),
            file: file.to_string(),
            bytes_uploaded: uploaded,
            total_bytes: total,
        }
    }

    #[test]
    fn waiting_until_sized() {
        let state = BatchState::new(["a"]);
        assert_eq!(state.percentage("a"), Some(Percentage::Waiting));
        let state = state.apply(&progress("a", "a_R1.fastq", 0, 100));
        assert_eq!(state.percentage("a"), Some(Percentage::Fraction(0.0)));
    }

    #[test]
    fn apply_leaves_previous_state() {
        let before = BatchState::new(["a"]);
        let after = before.apply(&SampleUploadEvent::Started {
            sample: "a".to_string(),
            files: vec![("a.fastq".to_string(), 10)],
        });
        assert_eq!(before.sample("a").unwrap().status, SampleStatus::Valid);
        assert_eq!(after.sample("a").unwrap().status, SampleStatus::Uploading);
    }

    #[test]
    fn summary_kinds() {
        let state = BatchState::new(["a", "b"]);
        assert_eq!(state.summary(), BatchSummary::InProgress);
        let state = state
            .apply(&SampleUploadEvent::SampleSucceeded {
                sample: "a".to_string(),
                sample_id: 1,
            })
            .apply(&SampleUploadEvent::SampleFailed {
                sample: "b".to_string(),
                kind: UploadErrorKind::TransferError,
                message: "boom".to_string(),
            });
        assert_eq!(state.summary(), BatchSummary::PartialFailure);
        assert_eq!(state.failed_samples(), vec!["b"]);
    }
}
