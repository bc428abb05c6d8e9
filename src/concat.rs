use std::io::{self, Read};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{Issue, IssueKind, SampleStatus};
use crate::error::UploadError;
use crate::sample::{FileGroup, LogicalSample};
use crate::source::{FileSource, RawFile};

#[derive(Debug, Clone)]
pub struct ConcatenatedFile {
    name: String,
    parts: Vec<RawFile>,
    starts: Vec<u64>,
    size: u64,
    modified: DateTime<Utc>,
}

impl ConcatenatedFile {
    pub fn new(name: impl Into<String>, parts: Vec<RawFile>) -> Self {
        let mut starts = Vec::with_capacity(parts.len());
        let mut offset = 0u64;
        for part in &parts {
            starts.push(offset);
            offset += part.len();
        }
        let modified = parts
            .iter()
            .map(RawFile::modified)
            .max()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self {
            name: name.into(),
            parts,
            starts,
            size: offset,
            modified,
        }
    }

    pub fn parts(&self) -> &[RawFile] {
        &self.parts
    }
}

impl FileSource for ConcatenatedFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.size
    }

    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>, UploadError> {
        let end = end.min(self.size);
        let mut out = Vec::with_capacity(end.saturating_sub(start) as usize);
        for (part, part_start) in self.parts.iter().zip(&self.starts) {
            let part_end = part_start + part.len();
            if part_end <= start || *part_start >= end {
                continue;
            }
            let local_start = start.saturating_sub(*part_start);
            let local_end = end.min(part_end) - part_start;
            out.extend(part.read_range(local_start, local_end)?);
        }
        Ok(out)
    }

    fn reader(&self) -> Result<Box<dyn Read + Send + '_>, UploadError> {
        Ok(Box::new(PartsReader {
            parts: &self.parts,
            current: None,
            next: 0,
        }))
    }

    fn local_paths(&self) -> Vec<Utf8PathBuf> {
        self.parts.iter().flat_map(RawFile::local_paths).collect()
    }
}

struct PartsReader<'a> {
    parts: &'a [RawFile],
    current: Option<Box<dyn Read + Send + 'a>>,
    next: usize,
}

impl Read for PartsReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                let n = reader.read(buf)?;
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
                self.current = None;
            }
            let Some(part) = self.parts.get(self.next) else {
                return Ok(0);
            };
            self.next += 1;
            self.current = Some(part.reader().map_err(io::Error::other)?);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LaneConcatenator;

impl LaneConcatenator {
    /// Returns a copy of `sample` whose multi-lane groups carry a
    /// [`ConcatenatedFile`]. Single-file groups pass through untouched.
    pub fn concatenate(&self, sample: &LogicalSample) -> Result<LogicalSample, UploadError> {
        if sample.grouping_issue().is_some() {
            return Ok(sample.clone());
        }

        let mut failure = None;
        let files = sample.map_groups(|group| match concatenate_group(&sample.name, group) {
            Ok(group) => group,
            Err(err) => {
                failure.get_or_insert(err);
                group.clone()
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }

        let result = LogicalSample {
            files,
            ..sample.clone()
        };
        let names = result
            .upload_files()
            .into_iter()
            .map(|file| file.name().to_string())
            .collect::<Vec<_>>();
        if names.len() == 2 && names[0] == names[1] {
            return Err(UploadError::GroupingAmbiguity(format!(
                "{}: R1 and R2 both concatenate to {}",
                sample.name, names[0]
            )));
        }
        Ok(result)
    }

    pub fn concatenate_all(&self, samples: &[LogicalSample]) -> Vec<LogicalSample> {
        samples
            .iter()
            .map(|sample| match self.concatenate(sample) {
                Ok(sample) => sample,
                Err(err) => {
                    let mut failed = sample.clone();
                    failed.status = SampleStatus::Invalid;
                    failed.issue = Some(Issue::new(IssueKind::GroupingAmbiguity, err.to_string()));
                    failed
                }
            })
            .collect()
    }
}

fn concatenate_group(sample: &str, group: &FileGroup) -> Result<FileGroup, UploadError> {
    let members = group.members();
    if members.len() < 2 {
        return Ok(group.clone());
    }

    let mut ordered = members.to_vec();
    ordered.sort_by_key(|member| member.parsed.lane);
    for pair in ordered.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        match (a.parsed.lane, b.parsed.lane) {
            (Some(x), Some(y)) if x != y => {}
            _ => {
                return Err(UploadError::GroupingAmbiguity(format!(
                    "{sample}: cannot order {} and {} by lane",
                    a.name(),
                    b.name()
                )));
            }
        }
    }

    let name = ordered[0].parsed.without_lane();
    if let Some(other) = ordered
        .iter()
        .find(|member| member.parsed.without_lane() != name)
    {
        return Err(UploadError::GroupingAmbiguity(format!(
            "{sample}: {} does not match {name} once the lane is removed",
            other.name()
        )));
    }

    debug!(sample, output = %name, lanes = ordered.len(), "concatenating lanes");
    let parts = ordered.iter().map(|member| member.file.clone()).collect();
    Ok(group.with_concatenated(RawFile::new(ConcatenatedFile::new(name, parts))))
}
