use serde::Serialize;

use crate::domain::{Issue, IssueKind, ParsedFileName, ReadDirection, SampleStatus};
use crate::source::RawFile;

#[derive(Debug, Clone)]
pub struct LaneFile {
    pub file: RawFile,
    pub parsed: ParsedFileName,
}

impl LaneFile {
    pub fn name(&self) -> &str {
        self.file.name()
    }
}

#[derive(Debug, Clone)]
pub struct FileGroup {
    direction: ReadDirection,
    members: Vec<LaneFile>,
    concatenated: Option<RawFile>,
}

impl FileGroup {
    pub fn new(direction: ReadDirection, mut members: Vec<LaneFile>) -> Self {
        members.sort_by(|a, b| {
            a.parsed
                .lane
                .cmp(&b.parsed.lane)
                .then_with(|| a.name().cmp(b.name()))
        });
        Self {
            direction,
            members,
            concatenated: None,
        }
    }

    pub(crate) fn with_concatenated(&self, file: RawFile) -> Self {
        Self {
            direction: self.direction,
            members: self.members.clone(),
            concatenated: Some(file),
        }
    }

    pub fn direction(&self) -> ReadDirection {
        self.direction
    }

    pub fn members(&self) -> &[LaneFile] {
        &self.members
    }

    pub fn concatenated(&self) -> Option<&RawFile> {
        self.concatenated.as_ref()
    }

    /// The file that gets validated and uploaded for this slot. `None` when
    /// the group holds several lanes that have not been concatenated yet.
    pub fn upload_file(&self) -> Option<&RawFile> {
        match (&self.concatenated, self.members.as_slice()) {
            (Some(file), _) => Some(file),
            (None, [single]) => Some(&single.file),
            _ => None,
        }
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members
            .iter()
            .map(|member| member.name().to_string())
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.members.iter().map(|member| member.file.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub enum SampleFiles {
    Paired { r1: FileGroup, r2: FileGroup },
    Single(FileGroup),
}

#[derive(Debug, Clone)]
pub struct LogicalSample {
    pub name: String,
    pub project_id: Option<u64>,
    pub host_genome: Option<String>,
    pub files: SampleFiles,
    pub client: String,
    pub status: SampleStatus,
    pub issue: Option<Issue>,
}

impl LogicalSample {
    pub fn groups(&self) -> Vec<&FileGroup> {
        match &self.files {
            SampleFiles::Paired { r1, r2 } => vec![r1, r2],
            SampleFiles::Single(group) => vec![group],
        }
    }

    pub fn is_paired(&self) -> bool {
        matches!(self.files, SampleFiles::Paired { .. })
    }

    pub fn member_files(&self) -> Vec<&LaneFile> {
        self.groups()
            .into_iter()
            .flat_map(|group| group.members().iter())
            .collect()
    }

    pub fn member_names(&self) -> Vec<String> {
        self.member_files()
            .into_iter()
            .map(|member| member.name().to_string())
            .collect()
    }

    pub fn upload_files(&self) -> Vec<&RawFile> {
        self.groups()
            .into_iter()
            .filter_map(FileGroup::upload_file)
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.groups().iter().map(|group| group.total_bytes()).sum()
    }

    /// The issue found while grouping, if any. Issues from validation are
    /// recomputed on every run and are not returned here.
    pub fn grouping_issue(&self) -> Option<&Issue> {
        self.issue
            .as_ref()
            .filter(|issue| issue.kind == IssueKind::GroupingAmbiguity)
    }

    pub fn is_selectable(&self) -> bool {
        self.issue.is_none() && self.status == SampleStatus::Valid
    }

    pub(crate) fn map_groups<F>(&self, mut f: F) -> SampleFiles
    where
        F: FnMut(&FileGroup) -> FileGroup,
    {
        match &self.files {
            SampleFiles::Paired { r1, r2 } => SampleFiles::Paired {
                r1: f(r1),
                r2: f(r2),
            },
            SampleFiles::Single(group) => SampleFiles::Single(f(group)),
        }
    }

    pub fn summary(&self) -> SampleSummary {
        SampleSummary {
            name: self.name.clone(),
            status: self.status,
            paired: self.is_paired(),
            files: self.member_names(),
            upload_files: self
                .upload_files()
                .into_iter()
                .map(|file| file.name().to_string())
                .collect(),
            bytes: self.total_bytes(),
            issue: self.issue.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleSummary {
    pub name: String,
    pub status: SampleStatus,
    pub paired: bool,
    pub files: Vec<String>,
    pub upload_files: Vec<String>,
    pub bytes: u64,
    pub issue: Option<Issue>,
}
