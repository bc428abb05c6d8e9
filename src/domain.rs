use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

pub const ACCEPTED_EXTENSIONS: [&str; 5] = ["fastq", "fq", "fasta", "fa", "fna"];

static LANE_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^L(\d{3})$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    Illumina,
    Nanopore,
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Technology::Illumina => write!(f, "illumina"),
            Technology::Nanopore => write!(f, "nanopore"),
        }
    }
}

impl FromStr for Technology {
    type Err = UploadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "illumina" => Ok(Technology::Illumina),
            "nanopore" | "ont" => Ok(Technology::Nanopore),
            _ => Err(UploadError::InvalidTechnology(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    #[serde(rename = "FASTA")]
    Fasta,
    #[serde(rename = "FASTQ")]
    Fastq,
    #[serde(rename = "unknown")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReadDirection {
    R1,
    R2,
    Unpaired,
}

impl ReadDirection {
    pub fn marker(self) -> Option<&'static str> {
        match self {
            ReadDirection::R1 => Some("R1"),
            ReadDirection::R2 => Some("R2"),
            ReadDirection::Unpaired => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    Created,
    Validating,
    Valid,
    Invalid,
    Uploading,
    Success,
    Error,
}

impl SampleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SampleStatus::Success | SampleStatus::Error)
    }
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SampleStatus::Created => "created",
            SampleStatus::Validating => "validating",
            SampleStatus::Valid => "valid",
            SampleStatus::Invalid => "invalid",
            SampleStatus::Uploading => "uploading",
            SampleStatus::Success => "success",
            SampleStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Problems found before upload. These deselect a sample; they are never
/// raised as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    GroupingAmbiguity,
    EmptyFile,
    InvalidFormat,
    DuplicateReadId,
    TruncatedFile,
    PairedEndMismatch,
    PlatformMismatch,
    NoValidSamples,
}

impl IssueKind {
    pub fn describe(self) -> &'static str {
        match self {
            IssueKind::GroupingAmbiguity => "files could not be grouped unambiguously",
            IssueKind::EmptyFile => "file is empty",
            IssueKind::InvalidFormat => "not a FASTA or FASTQ file",
            IssueKind::DuplicateReadId => "duplicate read IDs",
            IssueKind::TruncatedFile => "file appears to be truncated",
            IssueKind::PairedEndMismatch => "paired-end files do not match",
            IssueKind::PlatformMismatch => "reads do not match the selected sequencing platform",
            IssueKind::NoValidSamples => "no valid samples available for upload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub message: String,
}

impl Issue {
    pub fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFileName {
    pub file_name: String,
    pub sample: String,
    pub lane: Option<u16>,
    pub direction: ReadDirection,
    pub extension: String,
    pub compressed: bool,
    lane_stripped_stem: String,
}

impl ParsedFileName {
    pub fn without_lane(&self) -> String {
        format!("{}{}", self.lane_stripped_stem, self.extension)
    }
}

impl FromStr for ParsedFileName {
    type Err = UploadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let file_name = value
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(value)
            .to_string();
        let lower = file_name.to_ascii_lowercase();
        let compressed = lower.ends_with(".gz");
        let without_gz = if compressed {
            &file_name[..file_name.len() - 3]
        } else {
            file_name.as_str()
        };
        let (stem, ext) = without_gz
            .rsplit_once('.')
            .ok_or_else(|| UploadError::UnsupportedFile(file_name.clone()))?;
        let accepted = ACCEPTED_EXTENSIONS
            .iter()
            .any(|candidate| ext.eq_ignore_ascii_case(candidate));
        if !accepted || stem.is_empty() {
            return Err(UploadError::UnsupportedFile(file_name.clone()));
        }
        let extension = file_name[stem.len()..].to_string();

        let tokens = stem.split('_').collect::<Vec<_>>();
        let (direction, direction_index) = direction_token(&tokens);
        let search_end = direction_index.unwrap_or(tokens.len());
        let lane_index = (1..search_end).find(|idx| LANE_TOKEN.is_match(tokens[*idx]));
        let lane = lane_index
            .and_then(|idx| LANE_TOKEN.captures(tokens[idx]))
            .and_then(|caps| caps[1].parse::<u16>().ok())
            .filter(|lane| *lane > 0);
        let lane_index = lane.and(lane_index);

        let sample = tokens[..search_end]
            .iter()
            .enumerate()
            .filter(|(idx, _)| Some(*idx) != lane_index)
            .map(|(_, token)| *token)
            .collect::<Vec<_>>()
            .join("_");
        let lane_stripped_stem = tokens
            .iter()
            .enumerate()
            .filter(|(idx, _)| Some(*idx) != lane_index)
            .map(|(_, token)| *token)
            .collect::<Vec<_>>()
            .join("_");

        Ok(Self {
            file_name,
            sample,
            lane,
            direction,
            extension,
            compressed,
            lane_stripped_stem,
        })
    }
}

// `_R1`/`_R2` must be the last token, or the second to last when followed by
// the Illumina segment counter (`_001`).
fn direction_token(tokens: &[&str]) -> (ReadDirection, Option<usize>) {
    let parse = |token: &str| match token {
        "R1" => Some(ReadDirection::R1),
        "R2" => Some(ReadDirection::R2),
        _ => None,
    };
    let len = tokens.len();
    if len >= 2 {
        if let Some(direction) = parse(tokens[len - 1]) {
            return (direction, Some(len - 1));
        }
    }
    if len >= 3 {
        let segment = tokens[len - 1];
        let is_segment = segment.len() == 3 && segment.chars().all(|ch| ch.is_ascii_digit());
        if is_segment {
            if let Some(direction) = parse(tokens[len - 2]) {
                return (direction, Some(len - 2));
            }
        }
    }
    (ReadDirection::Unpaired, None)
}
