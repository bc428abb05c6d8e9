//! Pre-upload quality checks.
//!
//! Every check reads a bounded slice of the file (the first or last
//! [`SLICE_BYTES`]) rather than the whole content. Problems outside that window
//! go unnoticed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex};
use std::thread;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{FileType, Issue, IssueKind, ParsedFileName, ReadDirection, SampleStatus, Technology};
use crate::inspector::{FormatInspector, NormalizeMode};
use crate::sample::LogicalSample;
use crate::source::{FileFingerprint, RawFile};

pub const SLICE_BYTES: u64 = 1_048_576;
pub const MAX_READ_NAMES: usize = 100;

static ILLUMINA_READ: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^@[\w.\-]+:\d+:[\w.\-]+:\d+:\d+:\d+:\d+(?:[ \t/].*)?$|^@[\w.\-]+:\d+:\d+:\d+:\d+#[\w+]*(?:/[12])?(?:\s.*)?$",
    )
    .unwrap()
});
static NANOPORE_READ: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}(?:\s.*)?$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformFormat {
    Illumina,
    Nanopore,
    Unknown,
}

impl PlatformFormat {
    pub fn contradicts(self, technology: Technology) -> bool {
        match self {
            PlatformFormat::Illumina => technology != Technology::Illumina,
            PlatformFormat::Nanopore => technology != Technology::Nanopore,
            PlatformFormat::Unknown => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStage {
    Pending,
    TypeChecked,
    ContentChecked,
    FormatClassified,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub file_name: String,
    pub file_type: FileType,
    pub platform: PlatformFormat,
    pub is_valid: bool,
    pub error: Option<IssueKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip)]
    pub stage: CheckStage,
    #[serde(skip)]
    pub compressed: bool,
}

impl ValidationResult {
    fn pending(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            file_type: FileType::Unknown,
            platform: PlatformFormat::Unknown,
            is_valid: true,
            error: None,
            message: None,
            stage: CheckStage::Pending,
            compressed: false,
        }
    }

    fn fail(mut self, kind: IssueKind, message: impl Into<String>) -> Self {
        self.is_valid = false;
        self.error = Some(kind);
        self.message = Some(message.into());
        self.stage = CheckStage::Done;
        self
    }

    fn advance(&mut self, stage: CheckStage) {
        self.stage = stage;
    }
}

#[derive(Debug, Clone)]
struct FileCheck {
    result: ValidationResult,
    read_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WarningKind {
    Uncompressed,
}

impl WarningKind {
    pub fn describe(self) -> &'static str {
        match self {
            WarningKind::Uncompressed => "uncompressed FASTQ; gzip it to shorten the upload",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationWarning {
    pub file_name: String,
    pub kind: WarningKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleVerdict {
    pub sample: String,
    pub valid: bool,
    pub issue: Option<Issue>,
    pub files: Vec<ValidationResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub technology: Technology,
    pub samples: Vec<SampleVerdict>,
    pub warnings: Vec<ValidationWarning>,
    pub invalid_bytes: u64,
    pub summary: Option<Issue>,
}

impl ValidationReport {
    pub fn verdict(&self, sample: &str) -> Option<&SampleVerdict> {
        self.samples.iter().find(|verdict| verdict.sample == sample)
    }

    pub fn valid_count(&self) -> usize {
        self.samples.iter().filter(|verdict| verdict.valid).count()
    }

    pub fn results(&self) -> impl Iterator<Item = &ValidationResult> {
        self.samples.iter().flat_map(|verdict| verdict.files.iter())
    }

    pub fn apply(&self, samples: &[LogicalSample]) -> Vec<LogicalSample> {
        samples
            .iter()
            .map(|sample| {
                let mut next = sample.clone();
                if let Some(verdict) = self.verdict(&sample.name) {
                    next.status = if verdict.valid {
                        SampleStatus::Valid
                    } else {
                        SampleStatus::Invalid
                    };
                    next.issue = verdict.issue.clone();
                }
                next
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    Completed(ValidationReport),
    Superseded,
}

pub fn mark_validating(samples: &[LogicalSample]) -> Vec<LogicalSample> {
    samples
        .iter()
        .map(|sample| {
            let mut next = sample.clone();
            if sample.grouping_issue().is_none() && !sample.status.is_terminal() {
                next.status = SampleStatus::Validating;
            }
            next
        })
        .collect()
}

pub struct PreUploadValidator<I> {
    inspector: I,
    cache: Mutex<HashMap<FileFingerprint, FileCheck>>,
    generation: AtomicU64,
    workers: usize,
}

impl<I: FormatInspector> PreUploadValidator<I> {
    pub fn new(inspector: I) -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_workers(inspector, workers)
    }

    pub fn with_workers(inspector: I, workers: usize) -> Self {
        Self {
            inspector,
            cache: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            workers: workers.max(1),
        }
    }

    pub fn inspector(&self) -> &I {
        &self.inspector
    }

    /// Checks every file of `samples`. Files already checked with the same
    /// fingerprint are not inspected again, and cached results for files no
    /// longer present are dropped.
    pub fn validate(&self, samples: &[LogicalSample], technology: Technology) -> ValidationOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let files = samples
            .iter()
            .filter(|sample| sample.grouping_issue().is_none())
            .flat_map(checked_files)
            .collect::<Vec<_>>();
        let present = files
            .iter()
            .map(RawFile::fingerprint)
            .collect::<HashSet<_>>();

        let pending = {
            let cache = self.lock_cache();
            let mut queued = HashSet::new();
            files
                .iter()
                .filter(|file| {
                    let fingerprint = file.fingerprint();
                    !cache.contains_key(&fingerprint) && queued.insert(fingerprint)
                })
                .cloned()
                .collect::<Vec<_>>()
        };
        debug!(
            generation,
            total = files.len(),
            pending = pending.len(),
            "validating files"
        );

        let Some(checked) = self.run_checks(&pending, generation) else {
            info!(generation, "validation superseded");
            return ValidationOutcome::Superseded;
        };

        let mut cache = self.lock_cache();
        if self.generation.load(Ordering::SeqCst) != generation {
            info!(generation, "validation superseded");
            return ValidationOutcome::Superseded;
        }
        cache.retain(|fingerprint, _| present.contains(fingerprint));
        cache.extend(checked);

        ValidationOutcome::Completed(build_report(samples, technology, &cache))
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<FileFingerprint, FileCheck>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn run_checks(&self, files: &[RawFile], generation: u64) -> Option<Vec<(FileFingerprint, FileCheck)>> {
        if files.is_empty() {
            return Some(Vec::new());
        }
        let next = AtomicUsize::new(0);
        let done = Mutex::new(Vec::with_capacity(files.len()));
        let workers = self.workers.min(files.len());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some(file) = files.get(idx) else {
                            break;
                        };
                        let Some(check) = self.check_file(file, generation) else {
                            break;
                        };
                        done.lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .push((file.fingerprint(), check));
                    }
                });
            }
        });

        if !self.is_current(generation) {
            return None;
        }
        Some(done.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Runs the per-file checks in order, stopping at the first failure.
    /// Returns `None` once a newer generation has started.
    fn check_file(&self, file: &RawFile, generation: u64) -> Option<FileCheck> {
        let name = file.name();
        let mut result = ValidationResult::pending(name);
        let check = |result: ValidationResult, read_names: Vec<String>| {
            Some(FileCheck { result, read_names })
        };

        if file.is_empty() {
            return check(
                result.fail(IssueKind::EmptyFile, format!("{name} is empty")),
                Vec::new(),
            );
        }

        let head = match file.read_range(0, SLICE_BYTES) {
            Ok(head) => head,
            Err(err) => {
                return check(result.fail(IssueKind::InvalidFormat, err.to_string()), Vec::new());
            }
        };
        result.compressed = is_compressed(name, &head);

        let file_type = match self.inspector.sniff_type(name, &head) {
            Ok(file_type) => file_type,
            Err(err) => {
                warn!(file = name, error = %err, "type sniff failed");
                FileType::Unknown
            }
        };
        result.file_type = file_type;
        if file_type == FileType::Unknown {
            return check(
                result.fail(IssueKind::InvalidFormat, format!("{name} is not FASTA or FASTQ")),
                Vec::new(),
            );
        }
        result.advance(CheckStage::TypeChecked);
        if !self.is_current(generation) {
            return None;
        }

        let read_names = match self.read_names(name, &head, file_type) {
            Ok(names) => names,
            Err(message) => {
                return check(result.fail(IssueKind::InvalidFormat, message), Vec::new());
            }
        };

        match file_type {
            FileType::Fasta => {
                if let Some(duplicate) = first_duplicate_id(&read_names) {
                    return check(
                        result.fail(
                            IssueKind::DuplicateReadId,
                            format!("{name}: sequence ID {duplicate} appears more than once"),
                        ),
                        read_names,
                    );
                }
            }
            FileType::Fastq if !result.compressed => match self.last_record_is_complete(file) {
                Ok(true) => {}
                Ok(false) => {
                    return check(
                        result.fail(
                            IssueKind::TruncatedFile,
                            format!("{name}: last FASTQ record is incomplete"),
                        ),
                        read_names,
                    );
                }
                Err(message) => {
                    return check(result.fail(IssueKind::InvalidFormat, message), read_names);
                }
            },
            _ => {}
        }
        result.advance(CheckStage::ContentChecked);
        if !self.is_current(generation) {
            return None;
        }

        if file_type == FileType::Fastq {
            result.platform = classify_platform(&read_names);
        }
        result.advance(CheckStage::FormatClassified);
        result.advance(CheckStage::Done);
        check(result, read_names)
    }

    fn read_names(&self, name: &str, head: &[u8], file_type: FileType) -> Result<Vec<String>, String> {
        let fasta = self
            .inspector
            .normalize_slice(name, head, NormalizeMode::Fasta)
            .map_err(|err| err.to_string())?;
        Ok(fasta
            .lines()
            .filter_map(|line| line.strip_prefix('>'))
            .take(MAX_READ_NAMES)
            .map(|header| match file_type {
                FileType::Fastq => format!("@{header}"),
                _ => format!(">{header}"),
            })
            .collect())
    }

    fn last_record_is_complete(&self, file: &RawFile) -> Result<bool, String> {
        let start = file.len().saturating_sub(SLICE_BYTES);
        let tail = file
            .read_range(start, file.len())
            .map_err(|err| err.to_string())?;
        let text = String::from_utf8_lossy(&tail);
        let lines = text.trim().lines().collect::<Vec<_>>();
        let last_four = lines[lines.len().saturating_sub(4)..].join("\n");
        let record = self
            .inspector
            .normalize_slice(file.name(), last_four.as_bytes(), NormalizeMode::Native)
            .map_err(|err| err.to_string())?;
        Ok(record.starts_with('@'))
    }
}

fn build_report(
    samples: &[LogicalSample],
    technology: Technology,
    cache: &HashMap<FileFingerprint, FileCheck>,
) -> ValidationReport {
    let mut verdicts = Vec::with_capacity(samples.len());
    let mut warnings = Vec::new();
    let mut invalid_bytes = 0u64;

    for sample in samples {
        let verdict = judge_sample(sample, technology, cache);
        for result in &verdict.files {
            if result.is_valid && result.file_type == FileType::Fastq && !result.compressed {
                warnings.push(ValidationWarning {
                    file_name: result.file_name.clone(),
                    kind: WarningKind::Uncompressed,
                });
            }
        }
        if !verdict.valid {
            invalid_bytes += sample.total_bytes();
        }
        verdicts.push(verdict);
    }

    let summary = if !verdicts.is_empty() && verdicts.iter().all(|verdict| !verdict.valid) {
        Some(Issue::new(
            IssueKind::NoValidSamples,
            IssueKind::NoValidSamples.describe(),
        ))
    } else {
        None
    };

    ValidationReport {
        technology,
        samples: verdicts,
        warnings,
        invalid_bytes,
        summary,
    }
}

fn judge_sample(
    sample: &LogicalSample,
    technology: Technology,
    cache: &HashMap<FileFingerprint, FileCheck>,
) -> SampleVerdict {
    if let Some(issue) = sample.grouping_issue() {
        return SampleVerdict {
            sample: sample.name.clone(),
            valid: false,
            issue: Some(issue.clone()),
            files: Vec::new(),
        };
    }

    let files = checked_files(sample);
    let checks = files
        .iter()
        .filter_map(|file| cache.get(&file.fingerprint()))
        .collect::<Vec<_>>();
    let mut results = checks
        .iter()
        .map(|check| check.result.clone())
        .collect::<Vec<_>>();

    let mut issue = results.iter().find(|result| !result.is_valid).map(|result| {
        let kind = result.error.unwrap_or(IssueKind::InvalidFormat);
        Issue::new(
            kind,
            result
                .message
                .clone()
                .unwrap_or_else(|| kind.describe().to_string()),
        )
    });

    if issue.is_none() && sample.is_paired() && checks.len() == 2 {
        let (mut r1, mut r2) = (checks[0], checks[1]);
        if direction_of(&r1.result.file_name) == ReadDirection::R2
            && direction_of(&r2.result.file_name) == ReadDirection::R1
        {
            std::mem::swap(&mut r1, &mut r2);
        }
        let both_fastq =
            r1.result.file_type == FileType::Fastq && r2.result.file_type == FileType::Fastq;
        if both_fastq && !names_are_paired(&r1.read_names, &r2.read_names) {
            for result in &mut results {
                result.is_valid = false;
                result.error = Some(IssueKind::PairedEndMismatch);
            }
            issue = Some(Issue::new(
                IssueKind::PairedEndMismatch,
                format!(
                    "{}: read names of {} and {} do not pair",
                    sample.name, r1.result.file_name, r2.result.file_name
                ),
            ));
        }
    }

    if issue.is_none() {
        if let Some(result) = results
            .iter()
            .find(|result| result.platform.contradicts(technology))
        {
            issue = Some(Issue::new(
                IssueKind::PlatformMismatch,
                format!(
                    "{}: reads look like {:?} but {technology} was selected",
                    result.file_name, result.platform
                ),
            ));
        }
    }

    if issue.is_none() && results.len() < files.len() {
        issue = Some(Issue::new(
            IssueKind::InvalidFormat,
            format!("{}: not every file could be checked", sample.name),
        ));
    }

    SampleVerdict {
        sample: sample.name.clone(),
        valid: issue.is_none(),
        issue,
        files: results,
    }
}

fn checked_files(sample: &LogicalSample) -> Vec<RawFile> {
    sample
        .groups()
        .into_iter()
        .flat_map(|group| match group.upload_file() {
            Some(file) => vec![file.clone()],
            None => group
                .members()
                .iter()
                .map(|member| member.file.clone())
                .collect(),
        })
        .collect()
}

fn direction_of(name: &str) -> ReadDirection {
    name.parse::<ParsedFileName>()
        .map(|parsed| parsed.direction)
        .unwrap_or(ReadDirection::Unpaired)
}

fn is_compressed(name: &str, head: &[u8]) -> bool {
    head.starts_with(&[0x1f, 0x8b]) || name.to_ascii_lowercase().ends_with(".gz")
}

fn first_duplicate_id(names: &[String]) -> Option<&str> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|name| {
            name[1..]
                .split_whitespace()
                .next()
                .unwrap_or_default()
        })
        .find(|id| !seen.insert(*id))
}

/// Platform of a FASTQ file, set only when every sampled name matches the
/// same read-name grammar.
pub fn classify_platform(names: &[String]) -> PlatformFormat {
    if names.is_empty() {
        return PlatformFormat::Unknown;
    }
    if names.iter().all(|name| ILLUMINA_READ.is_match(name)) {
        PlatformFormat::Illumina
    } else if names.iter().all(|name| NANOPORE_READ.is_match(name)) {
        PlatformFormat::Nanopore
    } else {
        PlatformFormat::Unknown
    }
}

/// True when an R1 read name and its R2 mate differ in exactly one position,
/// holding `1` in R1 and `2` in R2.
pub fn reads_are_paired(r1: &str, r2: &str) -> bool {
    if r1.len() != r2.len() {
        return false;
    }
    let mut diffs = r1.bytes().zip(r2.bytes()).filter(|(a, b)| a != b);
    matches!((diffs.next(), diffs.next()), (Some((b'1', b'2')), None))
}

fn names_are_paired(r1: &[String], r2: &[String]) -> bool {
    let count = MAX_READ_NAMES.min(r1.len()).min(r2.len());
    r1.iter()
        .zip(r2)
        .take(count)
        .all(|(a, b)| reads_are_paired(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::NativeInspector;

    #[test]
    fn paired_names_differ_only_in_direction_digit() {
        let r1 = "@M01234:12:000000000-ABCDE:1:1101:15589:1331 1:N:0:ATCACG";
        let r2 = "@M01234:12:000000000-ABCDE:1:1101:15589:1331 2:N:0:ATCACG";
        assert!(reads_are_paired(r1, r2));
        assert!(!reads_are_paired(r2, r1));
        assert!(!reads_are_paired(r1, r1));
        let other = "@M01234:12:000000000-ABCDE:1:1101:15589:1332 2:N:0:ATCACG";
        assert!(!reads_are_paired(r1, other));
    }

    #[test]
    fn classify_requires_every_name_to_match() {
        let illumina = vec![
            "@M01234:12:000000000-ABCDE:1:1101:15589:1331 1:N:0:ATCACG".to_string(),
            "@HWUSI-EAS100R:6:73:941:1973#0/1".to_string(),
        ];
        assert_eq!(classify_platform(&illumina), PlatformFormat::Illumina);

        let nanopore = vec!["@0a1b2c3d-1111-2222-3333-444455556666 runid=abc read=12".to_string()];
        assert_eq!(classify_platform(&nanopore), PlatformFormat::Nanopore);

        let mixed = vec![illumina[0].clone(), nanopore[0].clone()];
        assert_eq!(classify_platform(&mixed), PlatformFormat::Unknown);
        assert_eq!(classify_platform(&[]), PlatformFormat::Unknown);
    }

    #[test]
    fn platform_contradiction() {
        assert!(PlatformFormat::Nanopore.contradicts(Technology::Illumina));
        assert!(!PlatformFormat::Unknown.contradicts(Technology::Nanopore));
        assert!(!PlatformFormat::Illumina.contradicts(Technology::Illumina));
    }

    #[test]
    fn duplicate_ids_use_first_token() {
        let names = vec![">c1 first".to_string(), ">c2".to_string(), ">c1 again".to_string()];
        assert_eq!(first_duplicate_id(&names), Some("c1"));
        assert_eq!(first_duplicate_id(&names[..2]), None);
    }

    #[test]
    fn truncated_tail_is_detected() {
        let validator = PreUploadValidator::with_workers(NativeInspector, 1);
        let complete = RawFile::in_memory("a.fastq", b"@r1\nACGT\n+\nIIII\n@r2\nACGT\n+\nIIII\n".to_vec());
        let truncated = RawFile::in_memory("b.fastq", b"@r1\nACGT\n+\nIIII\n@r2\nACGT\n+\n".to_vec());
        assert_eq!(validator.last_record_is_complete(&complete), Ok(true));
        assert_eq!(validator.last_record_is_complete(&truncated), Ok(false));
    }
}
