use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;

use sample_upload::concat::LaneConcatenator;
use sample_upload::domain::{FileType, IssueKind, SampleStatus, Technology};
use sample_upload::error::UploadError;
use sample_upload::grouper::FileGrouper;
use sample_upload::inspector::{FormatInspector, NativeInspector, NormalizeMode};
use sample_upload::sample::LogicalSample;
use sample_upload::source::{MemoryFile, RawFile};
use sample_upload::validator::{
    PlatformFormat, PreUploadValidator, ValidationOutcome, ValidationReport, WarningKind,
    mark_validating,
};

const R1: &str = "@M01234:12:000000000-ABCDE:1:1101:15589:1331 1:N:0:ATCACG\nACGT\n+\nIIII\n\
@M01234:12:000000000-ABCDE:1:1101:15600:1400 1:N:0:ATCACG\nTTGA\n+\nIIII\n";
const R2: &str = "@M01234:12:000000000-ABCDE:1:1101:15589:1331 2:N:0:ATCACG\nTGCA\n+\nIIII\n\
@M01234:12:000000000-ABCDE:1:1101:15600:1400 2:N:0:ATCACG\nTCAA\n+\nIIII\n";
const NANOPORE: &str = "@0a1b2c3d-1111-2222-3333-444455556666 runid=ab read=1\nACGTACGT\n+\nIIIIIIII\n";

#[derive(Default)]
struct CountingInspector {
    sniffed: Mutex<Vec<String>>,
    normalized: AtomicUsize,
}

impl CountingInspector {
    fn sniffed(&self) -> Vec<String> {
        self.sniffed.lock().unwrap().clone()
    }
}

impl FormatInspector for CountingInspector {
    fn sniff_type(&self, name: &str, slice: &[u8]) -> Result<FileType, UploadError> {
        self.sniffed.lock().unwrap().push(name.to_string());
        NativeInspector.sniff_type(name, slice)
    }

    fn normalize_slice(
        &self,
        name: &str,
        slice: &[u8],
        mode: NormalizeMode,
    ) -> Result<String, UploadError> {
        self.normalized.fetch_add(1, Ordering::SeqCst);
        NativeInspector.normalize_slice(name, slice, mode)
    }
}

/// Holds the sniff of `slow.fastq` until the gate opens.
struct BlockingInspector {
    entered: Mutex<Sender<()>>,
    gate: Mutex<Receiver<()>>,
}

impl FormatInspector for BlockingInspector {
    fn sniff_type(&self, name: &str, slice: &[u8]) -> Result<FileType, UploadError> {
        if name == "slow.fastq" {
            self.entered.lock().unwrap().send(()).unwrap();
            self.gate.lock().unwrap().recv().unwrap();
        }
        NativeInspector.sniff_type(name, slice)
    }

    fn normalize_slice(
        &self,
        name: &str,
        slice: &[u8],
        mode: NormalizeMode,
    ) -> Result<String, UploadError> {
        NativeInspector.normalize_slice(name, slice, mode)
    }
}

fn file(name: &str, body: &str) -> RawFile {
    RawFile::in_memory(name, body.as_bytes().to_vec())
}

fn samples(files: Vec<RawFile>) -> Vec<LogicalSample> {
    let outcome = FileGrouper::default().group(files);
    LaneConcatenator.concatenate_all(&outcome.samples)
}

fn completed(outcome: ValidationOutcome) -> ValidationReport {
    match outcome {
        ValidationOutcome::Completed(report) => report,
        ValidationOutcome::Superseded => panic!("validation was superseded"),
    }
}

fn gzip(body: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn valid_pair_passes_with_uncompressed_warning() {
    let validator = PreUploadValidator::with_workers(NativeInspector, 2);
    let batch = samples(vec![file("liver_R1.fastq", R1), file("liver_R2.fastq", R2)]);
    let report = completed(validator.validate(&batch, Technology::Illumina));

    let verdict = report.verdict("liver").unwrap();
    assert!(verdict.valid, "{verdict:?}");
    assert!(verdict.files.iter().all(|result| result.platform == PlatformFormat::Illumina));
    assert_eq!(report.warnings.len(), 2);
    assert!(report.warnings.iter().all(|warning| warning.kind == WarningKind::Uncompressed));
    assert_eq!(report.invalid_bytes, 0);
    assert!(report.summary.is_none());
}

#[test]
fn empty_file_is_rejected_before_inspection() {
    let inspector = CountingInspector::default();
    let validator = PreUploadValidator::with_workers(inspector, 1);
    let batch = samples(vec![file("blank.fastq", ""), file("reads.fastq", NANOPORE)]);
    let report = completed(validator.validate(&batch, Technology::Nanopore));

    let blank = report.verdict("blank").unwrap();
    assert!(!blank.valid);
    assert_eq!(blank.issue.as_ref().map(|issue| issue.kind), Some(IssueKind::EmptyFile));
    assert_eq!(validator.inspector().sniffed(), vec!["reads.fastq"]);

    let applied = report.apply(&batch);
    assert_eq!(applied[0].status, SampleStatus::Invalid);
    assert!(!applied[0].is_selectable());
    assert_eq!(applied[1].status, SampleStatus::Valid);
    assert!(applied[1].is_selectable());
}

#[test]
fn unknown_format_stops_before_read_names() {
    let validator = PreUploadValidator::with_workers(CountingInspector::default(), 1);
    let batch = samples(vec![file("notes.fasta", "just some text\n")]);
    let report = completed(validator.validate(&batch, Technology::Illumina));

    let verdict = report.verdict("notes").unwrap();
    assert_eq!(verdict.files[0].error, Some(IssueKind::InvalidFormat));
    assert_eq!(verdict.files[0].file_type, FileType::Unknown);
    assert_eq!(validator.inspector().normalized.load(Ordering::SeqCst), 0);
    assert_matches!(report.summary.map(|issue| issue.kind), Some(IssueKind::NoValidSamples));
}

#[test]
fn duplicate_fasta_ids_are_reported() {
    let validator = PreUploadValidator::with_workers(NativeInspector, 1);
    let body = ">c1 first\nACGT\n>c2\nGG\n>c1 second\nTT\n";
    let batch = samples(vec![file("asm.fasta", body), file("ok.fasta", ">a\nA\n")]);
    let report = completed(validator.validate(&batch, Technology::Illumina));

    let verdict = report.verdict("asm").unwrap();
    assert_eq!(
        verdict.issue.as_ref().map(|issue| issue.kind),
        Some(IssueKind::DuplicateReadId)
    );
    assert_eq!(report.invalid_bytes, body.len() as u64);
    assert!(report.verdict("ok").unwrap().valid);
    // FASTA never gets the compression hint.
    assert!(report.warnings.is_empty());
}

#[test]
fn truncated_fastq_is_reported() {
    let validator = PreUploadValidator::with_workers(NativeInspector, 1);
    let batch = samples(vec![file("cut.fastq", "@r1\nACGT\n+\nIIII\n@r2\nAC")]);
    let report = completed(validator.validate(&batch, Technology::Illumina));
    assert_eq!(
        report.verdict("cut").unwrap().issue.as_ref().map(|issue| issue.kind),
        Some(IssueKind::TruncatedFile)
    );
}

#[test]
fn gzipped_fastq_skips_tail_check() {
    let validator = PreUploadValidator::with_workers(NativeInspector, 1);
    let batch = samples(vec![RawFile::in_memory("long.fastq.gz", gzip(NANOPORE))]);
    let report = completed(validator.validate(&batch, Technology::Nanopore));

    let verdict = report.verdict("long").unwrap();
    assert!(verdict.valid, "{verdict:?}");
    assert_eq!(verdict.files[0].platform, PlatformFormat::Nanopore);
    assert!(report.warnings.is_empty());
}

#[test]
fn platform_must_match_technology() {
    let validator = PreUploadValidator::with_workers(NativeInspector, 1);
    let batch = samples(vec![file("ont.fastq", NANOPORE)]);
    let report = completed(validator.validate(&batch, Technology::Illumina));
    assert_eq!(
        report.verdict("ont").unwrap().issue.as_ref().map(|issue| issue.kind),
        Some(IssueKind::PlatformMismatch)
    );
}

#[test]
fn unpaired_mates_fail_both_files() {
    let validator = PreUploadValidator::with_workers(NativeInspector, 2);
    let wrong_r2 = R2.replace("15589:1331", "15589:9999");
    let batch = samples(vec![file("s_R1.fastq", R1), file("s_R2.fastq", &wrong_r2)]);
    let report = completed(validator.validate(&batch, Technology::Illumina));

    let verdict = report.verdict("s").unwrap();
    assert!(!verdict.valid);
    assert_eq!(verdict.files.len(), 2);
    assert!(
        verdict
            .files
            .iter()
            .all(|result| !result.is_valid && result.error == Some(IssueKind::PairedEndMismatch))
    );
}

#[test]
fn identical_mates_do_not_pair() {
    let validator = PreUploadValidator::with_workers(NativeInspector, 2);
    let batch = samples(vec![file("t_R1.fastq", R1), file("t_R2.fastq", R1)]);
    let report = completed(validator.validate(&batch, Technology::Illumina));
    assert_eq!(
        report.verdict("t").unwrap().issue.as_ref().map(|issue| issue.kind),
        Some(IssueKind::PairedEndMismatch)
    );
}

#[test]
fn grouping_issues_are_not_inspected() {
    let validator = PreUploadValidator::with_workers(CountingInspector::default(), 1);
    let batch = samples(vec![file("g.fastq", R1), file("g_R1.fastq", R1)]);
    let report = completed(validator.validate(&batch, Technology::Illumina));

    assert_eq!(
        report.verdict("g").unwrap().issue.as_ref().map(|issue| issue.kind),
        Some(IssueKind::GroupingAmbiguity)
    );
    assert!(validator.inspector().sniffed().is_empty());
    let marked = mark_validating(&batch);
    assert_eq!(marked[0].status, SampleStatus::Invalid);
}

#[test]
fn unchanged_files_are_not_checked_again() {
    let validator = PreUploadValidator::with_workers(CountingInspector::default(), 2);
    let batch = samples(vec![file("a.fastq", NANOPORE), file("b.fastq", NANOPORE)]);
    completed(validator.validate(&batch, Technology::Nanopore));
    assert_eq!(validator.inspector().sniffed().len(), 2);

    let again = completed(validator.validate(&batch, Technology::Nanopore));
    assert_eq!(validator.inspector().sniffed().len(), 2);
    assert_eq!(again.valid_count(), 2);

    let touched = RawFile::new(
        MemoryFile::new("a.fastq", NANOPORE.as_bytes().to_vec())
            .with_modified(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
    );
    let changed = samples(vec![touched, file("b.fastq", NANOPORE)]);
    completed(validator.validate(&changed, Technology::Nanopore));
    assert_eq!(validator.inspector().sniffed().len(), 3);
}

#[test]
fn removed_files_are_forgotten() {
    let validator = PreUploadValidator::with_workers(CountingInspector::default(), 1);
    let a = file("a.fastq", NANOPORE);
    let b = file("b.fastq", NANOPORE);
    completed(validator.validate(&samples(vec![a.clone(), b.clone()]), Technology::Nanopore));
    completed(validator.validate(&samples(vec![a.clone()]), Technology::Nanopore));
    assert_eq!(validator.inspector().sniffed(), vec!["a.fastq", "b.fastq"]);

    let report = completed(validator.validate(&samples(vec![a, b]), Technology::Nanopore));
    assert_eq!(
        validator.inspector().sniffed(),
        vec!["a.fastq", "b.fastq", "b.fastq"]
    );
    assert_eq!(report.valid_count(), 2);
}

#[test]
fn newer_run_supersedes_older_one() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel();
    let validator = PreUploadValidator::with_workers(
        BlockingInspector {
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
        },
        1,
    );
    let slow = samples(vec![file("slow.fastq", NANOPORE)]);
    let fast = samples(vec![file("fast.fastq", NANOPORE)]);

    thread::scope(|scope| {
        let older = scope.spawn(|| validator.validate(&slow, Technology::Nanopore));
        entered_rx.recv().unwrap();

        let newer = completed(validator.validate(&fast, Technology::Nanopore));
        assert!(newer.verdict("fast").unwrap().valid);

        gate_tx.send(()).unwrap();
        assert_matches!(older.join().unwrap(), ValidationOutcome::Superseded);
    });
}

#[test]
fn marking_leaves_terminal_samples_alone() {
    let mut batch = samples(vec![file("a.fastq", NANOPORE), file("b.fastq", NANOPORE)]);
    batch[1].status = SampleStatus::Success;
    let marked = mark_validating(&batch);
    assert_eq!(marked[0].status, SampleStatus::Validating);
    assert_eq!(marked[1].status, SampleStatus::Success);
    // The input is not modified.
    assert_eq!(batch[0].status, SampleStatus::Created);
}
