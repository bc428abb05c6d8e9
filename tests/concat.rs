use std::io::Read;

use sample_upload::concat::LaneConcatenator;
use sample_upload::domain::{IssueKind, SampleStatus};
use sample_upload::grouper::FileGrouper;
use sample_upload::source::RawFile;

fn lane(name: &str, body: &str) -> RawFile {
    RawFile::in_memory(name, body.as_bytes().to_vec())
}

fn read_all(file: &RawFile) -> String {
    let mut out = String::new();
    file.reader().unwrap().read_to_string(&mut out).unwrap();
    out
}

#[test]
fn lanes_join_in_lane_order() {
    let outcome = FileGrouper::default().group(vec![
        lane("s1_L002_R1.fastq", "@b\nC\n+\nI\n"),
        lane("s1_L001_R1.fastq", "@a\nA\n+\nI\n"),
        lane("s1_L003_R1.fastq", "@c\nG\n+\nI\n"),
        lane("s1_L003_R2.fastq", "@c\nG\n+\nI\n"),
        lane("s1_L001_R2.fastq", "@a\nA\n+\nI\n"),
        lane("s1_L002_R2.fastq", "@b\nC\n+\nI\n"),
    ]);
    let joined = LaneConcatenator.concatenate(&outcome.samples[0]).unwrap();

    let uploads = joined.upload_files();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].name(), "s1_R1.fastq");
    assert_eq!(uploads[1].name(), "s1_R2.fastq");
    assert_eq!(read_all(uploads[0]), "@a\nA\n+\nI\n@b\nC\n+\nI\n@c\nG\n+\nI\n");
    assert_eq!(uploads[0].len(), outcome.samples[0].groups()[0].total_bytes());
    // The source files stay listed for registration.
    assert_eq!(joined.member_names().len(), 6);
}

#[test]
fn concatenation_is_deterministic() {
    let files = || {
        vec![
            lane("d_L002.fastq", "@2\nT\n+\nI\n"),
            lane("d_L001.fastq", "@1\nA\n+\nI\n"),
        ]
    };
    let first = FileGrouper::default().group(files());
    let mut reversed = files();
    reversed.reverse();
    let second = FileGrouper::default().group(reversed);

    let a = LaneConcatenator.concatenate(&first.samples[0]).unwrap();
    let b = LaneConcatenator.concatenate(&second.samples[0]).unwrap();
    let (a, b) = (a.upload_files()[0].clone(), b.upload_files()[0].clone());
    assert_eq!(a.name(), "d.fastq");
    assert_eq!(a.name(), b.name());
    assert_eq!(read_all(&a), read_all(&b));
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn single_file_groups_are_untouched() {
    let outcome = FileGrouper::default().group(vec![lane("solo.fasta", ">x\nA\n")]);
    let joined = LaneConcatenator.concatenate(&outcome.samples[0]).unwrap();
    assert_eq!(joined.upload_files()[0].name(), "solo.fasta");
    assert!(joined.groups()[0].concatenated().is_none());
}

#[test]
fn ambiguous_samples_pass_through() {
    let outcome = FileGrouper::default().group(vec![
        lane("q.fastq", "@a\nA\n+\nI\n"),
        lane("q_R1.fastq", "@a\nA\n+\nI\n"),
    ]);
    let all = LaneConcatenator.concatenate_all(&outcome.samples);
    assert_eq!(all[0].status, SampleStatus::Invalid);
    assert_eq!(
        all[0].issue.as_ref().map(|issue| issue.kind),
        Some(IssueKind::GroupingAmbiguity)
    );
    assert!(all[0].upload_files().is_empty());
}

#[test]
fn mismatched_stems_become_a_grouping_issue() {
    let outcome = FileGrouper::default().group(vec![
        lane("m_L001_R1.fastq", "@a\nA\n+\nI\n"),
        lane("m_L002_R1.fastq.gz", "@a\nA\n+\nI\n"),
    ]);
    let all = LaneConcatenator.concatenate_all(&outcome.samples);
    assert_eq!(all[0].status, SampleStatus::Invalid);
    assert!(all[0].grouping_issue().is_some());
}
