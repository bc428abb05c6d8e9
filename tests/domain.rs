use assert_matches::assert_matches;

use sample_upload::domain::{FileType, ParsedFileName, ReadDirection, SampleStatus, Technology};
use sample_upload::error::UploadError;

#[test]
fn parse_gzipped_lane_file() {
    let parsed: ParsedFileName = "liver_S1_L003_R2_001.fastq.gz".parse().unwrap();
    assert_eq!(parsed.sample, "liver_S1");
    assert_eq!(parsed.lane, Some(3));
    assert_eq!(parsed.direction, ReadDirection::R2);
    assert!(parsed.compressed);
    assert_eq!(parsed.without_lane(), "liver_S1_R2_001.fastq.gz");
}

#[test]
fn lane_zero_is_not_a_lane() {
    let parsed: ParsedFileName = "s_L000_R1.fq".parse().unwrap();
    assert_eq!(parsed.lane, None);
}

#[test]
fn direction_must_be_trailing() {
    let parsed: ParsedFileName = "R1_control.fasta".parse().unwrap();
    assert_eq!(parsed.direction, ReadDirection::Unpaired);
    assert_eq!(parsed.sample, "R1_control");
}

#[test]
fn rejects_archives() {
    let err = "reads.tar.gz".parse::<ParsedFileName>().unwrap_err();
    assert_matches!(err, UploadError::UnsupportedFile(_));
    let err = ".fastq".parse::<ParsedFileName>().unwrap_err();
    assert_matches!(err, UploadError::UnsupportedFile(_));
}

#[test]
fn technology_parsing() {
    assert_eq!("Illumina".parse::<Technology>().unwrap(), Technology::Illumina);
    assert_eq!(" nanopore ".parse::<Technology>().unwrap(), Technology::Nanopore);
    assert_matches!(
        "pacbio".parse::<Technology>(),
        Err(UploadError::InvalidTechnology(_))
    );
}

#[test]
fn status_labels() {
    assert_eq!(SampleStatus::Uploading.to_string(), "uploading");
    assert!(SampleStatus::Error.is_terminal());
    assert!(!SampleStatus::Valid.is_terminal());
    assert_eq!(
        serde_json::to_string(&FileType::Fastq).unwrap(),
        "\"FASTQ\""
    );
}
