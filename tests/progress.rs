use sample_upload::domain::SampleStatus;
use sample_upload::error::{UploadError, UploadErrorKind};
use sample_upload::grouper::FileGrouper;
use sample_upload::manager::SampleUploadEvent;
use sample_upload::progress::{BatchState, BatchSummary, Percentage};
use sample_upload::session::UploadSession;
use sample_upload::source::RawFile;

fn progress(sample: &str, file: &str, bytes_uploaded: u64, total_bytes: u64) -> SampleUploadEvent {
    SampleUploadEvent::FileProgress {
        sample: sample.to_string(),
        file: file.to_string(),
        bytes_uploaded,
        total_bytes,
    }
}

fn fraction(state: &BatchState, name: &str) -> f64 {
    match state.percentage(name) {
        Some(Percentage::Fraction(value)) => value,
        other => panic!("expected a fraction, got {other:?}"),
    }
}

#[test]
fn percentage_rises_to_one_with_bytes() {
    let mut state = BatchState::new(["s"])
        .apply(&progress("s", "s_R1.fastq", 0, 100))
        .apply(&progress("s", "s_R2.fastq", 0, 300));

    let mut previous = fraction(&state, "s");
    assert_eq!(previous, 0.0);
    for step in [(50, 0), (100, 0), (100, 150), (100, 300)] {
        state = state
            .apply(&progress("s", "s_R1.fastq", step.0, 100))
            .apply(&progress("s", "s_R2.fastq", step.1, 300));
        let current = fraction(&state, "s");
        assert!(current >= previous);
        previous = current;
    }
    assert_eq!(previous, 1.0);
}

#[test]
fn quick_mate_does_not_finish_the_sample() {
    let started = BatchState::new(["s"]).apply(&SampleUploadEvent::Started {
        sample: "s".to_string(),
        files: vec![("s_R1.fastq".to_string(), 100), ("s_R2.fastq".to_string(), 100)],
    });
    assert_eq!(fraction(&started, "s"), 0.0);

    // R1 completes before R2 has reported anything.
    let r1_done = started
        .apply(&progress("s", "s_R1.fastq", 100, 100))
        .apply(&SampleUploadEvent::FileCompleted {
            sample: "s".to_string(),
            file: "s_R1.fastq".to_string(),
        });
    assert_eq!(fraction(&r1_done, "s"), 0.5);

    let r2_first = r1_done.apply(&progress("s", "s_R2.fastq", 0, 100));
    assert_eq!(fraction(&r2_first, "s"), 0.5);
    let r2_done = r2_first.apply(&progress("s", "s_R2.fastq", 100, 100));
    assert_eq!(fraction(&r2_done, "s"), 1.0);
}

#[test]
fn late_progress_does_not_move_backwards() {
    let state = BatchState::new(["s"])
        .apply(&progress("s", "s.fastq", 80, 100))
        .apply(&progress("s", "s.fastq", 40, 100));
    assert_eq!(fraction(&state, "s"), 0.8);
}

#[test]
fn completion_needs_every_sample_terminal() {
    let succeeded = |name: &str| SampleUploadEvent::SampleSucceeded {
        sample: name.to_string(),
        sample_id: 1,
    };
    let state = BatchState::new(["a", "b"])
        .apply(&succeeded("a"))
        .apply(&SampleUploadEvent::SampleFailed {
            sample: "b".to_string(),
            kind: UploadErrorKind::TransferError,
            message: "connection reset".to_string(),
        });
    assert!(state.is_complete());
    assert_eq!(state.summary(), BatchSummary::PartialFailure);
    assert_eq!(state.succeeded(), 1);
    assert_eq!(state.failed(), 1);

    let more = state.apply(&SampleUploadEvent::Started {
        sample: "c".to_string(),
        files: Vec::new(),
    });
    assert!(!more.is_complete());
    assert_eq!(more.in_progress(), 1);
    assert_eq!(more.summary(), BatchSummary::InProgress);

    // Retrying clears the old error.
    let retried = state.apply(&SampleUploadEvent::Started {
        sample: "b".to_string(),
        files: Vec::new(),
    });
    assert_eq!(retried.sample("b").unwrap().status, SampleStatus::Uploading);
    assert!(retried.sample("b").unwrap().error.is_none());
    let done = retried.apply(&succeeded("b"));
    assert_eq!(done.summary(), BatchSummary::AllSucceeded);
}

#[test]
fn state_picks_up_a_stored_session() {
    let outcome = FileGrouper::default().group(vec![
        RawFile::in_memory("a.fastq", b"@r\nA\n+\nI\n".to_vec()),
        RawFile::in_memory("b.fastq", b"@r\nAC\n+\nII\n".to_vec()),
    ]);
    let mut session = UploadSession::new(&outcome.samples, 5 * 1024 * 1024);
    session.mark_status("a", SampleStatus::Success);
    session.set_bytes_uploaded("a", "a.fastq", 10);
    session.mark_failed("b", &UploadError::Credential("expired".to_string()));

    let state = BatchState::from_session(&session);
    assert_eq!(fraction(&state, "a"), 1.0);
    assert_eq!(fraction(&state, "b"), 0.0);
    assert_eq!(state.failed_samples(), vec!["b"]);
    assert_eq!(
        state.sample("b").unwrap().error.as_ref().map(|(kind, _)| *kind),
        Some(UploadErrorKind::CredentialError)
    );
    assert_eq!(state.summary(), BatchSummary::PartialFailure);
}
