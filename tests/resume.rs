//! End-to-end conversion, retry and resume behavior.

mod common;

use common::{media_body, Harness, Step};
use tokio_test::{assert_err, assert_ok};

use equirect_pipeline::coordinator::RunOutcome;
use equirect_pipeline::encoder::Transcoder;
use equirect_pipeline::error::EngineError;
use equirect_pipeline::job::{ErrorKind, JobStatus};
use equirect_pipeline::planner::UnitStatus;

const CHUNK_MS: Option<u64> = Some(60_000);

#[tokio::test]
async fn converts_125_seconds_in_three_units() {
    let h = Harness::new(125_000);
    let controller = h.controller(h.settings(2, 3));

    let job_id = assert_ok!(controller.start(h.job(CHUNK_MS)));
    let outcome = assert_ok!(controller.wait(&job_id).await);

    assert_eq!(
        outcome,
        RunOutcome::Completed {
            output: h.destination.clone(),
            duration_ms: 125_000
        }
    );
    assert_eq!(h.fake.calls_for(&job_id), vec![0, 1, 2]);

    let record = h.load(&job_id);
    assert_eq!(record.job.status, JobStatus::Completed);
    let ranges: Vec<_> = record
        .units
        .iter()
        .map(|u| (u.range.start_ms, u.range.end_ms))
        .collect();
    assert_eq!(ranges, vec![(0, 60_000), (60_000, 120_000), (120_000, 125_000)]);

    let output = h.fake.probe(&h.destination).await.unwrap();
    assert_eq!(output.duration_ms(), 125_000);
    assert!(!h.state_root.join(job_id.as_str()).exists());
}

#[tokio::test]
async fn converting_twice_yields_the_same_duration() {
    let h = Harness::new(125_000);
    let controller = h.controller(h.settings(2, 3));

    let first = controller.start(h.job(CHUNK_MS)).unwrap();
    let first = controller.wait(&first).await.unwrap();
    let second = controller.start(h.job(CHUNK_MS)).unwrap();
    let second = controller.wait(&second).await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn resuming_a_completed_job_does_no_work() {
    let h = Harness::new(125_000);
    let controller = h.controller(h.settings(2, 3));

    let job_id = controller.start(h.job(CHUNK_MS)).unwrap();
    controller.wait(&job_id).await.unwrap();
    h.fake.clear_calls();

    controller.resume(&job_id).await.unwrap();
    let outcome = controller.wait(&job_id).await.unwrap();

    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert!(h.fake.calls_for(&job_id).is_empty());
}

#[tokio::test]
async fn resume_runs_only_pending_units_and_reuses_done_artifact() {
    let h = Harness::new(300_000);
    let mut settings = h.settings(2, 3);
    settings.cleanup_artifacts = false;

    let mut record = h.seed_record(h.job(CHUNK_MS), 300_000, &settings);
    h.seed_done_unit(&mut record, 2, &media_body(60_000));
    let reused = record.units[2].artifact.clone();
    let modified = std::fs::metadata(&reused).unwrap().modified().unwrap();

    let controller = h.controller(settings);
    let job_id = controller.resume(&record.job.id).await.unwrap();
    assert_ok!(controller.wait(&job_id).await);

    assert_eq!(h.fake.calls_for(&job_id), vec![0, 1, 3, 4]);
    assert_eq!(std::fs::read_to_string(&reused).unwrap(), media_body(60_000));
    assert_eq!(std::fs::metadata(&reused).unwrap().modified().unwrap(), modified);
    assert_eq!(h.load(&job_id).units[2].attempts, 1);
}

#[tokio::test]
async fn in_progress_unit_is_rerun_after_a_crash() {
    let h = Harness::new(125_000);
    let settings = h.settings(1, 3);

    let mut record = h.seed_record(h.job(CHUNK_MS), 125_000, &settings);
    h.seed_done_unit(&mut record, 0, &media_body(60_000));
    record.units[1].status = UnitStatus::InProgress;
    record.units[1].attempts = 1;
    // the crashed run left its staging file behind
    std::fs::write(
        settings.paths(&record.job.id).unit_staging(1),
        "half written",
    )
    .unwrap();
    record.job.start();
    h.store.save_blocking(&record).unwrap();

    let controller = h.controller(settings);
    let job_id = controller.resume(&record.job.id).await.unwrap();
    assert_ok!(controller.wait(&job_id).await);

    assert_eq!(h.fake.calls_for(&job_id), vec![1, 2]);
    let record = h.load(&job_id);
    // the interrupted attempt is not charged
    assert_eq!(record.units[1].attempts, 1);
    assert_eq!(record.job.status, JobStatus::Completed);
}

#[tokio::test]
async fn missing_and_truncated_artifacts_are_redone() {
    let h = Harness::new(180_000);
    let settings = h.settings(2, 3);

    let mut record = h.seed_record(h.job(CHUNK_MS), 180_000, &settings);
    h.seed_done_unit(&mut record, 0, &media_body(60_000));
    h.seed_done_unit(&mut record, 1, "");
    h.seed_done_unit(&mut record, 2, &media_body(60_000));
    std::fs::remove_file(&record.units[0].artifact).unwrap();

    let controller = h.controller(settings);
    let job_id = controller.resume(&record.job.id).await.unwrap();
    assert_ok!(controller.wait(&job_id).await);

    assert_eq!(h.fake.calls_for(&job_id), vec![0, 1]);
    let output = h.fake.probe(&h.destination).await.unwrap();
    assert_eq!(output.duration_ms(), 180_000);
}

#[tokio::test]
async fn transient_failures_are_retried_within_the_limit() {
    let h = Harness::new(125_000);
    h.fake
        .script(1, [Step::Transient("killed"), Step::Transient("killed")]);
    let controller = h.controller(h.settings(1, 3));

    let job_id = controller.start(h.job(CHUNK_MS)).unwrap();
    let outcome = assert_ok!(controller.wait(&job_id).await);

    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(h.fake.calls_for(&job_id), vec![0, 1, 1, 1, 2]);
    let record = h.load(&job_id);
    assert_eq!(record.units[1].attempts, 3);
    assert_eq!(record.job.status, JobStatus::Completed);
}

#[tokio::test]
async fn exhausted_retries_fail_the_job_on_that_unit() {
    let h = Harness::new(125_000);
    h.fake
        .script(1, [Step::Transient("killed"), Step::Transient("killed")]);
    let controller = h.controller(h.settings(1, 2));

    let job_id = controller.start(h.job(CHUNK_MS)).unwrap();
    let err = assert_err!(controller.wait(&job_id).await);

    assert!(matches!(
        err,
        EngineError::RetryExhausted {
            unit: 1,
            attempts: 2,
            ..
        }
    ));
    let record = h.load(&job_id);
    assert_eq!(record.job.status, JobStatus::Failed);
    let failure = record.job.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::RetryExhausted);
    assert_eq!(failure.units, vec![1]);
    assert_eq!(record.units[1].status, UnitStatus::Failed);
    assert_eq!(record.units[0].status, UnitStatus::Done);
}

#[tokio::test]
async fn failed_job_needs_restart_which_keeps_done_units() {
    let h = Harness::new(125_000);
    h.fake
        .script(1, [Step::Transient("killed"), Step::Transient("killed")]);
    let controller = h.controller(h.settings(1, 2));

    let job_id = controller.start(h.job(CHUNK_MS)).unwrap();
    assert_err!(controller.wait(&job_id).await);

    let err = assert_err!(controller.resume(&job_id).await);
    assert!(matches!(err, EngineError::InvalidState { .. }));

    h.fake.clear_calls();
    controller.restart(&job_id, false).await.unwrap();
    assert_ok!(controller.wait(&job_id).await);
    assert_eq!(h.fake.calls_for(&job_id), vec![1, 2]);
}

#[tokio::test]
async fn fatal_failure_is_not_retried() {
    let h = Harness::new(125_000);
    h.fake.script(0, [Step::Fatal("Invalid data found when processing input")]);
    let controller = h.controller(h.settings(1, 3));

    let job_id = controller.start(h.job(CHUNK_MS)).unwrap();
    let err = assert_err!(controller.wait(&job_id).await);

    assert!(matches!(err, EngineError::Fatal { unit: Some(0), .. }));
    assert_eq!(h.fake.calls_for(&job_id), vec![0]);
    assert_eq!(equirect_pipeline::exit_code_for(&err), 2);
    assert_eq!(
        h.load(&job_id).job.failure.unwrap().kind,
        ErrorKind::FatalFailure
    );
}

#[tokio::test]
async fn zero_duration_source_is_rejected() {
    let h = Harness::new(0);
    let controller = h.controller(h.settings(1, 3));

    let job_id = controller.start(h.job(CHUNK_MS)).unwrap();
    let err = assert_err!(controller.wait(&job_id).await);

    assert!(matches!(err, EngineError::InvalidDuration { duration_ms: 0 }));
    assert!(h.fake.calls_for(&job_id).is_empty());

    let record = h.load(&job_id);
    assert_eq!(record.job.status, JobStatus::Failed);
    assert_eq!(record.job.failure.unwrap().kind, ErrorKind::InvalidDuration);
    assert!(record.units.is_empty());

    let err = assert_err!(controller.resume(&job_id).await);
    assert!(matches!(err, EngineError::InvalidState { .. }));

    std::fs::write(&h.source, media_body(60_000)).unwrap();
    controller.restart(&job_id, false).await.unwrap();
    let outcome = assert_ok!(controller.wait(&job_id).await);
    assert!(matches!(outcome, RunOutcome::Completed { duration_ms: 60_000, .. }));
    assert_eq!(h.fake.calls_for(&job_id), vec![0]);
}

#[tokio::test]
async fn changed_encoder_settings_start_over() {
    let h = Harness::new(125_000);
    let settings = h.settings(1, 3);
    let old = h.job(CHUNK_MS).with_encoding("c:v=libx265;crf=18");
    let mut record = h.seed_record(old, 125_000, &settings);
    h.seed_done_unit(&mut record, 0, &media_body(60_000));
    let old_id = record.job.id.clone();

    let job = h.job(CHUNK_MS).with_encoding("c:v=libx265;crf=23");
    assert_ne!(job.id, old_id);
    let controller = h.controller(settings);
    let err = assert_err!(controller.resume(&job.id).await);
    assert!(matches!(err, EngineError::JobNotFound { .. }));

    let job_id = controller.start(job).unwrap();
    assert_ok!(controller.wait(&job_id).await);
    assert_eq!(h.fake.calls_for(&job_id), vec![0, 1, 2]);
    assert_eq!(h.load(&old_id).units[0].status, UnitStatus::Done);
}

#[tokio::test]
async fn source_without_video_is_fatal() {
    let h = Harness::with_source_body("audio:30000");
    let controller = h.controller(h.settings(1, 3));

    let job_id = controller.start(h.job(CHUNK_MS)).unwrap();
    let err = assert_err!(controller.wait(&job_id).await);
    assert!(matches!(err, EngineError::Fatal { unit: None, .. }));
}

#[tokio::test]
async fn short_output_fails_verification() {
    let h = Harness::new(125_000);
    h.fake.truncate_output();
    let controller = h.controller(h.settings(2, 3));

    let job_id = controller.start(h.job(CHUNK_MS)).unwrap();
    let err = assert_err!(controller.wait(&job_id).await);

    assert!(matches!(err, EngineError::Verification { .. }));
    assert!(!h.destination.exists());
    assert_eq!(
        h.load(&job_id).job.failure.unwrap().kind,
        ErrorKind::VerificationFailure
    );
}

#[tokio::test]
async fn whole_file_runs_as_one_unit() {
    let h = Harness::new(125_000);
    let controller = h.controller(h.settings(4, 3));

    let job_id = controller.start(h.job(None)).unwrap();
    assert_ok!(controller.wait(&job_id).await);
    assert_eq!(h.fake.calls_for(&job_id), vec![0]);
}

#[tokio::test]
async fn changed_source_is_not_resumed() {
    let h = Harness::new(125_000);
    let settings = h.settings(1, 3);
    let record = h.seed_record(h.job(CHUNK_MS), 125_000, &settings);
    std::fs::write(&h.source, media_body(1_250_000)).unwrap();

    let controller = h.controller(settings);
    let job_id = controller.resume(&record.job.id).await.unwrap();
    let err = assert_err!(controller.wait(&job_id).await);

    assert!(matches!(err, EngineError::Fatal { unit: None, .. }));
    assert_eq!(h.load(&job_id).job.status, JobStatus::Failed);
}
