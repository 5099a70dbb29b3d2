use std::fs;

use tuber_pipeline::config::PipelineConfig;
use tuber_pipeline::container::ContainerRuntimeAdapter;
use tuber_pipeline::error::{ConfigError, SubjectFailure};
use tuber_pipeline::executor::StepStatus;
use tuber_pipeline::orchestrator::{run_pipeline, PipelineOutcome, PipelineRun, RunOptions};
use tuber_pipeline::step::{StepId, REGISTER_TO_MNI_IMAGE, SEGMENT_TUBERS_IMAGE};
use tuber_pipeline::trace::{Trace, TraceEvent};
use tuber_pipeline::volumes::{VOLUME_FILE_NAME, VOLUME_HEADER};

mod helpers;
use helpers::{
    file_names, unique_test_temp_dir, write_subject, write_valid_subject, Behavior, FakeRuntime,
};

fn project(prefix: &str, subjects: &[&str]) -> PipelineConfig {
    let root = unique_test_temp_dir(prefix);
    let config = PipelineConfig::from_project_root(&root);
    config.ensure_directories().unwrap();
    for id in subjects {
        write_valid_subject(&config.input_dir, id);
    }
    config
}

fn run(config: &PipelineConfig, fake: &FakeRuntime, options: RunOptions) -> (PipelineRun, Trace) {
    let adapter = ContainerRuntimeAdapter::new(Box::new(fake.clone()), false);
    run_pipeline(config, &adapter, options).unwrap()
}

fn log_prefixes(config: &PipelineConfig) -> Vec<String> {
    let mut steps: Vec<String> = file_names(&config.logs_dir)
        .into_iter()
        .filter_map(|n| n.rsplitn(3, '_').nth(2).map(str::to_string))
        .collect();
    steps.dedup();
    steps
}

#[test]
fn all_valid_subjects_complete_every_step() {
    let config = project("orch-complete", &["Case001", "Case002", "Case003"]);
    let fake = FakeRuntime::new();

    let (run, trace) = run(&config, &fake, RunOptions::default());

    assert_eq!(run.outcome, PipelineOutcome::Completed);
    assert_eq!(run.attempted(), StepId::ALL.to_vec());
    for step in &run.steps {
        assert_eq!(step.counts.failed, 0, "{:?}", step.step);
        assert_eq!(step.counts.succeeded, 3, "{:?}", step.step);
    }
    // Step 0 stages in-process and single-T2 subjects skip the combination
    // container, so only steps 1, 3 and 4 invoke the runtime.
    assert_eq!(fake.calls().len(), 3 * 3);
    assert_eq!(fake.subjects_for(SEGMENT_TUBERS_IMAGE), vec!["Case001", "Case002", "Case003"]);

    let table = run.volume_table.clone().unwrap();
    assert_eq!(table, config.results_dir.join(VOLUME_FILE_NAME));
    let body = fs::read_to_string(table).unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines[0], VOLUME_HEADER);
    assert_eq!(lines.len(), 4);
    assert!(lines[1].starts_with("Case001\t"));
    assert!(lines[3].starts_with("Case003\t"));

    assert!(matches!(
        trace.events.last(),
        Some(TraceEvent::RunFinished { success: true, .. })
    ));
}

#[test]
fn missing_modality_halts_before_step_one() {
    let config = project("orch-halt-validation", &["Case001", "Case003"]);
    write_subject(
        &config.input_dir,
        "Case002",
        &["Case002_T1_ax.nii.gz", "Case002_T2_ax.nii.gz"],
    );
    let fake = FakeRuntime::new();

    let (run, _) = run(&config, &fake, RunOptions::default());

    assert_eq!(run.outcome, PipelineOutcome::HaltedAtStep(StepId::PrepareData));
    assert!(!run.success());
    assert_eq!(run.attempted(), vec![StepId::PrepareData]);
    let statuses: Vec<&str> = run.steps[0]
        .results
        .iter()
        .map(|r| r.status.label())
        .collect();
    assert_eq!(statuses, vec!["succeeded", "failed", "succeeded"]);
    assert!(fake.calls().is_empty());
    assert!(run.volume_table.is_none());

    let failures: Vec<_> = run.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].subject, "Case002");
    assert!(matches!(
        failures[0].failure(),
        Some(SubjectFailure::Validation(_))
    ));
}

#[test]
fn rerun_without_force_skips_every_subject() {
    let config = project("orch-rerun", &["Case001", "Case002", "Case003"]);
    let fake = FakeRuntime::new();
    run(&config, &fake, RunOptions::default());
    let calls = fake.calls().len();

    let (second, _) = run(&config, &fake, RunOptions::default());

    assert_eq!(second.outcome, PipelineOutcome::Completed);
    for step in &second.steps {
        assert_eq!(step.counts.skipped, 3, "{:?}", step.step);
        assert!(step.results.iter().all(|r| r.status == StepStatus::Skipped));
    }
    assert_eq!(fake.calls().len(), calls);
}

#[test]
fn start_from_leaves_earlier_steps_untouched() {
    let config = project("orch-resume", &["Case001", "Case002"]);
    // Seed the output of step 2 as a previous run would have left it.
    for id in ["Case001", "Case002"] {
        write_subject(
            &config.preprocessing_dir.join("combined_MRIs"),
            id,
            &[&format!("{id}_T1_ax.nii.gz"), &format!("{id}_T2_ax.nii.gz")],
        );
    }
    let fake = FakeRuntime::new();

    let (run, _) = run(
        &config,
        &fake,
        RunOptions {
            start_from: StepId::RegisterToMni,
            force: false,
        },
    );

    assert_eq!(run.outcome, PipelineOutcome::Completed);
    assert_eq!(
        run.attempted(),
        vec![StepId::RegisterToMni, StepId::SegmentTubers]
    );
    assert_eq!(log_prefixes(&config), vec!["register_to_mni", "segment_tubers"]);
    assert!(file_names(&config.preprocessing_dir.join("MRI_files")).is_empty());
    assert_eq!(fake.subjects_for(SEGMENT_TUBERS_IMAGE), vec!["Case001", "Case002"]);
}

#[test]
fn silent_container_failure_halts_the_run() {
    let config = project("orch-silent", &["Case001", "Case002"]);
    let fake = FakeRuntime::new();
    fake.script(REGISTER_TO_MNI_IMAGE, "Case001", Behavior::NoOutput);

    let (run, trace) = run(&config, &fake, RunOptions::default());

    assert_eq!(
        run.outcome,
        PipelineOutcome::HaltedAtStep(StepId::RegisterToMni)
    );
    let last = run.steps.last().unwrap();
    assert_eq!(last.counts.failed, 1);
    assert_eq!(last.counts.succeeded, 1);
    assert!(matches!(
        last.results[0].failure(),
        Some(SubjectFailure::OutputValidation(_))
    ));
    assert!(fake.subjects_for(SEGMENT_TUBERS_IMAGE).is_empty());
    assert!(!config.results_dir.join(VOLUME_FILE_NAME).exists());
    assert!(trace.events.iter().any(|e| matches!(
        e,
        TraceEvent::RunHalted {
            step: StepId::RegisterToMni,
            ..
        }
    )));
}

#[test]
fn missing_input_root_is_a_configuration_error() {
    let root = unique_test_temp_dir("orch-no-input");
    let config = PipelineConfig::from_project_root(&root);
    let adapter = ContainerRuntimeAdapter::new(Box::new(FakeRuntime::new()), false);

    let err = run_pipeline(&config, &adapter, RunOptions::default()).unwrap_err();
    assert!(matches!(err, ConfigError::InputRootMissing(_)), "{err}");

    fs::create_dir_all(&config.input_dir).unwrap();
    let err = run_pipeline(&config, &adapter, RunOptions::default()).unwrap_err();
    assert!(matches!(err, ConfigError::NoSubjects(_)), "{err}");
}
