use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use tuber_pipeline::capabilities::{detect_engine, gpu_enabled};
use tuber_pipeline::config::{ConfigOverrides, PipelineConfig};
use tuber_pipeline::container::ContainerRuntimeAdapter;
use tuber_pipeline::error::ConfigError;
use tuber_pipeline::orchestrator::{run_pipeline, RunOptions};
use tuber_pipeline::report::PipelineReport;
use tuber_pipeline::runtime::ProcessRuntime;
use tuber_pipeline::step::{catalog, StepId};
use tuber_pipeline::{plan, trace};

/// Run the TSC tuber segmentation pipeline over every subject in TSC_MRI_SUB.
///
/// Steps: 0 prepare_data, 1 skull_strip, 2 combine_t2, 3 register_to_mni,
/// 4 segment_tubers. Completed (subject, step) pairs are skipped unless
/// --force is given.
#[derive(Parser, Debug)]
#[command(name = "tuber-pipeline", version)]
#[command(about = "Checkpointed, fail-stop orchestrator for the TSC tuber segmentation pipeline")]
struct Cli {
    /// Re-run every step even when its output already exists
    #[arg(long)]
    force: bool,

    /// First step to run (0-4)
    #[arg(long, value_name = "N", default_value_t = 0)]
    start_from: u8,

    /// Project root (overrides TUBER_PROJECT_ROOT)
    #[arg(long, value_name = "DIR")]
    project_root: Option<PathBuf>,

    /// YAML settings file (image overrides, extra container flags)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the resolved step plan and exit
    #[arg(long)]
    print_plan: bool,

    /// Print the run trace after the run
    #[arg(long)]
    trace: bool,

    /// Also write the final report as JSON
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match real_main(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            print_error_chain(&err);
            std::process::exit(1);
        }
    }
}

/// `Ok(true)` when every attempted step finished without failed subjects.
fn real_main(cli: Cli) -> Result<bool> {
    let start_from =
        StepId::from_ordinal(cli.start_from).ok_or(ConfigError::InvalidStartStep(cli.start_from))?;

    let overrides = ConfigOverrides {
        project_root: cli.project_root,
        settings_file: cli.config,
    };
    let config = PipelineConfig::from_env(&overrides).context("invalid configuration")?;

    if cli.print_plan {
        plan::print_plan(&config, &catalog(&config), start_from);
        return Ok(true);
    }

    config.ensure_directories()?;
    let engine = detect_engine(config.engine)?;
    let gpu = gpu_enabled(config.gpu_mode);

    let adapter = ContainerRuntimeAdapter::new(Box::new(ProcessRuntime::new(engine)), gpu);
    let options = RunOptions {
        start_from,
        force: cli.force,
    };
    let (run, tr) = run_pipeline(&config, &adapter, options)?;

    let report = PipelineReport::from_run(&run);
    print!("{}", report.render());
    if let Some(path) = &cli.report {
        report.write_json(path)?;
    }
    if cli.trace {
        trace::print_trace(&tr);
    }

    Ok(run.success())
}
