use std::process::ExitCode;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use solpipe::orchestrator::{run_pipeline, CancelFlag, ProcessRunner};
use solpipe::{logging, Cli, PipelineError};
use tokio::runtime::Builder;
use tracing::{info, warn};

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let stage = err
                .downcast_ref::<PipelineError>()
                .map(PipelineError::stage)
                .unwrap_or("setup");
            eprintln!("solpipe: {stage} failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let controls = cli.build_controls().map_err(PipelineError::from)?;
    let cancel = CancelFlag::new();
    spawn_interrupt_listener(cancel.clone()).context("failed to install Ctrl-C handler")?;

    let runner = ProcessRunner::from_controls(&controls);
    let report = run_pipeline(controls, runner, cancel)?;
    info!(
        output = %report.output.display(),
        sequences = report.sequences,
        rows = report.report.rows,
        degraded = report.report.degraded.len(),
        "pipeline finished"
    );
    if let Some(workdir) = &report.retained_workdir {
        info!(workdir = %workdir.display(), "working directory retained");
    }
    Ok(())
}

/// Raises `cancel` on the first Ctrl-C. The listener thread is detached and
/// dies with the process.
fn spawn_interrupt_listener(cancel: CancelFlag) -> std::io::Result<()> {
    let rt = Builder::new_current_thread().enable_all().build()?;
    thread::Builder::new()
        .name("solpipe-signal".to_string())
        .spawn(move || {
            if rt.block_on(tokio::signal::ctrl_c()).is_ok() {
                warn!("interrupt received, cancelling the running stage");
                cancel.cancel();
            }
        })?;
    Ok(())
}
