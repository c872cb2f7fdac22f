//! Drives the embedding and scoring stages inside a scoped working directory.
//!
//! The orchestrator owns the run's state machine:
//!
//! ```text
//! Init → EmbeddingRunning → EmbeddingDone → ScoringRunning → ScoringDone → Normalized
//!                 └──────────────┴────────────────┴──────────────┴──→ Failed
//! ```
//!
//! Each stage is a subordinate process behind the [`StageRunner`] seam, fed a
//! YAML descriptor written into the working directory. The working directory
//! is a [`TempDir`], so it disappears whenever the orchestrator is dropped,
//! whichever way the run ended.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::controls::{PipelineControls, StageCommand};
use crate::descriptor::{
    absolutize, materialize_remapping, EmbedDescriptor, ScoreDescriptor, StageDescriptor,
    StageKind, DEFAULT_KEY_FORMAT, DEFAULT_LOG_ITERATIONS, DEFAULT_N_DRAWS,
    EMBED_DESCRIPTOR_FILE, PREDICTIONS_FILE, SCORE_DESCRIPTOR_FILE,
};
use crate::error::PipelineError;
use crate::normalizer::{
    read_raw_table, report_path, write_canonical_outputs, NormalizationConfig, NormalizationReport,
    Normalizer,
};
use crate::sequences::{ParseError, SequenceIndex};
use crate::store::EmbeddingStoreReader;

/// Prefix of every working directory name.
pub const WORKDIR_PREFIX: &str = "solpipe-";
/// How often a running stage is checked for exit or cancellation.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

type Result<T> = std::result::Result<T, PipelineError>;

/// Lifecycle of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Nothing has run yet.
    Init,
    /// The embedding process is running.
    EmbeddingRunning,
    /// The embedding store is complete.
    EmbeddingDone,
    /// The scoring process is running.
    ScoringRunning,
    /// Raw predictions are available.
    ScoringDone,
    /// The canonical table has been published.
    Normalized,
    /// The run ended with an error or was cancelled.
    Failed,
}

impl PipelineState {
    /// True when no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Normalized | Self::Failed)
    }

    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Init, EmbeddingRunning)
            | (EmbeddingRunning, EmbeddingDone)
            | (EmbeddingDone, ScoringRunning)
            | (ScoringRunning, ScoringDone)
            | (ScoringDone, Normalized) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::EmbeddingRunning => "embedding_running",
            Self::EmbeddingDone => "embedding_done",
            Self::ScoringRunning => "scoring_running",
            Self::ScoringDone => "scoring_done",
            Self::Normalized => "normalized",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Stage sequencing and execution failures.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A stage process exited unsuccessfully.
    #[error("{stage} stage failed with {}", describe_exit(.exit_code))]
    StageExecution {
        /// Failing stage.
        stage: StageKind,
        /// Exit code, absent when the process was killed by a signal.
        exit_code: Option<i32>,
    },
    /// A stage process could not be started.
    #[error("failed to start the {stage} stage: {source}")]
    StageSpawn {
        /// Stage being started.
        stage: StageKind,
        /// Spawn failure.
        #[source]
        source: io::Error,
    },
    /// A stage was interrupted by a cancellation request.
    #[error("{stage} stage was cancelled")]
    StageCancelled {
        /// Interrupted stage.
        stage: StageKind,
    },
    /// A stage was prepared before what it depends on was available.
    #[error("{stage} stage cannot start: {reason}")]
    MissingDependency {
        /// Stage being prepared.
        stage: StageKind,
        /// What is missing.
        reason: String,
    },
    /// A stage exited cleanly without producing its output.
    #[error("{stage} stage finished but {path:?} does not exist")]
    MissingOutput {
        /// Stage that should have written the file.
        stage: StageKind,
        /// Expected output.
        path: PathBuf,
    },
    /// The embedding store's keys differ from the input's identifiers.
    #[error(
        "embedding store {path:?} does not match the input: {} missing, {} unexpected{}",
        .missing.len(),
        .unexpected.len(),
        describe_example(.missing, .unexpected)
    )]
    IncompleteStore {
        /// Store path.
        path: PathBuf,
        /// Input identifiers with no stored vector.
        missing: Vec<String>,
        /// Stored keys that are not input identifiers.
        unexpected: Vec<String>,
    },
    /// The state machine was asked to skip or repeat a step.
    #[error("illegal pipeline transition {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: PipelineState,
        /// Requested state.
        to: PipelineState,
    },
}

impl OrchestrationError {
    /// Stage the error belongs to, when it belongs to one.
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            Self::StageExecution { stage, .. }
            | Self::StageSpawn { stage, .. }
            | Self::StageCancelled { stage }
            | Self::MissingDependency { stage, .. }
            | Self::MissingOutput { stage, .. } => Some(*stage),
            Self::IncompleteStore { .. } => Some(StageKind::Embedding),
            Self::InvalidTransition { .. } => None,
        }
    }
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn describe_example(missing: &[String], unexpected: &[String]) -> String {
    match (missing.first(), unexpected.first()) {
        (Some(id), _) => format!(" (e.g. missing {id})"),
        (None, Some(id)) => format!(" (e.g. unexpected {id})"),
        (None, None) => String::new(),
    }
}

/// Shared cancellation request.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that has not been raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the running stage.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once [`CancelFlag::cancel`] has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a stage process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Exit status zero.
    Completed,
    /// Non-zero exit or death by signal.
    Failed {
        /// Exit code, if the process produced one.
        exit_code: Option<i32>,
    },
    /// Killed after a cancellation request.
    Cancelled,
}

/// Executes one stage against its descriptor and waits for it.
pub trait StageRunner {
    /// Runs `stage`, blocking until it exits or `cancel` is raised.
    fn run(&self, stage: StageKind, descriptor: &Path, cancel: &CancelFlag)
        -> io::Result<StageOutcome>;
}

impl<R: StageRunner + ?Sized> StageRunner for &R {
    fn run(
        &self,
        stage: StageKind,
        descriptor: &Path,
        cancel: &CancelFlag,
    ) -> io::Result<StageOutcome> {
        (**self).run(stage, descriptor, cancel)
    }
}

/// Runs stages as child processes that inherit this process's stdio.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    embed: StageCommand,
    score: StageCommand,
    poll_interval: Duration,
}

impl ProcessRunner {
    /// Runner for the given stage commands.
    pub fn new(embed: StageCommand, score: StageCommand) -> Self {
        Self {
            embed,
            score,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Runner using the commands configured in `controls`.
    pub fn from_controls(controls: &PipelineControls) -> Self {
        Self::new(
            controls.command(StageKind::Embedding).clone(),
            controls.command(StageKind::Scoring).clone(),
        )
    }

    /// Overrides how often the child is polled.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl StageRunner for ProcessRunner {
    fn run(
        &self,
        stage: StageKind,
        descriptor: &Path,
        cancel: &CancelFlag,
    ) -> io::Result<StageOutcome> {
        let command = match stage {
            StageKind::Embedding => &self.embed,
            StageKind::Scoring => &self.score,
        };
        debug!(%stage, program = command.program(), descriptor = %descriptor.display(), "spawning stage");
        let mut child = command.to_command(descriptor).spawn()?;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(if status.success() {
                    StageOutcome::Completed
                } else if cancel.is_cancelled() {
                    // The interrupt reached the child before the flag was polled.
                    StageOutcome::Cancelled
                } else {
                    StageOutcome::Failed {
                        exit_code: status.code(),
                    }
                });
            }
            if cancel.is_cancelled() {
                warn!(%stage, pid = child.id(), "cancellation requested, killing stage");
                if let Err(err) = child.kill() {
                    // Already exited between the poll and the kill.
                    if err.kind() != io::ErrorKind::InvalidInput {
                        return Err(err);
                    }
                }
                child.wait()?;
                return Ok(StageOutcome::Cancelled);
            }
            thread::sleep(self.poll_interval);
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    /// Published canonical table.
    pub output: PathBuf,
    /// Report sidecar beside the table.
    pub report_path: PathBuf,
    /// Normalization summary.
    pub report: NormalizationReport,
    /// Sequences in the input.
    pub sequences: usize,
    /// Every state the run passed through, starting at `Init`.
    pub history: Vec<PipelineState>,
    /// Working directory left on disk, when retention was requested.
    pub retained_workdir: Option<PathBuf>,
}

/// Sequences the stages of one run inside a private working directory.
pub struct Orchestrator<R> {
    controls: PipelineControls,
    runner: R,
    cancel: CancelFlag,
    workdir: TempDir,
    state: PipelineState,
    history: Vec<PipelineState>,
    sequences: Option<SequenceIndex>,
}

impl<R> fmt::Debug for Orchestrator<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workdir", &self.workdir.path())
            .field("state", &self.state)
            .field("history", &self.history)
            .finish()
    }
}

impl<R: StageRunner> Orchestrator<R> {
    /// Acquires a fresh working directory for the run.
    pub fn new(controls: PipelineControls, runner: R, cancel: CancelFlag) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKDIR_PREFIX).disable_cleanup(controls.keep_workdir());
        let workdir = match controls.workdir_root() {
            Some(root) => {
                fs::create_dir_all(root).map_err(PipelineError::WorkingDir)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(PipelineError::WorkingDir)?;
        info!(workdir = %workdir.path().display(), "acquired working directory");
        Ok(Self {
            controls,
            runner,
            cancel,
            workdir,
            state: PipelineState::Init,
            history: vec![PipelineState::Init],
            sequences: None,
        })
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state entered so far, oldest first.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// The run's working directory.
    pub fn working_dir(&self) -> &Path {
        self.workdir.path()
    }

    /// Run controls.
    pub fn controls(&self) -> &PipelineControls {
        &self.controls
    }

    /// Validates the input and writes the embedding descriptor.
    pub fn prepare_embedding_stage(&mut self, sequence_source: &Path) -> Result<PathBuf> {
        if self.state != PipelineState::Init {
            return Err(OrchestrationError::InvalidTransition {
                from: self.state,
                to: PipelineState::EmbeddingRunning,
            }
            .into());
        }
        if self.controls.batch_size() == 0 {
            return Err(ParseError::InvalidBatchSize.into());
        }
        let index = SequenceIndex::load(sequence_source)?;
        info!(
            sequences = index.len(),
            source = %sequence_source.display(),
            "validated sequence source"
        );
        self.sequences = Some(index);

        let descriptor = StageDescriptor::Embed(EmbedDescriptor {
            sequence_source: absolutize(sequence_source).map_err(PipelineError::WorkingDir)?,
            output_prefix: self.workdir.path().to_path_buf(),
            model_variant: self.controls.model_variant().to_string(),
            precision_mode: self.controls.precision(),
            batch_size: self.controls.batch_size(),
        });
        let path = self.workdir.path().join(EMBED_DESCRIPTOR_FILE);
        descriptor.write_to(&path)?;
        debug!(descriptor = %path.display(), "wrote embedding descriptor");
        Ok(path)
    }

    /// Runs the embedding stage and returns the store it produced.
    pub fn run_embedding_stage(&mut self, descriptor_path: &Path) -> Result<PathBuf> {
        let descriptor = StageDescriptor::read_embed(descriptor_path)?;
        self.transition(PipelineState::EmbeddingRunning)?;
        self.execute(StageKind::Embedding, descriptor_path)?;
        let store = descriptor.embeddings_path();
        if !store.is_file() {
            return Err(self.abort(OrchestrationError::MissingOutput {
                stage: StageKind::Embedding,
                path: store,
            }));
        }
        self.transition(PipelineState::EmbeddingDone)?;
        Ok(store)
    }

    /// Checks the embedding store against the input and writes the scoring descriptor.
    pub fn prepare_scoring_stage(
        &mut self,
        embedding_output: &Path,
        sequence_source: &Path,
    ) -> Result<PathBuf> {
        if self.state != PipelineState::EmbeddingDone {
            return Err(OrchestrationError::MissingDependency {
                stage: StageKind::Scoring,
                reason: format!("embedding stage has not completed (state {})", self.state),
            }
            .into());
        }
        if !embedding_output.is_file() {
            return Err(self.abort(OrchestrationError::MissingDependency {
                stage: StageKind::Scoring,
                reason: format!("embedding store {embedding_output:?} does not exist"),
            }));
        }
        if let Err(err) = self.check_store(embedding_output, sequence_source) {
            return Err(self.abort(err));
        }

        let prefix = self.workdir.path().to_path_buf();
        let remapped = match materialize_remapping(sequence_source, &prefix) {
            Ok(path) => path,
            Err(err) => return Err(self.abort(PipelineError::WorkingDir(err))),
        };
        let descriptor = StageDescriptor::Score(ScoreDescriptor {
            sequence_source: absolutize(sequence_source).map_err(PipelineError::WorkingDir)?,
            output_prefix: prefix.clone(),
            model_variant: self.controls.model_variant().to_string(),
            precision_mode: self.controls.precision(),
            embeddings_source: absolutize(embedding_output).map_err(PipelineError::WorkingDir)?,
            remapping_source: remapped,
            checkpoint_list: self.controls.checkpoints().to_vec(),
            batch_size: self.controls.batch_size(),
            output_path: prefix.join(PREDICTIONS_FILE),
            model_config: self.controls.model_config().map(Path::to_path_buf),
            key_format: DEFAULT_KEY_FORMAT.to_string(),
            n_draws: DEFAULT_N_DRAWS,
            log_iterations: DEFAULT_LOG_ITERATIONS,
            output_files_name: predictions_stem(),
        });
        let path = prefix.join(SCORE_DESCRIPTOR_FILE);
        descriptor.write_to(&path)?;
        debug!(descriptor = %path.display(), "wrote scoring descriptor");
        Ok(path)
    }

    /// Runs the scoring stage and returns its raw prediction table.
    pub fn run_scoring_stage(&mut self, descriptor_path: &Path) -> Result<PathBuf> {
        let descriptor = StageDescriptor::read_score(descriptor_path)?;
        self.transition(PipelineState::ScoringRunning)?;
        self.execute(StageKind::Scoring, descriptor_path)?;
        if !descriptor.output_path.is_file() {
            return Err(self.abort(OrchestrationError::MissingOutput {
                stage: StageKind::Scoring,
                path: descriptor.output_path,
            }));
        }
        self.transition(PipelineState::ScoringDone)?;
        Ok(descriptor.output_path)
    }

    /// Publishes the canonical table and its report sidecar.
    pub fn normalize_output(
        &mut self,
        raw_output: &Path,
        output: &Path,
    ) -> Result<NormalizationReport> {
        if self.state != PipelineState::ScoringDone {
            return Err(OrchestrationError::InvalidTransition {
                from: self.state,
                to: PipelineState::Normalized,
            }
            .into());
        }
        match self.publish(raw_output, output) {
            Ok(report) => {
                self.transition(PipelineState::Normalized)?;
                info!(
                    output = %output.display(),
                    rows = report.rows,
                    degraded = report.degraded.len(),
                    "published canonical table"
                );
                Ok(report)
            }
            Err(err) => Err(self.abort(err)),
        }
    }

    /// Marks the run failed, if it has not already ended.
    pub fn mark_failed(&mut self) {
        if self.state.can_transition_to(PipelineState::Failed) {
            self.history.push(PipelineState::Failed);
            info!(from = %self.state, to = %PipelineState::Failed, "pipeline transition");
            self.state = PipelineState::Failed;
        }
    }

    /// Ends the run. Returns the working directory path when it is retained.
    pub fn finish(self) -> Option<PathBuf> {
        if self.controls.keep_workdir() {
            let path = self.workdir.path().to_path_buf();
            info!(workdir = %path.display(), "keeping working directory");
            Some(path)
        } else {
            None
        }
    }

    fn drive(&mut self) -> Result<NormalizationReport> {
        let source = self.controls.input_sequences().to_path_buf();
        let output = self.controls.output().to_path_buf();

        let embed_descriptor = self.prepare_embedding_stage(&source)?;
        let store = self.run_embedding_stage(&embed_descriptor)?;
        let score_descriptor = self.prepare_scoring_stage(&store, &source)?;
        let raw = self.run_scoring_stage(&score_descriptor)?;
        self.normalize_output(&raw, &output)
    }

    fn transition(&mut self, next: PipelineState) -> std::result::Result<(), OrchestrationError> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestrationError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        info!(from = %self.state, to = %next, "pipeline transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    fn execute(&mut self, stage: StageKind, descriptor: &Path) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.abort(OrchestrationError::StageCancelled { stage }));
        }
        info!(%stage, "starting stage");
        let failure = match self.runner.run(stage, descriptor, &self.cancel) {
            Ok(StageOutcome::Completed) => {
                info!(%stage, "stage completed");
                return Ok(());
            }
            Ok(StageOutcome::Failed { exit_code }) => {
                OrchestrationError::StageExecution { stage, exit_code }
            }
            Ok(StageOutcome::Cancelled) => OrchestrationError::StageCancelled { stage },
            Err(source) => OrchestrationError::StageSpawn { stage, source },
        };
        Err(self.abort(failure))
    }

    fn abort(&mut self, err: impl Into<PipelineError>) -> PipelineError {
        let err = err.into();
        error!(stage = err.stage(), error = %err, "pipeline step failed");
        self.mark_failed();
        err
    }

    fn sequence_index(&mut self, source: &Path) -> Result<&SequenceIndex> {
        let index = match self.sequences.take() {
            Some(index) => index,
            None => SequenceIndex::load(source)?,
        };
        Ok(self.sequences.insert(index))
    }

    fn check_store(&mut self, store_path: &Path, sequence_source: &Path) -> Result<()> {
        let store = EmbeddingStoreReader::open(store_path)?;
        let index = self.sequence_index(sequence_source)?;
        let stored: HashSet<&str> = store.ids().iter().map(String::as_str).collect();
        let missing: Vec<String> = index
            .ids()
            .iter()
            .filter(|id| !stored.contains(id.as_str()))
            .cloned()
            .collect();
        let unexpected: Vec<String> = store
            .ids()
            .iter()
            .filter(|id| !index.contains(id))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(OrchestrationError::IncompleteStore {
                path: store_path.to_path_buf(),
                missing,
                unexpected,
            }
            .into());
        }
        debug!(
            vectors = store.len(),
            dimension = store.dimension(),
            "embedding store matches input"
        );
        Ok(())
    }

    fn publish(&mut self, raw_output: &Path, output: &Path) -> Result<NormalizationReport> {
        let predictor = self.controls.predictor_name().to_string();
        let source = self.controls.input_sequences().to_path_buf();
        let raw = read_raw_table(raw_output)?;
        let normalizer = Normalizer::new(NormalizationConfig {
            predictor: predictor.clone(),
        });
        let table = normalizer.normalize(&raw, self.sequence_index(&source)?)?;
        let report = table.report(&predictor);
        write_canonical_outputs(output, table.rows(), &report)?;
        Ok(report)
    }
}

fn predictions_stem() -> String {
    Path::new(PREDICTIONS_FILE)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| PREDICTIONS_FILE.to_string())
}

/// Runs both stages and publishes the canonical table.
///
/// On any failure the run moves to [`PipelineState::Failed`] and the working
/// directory is removed unless retention was requested. Nothing is retried.
pub fn run_pipeline<R: StageRunner>(
    controls: PipelineControls,
    runner: R,
    cancel: CancelFlag,
) -> Result<PipelineReport> {
    let mut orchestrator = Orchestrator::new(controls, runner, cancel)?;
    match orchestrator.drive() {
        Ok(report) => {
            let output = orchestrator.controls().output().to_path_buf();
            let sequences = orchestrator
                .sequences
                .as_ref()
                .map(SequenceIndex::len)
                .unwrap_or_default();
            let history = orchestrator.history().to_vec();
            let retained_workdir = orchestrator.finish();
            Ok(PipelineReport {
                report_path: report_path(&output),
                output,
                report,
                sequences,
                history,
                retained_workdir,
            })
        }
        Err(err) => {
            orchestrator.mark_failed();
            if let Some(path) = orchestrator.finish() {
                warn!(workdir = %path.display(), "failed run left its working directory in place");
            }
            Err(err)
        }
    }
}
