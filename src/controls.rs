//! Run controls for the `solpipe` pipeline.

use clap::Parser;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

use crate::descriptor::{PrecisionMode, StageKind, DEFAULT_MODEL_VARIANT};
use crate::normalizer::DEFAULT_PREDICTOR;

/// Binary the default embedding command runs.
pub const EMBED_BINARY: &str = "solpipe-embed";
/// Default scoring command template.
pub const DEFAULT_SCORE_COMMAND: &str = "python inference.py";

/// Errors raised while turning CLI input into controls.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlsError {
    /// The batch size must be at least one.
    #[error("batch size must be at least 1, got {0}")]
    InvalidBatchSize(usize),
    /// A stage command template had no program.
    #[error("{stage} command is empty")]
    EmptyCommand {
        /// Stage the command belongs to.
        stage: StageKind,
    },
}

/// A stage command: program plus leading arguments. The runner appends
/// `--config <descriptor>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageCommand {
    program: String,
    args: Vec<String>,
}

impl StageCommand {
    /// Command running `program` with no extra arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends leading arguments verbatim, without splitting.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Splits a template on whitespace; the first word is the program.
    pub fn parse(stage: StageKind, template: &str) -> Result<Self, ControlsError> {
        let mut words = template.split_whitespace().map(str::to_string);
        let program = words.next().ok_or(ControlsError::EmptyCommand { stage })?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    /// Program to execute.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments placed before `--config`.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Builds the process invocation for `descriptor`.
    pub fn to_command(&self, descriptor: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg("--config").arg(descriptor);
        command
    }
}

/// Everything one pipeline run needs, validated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineControls {
    input_sequences: PathBuf,
    output: PathBuf,
    batch_size: usize,
    precision: PrecisionMode,
    model_variant: String,
    embed_command: StageCommand,
    score_command: StageCommand,
    model_config: Option<PathBuf>,
    checkpoints: Vec<PathBuf>,
    predictor_name: String,
    workdir_root: Option<PathBuf>,
    keep_workdir: bool,
}

impl PipelineControls {
    /// Controls with defaults for everything but the input and output paths.
    pub fn new(input_sequences: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input_sequences: input_sequences.into(),
            output: output.into(),
            batch_size: 1,
            precision: PrecisionMode::Full,
            model_variant: DEFAULT_MODEL_VARIANT.to_string(),
            embed_command: StageCommand::new(EMBED_BINARY),
            score_command: StageCommand {
                program: "python".to_string(),
                args: vec!["inference.py".to_string()],
            },
            model_config: None,
            checkpoints: Vec::new(),
            predictor_name: DEFAULT_PREDICTOR.to_string(),
            workdir_root: None,
            keep_workdir: false,
        }
    }

    /// Sets the records-per-batch for both stages.
    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self, ControlsError> {
        if batch_size == 0 {
            return Err(ControlsError::InvalidBatchSize(batch_size));
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    /// Sets the embedding precision.
    pub fn with_precision(mut self, precision: PrecisionMode) -> Self {
        self.precision = precision;
        self
    }

    /// Sets the embedding model identifier.
    pub fn with_model_variant(mut self, model_variant: impl Into<String>) -> Self {
        self.model_variant = model_variant.into();
        self
    }

    /// Sets the commands for both stages.
    pub fn with_commands(mut self, embed: StageCommand, score: StageCommand) -> Self {
        self.embed_command = embed;
        self.score_command = score;
        self
    }

    /// Sets the scorer architecture config.
    pub fn with_model_config(mut self, model_config: Option<PathBuf>) -> Self {
        self.model_config = model_config;
        self
    }

    /// Sets the scorer checkpoints.
    pub fn with_checkpoints(mut self, checkpoints: Vec<PathBuf>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Sets the `Predictor` column value.
    pub fn with_predictor_name(mut self, predictor_name: impl Into<String>) -> Self {
        self.predictor_name = predictor_name.into();
        self
    }

    /// Places the working directory under `root`.
    pub fn with_workdir_root(mut self, root: Option<PathBuf>) -> Self {
        self.workdir_root = root;
        self
    }

    /// Keeps the working directory after the run.
    pub fn with_keep_workdir(mut self, keep: bool) -> Self {
        self.keep_workdir = keep;
        self
    }

    /// FASTA input.
    pub fn input_sequences(&self) -> &Path {
        &self.input_sequences
    }

    /// Canonical table destination.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Records per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embedding precision.
    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }

    /// Embedding model identifier.
    pub fn model_variant(&self) -> &str {
        &self.model_variant
    }

    /// Command for `stage`.
    pub fn command(&self, stage: StageKind) -> &StageCommand {
        match stage {
            StageKind::Embedding => &self.embed_command,
            StageKind::Scoring => &self.score_command,
        }
    }

    /// Scorer architecture config.
    pub fn model_config(&self) -> Option<&Path> {
        self.model_config.as_deref()
    }

    /// Scorer checkpoints in ensemble order.
    pub fn checkpoints(&self) -> &[PathBuf] {
        &self.checkpoints
    }

    /// `Predictor` column value.
    pub fn predictor_name(&self) -> &str {
        &self.predictor_name
    }

    /// Parent directory for the working directory, if not the system temp dir.
    pub fn workdir_root(&self) -> Option<&Path> {
        self.workdir_root.as_deref()
    }

    /// Whether the working directory outlives the run.
    pub fn keep_workdir(&self) -> bool {
        self.keep_workdir
    }
}

/// Command-line interface of the `solpipe` binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "solpipe",
    about = "Predict protein solubility from a FASTA file"
)]
pub struct Cli {
    /// FASTA file with the sequences to score
    #[arg(long, env = "SOLPIPE_INPUT_SEQUENCES")]
    pub input_sequences: PathBuf,

    /// Destination of the canonical CSV table
    #[arg(long, env = "SOLPIPE_OUTPUT")]
    pub output: PathBuf,

    /// Records per embedding and scoring batch
    #[arg(long, env = "SOLPIPE_BATCH_SIZE", default_value_t = 1)]
    pub batch_size: usize,

    /// Run the embedding model at half precision
    #[arg(long, env = "SOLPIPE_REDUCED_PRECISION", default_value_t = false)]
    pub reduced_precision: bool,

    /// Protein language model used for embeddings
    #[arg(long, env = "SOLPIPE_MODEL_VARIANT", default_value = DEFAULT_MODEL_VARIANT)]
    pub model_variant: String,

    /// Embedding stage command (default: solpipe-embed next to this binary)
    #[arg(long, env = "SOLPIPE_EMBED_COMMAND")]
    pub embed_command: Option<String>,

    /// Scoring stage command
    #[arg(long, env = "SOLPIPE_SCORE_COMMAND", default_value = DEFAULT_SCORE_COMMAND)]
    pub score_command: String,

    /// Scorer architecture config
    #[arg(long, env = "SOLPIPE_MODEL_CONFIG")]
    pub model_config: Option<PathBuf>,

    /// Scorer checkpoint; repeat for an ensemble
    #[arg(long = "checkpoint", env = "SOLPIPE_CHECKPOINTS", value_delimiter = ',')]
    pub checkpoints: Vec<PathBuf>,

    /// Value of the Predictor output column
    #[arg(long, env = "SOLPIPE_PREDICTOR_NAME", default_value = DEFAULT_PREDICTOR)]
    pub predictor_name: String,

    /// Directory to create the working directory in
    #[arg(long, env = "SOLPIPE_WORKDIR_ROOT")]
    pub workdir_root: Option<PathBuf>,

    /// Keep the working directory after the run
    #[arg(long, env = "SOLPIPE_KEEP_WORKDIR", default_value_t = false)]
    pub keep_workdir: bool,
}

impl Cli {
    /// Converts the parsed CLI into `PipelineControls`.
    pub fn build_controls(&self) -> Result<PipelineControls, ControlsError> {
        let embed = match self.embed_command.as_deref() {
            Some(template) => StageCommand::parse(StageKind::Embedding, template)?,
            None => default_embed_command(),
        };
        let score = StageCommand::parse(StageKind::Scoring, &self.score_command)?;
        Ok(
            PipelineControls::new(&self.input_sequences, &self.output)
                .with_batch_size(self.batch_size)?
                .with_precision(PrecisionMode::from_flag(self.reduced_precision))
                .with_model_variant(&self.model_variant)
                .with_commands(embed, score)
                .with_model_config(self.model_config.clone())
                .with_checkpoints(self.checkpoints.clone())
                .with_predictor_name(&self.predictor_name)
                .with_workdir_root(self.workdir_root.clone())
                .with_keep_workdir(self.keep_workdir),
        )
    }
}

/// `solpipe-embed` beside the running executable, falling back to a `PATH` lookup.
pub fn default_embed_command() -> StageCommand {
    let sibling = env::current_exe().ok().and_then(|exe| {
        let candidate = exe.with_file_name(format!("{EMBED_BINARY}{}", env::consts::EXE_SUFFIX));
        candidate.is_file().then_some(candidate)
    });
    match sibling {
        Some(path) => StageCommand::new(path.to_string_lossy().into_owned()),
        None => StageCommand::new(EMBED_BINARY),
    }
}
