#![warn(missing_docs)]
//! Core library for the solpipe protein solubility pipeline.
//!
//! A run embeds every input sequence with a protein language model, scores
//! the embeddings, and publishes one canonical row per sequence. The two model
//! steps run as separate processes; this crate owns everything around them.

pub mod controls;
pub mod descriptor;
pub mod embedder;
pub mod embedding_stage;
pub mod error;
pub mod logging;
pub mod normalizer;
pub mod orchestrator;
pub mod sequences;
pub mod store;

pub use controls::{Cli, ControlsError, PipelineControls, StageCommand};
pub use descriptor::{
    EmbedDescriptor, PrecisionMode, ScoreDescriptor, StageDescriptor, StageKind,
};
pub use embedder::{EmbedContext, EmbedError, Embedder};
pub use embedding_stage::{EmbeddingOptions, EmbeddingStageError, EmbeddingSummary};
pub use error::PipelineError;
pub use normalizer::{
    CanonicalRow, NormalizationConfig, NormalizationReport, NormalizeError, NormalizedTable,
    Normalizer, RawRow, ScoreEvidence, ScoreSource,
};
pub use orchestrator::{
    run_pipeline, CancelFlag, OrchestrationError, Orchestrator, PipelineReport, PipelineState,
    ProcessRunner, StageOutcome, StageRunner,
};
pub use sequences::{Batch, BatchReader, ParseError, SequenceIndex, SequenceRecord};
pub use store::{EmbeddingStoreReader, EmbeddingWriter, StoreError};
