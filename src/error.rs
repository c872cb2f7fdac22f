//! Crate-wide error type naming the pipeline step that failed.

use std::io;
use thiserror::Error;

use crate::controls::ControlsError;
use crate::descriptor::DescriptorError;
use crate::embedding_stage::EmbeddingStageError;
use crate::normalizer::NormalizeError;
use crate::orchestrator::OrchestrationError;
use crate::sequences::ParseError;
use crate::store::StoreError;

/// Any failure that ends a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The run configuration is invalid.
    #[error(transparent)]
    Controls(#[from] ControlsError),
    /// The sequence source is malformed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The embedding store is unreadable or inconsistent.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A stage descriptor could not be written or read.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    /// Stage sequencing or execution failed.
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
    /// The raw predictions could not be normalized.
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    /// The in-process embedding loop failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingStageError),
    /// The working directory could not be prepared.
    #[error("working directory: {0}")]
    WorkingDir(#[source] io::Error),
}

impl PipelineError {
    /// Name of the step that failed, as reported on standard error.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Controls(_) => "configuration",
            Self::Parse(_) => "input",
            Self::Store(_) | Self::Embedding(_) => "embedding",
            Self::Descriptor(_) | Self::WorkingDir(_) => "orchestration",
            Self::Orchestration(err) => err
                .stage()
                .map(|stage| stage.as_str())
                .unwrap_or("orchestration"),
            Self::Normalize(_) => "normalize",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::StageKind;

    #[test]
    fn stage_names_follow_the_failing_step() {
        let err = PipelineError::from(OrchestrationError::StageExecution {
            stage: StageKind::Scoring,
            exit_code: Some(3),
        });
        assert_eq!(err.stage(), "scoring");
        assert_eq!(err.to_string(), "scoring stage failed with exit code 3");

        let err = PipelineError::from(ParseError::InvalidBatchSize);
        assert_eq!(err.stage(), "input");

        let err = PipelineError::from(NormalizeError::UnmatchedAccession {
            accession: "x".to_string(),
            row: 0,
        });
        assert_eq!(err.stage(), "normalize");
    }
}
