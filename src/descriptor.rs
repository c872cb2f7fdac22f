//! Stage configuration descriptors handed to the embedding and scoring processes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the embedding stage descriptor inside the working directory.
pub const EMBED_DESCRIPTOR_FILE: &str = "embed_config.yml";
/// File name of the scoring stage descriptor inside the working directory.
pub const SCORE_DESCRIPTOR_FILE: &str = "infer_config.yml";
/// Copy of the input sequences the scoring stage uses to map keys back to records.
pub const REMAPPED_SEQUENCES_FILE: &str = "remapped_sequences_file.fasta";
/// Directory under the output prefix holding the embedding store.
pub const EMBEDDINGS_DIR: &str = "embeddings";
/// File name of the embedding store.
pub const EMBEDDINGS_FILE: &str = "embeddings_file.emb";
/// File name of the scoring stage's raw predictions.
pub const PREDICTIONS_FILE: &str = "plmsol_predictions.csv";

/// Default protein language model the embedding stage runs.
pub const DEFAULT_MODEL_VARIANT: &str = "prottrans_t5_xl_u50";
/// Key format the scoring stage uses to match embeddings to records.
pub const DEFAULT_KEY_FORMAT: &str = "fasta_descriptor";
/// Default number of sampling draws in the scoring stage.
pub const DEFAULT_N_DRAWS: u32 = 1000;
/// Default scoring stage logging interval.
pub const DEFAULT_LOG_ITERATIONS: u32 = 100;

/// Numeric precision the embedding model runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionMode {
    /// Full (fp32) precision.
    #[default]
    Full,
    /// Half precision with per-batch cache release.
    Reduced,
}

impl PrecisionMode {
    /// Maps the `--reduced-precision` flag to a mode.
    pub fn from_flag(reduced: bool) -> Self {
        if reduced {
            Self::Reduced
        } else {
            Self::Full
        }
    }

    /// True for [`PrecisionMode::Reduced`].
    pub fn is_reduced(self) -> bool {
        matches!(self, Self::Reduced)
    }
}

/// The two stages of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Sequence → embedding store.
    Embedding,
    /// Embedding store → raw predictions.
    Scoring,
}

impl StageKind {
    /// Stable lowercase name used in logs and error output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Scoring => "scoring",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs and options for the embedding stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedDescriptor {
    /// FASTA file to embed.
    pub sequence_source: PathBuf,
    /// Directory the stage writes under.
    pub output_prefix: PathBuf,
    /// Embedding model identifier.
    pub model_variant: String,
    /// Model precision.
    pub precision_mode: PrecisionMode,
    /// Records per embedding call.
    pub batch_size: usize,
}

impl EmbedDescriptor {
    /// Where the stage writes its store.
    pub fn embeddings_path(&self) -> PathBuf {
        embeddings_path(&self.output_prefix)
    }

    /// Sequences the stage should embed: the remapped copy under the prefix when
    /// one exists, otherwise the configured source.
    pub fn effective_source(&self) -> PathBuf {
        let remapped = self.output_prefix.join(REMAPPED_SEQUENCES_FILE);
        if remapped.is_file() {
            remapped
        } else {
            self.sequence_source.clone()
        }
    }
}

/// Inputs and options for the scoring stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDescriptor {
    /// FASTA file the run started from.
    pub sequence_source: PathBuf,
    /// Directory the stage writes under.
    pub output_prefix: PathBuf,
    /// Embedding model the store was produced with.
    pub model_variant: String,
    /// Precision the store was produced at.
    pub precision_mode: PrecisionMode,
    /// Embedding store produced by the embedding stage.
    pub embeddings_source: PathBuf,
    /// Sequence file used to remap store keys to records.
    pub remapping_source: PathBuf,
    /// Model checkpoints, in the order the scorer should ensemble them.
    pub checkpoint_list: Vec<PathBuf>,
    /// Records per scoring batch.
    pub batch_size: usize,
    /// Raw prediction table the stage must write.
    pub output_path: PathBuf,
    /// Scorer architecture config, when the scorer needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_config: Option<PathBuf>,
    /// How the scorer derives record keys.
    pub key_format: String,
    /// Sampling draws for the scorer's confidence estimate.
    pub n_draws: u32,
    /// Scorer progress interval.
    pub log_iterations: u32,
    /// Base name for scorer side outputs.
    pub output_files_name: String,
}

/// A descriptor of either stage, tagged by `stage_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage_type", rename_all = "snake_case")]
pub enum StageDescriptor {
    /// `stage_type: embed`
    Embed(EmbedDescriptor),
    /// `stage_type: score`
    Score(ScoreDescriptor),
}

impl StageDescriptor {
    /// Stage this descriptor configures.
    pub fn stage(&self) -> StageKind {
        match self {
            Self::Embed(_) => StageKind::Embedding,
            Self::Score(_) => StageKind::Scoring,
        }
    }

    /// Persists the descriptor as YAML at `path`.
    pub fn write_to(&self, path: &Path) -> Result<(), DescriptorError> {
        let file = File::create(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        serde_yaml::to_writer(&mut writer, self).map_err(|source| DescriptorError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        writer.flush().map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads a descriptor from `path`.
    pub fn read_from(path: &Path) -> Result<Self, DescriptorError> {
        let file = File::open(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_reader(BufReader::new(file)).map_err(|source| DescriptorError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads an embedding descriptor, rejecting any other stage type.
    pub fn read_embed(path: &Path) -> Result<EmbedDescriptor, DescriptorError> {
        match Self::read_from(path)? {
            Self::Embed(descriptor) => Ok(descriptor),
            other => Err(DescriptorError::WrongStage {
                path: path.to_path_buf(),
                expected: StageKind::Embedding,
                actual: other.stage(),
            }),
        }
    }

    /// Loads a scoring descriptor, rejecting any other stage type.
    pub fn read_score(path: &Path) -> Result<ScoreDescriptor, DescriptorError> {
        match Self::read_from(path)? {
            Self::Score(descriptor) => Ok(descriptor),
            other => Err(DescriptorError::WrongStage {
                path: path.to_path_buf(),
                expected: StageKind::Scoring,
                actual: other.stage(),
            }),
        }
    }
}

/// Errors raised while persisting or loading descriptors.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// Reading or writing the descriptor file failed.
    #[error("descriptor {path:?}: {source}")]
    Io {
        /// Descriptor path.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The descriptor is not valid YAML for its schema.
    #[error("descriptor {path:?} is not valid: {source}")]
    Yaml {
        /// Descriptor path.
        path: PathBuf,
        /// Parser failure.
        #[source]
        source: serde_yaml::Error,
    },
    /// The descriptor configures a different stage than requested.
    #[error("descriptor {path:?} configures the {actual} stage, expected {expected}")]
    WrongStage {
        /// Descriptor path.
        path: PathBuf,
        /// Stage the caller wanted.
        expected: StageKind,
        /// Stage found in the file.
        actual: StageKind,
    },
}

/// Embedding store location for a stage writing under `output_prefix`.
pub fn embeddings_path(output_prefix: &Path) -> PathBuf {
    output_prefix.join(EMBEDDINGS_DIR).join(EMBEDDINGS_FILE)
}

/// Makes `path` absolute against the current directory without touching the filesystem.
pub fn absolutize(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Copies the sequence source to the remapping file under `output_prefix`.
pub fn materialize_remapping(source: &Path, output_prefix: &Path) -> io::Result<PathBuf> {
    let target = output_prefix.join(REMAPPED_SEQUENCES_FILE);
    fs::copy(source, &target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn score_descriptor(prefix: &Path) -> ScoreDescriptor {
        ScoreDescriptor {
            sequence_source: prefix.join("input.fasta"),
            output_prefix: prefix.to_path_buf(),
            model_variant: DEFAULT_MODEL_VARIANT.to_string(),
            precision_mode: PrecisionMode::Reduced,
            embeddings_source: embeddings_path(prefix),
            remapping_source: prefix.join(REMAPPED_SEQUENCES_FILE),
            checkpoint_list: vec![PathBuf::from("a.t7"), PathBuf::from("b.t7")],
            batch_size: 4,
            output_path: prefix.join(PREDICTIONS_FILE),
            model_config: None,
            key_format: DEFAULT_KEY_FORMAT.to_string(),
            n_draws: DEFAULT_N_DRAWS,
            log_iterations: DEFAULT_LOG_ITERATIONS,
            output_files_name: "solpipe".to_string(),
        }
    }

    #[test]
    fn yaml_carries_stage_type_and_enums() {
        let dir = tempdir().expect("tempdir");
        let descriptor = StageDescriptor::Score(score_descriptor(dir.path()));
        let yaml = serde_yaml::to_string(&descriptor).expect("yaml");
        assert!(yaml.contains("stage_type: score"));
        assert!(yaml.contains("precision_mode: reduced"));
        assert!(!yaml.contains("model_config"));

        let path = dir.path().join(SCORE_DESCRIPTOR_FILE);
        descriptor.write_to(&path).expect("write");
        let loaded = StageDescriptor::read_from(&path).expect("read");
        assert_eq!(loaded, descriptor);
        match loaded {
            StageDescriptor::Score(score) => {
                assert_eq!(
                    score.checkpoint_list,
                    vec![PathBuf::from("a.t7"), PathBuf::from("b.t7")]
                );
            }
            other => panic!("unexpected descriptor {other:?}"),
        }
    }

    #[test]
    fn read_embed_rejects_scoring_descriptor() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(SCORE_DESCRIPTOR_FILE);
        StageDescriptor::Score(score_descriptor(dir.path()))
            .write_to(&path)
            .expect("write");
        assert!(matches!(
            StageDescriptor::read_embed(&path),
            Err(DescriptorError::WrongStage {
                expected: StageKind::Embedding,
                actual: StageKind::Scoring,
                ..
            })
        ));
    }

    #[test]
    fn embed_stage_prefers_remapped_sequences() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("input.fasta");
        fs::write(&source, ">a\nMK\n").expect("write source");
        let descriptor = EmbedDescriptor {
            sequence_source: source.clone(),
            output_prefix: dir.path().to_path_buf(),
            model_variant: DEFAULT_MODEL_VARIANT.to_string(),
            precision_mode: PrecisionMode::Full,
            batch_size: 1,
        };
        assert_eq!(descriptor.effective_source(), source);

        let remapped = materialize_remapping(&source, dir.path()).expect("remap");
        assert_eq!(descriptor.effective_source(), remapped);
        assert_eq!(
            descriptor.embeddings_path(),
            dir.path().join(EMBEDDINGS_DIR).join(EMBEDDINGS_FILE)
        );
    }
}
