use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::Path;

use pretty_assertions::assert_eq;
use solpipe::descriptor::{StageDescriptor, StageKind};
use solpipe::embedder::{EmbedContext, EmbedError, Embedder};
use solpipe::embedding_stage::{self, EmbeddingOptions};
use solpipe::normalizer::CanonicalRow;
use solpipe::orchestrator::{
    run_pipeline, CancelFlag, OrchestrationError, PipelineState, StageOutcome, StageRunner,
};
use solpipe::{EmbeddingStoreReader, PipelineControls, PipelineError, PrecisionMode};

const FASTA: &str = ">sp|P1|ALPHA\nMKVLAAGG\n>sp|P2|BETA\nMLLSTW\nQQ\n>sp|P3|GAMMA\nGGWYKR\n";

/// Embeds by residue composition so vectors differ per sequence.
struct CompositionEmbedder;

impl Embedder for CompositionEmbedder {
    fn model_variant(&self) -> &str {
        "composition"
    }

    fn embed_many(
        &self,
        _ctx: &EmbedContext,
        sequences: &[&str],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(sequences
            .iter()
            .map(|seq| {
                let hydrophobic = seq.chars().filter(|c| "AILMFVW".contains(*c)).count();
                vec![seq.len() as f32, hydrophobic as f32]
            })
            .collect())
    }
}

/// Runs the embedding stage in-process and scores from the store it wrote.
#[derive(Default)]
struct InProcessRunner {
    batch_sizes: RefCell<Vec<usize>>,
    cache_clears: RefCell<usize>,
    store_keys: RefCell<Vec<String>>,
    fail_scoring: bool,
}

impl StageRunner for InProcessRunner {
    fn run(
        &self,
        stage: StageKind,
        descriptor: &Path,
        _cancel: &CancelFlag,
    ) -> io::Result<StageOutcome> {
        match stage {
            StageKind::Embedding => {
                let config = StageDescriptor::read_embed(descriptor).expect("embed descriptor");
                let mut ctx = EmbedContext::new(config.precision_mode);
                let summary = embedding_stage::run(
                    &config,
                    &CompositionEmbedder,
                    &mut ctx,
                    EmbeddingOptions::default(),
                )
                .expect("embedding stage");
                *self.batch_sizes.borrow_mut() = summary.batch_sizes;
                *self.cache_clears.borrow_mut() = ctx.cache_clears();
                Ok(StageOutcome::Completed)
            }
            StageKind::Scoring if self.fail_scoring => Ok(StageOutcome::Failed { exit_code: Some(7) }),
            StageKind::Scoring => {
                let config = StageDescriptor::read_score(descriptor).expect("score descriptor");
                assert!(config.remapping_source.is_file());
                let mut store =
                    EmbeddingStoreReader::open(&config.embeddings_source).expect("store");
                let ids = store.ids().to_vec();
                let mut table = String::from("name,probability\n");
                for id in &ids {
                    let vector = store.get(id).expect("read").expect("vector");
                    let probability = vector[1] / vector[0];
                    table.push_str(&format!("{id},{probability}\n"));
                }
                fs::write(&config.output_path, table)?;
                *self.store_keys.borrow_mut() = ids;
                Ok(StageOutcome::Completed)
            }
        }
    }
}

fn setup(dir: &Path) -> PipelineControls {
    let input = dir.join("input.fasta");
    fs::write(&input, FASTA).expect("write fasta");
    PipelineControls::new(input, dir.join("results").join("solubility.csv"))
        .with_batch_size(2)
        .expect("batch size")
        .with_workdir_root(Some(dir.join("scratch")))
}

fn scratch_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir.join("scratch"))
        .expect("scratch dir")
        .next()
        .is_none()
}

#[test]
fn three_sequences_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runner = InProcessRunner::default();
    let report = run_pipeline(setup(dir.path()), &runner, CancelFlag::new()).expect("pipeline");

    assert_eq!(*runner.batch_sizes.borrow(), vec![2, 1]);
    assert_eq!(*runner.cache_clears.borrow(), 0);
    assert_eq!(
        *runner.store_keys.borrow(),
        vec!["sp|P1|ALPHA", "sp|P2|BETA", "sp|P3|GAMMA"]
    );
    assert_eq!(report.history.last(), Some(&PipelineState::Normalized));
    assert!(report.report.degraded.is_empty());

    let mut reader = csv::Reader::from_path(&report.output).expect("canonical table");
    let rows: Vec<CanonicalRow> = reader
        .deserialize()
        .collect::<Result<_, _>>()
        .expect("rows");
    let accessions: Vec<_> = rows.iter().map(|row| row.accession.as_str()).collect();
    assert_eq!(accessions, vec!["sp|P1|ALPHA", "sp|P2|BETA", "sp|P3|GAMMA"]);
    assert_eq!(rows[1].sequence, "MLLSTWQQ");
    for row in &rows {
        assert_eq!(row.predictor, "PLM_Sol");
        assert!((row.probability_soluble + row.probability_insoluble - 1.0).abs() < 1e-9);
    }
    assert!(report.report_path.is_file());
    assert!(scratch_is_empty(dir.path()));
}

#[test]
fn reduced_precision_clears_cache_every_batch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runner = InProcessRunner::default();
    let controls = setup(dir.path()).with_precision(PrecisionMode::Reduced);
    run_pipeline(controls, &runner, CancelFlag::new()).expect("pipeline");
    assert_eq!(*runner.cache_clears.borrow(), 2);
}

#[test]
fn scoring_failure_publishes_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runner = InProcessRunner {
        fail_scoring: true,
        ..InProcessRunner::default()
    };
    let controls = setup(dir.path());
    let output = controls.output().to_path_buf();
    let err = run_pipeline(controls, &runner, CancelFlag::new()).expect_err("scoring fails");
    assert!(matches!(
        err,
        PipelineError::Orchestration(OrchestrationError::StageExecution {
            stage: StageKind::Scoring,
            exit_code: Some(7)
        })
    ));
    assert_eq!(err.stage(), "scoring");
    assert!(!output.exists());
    assert!(scratch_is_empty(dir.path()));
}

#[test]
fn duplicate_input_ids_abort_before_any_stage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let controls = setup(dir.path());
    fs::write(controls.input_sequences(), ">a\nMK\n>a\nMV\n").expect("rewrite fasta");
    let runner = InProcessRunner::default();
    let err = run_pipeline(controls, &runner, CancelFlag::new()).expect_err("duplicate");
    assert_eq!(err.stage(), "input");
    assert!(runner.batch_sizes.borrow().is_empty());
}
