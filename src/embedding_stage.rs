//! Batch loop run inside the embedding stage: read → embed → persist → release.

use crate::descriptor::EmbedDescriptor;
use crate::embedder::{EmbedContext, EmbedError, Embedder};
use crate::sequences::{Batch, BatchReader, ParseError};
use crate::store::{EmbeddingWriter, StoreError};
use crossbeam_channel::bounded;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that abort the embedding stage.
#[derive(Debug, Error)]
pub enum EmbeddingStageError {
    /// The sequence source is malformed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The store rejected a write or could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The embedding capability failed.
    #[error(transparent)]
    Embed(#[from] EmbedError),
    /// The output directory could not be prepared.
    #[error("failed to prepare embedding output directory {path:?}: {source}")]
    OutputDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The embedder returned the wrong number of vectors for a batch.
    #[error("batch {batch} produced {returned} vectors for {requested} sequences")]
    VectorCount {
        /// Batch index.
        batch: usize,
        /// Sequences in the batch.
        requested: usize,
        /// Vectors returned.
        returned: usize,
    },
    /// The run ended with fewer stored vectors than input sequences.
    #[error("embedding store holds {stored} vectors for {expected} sequences")]
    Incomplete {
        /// Sequences counted in the source.
        expected: usize,
        /// Vectors written.
        stored: usize,
    },
    /// The prefetch thread stopped without finishing the source.
    #[error("sequence prefetch thread terminated unexpectedly")]
    PrefetchDisconnected,
}

/// Outcome of a completed embedding stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingSummary {
    /// Published store path.
    pub store_path: PathBuf,
    /// Sequences embedded.
    pub sequences: usize,
    /// Batches processed, in order, with their sizes.
    pub batch_sizes: Vec<usize>,
}

/// Options for the batch loop beyond what the descriptor carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingOptions {
    /// Parse the next batch on a helper thread while the current one is embedded.
    pub prefetch: bool,
}

/// Embeds every sequence the descriptor points at into its store.
///
/// Only the current batch (and, with prefetch, at most two more) is alive at
/// any point; vectors go to disk as soon as the embedder returns them.
pub fn run<E: Embedder + ?Sized>(
    descriptor: &EmbedDescriptor,
    embedder: &E,
    ctx: &mut EmbedContext,
    options: EmbeddingOptions,
) -> Result<EmbeddingSummary, EmbeddingStageError> {
    let source = descriptor.effective_source();
    let reader = BatchReader::open(&source, descriptor.batch_size)?;
    let total = reader.total();
    let store_path = descriptor.embeddings_path();
    if let Some(parent) = store_path.parent() {
        fs::create_dir_all(parent).map_err(|source| EmbeddingStageError::OutputDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let mut writer = EmbeddingWriter::open(&store_path, ctx.precision())?;
    info!(
        source = %source.display(),
        total,
        batch_size = descriptor.batch_size,
        model = embedder.model_variant(),
        precision = ?ctx.precision(),
        "embedding sequences"
    );

    let mut batch_sizes = Vec::with_capacity(reader.expected_batches());
    let mut processed = 0usize;
    let mut on_batch = |batch: Batch| -> Result<(), EmbeddingStageError> {
        let count = embed_batch(&batch, embedder, &*ctx, &mut writer)?;
        processed += count;
        batch_sizes.push(count);
        info!("processed {processed}/{total} sequences");
        drop(batch);
        ctx.release()?;
        Ok(())
    };

    if options.prefetch {
        run_prefetched(reader, &mut on_batch)?;
    } else {
        for batch in reader {
            on_batch(batch?)?;
        }
    }

    if writer.len() != total {
        return Err(EmbeddingStageError::Incomplete {
            expected: total,
            stored: writer.len(),
        });
    }
    let store_path = writer.close()?;
    info!(path = %store_path.display(), sequences = total, "embedding store complete");
    Ok(EmbeddingSummary {
        store_path,
        sequences: total,
        batch_sizes,
    })
}

fn embed_batch<E: Embedder + ?Sized>(
    batch: &Batch,
    embedder: &E,
    ctx: &EmbedContext,
    writer: &mut EmbeddingWriter,
) -> Result<usize, EmbeddingStageError> {
    let residues = batch.residues();
    let vectors = embedder.embed_many(ctx, &residues)?;
    if vectors.len() != batch.len() {
        return Err(EmbeddingStageError::VectorCount {
            batch: batch.index,
            requested: batch.len(),
            returned: vectors.len(),
        });
    }
    for (record, vector) in batch.records.iter().zip(&vectors) {
        writer.write(&record.id, vector)?;
    }
    debug!(batch = batch.index, size = batch.len(), "batch persisted");
    Ok(batch.len())
}

fn run_prefetched<F>(reader: BatchReader, on_batch: &mut F) -> Result<(), EmbeddingStageError>
where
    F: FnMut(Batch) -> Result<(), EmbeddingStageError>,
{
    let expected = reader.expected_batches();
    let (batch_tx, batch_rx) = bounded::<Result<Batch, ParseError>>(1);
    thread::scope(|scope| {
        scope.spawn(move || {
            for batch in reader {
                if batch_tx.send(batch).is_err() {
                    break;
                }
            }
        });

        let mut received = 0usize;
        let mut outcome = Ok(());
        for batch in batch_rx.iter() {
            received += 1;
            if let Err(err) = batch.map_err(EmbeddingStageError::from).and_then(&mut *on_batch) {
                outcome = Err(err);
                break;
            }
        }
        drop(batch_rx);
        if outcome.is_ok() && received < expected {
            outcome = Err(EmbeddingStageError::PrefetchDisconnected);
        }
        outcome
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{PrecisionMode, DEFAULT_MODEL_VARIANT};
    use crate::embedder::DeviceCache;
    use crate::store::{partial_path, EmbeddingStoreReader};
    use std::cell::RefCell;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Deterministic embedder: [length, first residue code, call number].
    struct FakeEmbedder {
        calls: RefCell<Vec<usize>>,
        fail_on_call: Option<usize>,
    }

    impl FakeEmbedder {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail_on_call: None,
            }
        }
    }

    impl Embedder for FakeEmbedder {
        fn model_variant(&self) -> &str {
            "fake"
        }

        fn embed_many(
            &self,
            _ctx: &EmbedContext,
            sequences: &[&str],
        ) -> Result<Vec<Vec<f32>>, EmbedError> {
            let mut calls = self.calls.borrow_mut();
            calls.push(sequences.len());
            let call = calls.len();
            if self.fail_on_call == Some(call) {
                return Err(EmbedError::Backend("device out of memory".to_string()));
            }
            Ok(sequences
                .iter()
                .map(|seq| {
                    vec![
                        seq.len() as f32,
                        seq.as_bytes()[0] as f32,
                        call as f32,
                    ]
                })
                .collect())
        }
    }

    struct CountingCache(Arc<AtomicUsize>);

    impl DeviceCache for CountingCache {
        fn clear(&mut self) -> Result<(), EmbedError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn descriptor(prefix: &Path, sequences: &str, batch_size: usize) -> EmbedDescriptor {
        let source = prefix.join("input.fasta");
        fs::write(&source, sequences).expect("write fasta");
        EmbedDescriptor {
            sequence_source: source,
            output_prefix: prefix.to_path_buf(),
            model_variant: DEFAULT_MODEL_VARIANT.to_string(),
            precision_mode: PrecisionMode::Reduced,
            batch_size,
        }
    }

    const THREE: &str = ">p1\nMKV\n>p2\nAAAA\n>p3\nGG\n";

    #[test]
    fn three_sequences_in_pairs() {
        let dir = tempdir().expect("tempdir");
        let descriptor = descriptor(dir.path(), THREE, 2);
        let clears = Arc::new(AtomicUsize::new(0));
        let mut ctx = EmbedContext::with_cache(
            PrecisionMode::Reduced,
            Box::new(CountingCache(Arc::clone(&clears))),
        );
        let embedder = FakeEmbedder::new();

        let summary = run(&descriptor, &embedder, &mut ctx, EmbeddingOptions::default())
            .expect("embedding run");
        assert_eq!(summary.batch_sizes, vec![2, 1]);
        assert_eq!(summary.sequences, 3);
        assert_eq!(*embedder.calls.borrow(), vec![2, 1]);
        assert_eq!(clears.load(Ordering::SeqCst), 2);

        let mut store = EmbeddingStoreReader::open(&summary.store_path).expect("store");
        assert_eq!(store.ids(), ["p1", "p2", "p3"]);
        assert_eq!(store.get("p2").expect("get"), Some(vec![4.0, b'A' as f32, 1.0]));
        assert_eq!(store.get("p3").expect("get"), Some(vec![2.0, b'G' as f32, 2.0]));
    }

    #[test]
    fn prefetch_produces_the_same_store() {
        let dir = tempdir().expect("tempdir");
        let descriptor = descriptor(dir.path(), THREE, 2);
        let mut ctx = EmbedContext::new(PrecisionMode::Full);
        let embedder = FakeEmbedder::new();

        let summary = run(
            &descriptor,
            &embedder,
            &mut ctx,
            EmbeddingOptions { prefetch: true },
        )
        .expect("embedding run");
        assert_eq!(summary.batch_sizes, vec![2, 1]);
        assert_eq!(ctx.releases(), 2);
        assert_eq!(ctx.cache_clears(), 0);
        let store = EmbeddingStoreReader::open(&summary.store_path).expect("store");
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn embedder_failure_leaves_no_store() {
        let dir = tempdir().expect("tempdir");
        let descriptor = descriptor(dir.path(), THREE, 2);
        let mut ctx = EmbedContext::new(PrecisionMode::Full);
        let mut embedder = FakeEmbedder::new();
        embedder.fail_on_call = Some(2);

        let err = run(&descriptor, &embedder, &mut ctx, EmbeddingOptions::default())
            .expect_err("second batch fails");
        assert!(matches!(err, EmbeddingStageError::Embed(_)));
        let store_path = descriptor.embeddings_path();
        assert!(!store_path.exists());
        assert!(!partial_path(&store_path).exists());
    }

    #[test]
    fn duplicate_identifier_aborts_stage() {
        let dir = tempdir().expect("tempdir");
        let descriptor = descriptor(dir.path(), ">p1\nMK\n>p1\nMV\n", 1);
        let mut ctx = EmbedContext::new(PrecisionMode::Full);
        let err = run(
            &descriptor,
            &FakeEmbedder::new(),
            &mut ctx,
            EmbeddingOptions { prefetch: true },
        )
        .expect_err("duplicate id");
        assert!(matches!(
            err,
            EmbeddingStageError::Store(StoreError::DuplicateKey { ref id }) if id == "p1"
        ));
    }

    #[test]
    fn parse_error_surfaces_through_prefetch() {
        let dir = tempdir().expect("tempdir");
        let descriptor = descriptor(dir.path(), ">p1\nMK\n>p2\nM#K\n", 1);
        let mut ctx = EmbedContext::new(PrecisionMode::Full);
        let err = run(
            &descriptor,
            &FakeEmbedder::new(),
            &mut ctx,
            EmbeddingOptions { prefetch: true },
        )
        .expect_err("invalid residue");
        assert!(matches!(
            err,
            EmbeddingStageError::Parse(ParseError::InvalidResidue { .. })
        ));
    }
}
