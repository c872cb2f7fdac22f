//! Embedding capability seam and the per-run context it executes in.
//!
//! The model itself is opaque: given a batch of residue strings it returns one
//! vector per string. Anything device-side that outlives a call (allocator
//! caches, pinned buffers) hangs off [`EmbedContext`], which the batch loop
//! releases explicitly after every batch.

pub mod http;

use crate::descriptor::PrecisionMode;
use thiserror::Error;

/// Errors surfaced by an embedding capability.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// The capability could not be configured.
    #[error("embedder configuration error: {0}")]
    Config(String),
    /// The model backend failed the request.
    #[error("embedding request failed: {0}")]
    Backend(String),
    /// The backend returned a different number of vectors than inputs.
    #[error("embedder returned {returned} vectors for {requested} sequences")]
    CountMismatch {
        /// Sequences in the batch.
        requested: usize,
        /// Vectors in the response.
        returned: usize,
    },
    /// Releasing device memory failed.
    #[error("failed to release device cache: {0}")]
    Release(String),
}

/// Device-side memory the model keeps between calls.
pub trait DeviceCache: Send {
    /// Returns cached device memory to the allocator.
    fn clear(&mut self) -> Result<(), EmbedError>;
}

/// Cache for backends that hold no local device memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDeviceCache;

impl DeviceCache for NoDeviceCache {
    fn clear(&mut self) -> Result<(), EmbedError> {
        Ok(())
    }
}

/// Explicit state shared between the batch loop and the embedder.
pub struct EmbedContext {
    precision: PrecisionMode,
    cache: Box<dyn DeviceCache>,
    releases: usize,
    cache_clears: usize,
}

impl std::fmt::Debug for EmbedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedContext")
            .field("precision", &self.precision)
            .field("releases", &self.releases)
            .field("cache_clears", &self.cache_clears)
            .finish()
    }
}

impl EmbedContext {
    /// Context with no device cache.
    pub fn new(precision: PrecisionMode) -> Self {
        Self::with_cache(precision, Box::new(NoDeviceCache))
    }

    /// Context owning `cache`.
    pub fn with_cache(precision: PrecisionMode, cache: Box<dyn DeviceCache>) -> Self {
        Self {
            precision,
            cache,
            releases: 0,
            cache_clears: 0,
        }
    }

    /// Precision the model should run at.
    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }

    /// Marks the end of a batch. In reduced-precision mode this also clears the
    /// device cache so the next batch starts from a known footprint.
    pub fn release(&mut self) -> Result<(), EmbedError> {
        self.releases += 1;
        if self.precision.is_reduced() {
            self.cache.clear()?;
            self.cache_clears += 1;
        }
        Ok(())
    }

    /// Batches released so far.
    pub fn releases(&self) -> usize {
        self.releases
    }

    /// Device cache clears performed so far.
    pub fn cache_clears(&self) -> usize {
        self.cache_clears
    }
}

/// A model that maps residue strings to fixed-dimension vectors.
pub trait Embedder {
    /// Model identifier, for logs.
    fn model_variant(&self) -> &str;

    /// Embeds `sequences`, returning one vector per input in input order.
    fn embed_many(
        &self,
        ctx: &EmbedContext,
        sequences: &[&str],
    ) -> Result<Vec<Vec<f32>>, EmbedError>;
}

impl<E: Embedder + ?Sized> Embedder for &E {
    fn model_variant(&self) -> &str {
        (**self).model_variant()
    }

    fn embed_many(
        &self,
        ctx: &EmbedContext,
        sequences: &[&str],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        (**self).embed_many(ctx, sequences)
    }
}
