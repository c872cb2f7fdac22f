use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use solpipe::descriptor::StageDescriptor;
use solpipe::embedder::http::HttpEmbedder;
use solpipe::embedder::EmbedContext;
use solpipe::embedding_stage::{self, EmbeddingOptions};
use solpipe::logging;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "solpipe-embed",
    about = "Embedding stage: embed a FASTA file into an embedding store"
)]
struct EmbedCli {
    /// Embedding stage descriptor (embed_config.yml)
    #[arg(long)]
    config: PathBuf,

    /// Base URL of the OpenAI-compatible embedding service
    #[arg(
        long,
        env = "SOLPIPE_EMBED_ENDPOINT",
        default_value = "http://127.0.0.1:8080/v1"
    )]
    endpoint: String,

    /// Bearer token for the embedding service
    #[arg(long, env = "SOLPIPE_EMBED_API_KEY")]
    api_key: Option<String>,

    /// Max seconds to wait for each embedding request
    #[arg(long, env = "SOLPIPE_EMBED_TIMEOUT_SECS", default_value_t = 120)]
    timeout_secs: u64,

    /// Parse the next batch while the current one is embedded
    #[arg(long, env = "SOLPIPE_EMBED_PREFETCH", default_value_t = false)]
    prefetch: bool,
}

fn main() -> Result<()> {
    logging::init();
    let cli = EmbedCli::parse();
    let descriptor = StageDescriptor::read_embed(&cli.config)
        .with_context(|| format!("failed to load descriptor {:?}", cli.config))?;

    let embedder = HttpEmbedder::new(
        &cli.endpoint,
        cli.api_key.as_deref(),
        descriptor.model_variant.clone(),
        Duration::from_secs(cli.timeout_secs.max(1)),
        descriptor.batch_size,
    )?;
    let mut ctx = EmbedContext::new(descriptor.precision_mode);
    let summary = embedding_stage::run(
        &descriptor,
        &embedder,
        &mut ctx,
        EmbeddingOptions {
            prefetch: cli.prefetch,
        },
    )
    .context("embedding stage failed")?;

    info!(
        store = %summary.store_path.display(),
        sequences = summary.sequences,
        batches = summary.batch_sizes.len(),
        "embedding stage complete"
    );
    Ok(())
}
