use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use minivllm::engine::{EngineService, ExecutionBatch, ModelExecutor, ModelOutput};
use minivllm::{logging, EngineConfig, GenerationRequest, LLMEngine};

#[derive(Parser, Debug)]
#[command(name = "minivllm")]
#[command(about = "Continuous batching over a paged KV cache, driven by a synthetic model")]
struct Args {
    /// JSON engine configuration; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Total KV cache blocks
    #[arg(long)]
    num_blocks: Option<usize>,

    /// Tokens per block
    #[arg(long)]
    block_size: Option<usize>,

    /// Maximum concurrently running requests
    #[arg(long)]
    max_num_seqs: Option<usize>,

    /// Stop each request at this many prompt + generated tokens
    #[arg(long, default_value = "32")]
    max_length: usize,

    /// Prompt as comma-separated token ids; repeat for several requests
    #[arg(short, long)]
    prompts: Vec<String>,

    /// Vocabulary size of the synthetic model
    #[arg(long, default_value = "1000")]
    vocab_size: u32,
}

/// Predicts the successor of the last token.
struct CountingModel {
    vocab_size: u32,
}

impl ModelExecutor for CountingModel {
    fn execute(&self, batch: &ExecutionBatch) -> minivllm::Result<ModelOutput> {
        let next = batch
            .sequences
            .iter()
            .map(|seq| seq.token_ids.last().map_or(0, |&t| (t + 1) % self.vocab_size))
            .collect();
        Ok(ModelOutput::TokenIds(next))
    }
}

fn parse_prompt(raw: &str) -> anyhow::Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().with_context(|| format!("bad token id {s:?}")))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing(logging::DEFAULT_LOG_FILTER);
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(num_blocks) = args.num_blocks {
        config.num_blocks = num_blocks;
    }
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    if let Some(max_num_seqs) = args.max_num_seqs {
        config.max_num_seqs = max_num_seqs;
    }

    let prompts = if args.prompts.is_empty() {
        vec![vec![1, 2, 3], vec![10, 11], vec![20, 21, 22, 23]]
    } else {
        args.prompts
            .iter()
            .map(|raw| parse_prompt(raw))
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    info!(version = env!("CARGO_PKG_VERSION"), requests = prompts.len(), "starting");

    let engine = LLMEngine::new(
        CountingModel {
            vocab_size: args.vocab_size,
        },
        config,
    )?;
    let service = EngineService::start(engine);

    let mut streams = Vec::new();
    for prompt in prompts {
        let request = GenerationRequest::new(prompt).max_length(args.max_length);
        streams.push(service.submit(request)?);
    }

    let readers: Vec<_> = streams
        .into_iter()
        .map(|(request_id, mut rx)| {
            tokio::spawn(async move {
                let mut tokens = Vec::new();
                let mut reason = None;
                while let Some(output) = rx.recv().await {
                    tokens.extend(output.token);
                    if output.finished {
                        reason = output.finish_reason;
                    }
                }
                (request_id, tokens, reason)
            })
        })
        .collect();

    for reader in readers {
        let Ok((request_id, tokens, reason)) = reader.await else {
            continue;
        };
        info!(
            request_id,
            tokens = ?tokens,
            reason = reason.map(|r| r.as_str()),
            "request complete"
        );
    }

    service.shutdown().await;
    Ok(())
}
