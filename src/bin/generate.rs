use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use burn_ndarray::NdArray;
use burn_wgpu::Wgpu;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "cuda")]
use burn_cuda::Cuda;

use burn_tiny_lm::{
    BigramLm, CheckpointStore, DecodeStrategyConfig, GenerationConfig, NucleusPolicy,
    NucleusSettings, TrainingConfig, build_model_config, decode_rows, generate_argmax,
    generate_nucleus, load_training_config,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate text from a trained checkpoint")]
struct Args {
    /// Additional configuration files applied in order (later files override earlier ones).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Vec<PathBuf>,
    /// Backend to use for generation.
    #[arg(long, value_enum, default_value_t = BackendArg::Wgpu)]
    backend: BackendArg,
    /// Checkpoint directory; defaults to the run directory of the selected backend.
    #[arg(long, value_name = "PATH")]
    checkpoint: Option<PathBuf>,
    /// Training step to load; defaults to the latest checkpoint.
    #[arg(long, value_name = "N")]
    step: Option<usize>,
    /// Override the prompt used for generation.
    #[arg(long)]
    prompt: Option<String>,
    /// Override the number of sequences generated.
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,
    /// Override the maximum sequence length.
    #[arg(long, value_name = "N")]
    max_len: Option<usize>,
    /// Sample with nucleus decoding using this threshold instead of greedy decoding.
    #[arg(long, value_name = "P")]
    nucleus: Option<f32>,
    /// Reproduce the batch-shared nucleus behavior of older runs.
    #[arg(long)]
    legacy_nucleus: bool,
    /// Seed for nucleus sampling.
    #[arg(long, default_value_t = 1337)]
    seed: u64,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BackendArg {
    Cuda,
    Ndarray,
    Wgpu,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("burn_tiny_lm=info,generate=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut config_paths = vec![PathBuf::from("config/base.toml")];
    config_paths.extend(args.config.clone());
    let config = load_training_config(&config_paths)?;

    match args.backend {
        BackendArg::Wgpu => generate_backend::<Wgpu<f32>>(&config, &args, "wgpu"),
        BackendArg::Ndarray => generate_backend::<NdArray<f32>>(&config, &args, "ndarray"),
        BackendArg::Cuda => {
            #[cfg(feature = "cuda")]
            {
                generate_backend::<Cuda<f32>>(&config, &args, "cuda")
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(anyhow!(
                    "cuda backend selected but this build lacks `cuda` feature; rebuild with `--features cuda`"
                ))
            }
        }
    }
}

fn generate_backend<B: Backend>(
    config: &TrainingConfig,
    args: &Args,
    backend_name: &str,
) -> Result<()> {
    let device = B::Device::default();
    B::seed(&device, config.training.seed);

    let vocab_path = config
        .dataset
        .tokenizer
        .storage_path(&config.dataset.cache_dir);
    let tokenizer = config
        .dataset
        .tokenizer
        .load(&vocab_path)
        .with_context(|| format!("failed to load vocabulary {}", vocab_path.display()))?;

    let checkpoint_dir = args.checkpoint.clone().unwrap_or_else(|| {
        config
            .tracking
            .run_dir
            .join(backend_name)
            .join("checkpoint")
    });
    let store = CheckpointStore::new(checkpoint_dir);
    let step = match args.step {
        Some(step) => step,
        None => store.latest_step()?.ok_or_else(|| {
            anyhow!("no checkpoints found in {}", store.dir().display())
        })?,
    };

    let model_config = build_model_config(&config.model, tokenizer.len());
    let model = store.load(BigramLm::<B>::new(model_config, &device), step, &device)?;
    info!(
        "Loaded step {step} from {} using {backend_name} backend.",
        store.path_for(step).display()
    );

    let mut generation = config.generation.clone();
    apply_generation_overrides(&mut generation, args);
    let batch_size = generation.batch_size.max(1);

    let prefix = if generation.prompt.is_empty() {
        None
    } else {
        let ids: Vec<i64> = tokenizer
            .encode(&generation.prompt, true, false)
            .into_iter()
            .map(i64::from)
            .collect();
        let len = ids.len();
        let rows: Vec<i64> = std::iter::repeat_n(ids, batch_size).flatten().collect();
        Some(Tensor::<B, 2, Int>::from_data(
            TensorData::new(rows, [batch_size, len]),
            &device,
        ))
    };

    let tokens = match generation.strategy {
        DecodeStrategyConfig::Argmax => generate_argmax(
            &model,
            &*tokenizer,
            &device,
            batch_size,
            prefix,
            generation.max_len,
        )?,
        DecodeStrategyConfig::Nucleus { nucleus, policy } => {
            let mut rng = StdRng::seed_from_u64(args.seed);
            let settings = NucleusSettings {
                max_len: generation.max_len,
                nucleus,
                policy,
            };
            generate_nucleus(
                &model,
                &*tokenizer,
                &device,
                batch_size,
                prefix,
                settings,
                &mut rng,
            )?
        }
    };

    for text in decode_rows(&*tokenizer, tokens)? {
        println!("{text}");
    }
    Ok(())
}

fn apply_generation_overrides(generation: &mut GenerationConfig, args: &Args) {
    if let Some(prompt) = &args.prompt {
        generation.prompt = prompt.clone();
    }
    if let Some(batch_size) = args.batch_size {
        generation.batch_size = batch_size;
    }
    if let Some(max_len) = args.max_len {
        generation.max_len = max_len;
    }
    if let Some(nucleus) = args.nucleus {
        let policy = if args.legacy_nucleus {
            NucleusPolicy::SharedLegacy
        } else {
            NucleusPolicy::PerSequence
        };
        generation.strategy = DecodeStrategyConfig::Nucleus { nucleus, policy };
    }
}
