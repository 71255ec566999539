#![recursion_limit = "256"]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

use burn::lr_scheduler::{
    LrScheduler,
    cosine::{CosineAnnealingLrScheduler, CosineAnnealingLrSchedulerConfig},
    linear::{LinearLrScheduler, LinearLrSchedulerConfig},
    noam::{NoamLrScheduler, NoamLrSchedulerConfig},
};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{AdamW, AdamWConfig, LearningRate};
use burn::tensor::backend::AutodiffBackend;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_wgpu::Wgpu;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "cuda")]
use burn_cuda::Cuda;

use burn_tiny_lm::trainer::{TrainLoader, ValidLoader};
use burn_tiny_lm::{
    BigramConfig, BigramLm, CheckpointStore, DatasetSplit, LearningRateScheduleConfig,
    OptimizerConfig, RunInfo, TextCorpus, Trainer, TrainerEnvironment, TrainerSettings,
    TrainingConfig, build_model_config, build_sinks, load_training_config,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a tiny language model")]
struct Cli {
    #[command(flatten)]
    train: TrainArgs,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(ClapArgs, Debug)]
struct TrainArgs {
    /// Additional configuration files applied in order (later files override earlier ones).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    config: Vec<PathBuf>,
    /// Backend to use for training.
    #[arg(long, value_enum, default_value_t = BackendArg::Wgpu)]
    backend: BackendArg,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the character-level vocabulary and exit.
    BuildVocab,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BackendArg {
    Cuda,
    Ndarray,
    Wgpu,
}

pub fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    init_tracing();
    let args = Cli::parse();

    let mut config_paths = vec![PathBuf::from("config/base.toml")];
    config_paths.extend(args.train.config.clone());
    let config = load_training_config(&config_paths)?;

    let corpus = prepare_corpus(&config)?;
    if matches!(args.command, Some(Command::BuildVocab)) {
        return Ok(());
    }

    match args.train.backend {
        BackendArg::Wgpu => train_backend::<Autodiff<Wgpu<f32>>>(&config, &corpus, "wgpu"),
        BackendArg::Ndarray => {
            train_backend::<Autodiff<NdArray<f32>>>(&config, &corpus, "ndarray")
        }
        BackendArg::Cuda => {
            #[cfg(feature = "cuda")]
            {
                train_backend::<Autodiff<Cuda<f32>>>(&config, &corpus, "cuda")
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

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("burn_tiny_lm=info,train=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_corpus(config: &TrainingConfig) -> Result<TextCorpus> {
    let dataset_cfg = &config.dataset;
    let vocab_path = dataset_cfg.tokenizer.storage_path(&dataset_cfg.cache_dir);
    let preexisting = vocab_path.is_file();

    let corpus = TextCorpus::from_config(dataset_cfg, config.training.block_size)?;
    let verb = if preexisting { "Loaded" } else { "Built" };
    info!(
        "{verb} character vocabulary with {} tokens at {}",
        corpus.tokenizer().len(),
        vocab_path.display()
    );
    info!("{}", corpus.summary());
    Ok(corpus)
}

fn train_backend<B>(config: &TrainingConfig, corpus: &TextCorpus, backend_name: &str) -> Result<()>
where
    B: AutodiffBackend,
{
    let device = B::Device::default();
    let training = &config.training;
    B::seed(&device, training.seed);

    let tokenizer = corpus.tokenizer();
    let model_config = build_model_config(&config.model, tokenizer.len());

    let mut train_loader = corpus.loader::<B>(DatasetSplit::Train, training.batch_size, &device)?;
    if let Some(seed) = config.dataset.shuffle_seed {
        train_loader = train_loader.with_shuffle(seed);
    }
    let valid_loader =
        corpus.loader::<B::InnerBackend>(DatasetSplit::Val, training.batch_size, &device)?;
    info!(
        "train schedule: steps_per_epoch={}, max_iters={}, epochs={}",
        train_loader.num_batches(),
        training.max_iters,
        training.epochs
    );

    let run_dir = config.tracking.run_dir.join(backend_name);
    let env = TrainerEnvironment::<B> {
        tokenizer,
        train_loader: Arc::new(train_loader) as TrainLoader<B>,
        valid_loader: Arc::new(valid_loader) as ValidLoader<B>,
        checkpoints: CheckpointStore::new(run_dir.join("checkpoint")),
        settings: TrainerSettings::from(training),
    };

    let model = BigramLm::<B>::new(model_config.clone(), &device);
    let optimizer = AdamWConfig::new()
        .with_weight_decay(config.optimizer.weight_decay)
        .init::<B, BigramLm<B>>();

    let run = RunInfo {
        project: config.tracking.project.clone(),
        run_dir: run_dir.clone(),
        config: serde_json::to_value(config).context("failed to serialize configuration")?,
    };

    match resolve_lr_scheduler(&config.optimizer, training.max_iters, &model_config)? {
        ResolvedLrScheduler::Constant(lr) => {
            train_with_scheduler(model, optimizer, lr, env, &run, config, &run_dir)
        }
        ResolvedLrScheduler::Cosine(scheduler) => {
            train_with_scheduler(model, optimizer, scheduler, env, &run, config, &run_dir)
        }
        ResolvedLrScheduler::Linear(scheduler) => {
            train_with_scheduler(model, optimizer, scheduler, env, &run, config, &run_dir)
        }
        ResolvedLrScheduler::Noam(scheduler) => {
            train_with_scheduler(model, optimizer, scheduler, env, &run, config, &run_dir)
        }
    }?;

    info!("Training complete on {backend_name}");
    Ok(())
}

enum ResolvedLrScheduler {
    Constant(LearningRate),
    Cosine(CosineAnnealingLrScheduler),
    Linear(LinearLrScheduler),
    Noam(NoamLrScheduler),
}

fn train_with_scheduler<B, S>(
    model: BigramLm<B>,
    optimizer: OptimizerAdaptor<AdamW, BigramLm<B>, B>,
    scheduler: S,
    env: TrainerEnvironment<B>,
    run: &RunInfo,
    config: &TrainingConfig,
    run_dir: &Path,
) -> Result<()>
where
    B: AutodiffBackend,
    S: LrScheduler,
{
    let mut sink = build_sinks(&config.tracking, run_dir);
    let mut trainer = Trainer::new(model, optimizer, scheduler, env);
    let summary = trainer.train(&mut sink, run)?;

    info!(
        "ran {} steps over {} epochs, {} checkpoints saved",
        summary.steps,
        summary.epochs_started,
        summary.checkpoints.len()
    );
    if let Some(validation) = summary.last_validation {
        info!(
            "last validation: loss {:.4}, perplexity {:.4}",
            validation.loss, validation.perplexity
        );
    }
    Ok(())
}

fn resolve_lr_scheduler(
    optimizer_cfg: &OptimizerConfig,
    total_steps: usize,
    model_config: &BigramConfig,
) -> Result<ResolvedLrScheduler> {
    let base_lr = optimizer_cfg.learning_rate;
    let fallback_iters = total_steps.max(1);

    let schedule = match &optimizer_cfg.lr_schedule {
        None => ResolvedLrScheduler::Constant(base_lr),
        Some(LearningRateScheduleConfig::Constant { initial_lr }) => {
            ResolvedLrScheduler::Constant(initial_lr.unwrap_or(base_lr))
        }
        Some(LearningRateScheduleConfig::Cosine {
            initial_lr,
            min_lr,
            num_iters,
        }) => {
            let scheduler = CosineAnnealingLrSchedulerConfig::new(
                initial_lr.unwrap_or(base_lr),
                num_iters.unwrap_or(fallback_iters).max(1),
            )
            .with_min_lr(min_lr.unwrap_or(0.0))
            .init()
            .map_err(|err| anyhow!("failed to initialize cosine lr scheduler: {err}"))?;
            ResolvedLrScheduler::Cosine(scheduler)
        }
        Some(LearningRateScheduleConfig::Linear {
            initial_lr,
            final_lr,
            num_iters,
        }) => {
            let scheduler = LinearLrSchedulerConfig::new(
                initial_lr.unwrap_or(base_lr),
                *final_lr,
                num_iters.unwrap_or(fallback_iters).max(1),
            )
            .init()
            .map_err(|err| anyhow!("failed to initialize linear lr scheduler: {err}"))?;
            ResolvedLrScheduler::Linear(scheduler)
        }
        Some(LearningRateScheduleConfig::Noam {
            initial_lr,
            warmup_steps,
            model_size,
        }) => {
            let scheduler = NoamLrSchedulerConfig::new(initial_lr.unwrap_or(base_lr))
                .with_warmup_steps(warmup_steps.unwrap_or(fallback_iters).max(1))
                .with_model_size(model_size.unwrap_or(model_config.n_embd).max(1))
                .init()
                .map_err(|err| anyhow!("failed to initialize noam lr scheduler: {err}"))?;
            ResolvedLrScheduler::Noam(scheduler)
        }
    };

    Ok(schedule)
}
