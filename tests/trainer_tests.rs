use std::sync::Arc;

use burn::data::dataloader::DataLoader;
use burn::module::AutodiffModule;
use burn::optim::AdamWConfig;
use burn::tensor::backend::{AutodiffBackend, Backend as BackendTrait};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use tempfile::{TempDir, tempdir};

use burn_tiny_lm::tokenizer::TokenizerConfig;
use burn_tiny_lm::tracking::MetricValue;
use burn_tiny_lm::trainer::{
    ARGMAX_TEXTS, LEARNING_RATE, TRAINING_LOSS, TRAINING_PERPLEXITY, TrainLoader, VALIDATION_LOSS,
    VALIDATION_PERPLEXITY, ValidLoader, evaluate,
};
use burn_tiny_lm::{
    BigramConfig, BigramLm, CheckpointStore, DatasetSplit, MemorySink, PaddedBatchLoader, RunInfo,
    SampleLoggingConfig, TextCorpus, Trainer, TrainerEnvironment, TrainerSettings,
};

type Backend = Autodiff<NdArray<f32>>;
type InnerBackend = <Backend as AutodiffBackend>::InnerBackend;

const TEXT: &str = "\
the cat sat on the mat
the dog sat on the log
a cat and a dog
the mat and the log
on the mat sat a cat
on the log sat a dog
the cat ran
the dog ran
";

fn settings(validate_every: usize, save_every: usize, log_frequency: usize) -> TrainerSettings {
    TrainerSettings {
        epochs: 3,
        max_iters: 5,
        validate_every,
        save_checkpoint_every: save_every,
        log_frequency,
        log_parameters: true,
        samples: SampleLoggingConfig {
            count: 2,
            prefix_len: 3,
            max_len: 8,
        },
    }
}

struct Fixture {
    dir: TempDir,
    corpus: TextCorpus,
    device: <Backend as BackendTrait>::Device,
}

impl Fixture {
    fn new() -> Self {
        let tokenizer_cfg = TokenizerConfig::default();
        let tokenizer = tokenizer_cfg.fit(std::iter::once(TEXT)).expect("fit vocab");
        let corpus =
            TextCorpus::from_text(TEXT, tokenizer, &tokenizer_cfg, 16, 0.75).expect("corpus");
        let device = <Backend as BackendTrait>::Device::default();
        <Backend as BackendTrait>::seed(&device, 42);
        Self {
            dir: tempdir().expect("tempdir"),
            corpus,
            device,
        }
    }

    fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.dir.path().join("checkpoint"))
    }

    fn run_info(&self) -> RunInfo {
        RunInfo {
            project: "tiny-lm-test".into(),
            run_dir: self.dir.path().to_path_buf(),
            config: serde_json::Value::Null,
        }
    }

    fn environment(&self, settings: TrainerSettings) -> TrainerEnvironment<Backend> {
        let train_loader = self
            .corpus
            .loader::<Backend>(DatasetSplit::Train, 2, &self.device)
            .expect("train loader");
        let valid_loader = self
            .corpus
            .loader::<<Backend as AutodiffBackend>::InnerBackend>(
                DatasetSplit::Val,
                2,
                &self.device,
            )
            .expect("valid loader");
        TrainerEnvironment {
            tokenizer: self.corpus.tokenizer(),
            train_loader: Arc::new(train_loader) as TrainLoader<Backend>,
            valid_loader: Arc::new(valid_loader) as ValidLoader<Backend>,
            checkpoints: self.checkpoints(),
            settings,
        }
    }

    fn model(&self) -> BigramLm<Backend> {
        BigramLm::new(
            BigramConfig {
                n_embd: 16,
                dropout: 0.0,
                vocab_size: self.corpus.tokenizer().len(),
            },
            &self.device,
        )
    }
}

#[test]
fn training_run_follows_cadences() {
    let fixture = Fixture::new();
    let optimizer = AdamWConfig::new().init::<Backend, BigramLm<Backend>>();
    let mut trainer = Trainer::new(
        fixture.model(),
        optimizer,
        1e-2,
        fixture.environment(settings(2, 4, 2)),
    );
    let mut sink = MemorySink::default();

    let summary = trainer
        .train(&mut sink, &fixture.run_info())
        .expect("training run");

    // 6 training sequences in batches of 2: the 5-step budget spans two epochs.
    assert_eq!(summary.steps, 5);
    assert_eq!(summary.epochs_started, 2);
    assert_eq!(summary.checkpoints, vec![0, 4]);
    assert!(sink.started && sink.finished);

    let steps = |name: &str| -> Vec<usize> {
        sink.scalars(name).into_iter().map(|(step, _)| step).collect()
    };
    assert_eq!(steps(TRAINING_LOSS), vec![0, 2, 4]);
    assert_eq!(steps(TRAINING_PERPLEXITY), vec![0, 2, 4]);
    assert_eq!(steps(VALIDATION_LOSS), vec![0, 2, 4]);
    assert_eq!(steps(VALIDATION_PERPLEXITY), vec![0, 2, 4]);
    assert!(
        sink.scalars(LEARNING_RATE)
            .iter()
            .all(|(_, lr)| (*lr - 1e-2).abs() < 1e-12)
    );

    for (step, loss) in sink.scalars(TRAINING_LOSS) {
        assert!(loss.is_finite() && loss > 0.0, "step {step} loss {loss}");
    }
    for ((_, loss), (_, ppl)) in sink
        .scalars(VALIDATION_LOSS)
        .into_iter()
        .zip(sink.scalars(VALIDATION_PERPLEXITY))
    {
        assert!(ppl >= 1.0 && loss >= 0.0);
    }

    let tables: Vec<_> = sink.named(ARGMAX_TEXTS).collect();
    assert_eq!(tables.len(), 3);
    for table in tables {
        match &table.value {
            MetricValue::Table { columns, rows } => {
                assert_eq!(columns, &vec!["Texts".to_string()]);
                assert_eq!(rows.len(), 2);
            }
            other => panic!("unexpected sample value {other:?}"),
        }
    }

    // embedding weight, head weight and head bias at each logging step
    let parameter_dumps = sink
        .records
        .iter()
        .filter(|record| record.name.starts_with("Model Parameter "))
        .count();
    assert_eq!(parameter_dumps, 9);

    let store = fixture.checkpoints();
    assert_eq!(store.steps().expect("steps"), vec![0, 4]);
    assert!(store.path_for(4).is_file());
}

#[test]
fn zero_cadences_disable_side_activities() {
    let fixture = Fixture::new();
    let optimizer = AdamWConfig::new().init::<Backend, BigramLm<Backend>>();
    let mut trainer = Trainer::new(
        fixture.model(),
        optimizer,
        1e-2,
        fixture.environment(settings(0, 0, 0)),
    );
    let mut sink = MemorySink::default();

    let summary = trainer
        .train(&mut sink, &fixture.run_info())
        .expect("training run");

    assert_eq!(summary.steps, 5);
    assert!(summary.checkpoints.is_empty());
    assert!(summary.last_validation.is_none());
    assert!(sink.records.is_empty());
    assert_eq!(fixture.checkpoints().latest_step().expect("latest"), None);
}

#[test]
fn repeated_steps_reduce_training_loss() {
    let fixture = Fixture::new();
    let env = fixture.environment(settings(0, 0, 0));
    let batch = env.train_loader.iter().next().expect("first batch");
    let optimizer = AdamWConfig::new().init::<Backend, BigramLm<Backend>>();
    let mut trainer = Trainer::new(fixture.model(), optimizer, 5e-2, env);

    let first = trainer.step(batch.clone());
    let mut last = first;
    for _ in 0..30 {
        last = trainer.step(batch.clone());
    }

    assert_eq!(first.learning_rate, Some(5e-2));
    assert!(
        last.loss < first.loss,
        "loss did not decrease: {} -> {}",
        first.loss,
        last.loss
    );
}

#[test]
fn validation_aggregates_whole_split() {
    let fixture = Fixture::new();
    let optimizer = AdamWConfig::new().init::<Backend, BigramLm<Backend>>();
    let trainer = Trainer::new(
        fixture.model(),
        optimizer,
        1e-2,
        fixture.environment(settings(1, 0, 0)),
    );

    let validation = trainer.validate();
    assert_eq!(validation.samples, 2);
    assert_eq!(validation.batches, 1);
    assert!(validation.loss.is_finite());
    assert!((validation.perplexity - validation.loss.exp()).abs() < 1e-3);

    let mut sink = MemorySink::default();
    let texts = trainer.log_predictions(7, 5, &mut sink).expect("samples");
    assert_eq!(texts.len(), 2);
    assert_eq!(sink.named(ARGMAX_TEXTS).count(), 1);
    assert_eq!(sink.records[0].step, 7);
}

#[test]
fn validation_weights_batch_losses_by_rows() {
    let fixture = Fixture::new();
    // three rows in batches of two leave a short last batch
    let valid_loader = || {
        PaddedBatchLoader::<InnerBackend>::new(
            fixture.corpus.split(DatasetSplit::Train)[..3].to_vec(),
            fixture.corpus.block_size(),
            2,
            fixture.corpus.pad_id().expect("pad id"),
            &fixture.device,
        )
    };
    let mut env = fixture.environment(settings(1, 0, 0));
    env.valid_loader = Arc::new(valid_loader()) as ValidLoader<Backend>;
    let optimizer = AdamWConfig::new().init::<Backend, BigramLm<Backend>>();
    let trainer = Trainer::new(fixture.model(), optimizer, 1e-2, env);

    let validation = trainer.validate();
    assert_eq!(validation.samples, 3);
    assert_eq!(validation.batches, 2);

    let model = trainer.model().valid();
    let per_batch: Vec<(usize, f64, f64)> = valid_loader()
        .iter()
        .map(|batch| {
            let rows = batch.batch_size();
            let output = evaluate(&model, batch);
            (rows, output.loss, output.perplexity)
        })
        .collect();
    assert_eq!(
        per_batch.iter().map(|(rows, _, _)| *rows).collect::<Vec<_>>(),
        vec![2, 1]
    );
    assert_ne!(per_batch[0].1, per_batch[1].1);

    let weighted_loss = per_batch
        .iter()
        .map(|(rows, loss, _)| loss * *rows as f64)
        .sum::<f64>()
        / 3.0;
    let mean_perplexity = per_batch.iter().map(|(_, _, ppl)| ppl).sum::<f64>() / 2.0;
    assert!(
        (validation.loss - weighted_loss).abs() < 1e-9,
        "validation loss {} vs row-weighted {weighted_loss}",
        validation.loss
    );
    assert!((validation.perplexity - mean_perplexity).abs() < 1e-9);
}

#[test]
fn trained_model_matches_last_checkpoint() {
    let fixture = Fixture::new();
    let optimizer = AdamWConfig::new().init::<Backend, BigramLm<Backend>>();
    let mut trainer = Trainer::new(
        fixture.model(),
        optimizer,
        1e-2,
        fixture.environment(settings(0, 4, 0)),
    );
    let mut sink = MemorySink::default();
    let summary = trainer
        .train(&mut sink, &fixture.run_info())
        .expect("training run");
    assert_eq!(summary.checkpoints.last().copied(), Some(4));
    assert_eq!(summary.steps, 5);

    let trained = trainer.into_model().valid();
    let restored = fixture
        .checkpoints()
        .load(fixture.model(), 4, &fixture.device)
        .expect("load checkpoint")
        .valid();
    let untrained = fixture.model().valid();

    let batch = || {
        fixture
            .corpus
            .loader::<InnerBackend>(DatasetSplit::Val, 2, &fixture.device)
            .expect("valid loader")
            .iter()
            .next()
            .expect("validation batch")
    };
    let trained_loss = evaluate(&trained, batch()).loss;
    assert!((evaluate(&restored, batch()).loss - trained_loss).abs() < 1e-6);
    assert_ne!(evaluate(&untrained, batch()).loss, trained_loss);
}
