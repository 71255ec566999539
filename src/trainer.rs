//! Step-budgeted training loop with validation, checkpoint and logging cadences.

use std::sync::Arc;

use anyhow::Result;
use burn::data::dataloader::DataLoader;
use burn::lr_scheduler::LrScheduler;
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::ElementConversion;
use burn::tensor::backend::{AutodiffBackend, Backend};
use tracing::{debug, info};

use crate::checkpoint::CheckpointStore;
use crate::config::{SampleLoggingConfig, TrainingHyperparameters};
use crate::dataset::TokenBatch;
use crate::generation::{decode_rows, generate_argmax};
use crate::model::LanguageModel;
use crate::objective::masked_objective;
use crate::tokenizer::SharedTokenizer;
use crate::tracking::{MetricRecord, MetricSink, RunInfo, collect_parameters};

pub const TRAINING_LOSS: &str = "Training Loss";
pub const TRAINING_PERPLEXITY: &str = "Training Perplexity";
pub const LEARNING_RATE: &str = "Learning Rate";
pub const VALIDATION_LOSS: &str = "Validation Loss";
pub const VALIDATION_PERPLEXITY: &str = "Validation Perplexity";
pub const ARGMAX_TEXTS: &str = "Argmax Texts";

/// Cadences and budgets of one run. A cadence of 0 disables the activity.
#[derive(Clone, Debug)]
pub struct TrainerSettings {
    pub epochs: usize,
    pub max_iters: usize,
    pub validate_every: usize,
    pub save_checkpoint_every: usize,
    pub log_frequency: usize,
    pub log_parameters: bool,
    pub samples: SampleLoggingConfig,
}

impl From<&TrainingHyperparameters> for TrainerSettings {
    fn from(training: &TrainingHyperparameters) -> Self {
        Self {
            epochs: training.epochs,
            max_iters: training.max_iters,
            validate_every: training.validate_every,
            save_checkpoint_every: training.save_checkpoint_every,
            log_frequency: training.log_frequency,
            log_parameters: training.log_parameters,
            samples: training.samples.clone(),
        }
    }
}

pub type TrainLoader<B> = Arc<dyn DataLoader<B, TokenBatch<B>>>;
pub type ValidLoader<B> =
    Arc<dyn DataLoader<<B as AutodiffBackend>::InnerBackend, TokenBatch<<B as AutodiffBackend>::InnerBackend>>>;

/// Everything the trainer needs besides the model, optimizer and schedule.
pub struct TrainerEnvironment<B: AutodiffBackend> {
    pub tokenizer: SharedTokenizer,
    pub train_loader: TrainLoader<B>,
    pub valid_loader: ValidLoader<B>,
    pub checkpoints: CheckpointStore,
    pub settings: TrainerSettings,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepOutput {
    pub loss: f64,
    pub perplexity: f64,
    /// Learning rate applied by the optimizer; `None` for evaluation steps.
    pub learning_rate: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValidationOutput {
    /// Batch losses weighted by batch size.
    pub loss: f64,
    /// Mean of the batch perplexities.
    pub perplexity: f64,
    pub samples: usize,
    pub batches: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingSummary {
    pub steps: usize,
    pub epochs_started: usize,
    pub last_train: Option<StepOutput>,
    pub last_validation: Option<ValidationOutput>,
    pub checkpoints: Vec<usize>,
}

pub struct Trainer<B, M, O, S>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + LanguageModel<B>,
    M::InnerModule: LanguageModel<B::InnerBackend>,
    O: Optimizer<M, B>,
    S: LrScheduler,
{
    model: M,
    optimizer: O,
    scheduler: S,
    tokenizer: SharedTokenizer,
    train_loader: TrainLoader<B>,
    valid_loader: ValidLoader<B>,
    checkpoints: CheckpointStore,
    settings: TrainerSettings,
}

impl<B, M, O, S> Trainer<B, M, O, S>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + LanguageModel<B>,
    M::InnerModule: LanguageModel<B::InnerBackend>,
    O: Optimizer<M, B>,
    S: LrScheduler,
{
    pub fn new(model: M, optimizer: O, scheduler: S, env: TrainerEnvironment<B>) -> Self {
        Self {
            model,
            optimizer,
            scheduler,
            tokenizer: env.tokenizer,
            train_loader: env.train_loader,
            valid_loader: env.valid_loader,
            checkpoints: env.checkpoints,
            settings: env.settings,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// One training step: forward, masked objective, backward, optimizer update.
    pub fn step(&mut self, batch: TokenBatch<B>) -> StepOutput {
        let logits = self
            .model
            .forward_with_lengths(batch.tokens.clone(), batch.lengths.clone());
        let objective = masked_objective(logits, batch.tokens, batch.lengths);

        let loss = objective.loss.clone().into_scalar().elem::<f64>();
        let perplexity = objective.perplexity.into_scalar().elem::<f64>();

        let grads = objective.loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        let lr = self.scheduler.step();
        self.model = self.optimizer.step(lr, self.model.clone(), grads);

        StepOutput {
            loss,
            perplexity,
            learning_rate: Some(lr),
        }
    }

    /// Full pass over the validation loader with the non-autodiff model.
    pub fn validate(&self) -> ValidationOutput {
        let model = self.model.valid();
        let mut loss_sum = 0.0;
        let mut perplexity_sum = 0.0;
        let mut samples = 0;
        let mut batches = 0;

        for batch in self.valid_loader.iter() {
            let rows = batch.batch_size();
            let output = evaluate(&model, batch);
            loss_sum += output.loss * rows as f64;
            perplexity_sum += output.perplexity;
            samples += rows;
            batches += 1;
        }

        ValidationOutput {
            loss: loss_sum / samples as f64,
            perplexity: perplexity_sum / batches as f64,
            samples,
            batches,
        }
    }

    /// Greedy-decode continuations of the first `num` validation rows and log them as a
    /// text table.
    pub fn log_predictions(
        &self,
        step: usize,
        num: usize,
        sink: &mut dyn MetricSink,
    ) -> Result<Vec<String>> {
        let Some(batch) = self.valid_loader.iter().next() else {
            return Ok(Vec::new());
        };
        let [rows, cols] = batch.tokens.dims();
        let num = num.min(rows);
        if num == 0 {
            return Ok(Vec::new());
        }
        let prefix_len = self.settings.samples.prefix_len.clamp(1, cols);
        let prefix = batch.tokens.slice([0..num, 0..prefix_len]);
        let device = prefix.device();

        let model = self.model.valid();
        let tokens = generate_argmax(
            &model,
            &*self.tokenizer,
            &device,
            num,
            Some(prefix),
            self.settings.samples.max_len,
        )?;
        let texts = decode_rows(&*self.tokenizer, tokens)?;

        sink.record(&MetricRecord::text_column(step, ARGMAX_TEXTS, "Texts", &texts))?;
        Ok(texts)
    }

    /// Run epochs until the step budget is spent. Every cadence fires on step 0.
    pub fn train(&mut self, sink: &mut dyn MetricSink, run: &RunInfo) -> Result<TrainingSummary> {
        sink.start(run)?;
        let mut summary = TrainingSummary::default();
        let mut step = 0;

        'epochs: for epoch in 0..self.settings.epochs {
            if step >= self.settings.max_iters {
                break;
            }
            summary.epochs_started += 1;
            info!("epoch {}/{}", epoch + 1, self.settings.epochs);

            let loader = self.train_loader.clone();
            for batch in loader.iter() {
                if step >= self.settings.max_iters {
                    break 'epochs;
                }

                let output = self.step(batch);
                summary.last_train = Some(output);

                if is_due(step, self.settings.validate_every) {
                    let validation = self.validate();
                    info!(
                        "step {step}: validation loss {:.4}, perplexity {:.4}",
                        validation.loss, validation.perplexity
                    );
                    sink.record(&MetricRecord::scalar(step, VALIDATION_LOSS, validation.loss))?;
                    sink.record(&MetricRecord::scalar(
                        step,
                        VALIDATION_PERPLEXITY,
                        validation.perplexity,
                    ))?;
                    self.log_predictions(step, self.settings.samples.count, sink)?;
                    summary.last_validation = Some(validation);
                }

                if is_due(step, self.settings.save_checkpoint_every) {
                    let path = self.checkpoints.save(&self.model, step)?;
                    info!("saved checkpoint {}", path.display());
                    summary.checkpoints.push(step);
                }

                if is_due(step, self.settings.log_frequency) {
                    self.log_training(step, output, sink)?;
                }

                step += 1;
            }
        }

        summary.steps = step;
        info!("training finished after {step} steps");
        sink.finish()?;
        Ok(summary)
    }

    fn log_training(&self, step: usize, output: StepOutput, sink: &mut dyn MetricSink) -> Result<()> {
        info!(
            "step {step}: loss {:.4}, perplexity {:.4}",
            output.loss, output.perplexity
        );
        sink.record(&MetricRecord::scalar(step, TRAINING_LOSS, output.loss))?;
        sink.record(&MetricRecord::scalar(
            step,
            TRAINING_PERPLEXITY,
            output.perplexity,
        ))?;
        if let Some(lr) = output.learning_rate {
            sink.record(&MetricRecord::scalar(step, LEARNING_RATE, lr))?;
        }

        if self.settings.log_parameters {
            let snapshots = collect_parameters(&self.model.valid())?;
            debug!("logging {} parameter tensors", snapshots.len());
            for snapshot in snapshots {
                sink.record(&MetricRecord::tensor(step, snapshot))?;
            }
        }
        Ok(())
    }
}

/// Masked objective of one batch without gradient tracking.
pub fn evaluate<B: Backend, M: LanguageModel<B>>(model: &M, batch: TokenBatch<B>) -> StepOutput {
    let logits = model.forward_with_lengths(batch.tokens.clone(), batch.lengths.clone());
    let objective = masked_objective(logits, batch.tokens, batch.lengths);
    StepOutput {
        loss: objective.loss.into_scalar().elem::<f64>(),
        perplexity: objective.perplexity.into_scalar().elem::<f64>(),
        learning_rate: None,
    }
}

fn is_due(step: usize, every: usize) -> bool {
    every > 0 && step % every == 0
}

#[cfg(test)]
mod tests {
    use super::is_due;

    #[test]
    fn cadence_fires_on_multiples_including_zero() {
        assert!(is_due(0, 5));
        assert!(!is_due(3, 5));
        assert!(is_due(10, 5));
    }

    #[test]
    fn zero_cadence_never_fires() {
        assert!(!is_due(0, 0));
        assert!(!is_due(7, 0));
    }
}
