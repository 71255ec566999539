use serde::{Deserialize, Serialize};

use crate::generation::NucleusPolicy;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TrainingHyperparameters {
    /// Fixed (padded) sequence length of every batch.
    pub block_size: usize,
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Total step budget across all epochs.
    pub max_iters: usize,
    #[serde(default)]
    pub validate_every: usize,
    #[serde(default)]
    pub save_checkpoint_every: usize,
    #[serde(default = "default_log_frequency")]
    pub log_frequency: usize,
    #[serde(default = "default_true")]
    pub log_parameters: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub samples: SampleLoggingConfig,
}

/// Greedy-decoded samples logged after every validation pass.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SampleLoggingConfig {
    pub count: usize,
    pub prefix_len: usize,
    pub max_len: usize,
}

impl Default for SampleLoggingConfig {
    fn default() -> Self {
        Self {
            count: 10,
            prefix_len: 7,
            max_len: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GenerationConfig {
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_generation_batch")]
    pub batch_size: usize,
    pub max_len: usize,
    #[serde(default)]
    pub strategy: DecodeStrategyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecodeStrategyConfig {
    #[default]
    Argmax,
    Nucleus {
        #[serde(default = "default_nucleus")]
        nucleus: f32,
        #[serde(default)]
        policy: NucleusPolicy,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct ModelOverrides {
    pub n_embd: Option<usize>,
    pub dropout: Option<f64>,
}

fn default_epochs() -> usize {
    1
}

fn default_log_frequency() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_seed() -> u64 {
    1337
}

fn default_generation_batch() -> usize {
    1
}

fn default_nucleus() -> f32 {
    0.9
}
