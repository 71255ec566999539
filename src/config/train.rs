use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use toml::Value;

use super::core::{GenerationConfig, ModelOverrides, TrainingHyperparameters};
use crate::tokenizer::TokenizerConfig;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TrainingConfig {
    pub dataset: DatasetConfig,
    pub training: TrainingHyperparameters,
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub tracking: TrackingConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DatasetConfig {
    /// Plain-text corpus, one training sequence per non-empty line.
    pub path: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_train_split_ratio")]
    pub train_split_ratio: f32,
    /// Seed for per-epoch shuffling of the training split. `None` keeps corpus order.
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default)]
    pub lr_schedule: Option<LearningRateScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LearningRateScheduleConfig {
    Constant {
        #[serde(default)]
        initial_lr: Option<f64>,
    },
    Cosine {
        #[serde(default)]
        initial_lr: Option<f64>,
        #[serde(default)]
        min_lr: Option<f64>,
        #[serde(default)]
        num_iters: Option<usize>,
    },
    Linear {
        #[serde(default)]
        initial_lr: Option<f64>,
        final_lr: f64,
        #[serde(default)]
        num_iters: Option<usize>,
    },
    Noam {
        #[serde(default)]
        initial_lr: Option<f64>,
        #[serde(default)]
        warmup_steps: Option<usize>,
        #[serde(default)]
        model_size: Option<usize>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TrackingConfig {
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(default = "default_sinks")]
    pub sinks: Vec<SinkKind>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            run_dir: default_run_dir(),
            sinks: default_sinks(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Jsonl,
    Console,
}

/// Load and merge configuration files in order; later files override earlier ones.
pub fn load_training_config(paths: &[PathBuf]) -> Result<TrainingConfig> {
    if paths.is_empty() {
        return Err(anyhow!("at least one configuration file is required"));
    }

    let mut merged = Value::Table(Default::default());
    for path in paths {
        let layer = read_layer(path)?;
        merge_values(&mut merged, layer);
    }

    let config: TrainingConfig = merged
        .try_into()
        .context("failed to deserialize merged training configuration")?;
    validate(&config)?;
    Ok(config)
}

/// Parse a configuration from a single TOML document.
pub fn parse_training_config(text: &str) -> Result<TrainingConfig> {
    let config: TrainingConfig = toml::from_str(text).context("failed to parse configuration")?;
    validate(&config)?;
    Ok(config)
}

fn read_layer(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    text.parse::<Value>()
        .with_context(|| format!("failed to parse config {}", path.display()))
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn validate(config: &TrainingConfig) -> Result<()> {
    let training = &config.training;
    if training.block_size < 2 {
        return Err(anyhow!(
            "training.block_size must be at least 2, got {}",
            training.block_size
        ));
    }
    if training.batch_size == 0 {
        return Err(anyhow!("training.batch_size must be positive"));
    }
    if !(0.0..=1.0).contains(&config.dataset.train_split_ratio) {
        return Err(anyhow!(
            "dataset.train_split_ratio must lie in [0, 1], got {}",
            config.dataset.train_split_ratio
        ));
    }
    if let super::DecodeStrategyConfig::Nucleus { nucleus, .. } = &config.generation.strategy
        && !(*nucleus > 0.0 && *nucleus < 1.0)
    {
        return Err(anyhow!(
            "generation.strategy.nucleus must lie in (0, 1), got {nucleus}"
        ));
    }
    Ok(())
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_train_split_ratio() -> f32 {
    0.9
}

fn default_project() -> String {
    "tiny-lm".to_string()
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_sinks() -> Vec<SinkKind> {
    vec![SinkKind::Jsonl, SinkKind::Console]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecodeStrategyConfig;
    use crate::generation::NucleusPolicy;
    use tempfile::tempdir;

    const BASE: &str = r#"
[dataset]
path = "corpus.txt"

[training]
block_size = 16
batch_size = 4
max_iters = 100
validate_every = 10

[optimizer]
learning_rate = 1e-3

[generation]
max_len = 20
"#;

    #[test]
    fn later_files_override_earlier_ones() {
        let dir = tempdir().expect("tempdir");
        let base = dir.path().join("base.toml");
        let small = dir.path().join("small.toml");
        fs::write(&base, BASE).expect("write base");
        fs::write(
            &small,
            r#"
[training]
batch_size = 2

[generation.strategy]
type = "nucleus"
nucleus = 0.8
policy = "shared_legacy"
"#,
        )
        .expect("write override");

        let config = load_training_config(&[base, small]).expect("load config");
        assert_eq!(config.training.batch_size, 2);
        assert_eq!(config.training.block_size, 16);
        assert_eq!(config.training.validate_every, 10);
        assert_eq!(config.training.log_frequency, 50);
        assert_eq!(
            config.generation.strategy,
            DecodeStrategyConfig::Nucleus {
                nucleus: 0.8,
                policy: NucleusPolicy::SharedLegacy,
            }
        );
        assert_eq!(config.tracking.sinks, vec![SinkKind::Jsonl, SinkKind::Console]);
    }

    #[test]
    fn rejects_nucleus_outside_unit_interval() {
        let text = format!("{BASE}\n[generation.strategy]\ntype = \"nucleus\"\nnucleus = 1.0\n");
        assert!(parse_training_config(&text).is_err());
    }

    #[test]
    fn rejects_degenerate_block_size() {
        let text = BASE.replace("block_size = 16", "block_size = 1");
        assert!(parse_training_config(&text).is_err());
    }
}
