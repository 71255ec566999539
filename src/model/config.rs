use crate::ModelOverrides;

#[derive(Clone, Debug, PartialEq)]
pub struct BigramConfig {
    pub n_embd: usize,
    pub dropout: f64,
    pub vocab_size: usize,
}

impl Default for BigramConfig {
    fn default() -> Self {
        Self {
            n_embd: 128,
            dropout: 0.1,
            vocab_size: 256,
        }
    }
}

/// Build a model configuration by applying configuration overrides.
pub fn build_model_config(overrides: &ModelOverrides, vocab_size: usize) -> BigramConfig {
    let mut model_config = BigramConfig {
        vocab_size,
        ..BigramConfig::default()
    };

    if let Some(n_embd) = overrides.n_embd {
        model_config.n_embd = n_embd.max(1);
    }
    if let Some(dropout) = overrides.dropout {
        model_config.dropout = dropout.clamp(0.0, 1.0);
    }

    model_config
}
