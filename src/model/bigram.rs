use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use super::LanguageModel;
use super::config::BigramConfig;

/// Reference next-token model: each position's logits depend only on its own token.
#[derive(Module, Debug)]
pub struct BigramLm<B: Backend> {
    vocab_size: usize,
    embed: Embedding<B>,
    dropout: Dropout,
    lm_head: Linear<B>,
}

impl<B: Backend> BigramLm<B> {
    pub fn new(config: BigramConfig, device: &B::Device) -> Self {
        Self {
            vocab_size: config.vocab_size,
            embed: EmbeddingConfig::new(config.vocab_size, config.n_embd).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            lm_head: LinearConfig::new(config.n_embd, config.vocab_size).init(device),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

impl<B: Backend> LanguageModel<B> for BigramLm<B> {
    fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let hidden = self.dropout.forward(self.embed.forward(tokens));
        self.lm_head.forward(hidden)
    }
}
