mod bigram;
mod config;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

pub use bigram::BigramLm;
pub use config::{BigramConfig, build_model_config};

/// What the harness needs from a model: per-position vocabulary logits for a batch.
pub trait LanguageModel<B: Backend> {
    /// `[batch, time]` token ids to `[batch, time, vocab]` logits.
    fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3>;

    /// Forward pass that may exploit the valid length of each row.
    fn forward_with_lengths(
        &self,
        tokens: Tensor<B, 2, Int>,
        lengths: Tensor<B, 1, Int>,
    ) -> Tensor<B, 3> {
        let _ = lengths;
        self.forward(tokens)
    }

    /// `[batch, vocab]` logits for the token following `prefix`.
    fn next_token_logits(&self, prefix: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let logits = self.forward(prefix);
        let [batch, time, vocab] = logits.dims();
        logits.slice_dim(1, (time - 1)..time).reshape([batch, vocab])
    }
}
