//! Length-masked next-token cross-entropy and perplexity.

use burn::tensor::backend::Backend;
use burn::tensor::{Bool, Int, Tensor, activation};

/// Scalar statistics of one batch. All tensors have shape `[1]`.
#[derive(Clone, Debug)]
pub struct MaskedObjective<B: Backend> {
    /// Mean negative log-likelihood over valid target positions.
    pub loss: Tensor<B, 1>,
    /// `exp(loss)`, detached from the autodiff graph.
    pub perplexity: Tensor<B, 1>,
    /// Number of valid target positions the loss was averaged over.
    pub valid_targets: Tensor<B, 1>,
}

/// `[batch, seq_len]` mask, true where `position < lengths[row]`.
pub fn validity_mask<B: Backend>(lengths: Tensor<B, 1, Int>, seq_len: usize) -> Tensor<B, 2, Bool> {
    let [batch] = lengths.dims();
    let device = lengths.device();
    let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &device)
        .unsqueeze::<2>()
        .expand([batch, seq_len]);
    let lengths = lengths.unsqueeze_dim::<2>(1).expand([batch, seq_len]);
    positions.lower(lengths)
}

/// Cross-entropy of the logits at positions `0..T-1` against the tokens at `1..T`,
/// restricted to target positions inside each row's valid length.
///
/// A batch without any valid target position divides by zero and yields NaN.
pub fn masked_objective<B: Backend>(
    logits: Tensor<B, 3>,
    tokens: Tensor<B, 2, Int>,
    lengths: Tensor<B, 1, Int>,
) -> MaskedObjective<B> {
    let [batch, seq_len, vocab] = logits.dims();
    let device = logits.device();
    let tokens = tokens.to_device(&device);
    let lengths = lengths.to_device(&device);

    let target_mask = validity_mask(lengths, seq_len)
        .slice([0..batch, 1..seq_len])
        .float();

    let predictions = logits.slice([0..batch, 0..seq_len - 1, 0..vocab]);
    let targets = tokens.slice([0..batch, 1..seq_len]);

    let log_probs = activation::log_softmax(predictions, 2);
    let nll = log_probs
        .gather(2, targets.unsqueeze_dim::<3>(2))
        .reshape([batch, seq_len - 1])
        .neg();

    let valid_targets = target_mask.clone().sum();
    let loss = (nll * target_mask).sum() / valid_targets.clone();
    let perplexity = loss.clone().detach().exp();

    MaskedObjective {
        loss,
        perplexity,
        valid_targets,
    }
}
