use std::cmp::Ordering;

use anyhow::{Result, anyhow};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};

use crate::model::LanguageModel;
use crate::tokenizer::{BOS_TOKEN, EOS_TOKEN, Tokenizer, require_token};

/// How the nucleus decoder turns the per-row nucleus into the next token.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NucleusPolicy {
    /// Historical behavior, kept for reproducing old runs: the nucleus is pooled across
    /// the batch, a single token is shared by every row, and when more than one token
    /// qualifies it is drawn uniformly from the whole vocabulary. Generation stops as soon
    /// as no token's cumulative probability is below the threshold.
    SharedLegacy,
    /// Each row samples from its own nucleus, the smallest set of most likely tokens whose
    /// cumulative probability reaches the threshold, weighted by the renormalized
    /// probabilities.
    #[default]
    PerSequence,
}

#[derive(Clone, Copy, Debug)]
pub struct NucleusSettings {
    pub max_len: usize,
    pub nucleus: f32,
    pub policy: NucleusPolicy,
}

/// Greedy decoding: append the most likely next token until every row holds `max_len`
/// tokens, then append `[EOS]` unconditionally.
///
/// Without a prefix every row starts from a single `[BOS]`. Ties resolve to the lowest
/// token id. The result has shape `[batch_size, max(max_len, prefix_len) + 1]`.
pub fn generate_argmax<B: Backend, M: LanguageModel<B> + ?Sized>(
    model: &M,
    tokenizer: &dyn Tokenizer,
    device: &B::Device,
    batch_size: usize,
    prefix: Option<Tensor<B, 2, Int>>,
    max_len: usize,
) -> Result<Tensor<B, 2, Int>> {
    let eos = require_token(tokenizer, EOS_TOKEN)? as i64;
    let mut rows = initial_rows(tokenizer, batch_size, prefix)?;

    while current_len(&rows) < max_len {
        let logits = next_token_rows(model, &rows, device)?;
        for (row, logits) in rows.iter_mut().zip(logits.iter()) {
            row.push(argmax(logits) as i64);
        }
    }

    for row in rows.iter_mut() {
        row.push(eos);
    }
    Ok(rows_to_tensor(&rows, device))
}

/// Nucleus (top-p) sampling; see [`NucleusPolicy`] for the two selection rules.
///
/// The output never exceeds `max(max_len, prefix_len) + 1` tokens per row and always ends
/// with `[EOS]`.
pub fn generate_nucleus<B, M, R>(
    model: &M,
    tokenizer: &dyn Tokenizer,
    device: &B::Device,
    batch_size: usize,
    prefix: Option<Tensor<B, 2, Int>>,
    settings: NucleusSettings,
    rng: &mut R,
) -> Result<Tensor<B, 2, Int>>
where
    B: Backend,
    M: LanguageModel<B> + ?Sized,
    R: Rng,
{
    if !(settings.nucleus > 0.0 && settings.nucleus < 1.0) {
        return Err(anyhow!(
            "nucleus must lie in (0, 1), got {}",
            settings.nucleus
        ));
    }

    let eos = require_token(tokenizer, EOS_TOKEN)? as i64;
    let mut rows = initial_rows(tokenizer, batch_size, prefix)?;

    while current_len(&rows) < settings.max_len {
        let logits = next_token_rows(model, &rows, device)?;
        let probs: Vec<Vec<f32>> = logits.into_iter().map(|row| softmax(&row)).collect();

        match settings.policy {
            NucleusPolicy::SharedLegacy => {
                let Some(token) = shared_legacy_choice(&probs, settings.nucleus, rng) else {
                    break;
                };
                for row in rows.iter_mut() {
                    row.push(token as i64);
                }
            }
            NucleusPolicy::PerSequence => {
                for (row, row_probs) in rows.iter_mut().zip(probs.iter()) {
                    let token = per_sequence_choice(row_probs, settings.nucleus, rng)?;
                    row.push(token as i64);
                }
            }
        }
    }

    for row in rows.iter_mut() {
        row.push(eos);
    }
    Ok(rows_to_tensor(&rows, device))
}

/// Decode every row of a `[batch, len]` token tensor to text.
pub fn decode_rows<B: Backend>(
    tokenizer: &dyn Tokenizer,
    tokens: Tensor<B, 2, Int>,
) -> Result<Vec<String>> {
    Ok(tensor_to_rows(tokens)?
        .iter()
        .map(|row| {
            let ids: Vec<u32> = row
                .iter()
                .filter_map(|&tok| (tok >= 0).then_some(tok as u32))
                .collect();
            tokenizer.decode(&ids)
        })
        .collect())
}

pub fn tensor_to_rows<B: Backend>(tokens: Tensor<B, 2, Int>) -> Result<Vec<Vec<i64>>> {
    let [batch, len] = tokens.dims();
    let values = tokens
        .to_data()
        .convert::<i64>()
        .into_vec::<i64>()
        .map_err(|err| anyhow!("{err:?}"))?;
    if len == 0 {
        return Ok(vec![Vec::new(); batch]);
    }
    Ok(values.chunks(len).map(<[i64]>::to_vec).collect())
}

fn initial_rows<B: Backend>(
    tokenizer: &dyn Tokenizer,
    batch_size: usize,
    prefix: Option<Tensor<B, 2, Int>>,
) -> Result<Vec<Vec<i64>>> {
    if batch_size == 0 {
        return Err(anyhow!("batch size must be positive"));
    }
    match prefix {
        Some(prefix) => {
            let [rows, len] = prefix.dims();
            if rows != batch_size {
                return Err(anyhow!(
                    "prefix holds {rows} sequences but batch size is {batch_size}"
                ));
            }
            if len == 0 {
                return Err(anyhow!("prefix must contain at least one token"));
            }
            tensor_to_rows(prefix)
        }
        None => {
            let bos = require_token(tokenizer, BOS_TOKEN)? as i64;
            Ok(vec![vec![bos]; batch_size])
        }
    }
}

fn current_len(rows: &[Vec<i64>]) -> usize {
    rows.first().map(Vec::len).unwrap_or(0)
}

fn rows_to_tensor<B: Backend>(rows: &[Vec<i64>], device: &B::Device) -> Tensor<B, 2, Int> {
    let len = current_len(rows);
    let flat: Vec<i64> = rows.iter().flatten().copied().collect();
    Tensor::<B, 2, Int>::from_data(TensorData::new(flat, [rows.len(), len]), device)
}

fn next_token_rows<B: Backend, M: LanguageModel<B> + ?Sized>(
    model: &M,
    rows: &[Vec<i64>],
    device: &B::Device,
) -> Result<Vec<Vec<f32>>> {
    let logits = model.next_token_logits(rows_to_tensor(rows, device));
    let [_, vocab] = logits.dims();
    let values = logits
        .to_data()
        .convert::<f32>()
        .into_vec::<f32>()
        .map_err(|err| anyhow!("{err:?}"))?;
    Ok(values.chunks(vocab.max(1)).map(<[f32]>::to_vec).collect())
}

/// Index of the first maximum.
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (idx, value) in values.iter().enumerate().skip(1) {
        if *value > values[best] {
            best = idx;
        }
    }
    best
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|value| (value - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|value| value / sum).collect()
}

/// Token ids sorted by descending probability (stable, so ties keep the lower id first)
/// paired with their cumulative probability.
fn sorted_cumulative(probs: &[f32]) -> Vec<(usize, f32, f32)> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));

    let mut cumulative = 0.0f32;
    order
        .into_iter()
        .map(|idx| {
            cumulative += probs[idx];
            (idx, probs[idx], cumulative)
        })
        .collect()
}

fn shared_legacy_choice<R: Rng>(
    probs: &[Vec<f32>],
    nucleus: f32,
    rng: &mut R,
) -> Option<usize> {
    let qualifying: Vec<usize> = probs
        .iter()
        .flat_map(|row| {
            sorted_cumulative(row)
                .into_iter()
                .take_while(|&(_, _, cumulative)| cumulative < nucleus)
                .map(|(idx, _, _)| idx)
        })
        .collect();

    match qualifying.as_slice() {
        [] => None,
        [only] => Some(*only),
        _ => {
            let vocab = probs.first().map(Vec::len).unwrap_or(0);
            Some(rng.gen_range(0..vocab.max(1)))
        }
    }
}

fn per_sequence_choice<R: Rng>(probs: &[f32], nucleus: f32, rng: &mut R) -> Result<usize> {
    let ranked = sorted_cumulative(probs);
    let cutoff = ranked
        .iter()
        .position(|&(_, _, cumulative)| cumulative >= nucleus)
        .map(|pos| pos + 1)
        .unwrap_or(ranked.len());
    let candidates = &ranked[..cutoff];

    let weights: Vec<f32> = candidates.iter().map(|&(_, prob, _)| prob).collect();
    let dist = WeightedIndex::new(&weights).map_err(|err| anyhow!(err.to_string()))?;
    Ok(candidates[dist.sample(rng)].0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[3.0]), 0);
    }

    #[test]
    fn per_sequence_nucleus_includes_token_crossing_threshold() {
        let probs = [0.05, 0.5, 0.3, 0.15];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..64 {
            let token = per_sequence_choice(&probs, 0.7, &mut rng).expect("sample");
            assert!(token == 1 || token == 2, "sampled {token} outside nucleus");
        }
    }

    #[test]
    fn per_sequence_nucleus_keeps_top_token_for_small_threshold() {
        let probs = [0.1, 0.8, 0.1];
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(per_sequence_choice(&probs, 0.05, &mut rng).expect("sample"), 1);
    }

    #[test]
    fn legacy_nucleus_stops_when_top_token_exceeds_threshold() {
        let probs = vec![vec![0.9, 0.05, 0.05], vec![0.95, 0.03, 0.02]];
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(shared_legacy_choice(&probs, 0.5, &mut rng), None);
    }

    #[test]
    fn legacy_nucleus_returns_single_qualifying_token() {
        let probs = vec![vec![0.1, 0.6, 0.3], vec![0.9, 0.05, 0.05]];
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(shared_legacy_choice(&probs, 0.65, &mut rng), Some(1));
    }
}
