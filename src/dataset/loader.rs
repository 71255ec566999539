use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use burn::data::dataloader::{DataLoader, DataLoaderIterator, Progress};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Padded token sequences paired with their valid lengths.
#[derive(Clone, Debug)]
pub struct TokenBatch<B: Backend> {
    /// `[batch, block]` token ids, padded past each sequence's length.
    pub tokens: Tensor<B, 2, Int>,
    /// `[batch]` number of valid positions per row.
    pub lengths: Tensor<B, 1, Int>,
}

impl<B: Backend> TokenBatch<B> {
    pub fn new(tokens: Tensor<B, 2, Int>, lengths: Tensor<B, 1, Int>) -> Self {
        Self { tokens, lengths }
    }

    /// Pad (or truncate) every sequence to `block_size` using `pad_id`.
    pub fn from_sequences<S: AsRef<[u32]>>(
        sequences: &[S],
        block_size: usize,
        pad_id: u32,
        device: &B::Device,
    ) -> Self {
        let rows = sequences.len();
        let mut tokens = vec![pad_id as i64; rows * block_size];
        let mut lengths = Vec::with_capacity(rows);

        for (row, sequence) in sequences.iter().enumerate() {
            let sequence = sequence.as_ref();
            let len = sequence.len().min(block_size);
            let base = row * block_size;
            for (slot, &token) in tokens[base..base + len].iter_mut().zip(sequence) {
                *slot = token as i64;
            }
            lengths.push(len as i64);
        }

        let tokens =
            Tensor::<B, 2, Int>::from_data(TensorData::new(tokens, [rows, block_size]), device);
        let lengths = Tensor::<B, 1, Int>::from_data(TensorData::new(lengths, [rows]), device);
        Self::new(tokens, lengths)
    }

    pub fn batch_size(&self) -> usize {
        self.tokens.dims()[0]
    }

    pub fn block_size(&self) -> usize {
        self.tokens.dims()[1]
    }
}

/// Sequential loader over in-memory token sequences. The last batch of an epoch may be
/// smaller than `batch_size`.
pub struct PaddedBatchLoader<B: Backend> {
    sequences: Arc<Vec<Vec<u32>>>,
    block_size: usize,
    batch_size: usize,
    pad_id: u32,
    device: B::Device,
    shuffle_seed: Option<u64>,
    epoch: Arc<AtomicU64>,
}

impl<B: Backend> Clone for PaddedBatchLoader<B> {
    fn clone(&self) -> Self {
        Self {
            sequences: Arc::clone(&self.sequences),
            block_size: self.block_size,
            batch_size: self.batch_size,
            pad_id: self.pad_id,
            device: self.device.clone(),
            shuffle_seed: self.shuffle_seed,
            epoch: Arc::clone(&self.epoch),
        }
    }
}

impl<B: Backend> PaddedBatchLoader<B> {
    pub fn new(
        sequences: Vec<Vec<u32>>,
        block_size: usize,
        batch_size: usize,
        pad_id: u32,
        device: &B::Device,
    ) -> Self {
        Self {
            sequences: Arc::new(sequences),
            block_size: block_size.max(1),
            batch_size: batch_size.max(1),
            pad_id,
            device: device.clone(),
            shuffle_seed: None,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reshuffle the sequence order at the start of every pass, seeded per epoch.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn num_batches(&self) -> usize {
        self.sequences.len().div_ceil(self.batch_size)
    }

    fn epoch_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.sequences.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        order
    }

    fn with_sequences(&self, sequences: Vec<Vec<u32>>, device: &B::Device) -> Self {
        Self {
            sequences: Arc::new(sequences),
            block_size: self.block_size,
            batch_size: self.batch_size,
            pad_id: self.pad_id,
            device: device.clone(),
            shuffle_seed: self.shuffle_seed,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<B> DataLoader<B, TokenBatch<B>> for PaddedBatchLoader<B>
where
    B: Backend + 'static,
    B::Device: Clone,
{
    fn iter<'a>(&'a self) -> Box<dyn DataLoaderIterator<TokenBatch<B>> + 'a> {
        Box::new(PaddedBatchIterator {
            loader: self,
            order: self.epoch_order(),
            cursor: 0,
        })
    }

    fn num_items(&self) -> usize {
        self.sequences.len()
    }

    fn to_device(&self, device: &B::Device) -> Arc<dyn DataLoader<B, TokenBatch<B>>> {
        let mut loader = self.clone();
        loader.device = device.clone();
        Arc::new(loader)
    }

    fn slice(&self, start: usize, end: usize) -> Arc<dyn DataLoader<B, TokenBatch<B>>> {
        let end = end.min(self.sequences.len());
        let start = start.min(end);
        Arc::new(self.with_sequences(self.sequences[start..end].to_vec(), &self.device))
    }
}

struct PaddedBatchIterator<'a, B: Backend> {
    loader: &'a PaddedBatchLoader<B>,
    order: Vec<usize>,
    cursor: usize,
}

impl<B: Backend> Iterator for PaddedBatchIterator<'_, B> {
    type Item = TokenBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let rows: Vec<&[u32]> = self.order[self.cursor..end]
            .iter()
            .map(|&idx| self.loader.sequences[idx].as_slice())
            .collect();
        self.cursor = end;

        Some(TokenBatch::from_sequences(
            &rows,
            self.loader.block_size,
            self.loader.pad_id,
            &self.loader.device,
        ))
    }
}

impl<B: Backend> DataLoaderIterator<TokenBatch<B>> for PaddedBatchIterator<'_, B> {
    fn progress(&self) -> Progress {
        Progress::new(self.cursor, self.order.len())
    }
}
