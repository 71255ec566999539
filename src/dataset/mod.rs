mod loader;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use burn::tensor::backend::Backend;

use crate::config::DatasetConfig;
use crate::tokenizer::{SharedTokenizer, Tokenizer, TokenizerConfig, require_token};

pub use loader::{PaddedBatchLoader, TokenBatch};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatasetSplit {
    Train,
    Val,
}

/// Line-oriented corpus: every non-empty line becomes one `[BOS] ... [EOS]` sequence,
/// truncated to the block size.
#[derive(Clone)]
pub struct TextCorpus {
    sequences: Vec<Vec<u32>>,
    train_len: usize,
    block_size: usize,
    train_split_ratio: f32,
    tokenizer: SharedTokenizer,
}

impl TextCorpus {
    /// Read the configured corpus, fitting (or reloading) the vocabulary in the cache
    /// directory.
    pub fn from_config(config: &DatasetConfig, block_size: usize) -> Result<Self> {
        let text = read_corpus(&config.path)?;
        fs::create_dir_all(&config.cache_dir).with_context(|| {
            format!(
                "failed to create cache directory {}",
                config.cache_dir.display()
            )
        })?;

        let tokenizer = config
            .tokenizer
            .load_or_fit(&config.cache_dir, std::iter::once(text.as_str()))?;
        Self::from_text(
            &text,
            tokenizer,
            &config.tokenizer,
            block_size,
            config.train_split_ratio,
        )
    }

    pub fn from_text(
        text: &str,
        tokenizer: SharedTokenizer,
        tokenizer_cfg: &TokenizerConfig,
        block_size: usize,
        train_split_ratio: f32,
    ) -> Result<Self> {
        tokenizer_cfg.validate_corpus(&*tokenizer, text)?;

        let sequences: Vec<Vec<u32>> = text
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let mut ids = tokenizer.encode(line, true, true);
                ids.truncate(block_size);
                ids
            })
            .collect();

        if sequences.is_empty() {
            return Err(anyhow!("corpus contains no non-empty lines"));
        }

        let split_ratio = train_split_ratio.clamp(0.0, 1.0);
        let train_len = ((sequences.len() as f32) * split_ratio) as usize;
        let train_len = train_len.clamp(1, sequences.len());

        Ok(Self {
            sequences,
            train_len,
            block_size,
            train_split_ratio: split_ratio,
            tokenizer,
        })
    }

    /// Sequences of the requested split. A split that would be empty falls back to the
    /// training sequences.
    pub fn split(&self, split: DatasetSplit) -> &[Vec<u32>] {
        match split {
            DatasetSplit::Train => &self.sequences[..self.train_len],
            DatasetSplit::Val if self.train_len < self.sequences.len() => {
                &self.sequences[self.train_len..]
            }
            DatasetSplit::Val => &self.sequences[..self.train_len],
        }
    }

    pub fn loader<B: Backend>(
        &self,
        split: DatasetSplit,
        batch_size: usize,
        device: &B::Device,
    ) -> Result<PaddedBatchLoader<B>> {
        let pad_id = self.pad_id()?;
        Ok(PaddedBatchLoader::new(
            self.split(split).to_vec(),
            self.block_size,
            batch_size,
            pad_id,
            device,
        ))
    }

    pub fn pad_id(&self) -> Result<u32> {
        require_token(&*self.tokenizer, crate::tokenizer::PAD_TOKEN)
    }

    pub fn tokenizer(&self) -> SharedTokenizer {
        self.tokenizer.clone()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn train_split_ratio(&self) -> f32 {
        self.train_split_ratio
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "corpus: {} sequences ({} train / {} val), block_size={}, vocab={}",
            self.len(),
            self.split(DatasetSplit::Train).len(),
            self.split(DatasetSplit::Val).len(),
            self.block_size,
            self.tokenizer.len()
        )
    }
}

fn read_corpus(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read corpus {}", path.display()))
}
