pub mod char_vocab;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use char_vocab::CharVocab;
use serde::{Deserialize, Serialize};

pub const PAD_TOKEN: &str = "[PAD]";
pub const BOS_TOKEN: &str = "[BOS]";
pub const EOS_TOKEN: &str = "[EOS]";
pub const UNK_TOKEN: &str = "[UNK]";

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Vec<u32>;
    fn decode(&self, ids: &[u32]) -> String;
    /// Map a symbolic token (`[BOS]`, `[EOS]`, ...) or a plain token string to its id.
    fn token_to_id(&self, token: &str) -> Option<u32>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
    fn as_any(&self) -> &dyn std::any::Any;

    fn bos_id(&self) -> Option<u32> {
        self.token_to_id(BOS_TOKEN)
    }

    fn eos_id(&self) -> Option<u32> {
        self.token_to_id(EOS_TOKEN)
    }

    fn pad_id(&self) -> Option<u32> {
        self.token_to_id(PAD_TOKEN)
    }
}

pub type SharedTokenizer = Arc<dyn Tokenizer>;

/// Resolve a symbolic token that the harness cannot work without.
pub fn require_token(tokenizer: &dyn Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("tokenizer has no id for {token}"))
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TokenizerConfig {
    #[serde(default)]
    pub vocab_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub include_unknown: bool,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            vocab_path: None,
            include_unknown: true,
        }
    }
}

impl TokenizerConfig {
    pub fn storage_path(&self, cache_dir: &Path) -> PathBuf {
        match &self.vocab_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => cache_dir.join(path),
            None => cache_dir.join("vocab.json"),
        }
    }

    pub fn load(&self, path: &Path) -> Result<SharedTokenizer> {
        let vocab = CharVocab::load(path)?;
        Ok(Arc::new(vocab) as SharedTokenizer)
    }

    pub fn fit<'a, I>(&self, texts: I) -> Result<SharedTokenizer>
    where
        I: Iterator<Item = &'a str>,
    {
        let vocab = CharVocab::fit(texts, self.include_unknown)?;
        Ok(Arc::new(vocab) as SharedTokenizer)
    }

    pub fn save(&self, tokenizer: &dyn Tokenizer, path: &Path) -> Result<()> {
        let vocab = tokenizer
            .as_any()
            .downcast_ref::<CharVocab>()
            .ok_or_else(|| anyhow!("expected char tokenizer"))?;
        vocab.save(path)
    }

    /// Load the persisted vocabulary if present, otherwise fit one on `texts` and persist it.
    pub fn load_or_fit<'a, I>(&self, cache_dir: &Path, texts: I) -> Result<SharedTokenizer>
    where
        I: Iterator<Item = &'a str>,
    {
        let path = self.storage_path(cache_dir);
        if path.is_file() {
            return self.load(&path);
        }
        let tokenizer = self.fit(texts)?;
        self.save(&*tokenizer, &path)?;
        Ok(tokenizer)
    }

    pub fn validate_corpus(&self, tokenizer: &dyn Tokenizer, text: &str) -> Result<()> {
        if self.include_unknown {
            return Ok(());
        }
        let vocab = tokenizer
            .as_any()
            .downcast_ref::<CharVocab>()
            .ok_or_else(|| anyhow!("expected char tokenizer"))?;
        match text
            .chars()
            .filter(|ch| *ch != '\n' && *ch != '\r')
            .find(|ch| !vocab.contains(*ch))
        {
            Some(ch) => Err(anyhow!(
                "vocabulary missing character {ch:?} found in dataset"
            )),
            None => Ok(()),
        }
    }
}

fn default_true() -> bool {
    true
}
