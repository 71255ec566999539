use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use super::{BOS_TOKEN, EOS_TOKEN, PAD_TOKEN, UNK_TOKEN};

const PAD_CHAR: char = '\u{0000}';
const BOS_CHAR: char = '\u{0001}';
const EOS_CHAR: char = '\u{0002}';
const UNK_CHAR: char = '\u{0003}';

/// Character-level vocabulary. Special tokens occupy the first ids, in the order
/// `[PAD]`, `[BOS]`, `[EOS]` and optionally `[UNK]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharVocab {
    id2ch: Vec<char>,
    ch2id: HashMap<char, u32>,
    bos: u32,
    eos: u32,
    pad: u32,
    unk: Option<u32>,
}

impl CharVocab {
    pub fn fit<'a, I>(texts: I, include_unknown: bool) -> Result<Self>
    where
        I: Iterator<Item = &'a str>,
    {
        let mut chars = IndexSet::new();
        chars.insert(PAD_CHAR);
        chars.insert(BOS_CHAR);
        chars.insert(EOS_CHAR);
        if include_unknown {
            chars.insert(UNK_CHAR);
        }

        for text in texts {
            chars.extend(text.chars().filter(|ch| *ch != '\n' && *ch != '\r'));
        }

        Self::from_chars(chars.into_iter().collect(), include_unknown)
    }

    fn from_chars(chars: Vec<char>, include_unknown: bool) -> Result<Self> {
        if chars.is_empty() {
            return Err(anyhow!("vocabulary cannot be empty"));
        }

        let mut id2ch = Vec::with_capacity(chars.len());
        let mut ch2id = HashMap::with_capacity(chars.len());

        for (idx, ch) in chars.into_iter().enumerate() {
            if ch2id.insert(ch, idx as u32).is_some() {
                return Err(anyhow!("duplicate character {ch:?}"));
            }
            id2ch.push(ch);
        }

        let special = |ch: char, name: &str| {
            ch2id
                .get(&ch)
                .copied()
                .ok_or_else(|| anyhow!("missing {name} character in vocabulary"))
        };
        let bos = special(BOS_CHAR, BOS_TOKEN)?;
        let eos = special(EOS_CHAR, EOS_TOKEN)?;
        let pad = special(PAD_CHAR, PAD_TOKEN)?;
        let unk = if include_unknown {
            ch2id.get(&UNK_CHAR).copied()
        } else {
            None
        };

        Ok(Self {
            id2ch,
            ch2id,
            bos,
            eos,
            pad,
            unk,
        })
    }

    fn to_record(&self) -> CharVocabRecord {
        CharVocabRecord {
            chars: self.id2ch.clone(),
            bos: self.bos,
            eos: self.eos,
            pad: self.pad,
            unk: self.unk,
        }
    }

    fn from_record(record: CharVocabRecord) -> Result<Self> {
        let mut vocab = Self::from_chars(record.chars, record.unk.is_some())?;
        let size = vocab.len() as u32;
        for id in [record.bos, record.eos, record.pad]
            .into_iter()
            .chain(record.unk)
        {
            if id >= size {
                return Err(anyhow!("special token id {id} outside vocabulary of {size}"));
            }
        }

        vocab.bos = record.bos;
        vocab.eos = record.eos;
        vocab.pad = record.pad;
        vocab.unk = record.unk;

        Ok(vocab)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.to_record())
            .context("failed to serialize vocabulary")?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read vocabulary {}", path.display()))?;
        Self::from_json_str(&data)
            .with_context(|| format!("failed to load vocabulary {}", path.display()))
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        let record: CharVocabRecord =
            serde_json::from_str(data).context("failed to parse vocabulary json")?;
        Self::from_record(record)
    }

    /// Characters missing from the vocabulary map to `[UNK]`, or are dropped when the
    /// vocabulary was fitted without one.
    pub fn encode(&self, s: &str, add_bos: bool, add_eos: bool) -> Vec<u32> {
        let mut tokens = Vec::with_capacity(s.chars().count() + 2);
        if add_bos {
            tokens.push(self.bos);
        }

        tokens.extend(
            s.chars()
                .filter_map(|ch| self.ch2id.get(&ch).copied().or(self.unk)),
        );

        if add_eos {
            tokens.push(self.eos);
        }

        tokens
    }

    /// Decode until the first `[EOS]`, skipping padding and `[BOS]`.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut text = String::new();
        for &id in ids {
            if id == self.pad || id == self.bos {
                continue;
            }
            if id == self.eos {
                break;
            }

            match self.id2ch.get(id as usize) {
                Some(ch) if Some(id) != self.unk => text.push(*ch),
                _ => text.push('?'),
            }
        }

        text
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        match token {
            BOS_TOKEN => Some(self.bos),
            EOS_TOKEN => Some(self.eos),
            PAD_TOKEN => Some(self.pad),
            UNK_TOKEN => self.unk,
            other => {
                let mut chars = other.chars();
                match (chars.next(), chars.next()) {
                    (Some(ch), None) => self.ch2id.get(&ch).copied(),
                    _ => None,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.id2ch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id2ch.is_empty()
    }

    pub fn contains(&self, ch: char) -> bool {
        self.ch2id.contains_key(&ch)
    }

    pub fn bos(&self) -> u32 {
        self.bos
    }

    pub fn eos(&self) -> u32 {
        self.eos
    }

    pub fn pad(&self) -> u32 {
        self.pad
    }

    pub fn unk(&self) -> Option<u32> {
        self.unk
    }
}

#[derive(Serialize, Deserialize)]
struct CharVocabRecord {
    chars: Vec<char>,
    bos: u32,
    eos: u32,
    pad: u32,
    unk: Option<u32>,
}

impl super::Tokenizer for CharVocab {
    fn encode(&self, s: &str, add_bos: bool, add_eos: bool) -> Vec<u32> {
        Self::encode(self, s, add_bos, add_eos)
    }

    fn decode(&self, ids: &[u32]) -> String {
        Self::decode(self, ids)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        Self::token_to_id(self, token)
    }

    fn len(&self) -> usize {
        Self::len(self)
    }

    fn is_empty(&self) -> bool {
        Self::is_empty(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
