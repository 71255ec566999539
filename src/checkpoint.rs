use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;

const PREFIX: &str = "checkpoint_";
const EXTENSION: &str = "bin";

/// Directory of full-precision model snapshots named `checkpoint_{step}.bin`.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path handed to the recorder, which appends the extension itself.
    fn base_path(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{PREFIX}{step}"))
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.base_path(step).with_extension(EXTENSION)
    }

    pub fn save<B: Backend, M: Module<B>>(&self, model: &M, step: usize) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create checkpoint directory {}", self.dir.display())
        })?;
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        model
            .clone()
            .save_file(self.base_path(step), &recorder)
            .with_context(|| format!("failed to save checkpoint for step {step}"))?;
        Ok(self.path_for(step))
    }

    pub fn load<B: Backend, M: Module<B>>(
        &self,
        model: M,
        step: usize,
        device: &B::Device,
    ) -> Result<M> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let record = recorder
            .load::<<M as Module<B>>::Record>(self.base_path(step), device)
            .with_context(|| {
                format!("failed to load checkpoint {}", self.path_for(step).display())
            })?;
        Ok(model.load_record(record))
    }

    /// Steps with a checkpoint on disk, ascending. A missing directory has none.
    pub fn steps(&self) -> Result<Vec<usize>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?;

        let mut steps = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(step) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.strip_prefix(PREFIX))
                .and_then(|step| step.parse::<usize>().ok())
            {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    pub fn latest_step(&self) -> Result<Option<usize>> {
        Ok(self.steps()?.last().copied())
    }
}
