#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod generation;
pub mod model;
pub mod objective;
pub mod tokenizer;
pub mod tracking;
pub mod trainer;

pub use checkpoint::CheckpointStore;
pub use config::{
    DatasetConfig, DecodeStrategyConfig, GenerationConfig, LearningRateScheduleConfig,
    ModelOverrides, OptimizerConfig, SampleLoggingConfig, SinkKind, TrackingConfig,
    TrainingConfig, TrainingHyperparameters, load_training_config, parse_training_config,
};
pub use dataset::{DatasetSplit, PaddedBatchLoader, TextCorpus, TokenBatch};
pub use generation::{
    NucleusPolicy, NucleusSettings, decode_rows, generate_argmax, generate_nucleus,
};
pub use model::{BigramConfig, BigramLm, LanguageModel, build_model_config};
pub use objective::{MaskedObjective, masked_objective, validity_mask};
pub use tokenizer::char_vocab::CharVocab;
pub use tokenizer::{SharedTokenizer, Tokenizer, TokenizerConfig};
pub use tracking::{
    ConsoleSink, JsonlSink, MemorySink, MetricRecord, MetricSink, MetricValue, MultiSink,
    RunInfo, build_sinks,
};
pub use trainer::{
    StepOutput, Trainer, TrainerEnvironment, TrainerSettings, TrainingSummary, ValidationOutput,
};
