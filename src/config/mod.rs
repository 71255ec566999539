pub mod core;
pub mod train;

pub use core::{
    DecodeStrategyConfig, GenerationConfig, ModelOverrides, SampleLoggingConfig,
    TrainingHyperparameters,
};
pub use train::{
    DatasetConfig, LearningRateScheduleConfig, OptimizerConfig, SinkKind, TrackingConfig,
    TrainingConfig, load_training_config, parse_training_config,
};
