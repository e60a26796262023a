// Training driver
//
// Configuration, learning-rate schedule, meters, loss, optimizer, batch
// sources, checkpoints and the train/validate loops that tie them to the
// layer profiler.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod driver;
pub mod loss;
pub mod meter;
pub mod optim;
pub mod schedule;

pub use checkpoint::{
    load_checkpoint, load_state_dict, save_checkpoint, state_dict, Checkpoint, SavedTensor,
    StateDict,
};
pub use config::TrainConfig;
pub use data::{Batch, DataLoader, Split, SyntheticConfig, SyntheticImageDataset};
pub use driver::{
    build_model, run, train_epoch, validate, EpochStats, ProfileMode, RunSummary, ValidationStats,
};
pub use loss::{Criterion, CrossEntropyLoss, LossOutput};
pub use meter::{accuracy, AverageMeter};
pub use optim::{Optimizer, OptimizerState, Sgd};
pub use schedule::{adjust_learning_rate, learning_rate, LrPolicy};
