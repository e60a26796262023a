// Training configuration
// Every knob of a run, loaded from a JSON file with defaults for anything
// left out

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::data::SyntheticConfig;
use super::schedule::LrPolicy;
use crate::error::{Error, Result};
use crate::nn::PeleeNetConfig;
use crate::profiler::ProfilerOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Dataset tag; only the synthetic source is built in
    pub data: String,
    pub arch: String,
    /// Loader parallelism hint, logged only
    pub workers: usize,
    pub epochs: usize,
    pub start_epoch: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub lr_policy: LrPolicy,
    pub momentum: f64,
    pub weight_decay: f64,
    pub print_freq: usize,
    /// Checkpoint to resume from
    pub resume: Option<PathBuf>,
    /// Validate once and return
    pub evaluate: bool,
    /// Load weights from `checkpoint_dir/checkpoint.json` before running
    pub pretrained: bool,
    pub input_dim: usize,
    pub world_size: usize,
    /// `none`, `stdio`, or a trace name written to `logs_dir/<name>.json`
    pub profile: String,
    /// Record per-layer timings for the whole run
    pub trace_layers: bool,
    pub checkpoint_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub seed: u64,
    /// Forward passes per validation batch when not profiling
    pub eval_runs: usize,
    /// Leading passes excluded from the timing average
    pub eval_warmup: usize,
    /// Architecture; `num_classes` is taken from the dataset
    pub model: PeleeNetConfig,
    pub dataset: SyntheticConfig,
    pub profiler: ProfilerOptions,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data: "synthetic".to_string(),
            arch: "peleenet".to_string(),
            workers: 16,
            epochs: 120,
            start_epoch: 0,
            batch_size: 512,
            lr: 0.18,
            lr_policy: LrPolicy::Cosine,
            momentum: 0.9,
            weight_decay: 1e-4,
            print_freq: 10,
            resume: None,
            evaluate: false,
            pretrained: false,
            input_dim: 224,
            world_size: 1,
            profile: "none".to_string(),
            trace_layers: false,
            checkpoint_dir: PathBuf::from("."),
            logs_dir: PathBuf::from("LOGS"),
            seed: 0,
            eval_runs: 20,
            eval_warmup: 10,
            model: PeleeNetConfig::default(),
            dataset: SyntheticConfig::default(),
            profiler: ProfilerOptions::default(),
        }
    }
}

impl TrainConfig {
    /// Small enough to train a few steps in a test
    pub fn tiny() -> Self {
        let dataset = SyntheticConfig {
            num_classes: 4,
            train_samples: 16,
            val_samples: 8,
            ..SyntheticConfig::default()
        };
        Self {
            epochs: 1,
            batch_size: 4,
            lr: 0.05,
            print_freq: 1,
            input_dim: 32,
            eval_runs: 3,
            eval_warmup: 1,
            model: PeleeNetConfig::tiny(dataset.num_classes),
            dataset,
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".to_string()));
        }
        if self.epochs == 0 {
            return Err(Error::InvalidConfig("epochs must be positive".to_string()));
        }
        if self.print_freq == 0 {
            return Err(Error::InvalidConfig("print_freq must be positive".to_string()));
        }
        if self.eval_warmup >= self.eval_runs {
            return Err(Error::InvalidConfig(format!(
                "eval_warmup ({}) must be smaller than eval_runs ({})",
                self.eval_warmup, self.eval_runs
            )));
        }
        // stem halves twice, each pooled transition once more
        let stages = self.model.block_config.len();
        let min_dim = 1usize << (2 + stages.saturating_sub(1));
        if self.input_dim < min_dim {
            return Err(Error::InvalidConfig(format!(
                "input_dim {} is too small for {} stages (need >= {})",
                self.input_dim, stages, min_dim
            )));
        }
        self.model.validate()
    }

    pub fn distributed(&self) -> bool {
        self.world_size > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_follow_reference_run() {
        let config = TrainConfig::default();
        assert_eq!(config.epochs, 120);
        assert_eq!(config.batch_size, 512);
        assert!((config.lr - 0.18).abs() < 1e-12);
        assert_eq!(config.lr_policy, LrPolicy::Cosine);
        assert_eq!(config.profile, "none");
        assert!(!config.distributed());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let naming = r#"{"naming": {"index_list_elements": true}}"#;
        write!(file, r#"{{"epochs": 3, "lr_policy": "step", "profiler": {}}}"#, naming).unwrap();
        let config = TrainConfig::from_file(file.path()).unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.lr_policy, LrPolicy::Step);
        assert_eq!(config.batch_size, 512);
        assert_eq!(config.model.growth_rate, 32);
        assert!(config.profiler.naming.index_list_elements);
        assert!(config.profiler.recorder.emit_values);
    }

    #[test]
    fn test_validation() {
        assert!(TrainConfig::tiny().validate().is_ok());

        let mut config = TrainConfig::tiny();
        config.eval_warmup = config.eval_runs;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::tiny();
        config.input_dim = 2;
        assert!(config.validate().is_err());
    }
}
