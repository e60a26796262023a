// Checkpoint storage
// JSON snapshots of model and optimizer state

use std::collections::BTreeMap;
use std::fs::{self, create_dir_all, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use super::optim::OptimizerState;
use crate::error::{Error, Result};
use crate::module::{named_buffers, named_parameters, Module};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const BEST_FILE: &str = "model_best.json";

/// Row-major tensor values with their shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl SavedTensor {
    pub fn from_array(array: &ArrayD<f32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone())?)
    }
}

pub type StateDict = BTreeMap<String, SavedTensor>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Next epoch to run
    pub epoch: usize,
    pub arch: String,
    pub state_dict: StateDict,
    pub best_acc1: f64,
    pub optimizer: OptimizerState,
}

/// Parameters and buffers of `model` keyed by dotted path
pub fn state_dict(model: &dyn Module) -> StateDict {
    named_parameters(model)
        .into_iter()
        .chain(named_buffers(model))
        .map(|(name, param)| (name, SavedTensor::from_array(&param.value())))
        .collect()
}

const WRAPPER_PREFIX: &str = "module.";

/// Look a key up as-is, then with the data-parallel wrapper prefix added or removed
fn find<'s>(state: &'s StateDict, key: &str) -> Option<&'s SavedTensor> {
    state.get(key).or_else(|| match key.strip_prefix(WRAPPER_PREFIX) {
        Some(bare) => state.get(bare),
        None => state.get(&format!("{}{}", WRAPPER_PREFIX, key)),
    })
}

/// Copy every parameter and buffer of `model` from `state`.
///
/// Every entry of the model must be present with a matching shape; extra
/// entries in `state` are ignored.
pub fn load_state_dict(model: &dyn Module, state: &StateDict) -> Result<()> {
    let entries = named_parameters(model).into_iter().chain(named_buffers(model));
    let mut loaded = 0;
    for (name, param) in entries {
        let saved = find(state, &name)
            .ok_or_else(|| Error::InvalidModel(format!("state dict has no entry for '{}'", name)))?;
        param.set_value(saved.to_array()?)?;
        loaded += 1;
    }
    debug!("loaded {} tensors from state dict ({} entries)", loaded, state.len());
    Ok(())
}

/// Write `dir/checkpoint.json`, copied to `dir/model_best.json` when `is_best`
pub fn save_checkpoint(checkpoint: &Checkpoint, is_best: bool, dir: &Path) -> Result<PathBuf> {
    create_dir_all(dir)?;
    let path = dir.join(CHECKPOINT_FILE);
    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer(&mut writer, checkpoint)?;
    writer.flush()?;

    if is_best {
        fs::copy(&path, dir.join(BEST_FILE))?;
    }
    info!("=> saved checkpoint '{}' (epoch {})", path.display(), checkpoint.epoch);
    Ok(path)
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let unreadable =
        |e: &dyn std::fmt::Display| Error::CheckpointError(path.to_path_buf(), e.to_string());
    let file = File::open(path).map_err(|e| unreadable(&e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| unreadable(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::layers::{BatchNorm2d, Linear};
    use crate::nn::{DataParallel, Sequential};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model(seed: u64) -> Sequential {
        let mut rng = StdRng::seed_from_u64(seed);
        Sequential::new().add("fc", Linear::new(3, 2, &mut rng)).add("bn", BatchNorm2d::new(2))
    }

    #[test]
    fn test_state_dict_keys() {
        let keys: Vec<String> = state_dict(&model(0)).into_keys().collect();
        assert_eq!(
            keys,
            vec![
                "bn.bias",
                "bn.running_mean",
                "bn.running_var",
                "bn.weight",
                "fc.bias",
                "fc.weight"
            ]
        );
    }

    #[test]
    fn test_load_copies_values() {
        let source = model(1);
        let target = model(2);
        assert_ne!(state_dict(&source), state_dict(&target));
        load_state_dict(&target, &state_dict(&source)).unwrap();
        assert_eq!(state_dict(&source), state_dict(&target));
    }

    #[test]
    fn test_load_across_data_parallel_wrapper() {
        let wrapped = DataParallel::new(Box::new(model(1)));
        let bare = model(2);
        load_state_dict(&bare, &state_dict(&wrapped)).unwrap();
        assert_eq!(state_dict(&bare), state_dict(wrapped.inner()));
    }

    #[test]
    fn test_missing_entry_is_an_error() {
        let mut state = state_dict(&model(0));
        state.remove("fc.weight");
        assert!(matches!(load_state_dict(&model(0), &state), Err(Error::InvalidModel(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint {
            epoch: 3,
            arch: "peleenet".to_string(),
            state_dict: state_dict(&model(0)),
            best_acc1: 41.5,
            optimizer: OptimizerState::default(),
        };
        let path = save_checkpoint(&checkpoint, false, dir.path()).unwrap();
        assert!(!dir.path().join(BEST_FILE).exists());
        assert_eq!(load_checkpoint(&path).unwrap(), checkpoint);

        save_checkpoint(&checkpoint, true, dir.path()).unwrap();
        assert_eq!(load_checkpoint(&dir.path().join(BEST_FILE)).unwrap().best_acc1, 41.5);
    }

    #[test]
    fn test_unreadable_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{").unwrap();
        assert!(matches!(load_checkpoint(&path), Err(Error::CheckpointError(..))));
        let absent = load_checkpoint(&dir.path().join("absent.json"));
        assert!(matches!(absent, Err(Error::CheckpointError(..))));
    }
}
