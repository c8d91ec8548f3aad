use std::collections::BTreeMap;
use std::path::Path;

use liteport_core::{Encoding, Model, Tensor, WriteError};
use serde_json::Value as Json;
use tracing::debug;

use crate::{Container, OPTIMIZER_PREFIX};

/// Training-only state stored in checkpoints next to the model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingState {
    /// Optimizer and loss configuration, opaque to the converter.
    pub config: Json,
    /// Optimizer slot variables, keyed without the `optimizer/` prefix.
    pub slots: BTreeMap<String, Tensor>,
}

/// Encode `model` without any training state.
pub fn encode_intermediate(model: &Model) -> Result<Vec<u8>, WriteError> {
    Container {
        encoding: Encoding::Intermediate,
        architecture: model.architecture.clone(),
        training_config: None,
        tensors: model.weights.clone(),
    }
    .encode()
}

/// Write the intermediate encoding of `model`, replacing any existing file.
pub fn save_intermediate(model: &Model, path: &Path) -> Result<(), WriteError> {
    let bytes = encode_intermediate(model)?;
    write_file(path, &bytes)?;
    debug!(path = %path.display(), bytes = bytes.len(), "wrote intermediate model");
    Ok(())
}

/// Write a full checkpoint, as a training job would.
pub fn save_checkpoint(model: &Model, training: &TrainingState, path: &Path) -> Result<(), WriteError> {
    let mut tensors = model.weights.clone();
    for (name, slot) in &training.slots {
        tensors.insert(format!("{OPTIMIZER_PREFIX}{name}"), slot.clone());
    }
    let bytes = Container {
        encoding: Encoding::Checkpoint,
        architecture: model.architecture.clone(),
        training_config: Some(training.config.clone()),
        tensors,
    }
    .encode()?;
    write_file(path, &bytes)?;
    debug!(path = %path.display(), bytes = bytes.len(), "wrote checkpoint");
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    std::fs::write(path, bytes).map_err(|source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    })
}
