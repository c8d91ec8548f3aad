use std::path::Path;

use liteport_core::{
    CustomOps, Encoding, LoadError, LoaderCapabilities, Model, ModelArtifact, ModelLoader,
};
use tracing::{debug, info};

use crate::{Container, GraphModel};

/// Load a checkpoint or intermediate file for inference.
///
/// Training state is skipped, and every `Lambda` layer must resolve against
/// `ops`: a checkpoint using an operation missing from the set fails with
/// [`LoadError::UnresolvedOperation`].
pub fn read_model(path: &Path, ops: &CustomOps) -> Result<(Model, Encoding), LoadError> {
    let container = Container::read(path, false)?;
    let model = Model {
        architecture: container.architecture,
        weights: container.tensors,
    };
    model
        .validate(ops)
        .map_err(|err| LoadError::from_graph(path, err))?;

    info!(
        path = %path.display(),
        encoding = %container.encoding,
        model = %model.architecture.name,
        layers = model.architecture.layers.len(),
        weights = model.weights.len(),
        "loaded model"
    );
    Ok((model, container.encoding))
}

pub fn load_model(path: &Path, ops: &CustomOps) -> Result<Model, LoadError> {
    read_model(path, ops).map(|(model, _)| model)
}

/// Loads checkpoint and intermediate files as runnable layer graphs.
pub struct CheckpointLoader;

impl CheckpointLoader {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CheckpointLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelLoader for CheckpointLoader {
    type Model = GraphModel;

    fn name(&self) -> &'static str {
        "checkpoint"
    }

    fn load(&self, artifact: &ModelArtifact, ops: &CustomOps) -> Result<Self::Model, LoadError> {
        let path = artifact.path();
        if artifact.encoding() == Encoding::Flat {
            return Err(LoadError::WrongEncoding {
                path: path.to_path_buf(),
                expected: Encoding::Checkpoint,
                found: Encoding::Flat,
            });
        }

        let (model, found) = read_model(path, ops)?;
        if found != artifact.encoding() {
            debug!(expected = %artifact.encoding(), %found, "artifact encoding differs from file");
        }
        GraphModel::new(&model, ops).map_err(|err| LoadError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("{err:#}"),
        })
    }

    fn capabilities(&self) -> LoaderCapabilities {
        LoaderCapabilities {
            accepts: &[Encoding::Checkpoint, Encoding::Intermediate],
            reads_training_state: false,
        }
    }
}
