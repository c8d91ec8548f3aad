use anyhow::Result;

use crate::{CustomOps, Encoding, LoadError, ModelArtifact, ModelSpec, Tensor};

#[derive(Clone, Copy, Debug)]
pub struct LoaderCapabilities {
    /// Encodings this loader can open.
    pub accepts: &'static [Encoding],
    /// Whether training state (optimizer slots, loss config) is read at all.
    pub reads_training_state: bool,
}

pub trait ModelLoader {
    type Model: InferenceModel;

    fn name(&self) -> &'static str;
    fn load(&self, artifact: &ModelArtifact, ops: &CustomOps) -> Result<Self::Model, LoadError>;
    fn capabilities(&self) -> LoaderCapabilities;
}

pub trait InferenceModel {
    fn spec(&self) -> &ModelSpec;

    /// One NHWC f32 tensor per declared input, in declaration order.
    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>>;
}
