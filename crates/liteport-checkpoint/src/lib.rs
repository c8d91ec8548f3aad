//! Checkpoint and intermediate encodings.
//!
//! Both encodings share one safetensors container. A checkpoint carries the
//! training configuration and optimizer slots next to the weights; the
//! intermediate encoding is the same model with that training state removed,
//! which is the only form the flat converter accepts.

mod container;
mod executor;
mod loader;
mod save;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use container::{
    Container, FORMAT_KEY, FORMAT_VERSION, FORMAT_VERSION_KEY, MODEL_CONFIG_KEY, OPTIMIZER_PREFIX,
    TRAINING_CONFIG_KEY,
};
pub use executor::GraphModel;
pub use loader::{load_model, read_model, CheckpointLoader};
pub use save::{encode_intermediate, save_checkpoint, save_intermediate, TrainingState};
