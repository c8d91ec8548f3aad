//! End-to-end conversion: checkpoint, intermediate, flat file.
//!
//! [`Pipeline::run`] executes the stages strictly in order. The intermediate
//! file is removed only once the flat output has been written in full.

pub mod config;
pub mod output;
pub mod pipeline;
pub mod stage;
pub mod verify;

pub use config::{ConfigError, OverwritePolicy, PipelineConfig};
pub use output::{write_atomic, IntermediateFile};
pub use pipeline::{Pipeline, PipelineReport, Timings};
pub use stage::Stage;
pub use verify::{verify_fidelity, verify_files, FidelityReport, DEFAULT_TOLERANCE};
