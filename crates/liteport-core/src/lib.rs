pub mod artifact;
pub mod custom_op;
pub mod error;
pub mod graph;
pub mod kernels;
pub mod loader;
pub mod spec;
pub mod tensor;

pub use artifact::*;
pub use custom_op::*;
pub use error::*;
pub use graph::*;
pub use loader::*;
pub use spec::*;
pub use tensor::*;
