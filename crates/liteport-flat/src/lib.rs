//! The flat inference format.
//!
//! A flat model is a single little-endian buffer: a tensor table, an
//! operator list referencing tensors by index, and a data section of 16-byte
//! aligned constant buffers. Layers from the checkpoint are lowered to
//! builtin operators by [`Converter`]; [`FlatInterpreter`] executes the
//! result on the CPU with the same kernels as the layer-graph interpreter.

mod convert;
mod interp;
mod reader;
mod schema;
mod writer;

pub use convert::{Converter, ConverterOptions, Quantize};
pub use interp::{FlatInterpreter, FlatLoader};
pub use schema::*;
