use anyhow::{ensure, Result};

use crate::{DType, Shape, Tensor};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IOName(pub String);

#[derive(Clone, Debug, PartialEq)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    pub rank: usize,
    pub dims: Vec<Option<usize>>, // None = dynamic
}

impl TensorSpec {
    /// NHWC activation with a dynamic batch dimension.
    pub fn nhwc(name: &str, height: usize, width: usize, channels: usize) -> Self {
        Self {
            name: IOName(name.to_string()),
            dtype: DType::F32,
            rank: 4,
            dims: vec![None, Some(height), Some(width), Some(channels)],
        }
    }

    /// Deterministic f32 input in `[-1, 1)` with dynamic dims set to `batch`.
    pub fn probe(&self, batch: usize, seed: u64) -> Result<Tensor> {
        ensure!(
            self.dtype == DType::F32,
            "cannot probe {} input `{}`",
            self.dtype.as_str(),
            self.name.0
        );
        let dims = self
            .dims
            .iter()
            .map(|d| d.unwrap_or(batch))
            .collect::<Vec<_>>();
        let shape = Shape::from_slice(&dims);
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        let values = (0..shape.numel())
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
            })
            .collect::<Vec<_>>();
        Tensor::from_f32(shape, &values)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelSpec {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}
