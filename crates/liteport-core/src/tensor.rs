use anyhow::{bail, ensure, Result};
use bytes::Bytes;
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    I32,
    I8,
    U8,
}

impl DType {
    pub fn byte_size(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::I8 | DType::U8 => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::I8 => "i8",
            DType::U8 => "u8",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }
    /// [`Shape::numel`] that returns `None` instead of overflowing.
    pub fn checked_numel(&self) -> Option<usize> {
        self.0
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
            .map(|n| n.max(1))
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
}

/// Dense little-endian tensor. Storage is shared, so cloning is cheap.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Shape,
    pub bytes: Bytes,
}

impl Tensor {
    pub fn from_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Result<Self> {
        let expected = shape
            .checked_numel()
            .and_then(|n| n.checked_mul(dtype.byte_size()));
        ensure!(
            expected == Some(bytes.len()),
            "tensor byte size mismatch: got {}, expected {:?} for {:?} {}",
            bytes.len(),
            expected,
            shape.dims(),
            dtype.as_str()
        );
        Ok(Self {
            dtype,
            shape,
            bytes,
        })
    }

    pub fn from_f32(shape: Shape, values: &[f32]) -> Result<Self> {
        let bytes = values
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<u8>>();
        Self::from_bytes(DType::F32, shape, Bytes::from(bytes))
    }

    pub fn from_i32(shape: Shape, values: &[i32]) -> Result<Self> {
        let bytes = values
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<u8>>();
        Self::from_bytes(DType::I32, shape, Bytes::from(bytes))
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn to_f32(&self) -> Result<Vec<f32>> {
        if self.dtype != DType::F32 {
            bail!("expected f32 tensor, found {}", self.dtype.as_str());
        }
        Ok(bytes_to_f32(&self.bytes))
    }

    pub fn to_i32(&self) -> Result<Vec<i32>> {
        if self.dtype != DType::I32 {
            bail!("expected i32 tensor, found {}", self.dtype.as_str());
        }
        Ok(self
            .bytes
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    pub fn to_i8(&self) -> Result<Vec<i8>> {
        if self.dtype != DType::I8 {
            bail!("expected i8 tensor, found {}", self.dtype.as_str());
        }
        Ok(self.bytes.iter().map(|b| *b as i8).collect())
    }
}

pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_values_survive_storage() -> Result<()> {
        let values = [0.0f32, -1.5, f32::MIN_POSITIVE, 3.25e-7];
        let tensor = Tensor::from_f32(Shape::from_slice(&[2, 2]), &values)?;
        assert_eq!(tensor.byte_len(), 16);
        let back = tensor.to_f32()?;
        for (a, b) in values.iter().zip(&back) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        Ok(())
    }

    #[test]
    fn rejects_wrong_byte_length() {
        let err = Tensor::from_bytes(
            DType::F32,
            Shape::from_slice(&[3]),
            Bytes::from_static(&[0u8; 8]),
        );
        assert!(err.is_err());
    }

    #[test]
    fn overflowing_shape_has_no_checked_numel() {
        let huge = u32::MAX as usize;
        assert_eq!(Shape::from_slice(&[huge, huge, huge, huge]).checked_numel(), None);
        assert_eq!(Shape::from_slice(&[2, 3]).checked_numel(), Some(6));
        let err = Tensor::from_bytes(
            DType::F32,
            Shape::from_slice(&[huge, huge, huge, huge]),
            Bytes::new(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn scalar_shape_has_one_element() {
        assert_eq!(Shape::from_slice(&[]).numel(), 1);
        assert_eq!(Shape::from_slice(&[1, 157, 157, 3]).numel(), 157 * 157 * 3);
    }

    #[test]
    fn dtype_mismatch_is_reported() -> Result<()> {
        let tensor = Tensor::from_i32(Shape::from_slice(&[2]), &[157, 157])?;
        assert!(tensor.to_f32().is_err());
        assert_eq!(tensor.to_i32()?, vec![157, 157]);
        Ok(())
    }
}
