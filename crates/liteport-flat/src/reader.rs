use bytes::Bytes;
use liteport_core::FLAT_MAGIC;

use crate::schema::{
    dtype_from_tag, padding_from_tag, BuiltinOp, FlatModel, FlatOperator, FlatTensor, FormatError,
    FusedActivation, OpOptions, Quantization, BUFFER_ALIGNMENT, FORMAT_VERSION,
};

/// Bounds-checked little-endian cursor. Buffer payloads are sliced out of
/// the backing `Bytes` without copying.
struct Decoder {
    data: Bytes,
    pos: usize,
}

impl Decoder {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&[u8], FormatError> {
        if self.remaining() < len {
            return Err(FormatError::Truncated(what));
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..self.pos])
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, FormatError> {
        Ok(self.array::<1>(what)?[0])
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, FormatError> {
        self.array(what).map(u32::from_le_bytes)
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, FormatError> {
        self.array(what).map(i32::from_le_bytes)
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, FormatError> {
        self.array(what).map(u64::from_le_bytes)
    }

    fn f32(&mut self, what: &'static str) -> Result<f32, FormatError> {
        self.array(what).map(f32::from_le_bytes)
    }

    fn bool(&mut self, what: &'static str) -> Result<bool, FormatError> {
        Ok(self.u8(what)? != 0)
    }

    /// Element count of a table whose entries take at least `min_size`
    /// bytes each; rejects counts the remaining input cannot hold.
    fn count(&mut self, min_size: usize, what: &'static str) -> Result<usize, FormatError> {
        let count = self.u32(what)? as usize;
        if count.saturating_mul(min_size) > self.remaining() {
            return Err(FormatError::Truncated(what));
        }
        Ok(count)
    }

    fn string(&mut self, what: &'static str) -> Result<String, FormatError> {
        let len = self.count(1, what)?;
        let raw = self.take(len, what)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| FormatError::InvalidUtf8(what))
    }

    fn indices(&mut self, what: &'static str) -> Result<Vec<i32>, FormatError> {
        let len = self.count(4, what)?;
        (0..len).map(|_| self.i32(what)).collect()
    }

    fn activation(&mut self) -> Result<FusedActivation, FormatError> {
        FusedActivation::from_tag(self.u8("fused activation")?)
    }

    fn options(&mut self) -> Result<OpOptions, FormatError> {
        const WHAT: &str = "operator options";
        Ok(match self.u8(WHAT)? {
            0 => OpOptions::None,
            1 => OpOptions::Conv2d {
                padding: padding_from_tag(self.u8(WHAT)?)?,
                stride_h: self.u32(WHAT)?,
                stride_w: self.u32(WHAT)?,
                activation: self.activation()?,
            },
            2 => OpOptions::DepthwiseConv2d {
                padding: padding_from_tag(self.u8(WHAT)?)?,
                stride_h: self.u32(WHAT)?,
                stride_w: self.u32(WHAT)?,
                depth_multiplier: self.u32(WHAT)?,
                activation: self.activation()?,
            },
            3 => OpOptions::Pool2d {
                padding: padding_from_tag(self.u8(WHAT)?)?,
                stride_h: self.u32(WHAT)?,
                stride_w: self.u32(WHAT)?,
                filter_h: self.u32(WHAT)?,
                filter_w: self.u32(WHAT)?,
                activation: self.activation()?,
            },
            4 => OpOptions::Concatenation {
                axis: self.i32(WHAT)?,
                activation: self.activation()?,
            },
            5 => OpOptions::Add {
                activation: self.activation()?,
            },
            6 => OpOptions::ResizeBilinear {
                align_corners: self.bool(WHAT)?,
                half_pixel_centers: self.bool(WHAT)?,
            },
            7 => OpOptions::BatchNorm {
                epsilon: self.f32(WHAT)?,
            },
            other => return Err(FormatError::UnknownOptions(other)),
        })
    }

    fn tensor(&mut self) -> Result<FlatTensor, FormatError> {
        let name = self.string("tensor name")?;
        let dtype = dtype_from_tag(self.u8("tensor dtype")?)?;
        let rank = self.count(4, "tensor shape")?;
        let shape = (0..rank)
            .map(|_| self.u32("tensor shape").map(|d| d as usize))
            .collect::<Result<Vec<_>, _>>()?;
        let buffer = self.u32("tensor buffer")?;
        let quantization = if self.bool("tensor quantization")? {
            Some(Quantization {
                scale: self.f32("tensor quantization")?,
                zero_point: self.i32("tensor quantization")?,
            })
        } else {
            None
        };
        Ok(FlatTensor {
            name,
            dtype,
            shape,
            buffer,
            quantization,
        })
    }

    fn operator(&mut self) -> Result<FlatOperator, FormatError> {
        Ok(FlatOperator {
            opcode_index: self.u32("operator code index")?,
            inputs: self.indices("operator inputs")?,
            outputs: self.indices("operator outputs")?,
            options: self.options()?,
        })
    }
}

impl FlatModel {
    /// Decode a flat model. Every table index is checked, so a model that
    /// parses can be walked without further bounds errors.
    pub fn parse(data: Bytes) -> Result<FlatModel, FormatError> {
        let mut d = Decoder { data, pos: 0 };
        if d.array::<4>("magic").map_err(|_| FormatError::BadMagic)? != FLAT_MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = d.u32("version")?;
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let description = d.string("description")?;

        let entries = d.count(8, "metadata")?;
        let mut metadata = Vec::with_capacity(entries);
        for _ in 0..entries {
            metadata.push((d.string("metadata key")?, d.string("metadata value")?));
        }

        let codes = d.count(4, "operator codes")?;
        let operator_codes = (0..codes)
            .map(|_| BuiltinOp::from_code(d.u32("operator codes")?))
            .collect::<Result<Vec<_>, _>>()?;

        let count = d.count(14, "tensors")?;
        let tensors = (0..count)
            .map(|_| d.tensor())
            .collect::<Result<Vec<_>, _>>()?;

        let count = d.count(13, "operators")?;
        let operators = (0..count)
            .map(|_| d.operator())
            .collect::<Result<Vec<_>, _>>()?;

        let inputs = d.indices("graph inputs")?;
        let outputs = d.indices("graph outputs")?;

        let count = d.count(16, "buffer table")?;
        let mut spans = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = d.u64("buffer table")?;
            let len = d.u64("buffer table")?;
            spans.push((offset, len));
        }

        let data_start = d.pos.div_ceil(BUFFER_ALIGNMENT) * BUFFER_ALIGNMENT;
        let mut buffers = Vec::with_capacity(spans.len());
        for (index, (offset, len)) in spans.into_iter().enumerate() {
            let start = usize::try_from(offset)
                .ok()
                .and_then(|o| o.checked_add(data_start));
            let end = start.zip(usize::try_from(len).ok()).and_then(|(s, l)| s.checked_add(l));
            match (start, end) {
                (Some(start), Some(end)) if end <= d.data.len() => {
                    buffers.push(d.data.slice(start..end));
                }
                _ => return Err(FormatError::BufferOutOfBounds { index }),
            }
        }

        let model = FlatModel {
            version,
            description,
            metadata,
            operator_codes,
            tensors,
            operators,
            inputs,
            outputs,
            buffers,
        };
        model.check_indices()?;
        Ok(model)
    }

    pub(crate) fn check_indices(&self) -> Result<(), FormatError> {
        for tensor in &self.tensors {
            if tensor.buffer as usize >= self.buffers.len() {
                return Err(FormatError::BadIndex {
                    what: "buffer",
                    index: tensor.buffer as i64,
                    len: self.buffers.len(),
                });
            }
        }
        for op in &self.operators {
            self.opcode(op)?;
            for index in &op.inputs {
                if *index >= 0 {
                    self.tensor(*index)?;
                }
            }
            for index in &op.outputs {
                self.tensor(*index)?;
            }
        }
        for index in self.inputs.iter().chain(&self.outputs) {
            self.tensor(*index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liteport_core::{DType, Padding};
    use proptest::prelude::*;

    fn tiny() -> FlatModel {
        let weights: Vec<u8> = [1.0f32, -2.0, 0.5]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        FlatModel {
            version: FORMAT_VERSION,
            description: "tiny".to_string(),
            metadata: vec![("producer".to_string(), "test".to_string())],
            operator_codes: vec![BuiltinOp::Conv2d],
            tensors: vec![
                FlatTensor {
                    name: "x".to_string(),
                    dtype: DType::F32,
                    shape: vec![1, 2, 2, 3],
                    buffer: 0,
                    quantization: None,
                },
                FlatTensor {
                    name: "w".to_string(),
                    dtype: DType::F32,
                    shape: vec![1, 1, 1, 3],
                    buffer: 1,
                    quantization: None,
                },
                FlatTensor {
                    name: "y".to_string(),
                    dtype: DType::F32,
                    shape: vec![1, 2, 2, 1],
                    buffer: 0,
                    quantization: None,
                },
            ],
            operators: vec![FlatOperator {
                opcode_index: 0,
                inputs: vec![0, 1, -1],
                outputs: vec![2],
                options: OpOptions::Conv2d {
                    padding: Padding::Valid,
                    stride_h: 1,
                    stride_w: 1,
                    activation: FusedActivation::Relu,
                },
            }],
            inputs: vec![0],
            outputs: vec![2],
            buffers: vec![Bytes::new(), Bytes::from(weights)],
        }
    }

    #[test]
    fn encoded_model_parses_back() -> anyhow::Result<()> {
        let model = tiny();
        let bytes = model.to_bytes();
        assert_eq!(&bytes[..4], b"LPFB");
        let parsed = FlatModel::parse(bytes)?;
        assert_eq!(parsed, model);
        assert_eq!(parsed.constant(1)?.unwrap().to_f32()?, vec![1.0, -2.0, 0.5]);
        Ok(())
    }

    #[test]
    fn buffers_are_aligned_in_the_file() -> anyhow::Result<()> {
        let bytes = tiny().to_bytes();
        let base = bytes.as_ptr() as usize;
        let parsed = FlatModel::parse(bytes)?;
        let offset = parsed.buffers[1].as_ptr() as usize - base;
        assert_eq!(offset % BUFFER_ALIGNMENT, 0);
        Ok(())
    }

    #[test]
    fn rejects_bad_magic() {
        let mut raw = tiny().to_bytes().to_vec();
        raw[0] = b'X';
        assert!(matches!(
            FlatModel::parse(Bytes::from(raw)),
            Err(FormatError::BadMagic)
        ));
        assert!(matches!(
            FlatModel::parse(Bytes::from_static(b"LP")),
            Err(FormatError::BadMagic)
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut raw = tiny().to_bytes().to_vec();
        raw[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            FlatModel::parse(Bytes::from(raw)),
            Err(FormatError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn rejects_out_of_range_tensor_index() {
        let mut model = tiny();
        model.operators[0].outputs = vec![9];
        assert!(matches!(
            FlatModel::parse(model.to_bytes()),
            Err(FormatError::BadIndex { what: "tensor", index: 9, .. })
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let raw = tiny().to_bytes();
        for len in [8, 20, raw.len() / 2, raw.len() - 1] {
            let err = FlatModel::parse(raw.slice(..len)).unwrap_err();
            assert!(
                matches!(err, FormatError::Truncated(_) | FormatError::BufferOutOfBounds { .. }),
                "prefix of {len} bytes gave {err:?}"
            );
        }
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(tail in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut raw = b"LPFB\x01\x00\x00\x00".to_vec();
            raw.extend_from_slice(&tail);
            let _ = FlatModel::parse(Bytes::from(raw));
        }
    }
}
