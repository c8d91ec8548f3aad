use std::fmt;

use bytes::Bytes;
use liteport_core::{Activation, DType, Padding, Shape, Tensor};

pub const FORMAT_VERSION: u32 = 1;
/// Alignment of every constant buffer in the data section.
pub const BUFFER_ALIGNMENT: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("not a flat model (bad magic)")]
    BadMagic,

    #[error("unsupported flat format version {0}")]
    UnsupportedVersion(u32),

    #[error("truncated input while reading {0}")]
    Truncated(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unknown builtin operator code {0}")]
    UnknownOpcode(u32),

    #[error("unknown dtype tag {0}")]
    UnknownDType(u8),

    #[error("unknown padding tag {0}")]
    UnknownPadding(u8),

    #[error("unknown fused activation tag {0}")]
    UnknownActivation(u8),

    #[error("unknown operator options tag {0}")]
    UnknownOptions(u8),

    #[error("{what} index {index} out of range (len {len})")]
    BadIndex {
        what: &'static str,
        index: i64,
        len: usize,
    },

    #[error("buffer {index} spans past the end of the file")]
    BufferOutOfBounds { index: usize },

    #[error("buffer for tensor `{name}` holds {found} bytes, expected {expected}")]
    BufferSize {
        name: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum BuiltinOp {
    Add = 0,
    Concatenation = 2,
    Conv2d = 3,
    DepthwiseConv2d = 4,
    Logistic = 14,
    MaxPool2d = 17,
    Relu = 19,
    Relu6 = 21,
    ResizeBilinear = 23,
    BatchNorm = 128,
}

impl BuiltinOp {
    pub fn code(&self) -> u32 {
        *self as u32
    }

    pub fn from_code(code: u32) -> Result<Self, FormatError> {
        Ok(match code {
            0 => BuiltinOp::Add,
            2 => BuiltinOp::Concatenation,
            3 => BuiltinOp::Conv2d,
            4 => BuiltinOp::DepthwiseConv2d,
            14 => BuiltinOp::Logistic,
            17 => BuiltinOp::MaxPool2d,
            19 => BuiltinOp::Relu,
            21 => BuiltinOp::Relu6,
            23 => BuiltinOp::ResizeBilinear,
            128 => BuiltinOp::BatchNorm,
            other => return Err(FormatError::UnknownOpcode(other)),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinOp::Add => "ADD",
            BuiltinOp::Concatenation => "CONCATENATION",
            BuiltinOp::Conv2d => "CONV_2D",
            BuiltinOp::DepthwiseConv2d => "DEPTHWISE_CONV_2D",
            BuiltinOp::Logistic => "LOGISTIC",
            BuiltinOp::MaxPool2d => "MAX_POOL_2D",
            BuiltinOp::Relu => "RELU",
            BuiltinOp::Relu6 => "RELU6",
            BuiltinOp::ResizeBilinear => "RESIZE_BILINEAR",
            BuiltinOp::BatchNorm => "BATCH_NORM",
        }
    }
}

impl fmt::Display for BuiltinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Activation fused into the producing operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FusedActivation {
    #[default]
    None,
    Relu,
    Relu6,
}

impl FusedActivation {
    pub fn tag(&self) -> u8 {
        match self {
            FusedActivation::None => 0,
            FusedActivation::Relu => 1,
            FusedActivation::Relu6 => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, FormatError> {
        match tag {
            0 => Ok(FusedActivation::None),
            1 => Ok(FusedActivation::Relu),
            3 => Ok(FusedActivation::Relu6),
            other => Err(FormatError::UnknownActivation(other)),
        }
    }

    pub fn activation(&self) -> Activation {
        match self {
            FusedActivation::None => Activation::Linear,
            FusedActivation::Relu => Activation::Relu,
            FusedActivation::Relu6 => Activation::Relu6,
        }
    }
}

pub(crate) fn padding_tag(padding: Padding) -> u8 {
    match padding {
        Padding::Same => 0,
        Padding::Valid => 1,
    }
}

pub(crate) fn padding_from_tag(tag: u8) -> Result<Padding, FormatError> {
    match tag {
        0 => Ok(Padding::Same),
        1 => Ok(Padding::Valid),
        other => Err(FormatError::UnknownPadding(other)),
    }
}

pub(crate) fn dtype_tag(dtype: DType) -> u8 {
    match dtype {
        DType::F32 => 0,
        DType::I32 => 2,
        DType::U8 => 3,
        DType::I8 => 9,
    }
}

pub(crate) fn dtype_from_tag(tag: u8) -> Result<DType, FormatError> {
    match tag {
        0 => Ok(DType::F32),
        2 => Ok(DType::I32),
        3 => Ok(DType::U8),
        9 => Ok(DType::I8),
        other => Err(FormatError::UnknownDType(other)),
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OpOptions {
    None,
    Conv2d {
        padding: Padding,
        stride_h: u32,
        stride_w: u32,
        activation: FusedActivation,
    },
    DepthwiseConv2d {
        padding: Padding,
        stride_h: u32,
        stride_w: u32,
        depth_multiplier: u32,
        activation: FusedActivation,
    },
    Pool2d {
        padding: Padding,
        stride_h: u32,
        stride_w: u32,
        filter_h: u32,
        filter_w: u32,
        activation: FusedActivation,
    },
    Concatenation {
        axis: i32,
        activation: FusedActivation,
    },
    Add {
        activation: FusedActivation,
    },
    ResizeBilinear {
        align_corners: bool,
        half_pixel_centers: bool,
    },
    BatchNorm {
        epsilon: f32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quantization {
    pub scale: f32,
    pub zero_point: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlatTensor {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Index into [`FlatModel::buffers`]; 0 means no constant data.
    pub buffer: u32,
    pub quantization: Option<Quantization>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlatOperator {
    pub opcode_index: u32,
    /// Tensor indices, `-1` for an omitted optional input.
    pub inputs: Vec<i32>,
    pub outputs: Vec<i32>,
    pub options: OpOptions,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlatModel {
    pub version: u32,
    pub description: String,
    pub metadata: Vec<(String, String)>,
    pub operator_codes: Vec<BuiltinOp>,
    pub tensors: Vec<FlatTensor>,
    pub operators: Vec<FlatOperator>,
    pub inputs: Vec<i32>,
    pub outputs: Vec<i32>,
    pub buffers: Vec<Bytes>,
}

impl FlatModel {
    pub fn opcode(&self, op: &FlatOperator) -> Result<BuiltinOp, FormatError> {
        self.operator_codes
            .get(op.opcode_index as usize)
            .copied()
            .ok_or(FormatError::BadIndex {
                what: "operator code",
                index: op.opcode_index as i64,
                len: self.operator_codes.len(),
            })
    }

    pub fn tensor(&self, index: i32) -> Result<&FlatTensor, FormatError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.tensors.get(i))
            .ok_or(FormatError::BadIndex {
                what: "tensor",
                index: index as i64,
                len: self.tensors.len(),
            })
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Operators with a given builtin code, in execution order.
    pub fn operators_of(&self, op: BuiltinOp) -> impl Iterator<Item = &FlatOperator> {
        self.operators
            .iter()
            .filter(move |o| self.opcode(o).ok() == Some(op))
    }

    /// Constant data of a tensor, raw (not dequantized).
    pub fn constant(&self, index: i32) -> Result<Option<Tensor>, FormatError> {
        let tensor = self.tensor(index)?;
        if tensor.buffer == 0 {
            return Ok(None);
        }
        let bytes = self
            .buffers
            .get(tensor.buffer as usize)
            .ok_or(FormatError::BadIndex {
                what: "buffer",
                index: tensor.buffer as i64,
                len: self.buffers.len(),
            })?
            .clone();
        let expected = Shape::from_slice(&tensor.shape)
            .checked_numel()
            .and_then(|n| n.checked_mul(tensor.dtype.byte_size()));
        if expected != Some(bytes.len()) {
            return Err(FormatError::BufferSize {
                name: tensor.name.clone(),
                expected: expected.unwrap_or(usize::MAX),
                found: bytes.len(),
            });
        }
        Ok(Some(Tensor {
            dtype: tensor.dtype,
            shape: Shape::from_slice(&tensor.shape),
            bytes,
        }))
    }

    pub fn constant_bytes(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }
}

impl fmt::Display for FlatModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "flat model v{}: {}", self.version, self.description)?;
        for (key, value) in &self.metadata {
            writeln!(f, "  {key} = {value}")?;
        }
        writeln!(
            f,
            "  {} tensors, {} operators, {} buffers ({} constant bytes)",
            self.tensors.len(),
            self.operators.len(),
            self.buffers.len(),
            self.constant_bytes()
        )?;
        let describe = |index: &i32| match self.tensor(*index) {
            Ok(t) => format!("{}{:?}", t.name, t.shape),
            Err(_) => "-".to_string(),
        };
        for index in &self.inputs {
            writeln!(f, "  input  {}", describe(index))?;
        }
        for index in &self.outputs {
            writeln!(f, "  output {}", describe(index))?;
        }
        for (i, op) in self.operators.iter().enumerate() {
            let name = self
                .opcode(op)
                .map(|o| o.name())
                .unwrap_or("<invalid>");
            let inputs = op
                .inputs
                .iter()
                .map(|index| if *index < 0 { "-".to_string() } else { describe(index) })
                .collect::<Vec<_>>()
                .join(", ");
            let outputs = op.outputs.iter().map(describe).collect::<Vec<_>>().join(", ");
            writeln!(f, "  #{i:<3} {name:<18} ({inputs}) -> {outputs}  {:?}", op.options)?;
        }
        Ok(())
    }
}
