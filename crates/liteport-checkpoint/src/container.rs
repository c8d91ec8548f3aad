use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use bytes::Bytes;
use liteport_core::{
    Architecture, DType, Encoding, LoadError, Shape, Tensor, WriteError, FLAT_MAGIC,
};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde_json::Value as Json;

pub const FORMAT_KEY: &str = "liteport.format";
pub const FORMAT_VERSION_KEY: &str = "liteport.format_version";
pub const FORMAT_VERSION: &str = "1";
pub const MODEL_CONFIG_KEY: &str = "model_config";
pub const TRAINING_CONFIG_KEY: &str = "training_config";
/// Tensor-name prefix of optimizer slot variables.
pub const OPTIMIZER_PREFIX: &str = "optimizer/";

/// Decoded contents of a checkpoint or intermediate file.
#[derive(Clone, Debug)]
pub struct Container {
    pub encoding: Encoding,
    pub architecture: Architecture,
    pub training_config: Option<Json>,
    pub tensors: BTreeMap<String, Tensor>,
}

impl Container {
    /// Read a container. Optimizer slots are only materialized when
    /// `with_training_state` is set.
    pub fn read(path: &Path, with_training_state: bool) -> Result<Self, LoadError> {
        let buffer = std::fs::read(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LoadError::NotFound(path.to_path_buf())
            } else {
                LoadError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::decode(path, &buffer, with_training_state)
    }

    pub fn decode(path: &Path, buffer: &[u8], with_training_state: bool) -> Result<Self, LoadError> {
        let corrupt = |reason: String| LoadError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        if buffer.starts_with(&FLAT_MAGIC) {
            return Err(LoadError::WrongEncoding {
                path: path.to_path_buf(),
                expected: Encoding::Checkpoint,
                found: Encoding::Flat,
            });
        }

        let (_, metadata) = SafeTensors::read_metadata(buffer)
            .map_err(|err| corrupt(format!("unreadable container header: {err}")))?;
        let info = metadata
            .metadata()
            .as_ref()
            .ok_or_else(|| corrupt("container has no metadata".to_string()))?;

        let tag = info
            .get(FORMAT_KEY)
            .ok_or_else(|| corrupt(format!("missing `{FORMAT_KEY}`")))?;
        let encoding = match Encoding::from_tag(tag) {
            Some(e @ (Encoding::Checkpoint | Encoding::Intermediate)) => e,
            _ => return Err(corrupt(format!("unknown encoding `{tag}`"))),
        };
        match info.get(FORMAT_VERSION_KEY).map(String::as_str) {
            Some(FORMAT_VERSION) => {}
            other => {
                return Err(corrupt(format!(
                    "unsupported format version {other:?}, expected {FORMAT_VERSION}"
                )))
            }
        }

        let config = info
            .get(MODEL_CONFIG_KEY)
            .ok_or_else(|| corrupt(format!("missing `{MODEL_CONFIG_KEY}`")))?;
        let architecture: Architecture = serde_json::from_str(config)
            .map_err(|err| corrupt(format!("invalid model config: {err}")))?;

        let training_config = match info.get(TRAINING_CONFIG_KEY) {
            Some(raw) if with_training_state => Some(
                serde_json::from_str(raw)
                    .map_err(|err| corrupt(format!("invalid training config: {err}")))?,
            ),
            _ => None,
        };

        let tensors = SafeTensors::deserialize(buffer)
            .map_err(|err| corrupt(format!("unreadable tensors: {err}")))?;
        let mut out = BTreeMap::new();
        for (name, view) in tensors.tensors() {
            if !with_training_state && name.starts_with(OPTIMIZER_PREFIX) {
                continue;
            }
            let dtype = from_safetensors_dtype(view.dtype())
                .ok_or_else(|| corrupt(format!("tensor `{name}` has unsupported dtype {:?}", view.dtype())))?;
            let tensor = Tensor::from_bytes(
                dtype,
                Shape::from_slice(view.shape()),
                Bytes::copy_from_slice(view.data()),
            )
            .map_err(|err| corrupt(format!("tensor `{name}`: {err:#}")))?;
            out.insert(name, tensor);
        }

        Ok(Self {
            encoding,
            architecture,
            training_config,
            tensors: out,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, WriteError> {
        let encode_err = |reason: String| WriteError::Encode {
            what: "model container",
            reason,
        };

        let mut info = HashMap::new();
        info.insert(FORMAT_KEY.to_string(), self.encoding.as_str().to_string());
        info.insert(FORMAT_VERSION_KEY.to_string(), FORMAT_VERSION.to_string());
        info.insert(
            MODEL_CONFIG_KEY.to_string(),
            serde_json::to_string(&self.architecture).map_err(|err| encode_err(err.to_string()))?,
        );
        if let Some(training) = &self.training_config {
            info.insert(
                TRAINING_CONFIG_KEY.to_string(),
                serde_json::to_string(training).map_err(|err| encode_err(err.to_string()))?,
            );
        }

        let views = self
            .tensors
            .iter()
            .map(|(name, tensor)| {
                TensorView::new(
                    to_safetensors_dtype(tensor.dtype),
                    tensor.shape.dims().to_vec(),
                    &tensor.bytes,
                )
                .map(|view| (name.as_str(), view))
                .map_err(|err| encode_err(format!("tensor `{name}`: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        safetensors::serialize(views, Some(info)).map_err(|err| encode_err(err.to_string()))
    }
}

fn from_safetensors_dtype(dtype: Dtype) -> Option<DType> {
    match dtype {
        Dtype::F32 => Some(DType::F32),
        Dtype::I32 => Some(DType::I32),
        Dtype::I8 => Some(DType::I8),
        Dtype::U8 => Some(DType::U8),
        _ => None,
    }
}

fn to_safetensors_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::F32 => Dtype::F32,
        DType::I32 => Dtype::I32,
        DType::I8 => Dtype::I8,
        DType::U8 => Dtype::U8,
    }
}
