use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use liteport_core::kernels::{self, FeatureMap, Window};
use liteport_core::{
    Activation, CustomOps, DType, Encoding, Hwc, InferenceModel, LoadError, LoaderCapabilities,
    ModelArtifact, ModelLoader, ModelSpec, Tensor, TensorSpec,
};
use tracing::info;

use crate::schema::{BuiltinOp, FlatModel, OpOptions};

/// One operator with its constants decoded and dequantized up front.
enum Step {
    Conv {
        input: usize,
        filter: Vec<f32>,
        out_channels: usize,
        bias: Option<Vec<f32>>,
        window: Window,
        activation: Activation,
        output: usize,
    },
    Depthwise {
        input: usize,
        filter: Vec<f32>,
        bias: Option<Vec<f32>>,
        window: Window,
        activation: Activation,
        output: usize,
    },
    BatchNorm {
        input: usize,
        gamma: Vec<f32>,
        beta: Vec<f32>,
        mean: Vec<f32>,
        variance: Vec<f32>,
        epsilon: f32,
        output: usize,
    },
    Activate {
        input: usize,
        activation: Activation,
        output: usize,
    },
    Add {
        lhs: usize,
        rhs: usize,
        activation: Activation,
        output: usize,
    },
    Concat {
        inputs: Vec<usize>,
        activation: Activation,
        output: usize,
    },
    MaxPool {
        input: usize,
        window: Window,
        activation: Activation,
        output: usize,
    },
    Resize {
        input: usize,
        size: [usize; 2],
        align_corners: bool,
        half_pixel_centers: bool,
        output: usize,
    },
}

/// CPU interpreter for flat models. The batch dimension of every activation
/// is taken from the inputs at call time.
pub struct FlatInterpreter {
    model: FlatModel,
    spec: ModelSpec,
    inputs: Vec<(usize, Hwc)>,
    outputs: Vec<usize>,
    steps: Vec<Step>,
}

fn index(i: i32) -> Result<usize> {
    usize::try_from(i).with_context(|| format!("tensor index {i} is negative"))
}

fn hwc_of(shape: &[usize]) -> Result<Hwc> {
    ensure!(shape.len() == 4, "expected NHWC activation, got shape {shape:?}");
    Ok(Hwc::new(shape[1], shape[2], shape[3]))
}

impl FlatInterpreter {
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let raw = std::fs::read(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LoadError::NotFound(path.to_path_buf())
            } else {
                LoadError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let corrupt = |reason: String| LoadError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };
        let model = FlatModel::parse(Bytes::from(raw)).map_err(|err| corrupt(err.to_string()))?;
        let interpreter = Self::new(model).map_err(|err| corrupt(format!("{err:#}")))?;
        info!(
            path = %path.display(),
            operators = interpreter.model.operators.len(),
            "loaded flat model"
        );
        Ok(interpreter)
    }

    pub fn new(model: FlatModel) -> Result<Self> {
        model.check_indices()?;
        let endpoint = |i: &i32| -> Result<(usize, TensorSpec, Hwc)> {
            let tensor = model.tensor(*i)?;
            ensure!(
                tensor.dtype == DType::F32 && tensor.buffer == 0,
                "graph endpoint `{}` must be a non-constant f32 tensor",
                tensor.name
            );
            let hwc = hwc_of(&tensor.shape)?;
            let spec = TensorSpec::nhwc(&tensor.name, hwc.height, hwc.width, hwc.channels);
            Ok((index(*i)?, spec, hwc))
        };
        let inputs = model.inputs.iter().map(endpoint).collect::<Result<Vec<_>>>()?;
        let outputs = model.outputs.iter().map(endpoint).collect::<Result<Vec<_>>>()?;

        let steps = model
            .operators
            .iter()
            .enumerate()
            .map(|(i, op)| {
                Self::prepare(&model, op).with_context(|| {
                    let name = model.opcode(op).map(|o| o.name()).unwrap_or("<invalid>");
                    format!("operator #{i} ({name})")
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            spec: ModelSpec {
                inputs: inputs.iter().map(|(_, spec, _)| spec.clone()).collect(),
                outputs: outputs.iter().map(|(_, spec, _)| spec.clone()).collect(),
            },
            inputs: inputs.iter().map(|(i, _, hwc)| (*i, *hwc)).collect(),
            outputs: outputs.iter().map(|(i, _, _)| *i).collect(),
            model,
            steps,
        })
    }

    pub fn model(&self) -> &FlatModel {
        &self.model
    }

    /// Constant operand as f32, dequantizing int8 data.
    fn constant_f32(model: &FlatModel, i: i32) -> Result<Vec<f32>> {
        let tensor = model.tensor(i)?;
        let data = model
            .constant(i)?
            .with_context(|| format!("tensor `{}` has no constant data", tensor.name))?;
        match (tensor.dtype, tensor.quantization) {
            (DType::F32, None) => data.to_f32(),
            (DType::I8, Some(q)) => Ok(data
                .to_i8()?
                .into_iter()
                .map(|v| (v as i32 - q.zero_point) as f32 * q.scale)
                .collect()),
            (dtype, q) => bail!(
                "unsupported constant `{}`: {} with quantization {q:?}",
                tensor.name,
                dtype.as_str()
            ),
        }
    }

    fn optional_f32(model: &FlatModel, i: i32) -> Result<Option<Vec<f32>>> {
        if i < 0 {
            Ok(None)
        } else {
            Self::constant_f32(model, i).map(Some)
        }
    }

    fn prepare(model: &FlatModel, op: &crate::schema::FlatOperator) -> Result<Step> {
        let code = model.opcode(op)?;
        let arg = |n: usize| -> Result<i32> {
            op.inputs
                .get(n)
                .copied()
                .with_context(|| format!("{code} is missing input {n}"))
        };
        ensure!(op.outputs.len() == 1, "{code} must have exactly one output");
        let output = index(op.outputs[0])?;
        let input = index(arg(0)?)?;

        let step = match (code, op.options) {
            (
                BuiltinOp::Conv2d,
                OpOptions::Conv2d {
                    padding,
                    stride_h,
                    stride_w,
                    activation,
                },
            ) => {
                let filter_shape = &model.tensor(arg(1)?)?.shape;
                ensure!(filter_shape.len() == 4, "conv filter must be OHWI");
                Step::Conv {
                    input,
                    filter: Self::constant_f32(model, arg(1)?)?,
                    out_channels: filter_shape[0],
                    bias: Self::optional_f32(model, arg(2).unwrap_or(-1))?,
                    window: Window {
                        kernel: [filter_shape[1], filter_shape[2]],
                        strides: [stride_h as usize, stride_w as usize],
                        padding,
                    },
                    activation: activation.activation(),
                    output,
                }
            }
            (
                BuiltinOp::DepthwiseConv2d,
                OpOptions::DepthwiseConv2d {
                    padding,
                    stride_h,
                    stride_w,
                    depth_multiplier,
                    activation,
                },
            ) => {
                ensure!(depth_multiplier == 1, "depth multiplier {depth_multiplier} is not supported");
                let filter_shape = &model.tensor(arg(1)?)?.shape;
                ensure!(
                    filter_shape.len() == 4 && filter_shape[0] == 1,
                    "depthwise filter must be [1, kh, kw, c]"
                );
                Step::Depthwise {
                    input,
                    filter: Self::constant_f32(model, arg(1)?)?,
                    bias: Self::optional_f32(model, arg(2).unwrap_or(-1))?,
                    window: Window {
                        kernel: [filter_shape[1], filter_shape[2]],
                        strides: [stride_h as usize, stride_w as usize],
                        padding,
                    },
                    activation: activation.activation(),
                    output,
                }
            }
            (BuiltinOp::BatchNorm, OpOptions::BatchNorm { epsilon }) => Step::BatchNorm {
                input,
                gamma: Self::constant_f32(model, arg(1)?)?,
                beta: Self::constant_f32(model, arg(2)?)?,
                mean: Self::constant_f32(model, arg(3)?)?,
                variance: Self::constant_f32(model, arg(4)?)?,
                epsilon,
                output,
            },
            (BuiltinOp::Relu | BuiltinOp::Relu6 | BuiltinOp::Logistic, _) => Step::Activate {
                input,
                activation: match code {
                    BuiltinOp::Relu => Activation::Relu,
                    BuiltinOp::Relu6 => Activation::Relu6,
                    _ => Activation::Sigmoid,
                },
                output,
            },
            (BuiltinOp::Add, OpOptions::Add { activation }) => Step::Add {
                lhs: input,
                rhs: index(arg(1)?)?,
                activation: activation.activation(),
                output,
            },
            (BuiltinOp::Concatenation, OpOptions::Concatenation { axis, activation }) => {
                ensure!(axis == 3 || axis == -1, "only channel concatenation is supported, got axis {axis}");
                Step::Concat {
                    inputs: op.inputs.iter().map(|i| index(*i)).collect::<Result<_>>()?,
                    activation: activation.activation(),
                    output,
                }
            }
            (
                BuiltinOp::MaxPool2d,
                OpOptions::Pool2d {
                    padding,
                    stride_h,
                    stride_w,
                    filter_h,
                    filter_w,
                    activation,
                },
            ) => Step::MaxPool {
                input,
                window: Window {
                    kernel: [filter_h as usize, filter_w as usize],
                    strides: [stride_h as usize, stride_w as usize],
                    padding,
                },
                activation: activation.activation(),
                output,
            },
            (
                BuiltinOp::ResizeBilinear,
                OpOptions::ResizeBilinear {
                    align_corners,
                    half_pixel_centers,
                },
            ) => {
                let size = model
                    .constant(arg(1)?)?
                    .context("resize size must be a constant")?
                    .to_i32()?;
                ensure!(size.len() == 2, "resize size must hold [height, width]");
                let dims = [usize::try_from(size[0])?, usize::try_from(size[1])?];
                let out_shape = &model.tensor(op.outputs[0])?.shape;
                ensure!(
                    out_shape.len() == 4 && out_shape[1..3] == dims[..],
                    "resize size {dims:?} disagrees with output shape {out_shape:?}"
                );
                Step::Resize {
                    input,
                    size: dims,
                    align_corners,
                    half_pixel_centers,
                    output,
                }
            }
            (code, options) => bail!("{code} cannot take options {options:?}"),
        };
        Ok(step)
    }
}

impl InferenceModel for FlatInterpreter {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        ensure!(
            inputs.len() == self.inputs.len(),
            "expected {} inputs, got {}",
            self.inputs.len(),
            inputs.len()
        );

        let mut values: Vec<Option<FeatureMap>> = vec![None; self.model.tensors.len()];
        for ((slot, expected), tensor) in self.inputs.iter().zip(&inputs) {
            let fm = FeatureMap::from_tensor(tensor)?;
            ensure!(
                fm.hwc == *expected,
                "input `{}` has shape {:?}, expected {:?}",
                self.model.tensors[*slot].name,
                fm.hwc,
                expected
            );
            values[*slot] = Some(fm);
        }

        let tensors = &self.model.tensors;
        let get = |values: &[Option<FeatureMap>], i: usize| -> Result<FeatureMap> {
            values[i]
                .clone()
                .with_context(|| format!("tensor `{}` read before it was written", tensors[i].name))
        };
        for step in &self.steps {
            let (output, value) = match step {
                Step::Conv {
                    input,
                    filter,
                    out_channels,
                    bias,
                    window,
                    activation,
                    output,
                } => {
                    let x = get(&values, *input)?;
                    let y = kernels::conv2d(&x, filter, *out_channels, bias.as_deref(), *window, *activation)?;
                    (*output, y)
                }
                Step::Depthwise {
                    input,
                    filter,
                    bias,
                    window,
                    activation,
                    output,
                } => {
                    let x = get(&values, *input)?;
                    let y = kernels::depthwise_conv2d(&x, filter, bias.as_deref(), *window, *activation)?;
                    (*output, y)
                }
                Step::BatchNorm {
                    input,
                    gamma,
                    beta,
                    mean,
                    variance,
                    epsilon,
                    output,
                } => {
                    let x = get(&values, *input)?;
                    (*output, kernels::batch_norm(&x, gamma, beta, mean, variance, *epsilon)?)
                }
                Step::Activate {
                    input,
                    activation,
                    output,
                } => (*output, kernels::activate(&get(&values, *input)?, *activation)),
                Step::Add {
                    lhs,
                    rhs,
                    activation,
                    output,
                } => {
                    let a = get(&values, *lhs)?;
                    let b = get(&values, *rhs)?;
                    (*output, kernels::add(&a, &b, *activation)?)
                }
                Step::Concat {
                    inputs,
                    activation,
                    output,
                } => {
                    let parts = inputs
                        .iter()
                        .map(|i| get(&values, *i))
                        .collect::<Result<Vec<_>>>()?;
                    let refs = parts.iter().collect::<Vec<_>>();
                    let y = kernels::concat_channels(&refs)?;
                    (*output, kernels::activate(&y, *activation))
                }
                Step::MaxPool {
                    input,
                    window,
                    activation,
                    output,
                } => {
                    let y = kernels::max_pool2d(&get(&values, *input)?, *window)?;
                    (*output, kernels::activate(&y, *activation))
                }
                Step::Resize {
                    input,
                    size,
                    align_corners,
                    half_pixel_centers,
                    output,
                } => {
                    let x = get(&values, *input)?;
                    let y = kernels::resize_bilinear(&x, *size, *align_corners, *half_pixel_centers)?;
                    (*output, y)
                }
            };
            values[output] = Some(value);
        }

        self.outputs
            .iter()
            .map(|i| get(&values, *i)?.to_tensor())
            .collect()
    }
}

/// Opens flat files as [`FlatInterpreter`]s.
pub struct FlatLoader;

impl FlatLoader {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FlatLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelLoader for FlatLoader {
    type Model = FlatInterpreter;

    fn name(&self) -> &'static str {
        "flat"
    }

    fn load(&self, artifact: &ModelArtifact, _ops: &CustomOps) -> Result<Self::Model, LoadError> {
        if artifact.encoding() != Encoding::Flat {
            return Err(LoadError::WrongEncoding {
                path: artifact.path().to_path_buf(),
                expected: Encoding::Flat,
                found: artifact.encoding(),
            });
        }
        FlatInterpreter::open(artifact.path())
    }

    fn capabilities(&self) -> LoaderCapabilities {
        LoaderCapabilities {
            accepts: &[Encoding::Flat],
            reads_training_state: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Converter, ConverterOptions};
    use liteport_checkpoint::fixtures;
    use tempfile::TempDir;

    fn resize_flat(size: usize) -> FlatModel {
        Converter::new(CustomOps::standard(None), ConverterOptions::default())
            .convert_model(&fixtures::resize_net(size))
            .unwrap()
    }

    #[test]
    fn missing_flat_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let artifact = ModelArtifact::FlatPath(dir.path().join("absent.lpfb"));
        let err = FlatLoader::new()
            .load(&artifact, &CustomOps::new())
            .err()
            .expect("load should fail");
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[test]
    fn checkpoint_artifact_is_wrong_encoding() {
        let artifact = ModelArtifact::CheckpointPath("model.ckpt".into());
        let err = FlatLoader::new()
            .load(&artifact, &CustomOps::new())
            .err()
            .expect("load should fail");
        assert!(matches!(
            err,
            LoadError::WrongEncoding {
                expected: Encoding::Flat,
                found: Encoding::Checkpoint,
                ..
            }
        ));
    }

    #[test]
    fn garbage_flat_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.lpfb");
        std::fs::write(&path, b"LPFB\x01\x00\x00\x00\xff\xff").unwrap();
        let err = FlatInterpreter::open(&path).err().expect("open should fail");
        assert!(matches!(err, LoadError::Corrupt { .. }));
    }

    #[test]
    fn dangling_operator_index_is_an_error() {
        let mut model = resize_flat(4);
        model.operators[0].inputs[0] = 99;
        let err = FlatInterpreter::new(model).err().expect("new should fail");
        assert!(format!("{err:#}").contains("99"), "{err:#}");
    }

    #[test]
    fn resize_size_must_match_output_shape() {
        let mut model = resize_flat(4);
        let out = model.operators[0].outputs[0] as usize;
        model.tensors[out].shape = vec![1, 5, 5, 3];
        assert!(FlatInterpreter::new(model).is_err());
    }

    #[test]
    fn oversized_resize_fails_inference_without_aborting() -> anyhow::Result<()> {
        let mut interpreter = FlatInterpreter::new(resize_flat(i32::MAX as usize))?;
        let input = interpreter.spec().inputs[0].probe(1, 0)?;
        let err = interpreter.infer(vec![input]).unwrap_err();
        assert!(format!("{err:#}").contains("allocate"), "{err:#}");
        Ok(())
    }
}
