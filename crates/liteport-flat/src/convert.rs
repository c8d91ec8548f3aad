use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use bytes::Bytes;
use liteport_checkpoint::read_model;
use liteport_core::kernels::hwio_to_ohwi;
use liteport_core::{
    Activation, ConversionError, CustomOps, DType, Encoding, GraphPlan, Hwc, LayerDef, LayerKind,
    LoadError, Model, Primitive, Tensor,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::schema::{
    BuiltinOp, FlatModel, FlatOperator, FlatTensor, FusedActivation, OpOptions, Quantization,
    FORMAT_VERSION,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quantize {
    #[default]
    None,
    /// Symmetric per-tensor int8 for convolution kernels.
    Int8Weights,
}

impl Quantize {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quantize::None => "none",
            Quantize::Int8Weights => "int8-weights",
        }
    }
}

impl fmt::Display for Quantize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quantize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Quantize::None),
            "int8-weights" => Ok(Quantize::Int8Weights),
            other => Err(format!(
                "unknown quantization `{other}` (expected `none` or `int8-weights`)"
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConverterOptions {
    pub quantize: Quantize,
    pub description: String,
}

impl Default for ConverterOptions {
    fn default() -> Self {
        Self {
            quantize: Quantize::None,
            description: "liteport flat model".to_string(),
        }
    }
}

/// Lowers intermediate files to the flat format.
#[derive(Clone, Debug)]
pub struct Converter {
    ops: CustomOps,
    options: ConverterOptions,
}

impl Converter {
    pub fn new(ops: CustomOps, options: ConverterOptions) -> Self {
        Self { ops, options }
    }

    /// Convert an intermediate file into flat-format bytes. Checkpoints and
    /// flat files are rejected by encoding.
    pub fn convert_file(&self, path: &Path) -> Result<Bytes, ConversionError> {
        let (model, encoding) = read_model(path, &self.ops).map_err(|err| match err {
            LoadError::UnresolvedOperation {
                layer, function, ..
            } => ConversionError::UnresolvedOperation { layer, function },
            LoadError::WrongEncoding { found, .. } => ConversionError::UnexpectedEncoding {
                path: path.to_path_buf(),
                expected: Encoding::Intermediate,
                found,
            },
            other => ConversionError::Input(other),
        })?;
        if encoding != Encoding::Intermediate {
            return Err(ConversionError::UnexpectedEncoding {
                path: path.to_path_buf(),
                expected: Encoding::Intermediate,
                found: encoding,
            });
        }

        let flat = self.convert_model(&model)?;
        let bytes = flat.to_bytes();
        info!(
            path = %path.display(),
            operators = flat.operators.len(),
            tensors = flat.tensors.len(),
            bytes = bytes.len(),
            quantize = %self.options.quantize,
            "converted model"
        );
        Ok(bytes)
    }

    pub fn convert_model(&self, model: &Model) -> Result<FlatModel, ConversionError> {
        let plan = model.validate(&self.ops)?;
        let mut lowering = Lowering::new(model, &plan, self.options.quantize);

        for def in &model.architecture.layers {
            lowering.lower(def)?;
        }

        let inputs = model
            .architecture
            .inputs
            .iter()
            .map(|name| lowering.value(name))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = model
            .architecture
            .outputs
            .iter()
            .map(|name| lowering.value(name))
            .collect::<Result<Vec<_>, _>>()?;
        for tensor in &lowering.tensors {
            for dim in &tensor.shape {
                narrow::<u32>(&tensor.name, "dimension", *dim)?;
            }
        }

        Ok(FlatModel {
            version: FORMAT_VERSION,
            description: self.options.description.clone(),
            metadata: vec![
                (
                    "producer".to_string(),
                    format!("liteport {}", env!("CARGO_PKG_VERSION")),
                ),
                ("source_model".to_string(), model.architecture.name.clone()),
                (
                    "weight_quantization".to_string(),
                    self.options.quantize.to_string(),
                ),
            ],
            operator_codes: lowering.codes,
            tensors: lowering.tensors,
            operators: lowering.operators,
            inputs,
            outputs,
            buffers: lowering.buffers,
        })
    }
}

fn fused(activation: Activation) -> (FusedActivation, bool) {
    match activation {
        Activation::Linear => (FusedActivation::None, false),
        Activation::Relu => (FusedActivation::Relu, false),
        Activation::Relu6 => (FusedActivation::Relu6, false),
        Activation::Sigmoid => (FusedActivation::None, true),
    }
}

/// Narrow a layer parameter to the width the flat format stores it in.
fn narrow<T: TryFrom<usize>>(layer: &str, what: &str, value: usize) -> Result<T, ConversionError> {
    T::try_from(value).map_err(|_| ConversionError::UnsupportedOperation {
        layer: layer.to_string(),
        detail: format!("{what} {value} exceeds the flat format range"),
    })
}

/// Symmetric int8: `scale = max|w| / 127`, zero point 0.
fn quantize_symmetric(values: &[f32]) -> (Vec<u8>, Quantization) {
    let max_abs = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
    let bytes = values
        .iter()
        .map(|v| (v / scale).round().clamp(-127.0, 127.0) as i8 as u8)
        .collect();
    (
        bytes,
        Quantization {
            scale,
            zero_point: 0,
        },
    )
}

fn f32_bytes(values: &[f32]) -> Bytes {
    Bytes::from(values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>())
}

struct Lowering<'a> {
    model: &'a Model,
    plan: &'a GraphPlan,
    quantize: Quantize,
    codes: Vec<BuiltinOp>,
    tensors: Vec<FlatTensor>,
    operators: Vec<FlatOperator>,
    buffers: Vec<Bytes>,
    /// Tensor holding each layer's output.
    values: HashMap<String, i32>,
}

impl<'a> Lowering<'a> {
    fn new(model: &'a Model, plan: &'a GraphPlan, quantize: Quantize) -> Self {
        Self {
            model,
            plan,
            quantize,
            codes: Vec::new(),
            tensors: Vec::new(),
            operators: Vec::new(),
            // buffer 0 is the empty sentinel for non-constant tensors
            buffers: vec![Bytes::new()],
            values: HashMap::new(),
        }
    }

    fn value(&self, layer: &str) -> Result<i32, ConversionError> {
        self.values
            .get(layer)
            .copied()
            .ok_or_else(|| ConversionError::UnsupportedOperation {
                layer: layer.to_string(),
                detail: "output was never produced".to_string(),
            })
    }

    fn shape(&self, layer: &str) -> Result<Hwc, ConversionError> {
        self.plan
            .shape(layer)
            .ok_or_else(|| ConversionError::UnsupportedOperation {
                layer: layer.to_string(),
                detail: "no inferred shape".to_string(),
            })
    }

    fn weight(&self, layer: &str, param: &str) -> Result<Vec<f32>, ConversionError> {
        let missing = || ConversionError::UnsupportedOperation {
            layer: layer.to_string(),
            detail: format!("unreadable weight `{param}`"),
        };
        self.model
            .weight(layer, param)
            .ok_or_else(missing)
            .and_then(|t: &Tensor| t.to_f32().map_err(|_| missing()))
    }

    fn push_tensor(&mut self, tensor: FlatTensor) -> i32 {
        self.tensors.push(tensor);
        (self.tensors.len() - 1) as i32
    }

    fn activation(&mut self, name: String, hwc: Hwc) -> i32 {
        self.push_tensor(FlatTensor {
            name,
            dtype: DType::F32,
            shape: vec![1, hwc.height, hwc.width, hwc.channels],
            buffer: 0,
            quantization: None,
        })
    }

    fn constant(
        &mut self,
        name: String,
        dtype: DType,
        shape: Vec<usize>,
        data: Bytes,
        quantization: Option<Quantization>,
    ) -> i32 {
        self.buffers.push(data);
        let buffer = (self.buffers.len() - 1) as u32;
        self.push_tensor(FlatTensor {
            name,
            dtype,
            shape,
            buffer,
            quantization,
        })
    }

    fn f32_constant(&mut self, name: String, shape: Vec<usize>, values: &[f32]) -> i32 {
        self.constant(name, DType::F32, shape, f32_bytes(values), None)
    }

    /// Convolution kernel, int8 when weight quantization is enabled.
    fn kernel_constant(&mut self, name: String, shape: Vec<usize>, values: &[f32]) -> i32 {
        match self.quantize {
            Quantize::None => self.f32_constant(name, shape, values),
            Quantize::Int8Weights => {
                let (data, quantization) = quantize_symmetric(values);
                self.constant(name, DType::I8, shape, Bytes::from(data), Some(quantization))
            }
        }
    }

    fn bias(&mut self, layer: &str, use_bias: bool, len: usize) -> Result<i32, ConversionError> {
        if !use_bias {
            return Ok(-1);
        }
        let values = self.weight(layer, "bias")?;
        Ok(self.f32_constant(format!("{layer}/bias"), vec![len], &values))
    }

    fn push_op(&mut self, op: BuiltinOp, inputs: Vec<i32>, outputs: Vec<i32>, options: OpOptions) {
        let opcode_index = match self.codes.iter().position(|c| *c == op) {
            Some(index) => index,
            None => {
                self.codes.push(op);
                self.codes.len() - 1
            }
        } as u32;
        self.operators.push(FlatOperator {
            opcode_index,
            inputs,
            outputs,
            options,
        });
    }

    /// Output tensor for a layer whose activation may need a trailing
    /// `LOGISTIC`: returns the tensor the main operator writes to.
    fn fused_output(&mut self, layer: &str, hwc: Hwc, sigmoid: bool) -> i32 {
        let pre = if sigmoid {
            format!("{layer}/pre_activation")
        } else {
            layer.to_string()
        };
        self.activation(pre, hwc)
    }

    fn finish(&mut self, layer: &str, hwc: Hwc, produced: i32, sigmoid: bool) {
        let out = if sigmoid {
            let out = self.activation(layer.to_string(), hwc);
            self.push_op(BuiltinOp::Logistic, vec![produced], vec![out], OpOptions::None);
            out
        } else {
            produced
        };
        self.values.insert(layer.to_string(), out);
    }

    fn lower(&mut self, def: &LayerDef) -> Result<(), ConversionError> {
        let layer = def.name.as_str();
        let hwc = self.shape(layer)?;
        let args = def
            .inbound
            .iter()
            .map(|name| self.value(name))
            .collect::<Result<Vec<_>, _>>()?;

        match &def.layer {
            LayerKind::Input { .. } => {
                let index = self.activation(layer.to_string(), hwc);
                self.values.insert(layer.to_string(), index);
            }
            LayerKind::Conv2D {
                filters,
                kernel_size,
                strides,
                padding,
                activation,
                use_bias,
            } => {
                let input = self.shape(&def.inbound[0])?;
                let [kh, kw] = *kernel_size;
                let hwio = self.weight(layer, "kernel")?;
                let ohwi = hwio_to_ohwi(&hwio, [kh, kw, input.channels, *filters]).map_err(|err| {
                    ConversionError::UnsupportedOperation {
                        layer: layer.to_string(),
                        detail: format!("{err:#}"),
                    }
                })?;
                let filter = self.kernel_constant(
                    format!("{layer}/kernel"),
                    vec![*filters, kh, kw, input.channels],
                    &ohwi,
                );
                let bias = self.bias(layer, *use_bias, *filters)?;
                let (fused, sigmoid) = fused(*activation);
                let out = self.fused_output(layer, hwc, sigmoid);
                self.push_op(
                    BuiltinOp::Conv2d,
                    vec![args[0], filter, bias],
                    vec![out],
                    OpOptions::Conv2d {
                        padding: *padding,
                        stride_h: narrow(layer, "stride", strides[0])?,
                        stride_w: narrow(layer, "stride", strides[1])?,
                        activation: fused,
                    },
                );
                self.finish(layer, hwc, out, sigmoid);
            }
            LayerKind::DepthwiseConv2D {
                kernel_size,
                strides,
                padding,
                activation,
                use_bias,
            } => {
                let [kh, kw] = *kernel_size;
                // [kh, kw, c, 1] and [1, kh, kw, c] share element order
                let values = self.weight(layer, "depthwise_kernel")?;
                let filter = self.kernel_constant(
                    format!("{layer}/depthwise_kernel"),
                    vec![1, kh, kw, hwc.channels],
                    &values,
                );
                let bias = self.bias(layer, *use_bias, hwc.channels)?;
                let (fused, sigmoid) = fused(*activation);
                let out = self.fused_output(layer, hwc, sigmoid);
                self.push_op(
                    BuiltinOp::DepthwiseConv2d,
                    vec![args[0], filter, bias],
                    vec![out],
                    OpOptions::DepthwiseConv2d {
                        padding: *padding,
                        stride_h: narrow(layer, "stride", strides[0])?,
                        stride_w: narrow(layer, "stride", strides[1])?,
                        depth_multiplier: 1,
                        activation: fused,
                    },
                );
                self.finish(layer, hwc, out, sigmoid);
            }
            LayerKind::BatchNormalization { epsilon } => {
                let mut inputs = vec![args[0]];
                for param in ["gamma", "beta", "moving_mean", "moving_variance"] {
                    let values = self.weight(layer, param)?;
                    inputs.push(self.f32_constant(
                        format!("{layer}/{param}"),
                        vec![hwc.channels],
                        &values,
                    ));
                }
                let out = self.activation(layer.to_string(), hwc);
                self.push_op(
                    BuiltinOp::BatchNorm,
                    inputs,
                    vec![out],
                    OpOptions::BatchNorm { epsilon: *epsilon },
                );
                self.values.insert(layer.to_string(), out);
            }
            LayerKind::Activation { activation } => {
                let op = match activation {
                    Activation::Linear => {
                        self.values.insert(layer.to_string(), args[0]);
                        debug!(layer, "elided linear activation");
                        return Ok(());
                    }
                    Activation::Relu => BuiltinOp::Relu,
                    Activation::Relu6 => BuiltinOp::Relu6,
                    Activation::Sigmoid => BuiltinOp::Logistic,
                };
                let out = self.activation(layer.to_string(), hwc);
                self.push_op(op, vec![args[0]], vec![out], OpOptions::None);
                self.values.insert(layer.to_string(), out);
            }
            LayerKind::Add => {
                let mut acc = args[0];
                for (i, rhs) in args[1..].iter().enumerate() {
                    let out = if i + 2 == args.len() {
                        self.activation(layer.to_string(), hwc)
                    } else {
                        self.activation(format!("{layer}/partial_{i}"), hwc)
                    };
                    self.push_op(
                        BuiltinOp::Add,
                        vec![acc, *rhs],
                        vec![out],
                        OpOptions::Add {
                            activation: FusedActivation::None,
                        },
                    );
                    acc = out;
                }
                self.values.insert(layer.to_string(), acc);
            }
            LayerKind::Concatenate => {
                let out = self.activation(layer.to_string(), hwc);
                self.push_op(
                    BuiltinOp::Concatenation,
                    args,
                    vec![out],
                    OpOptions::Concatenation {
                        axis: 3,
                        activation: FusedActivation::None,
                    },
                );
                self.values.insert(layer.to_string(), out);
            }
            LayerKind::MaxPooling2D {
                pool_size,
                strides,
                padding,
            } => {
                let strides = strides.unwrap_or(*pool_size);
                let out = self.activation(layer.to_string(), hwc);
                self.push_op(
                    BuiltinOp::MaxPool2d,
                    vec![args[0]],
                    vec![out],
                    OpOptions::Pool2d {
                        padding: *padding,
                        stride_h: narrow(layer, "stride", strides[0])?,
                        stride_w: narrow(layer, "stride", strides[1])?,
                        filter_h: narrow(layer, "pool size", pool_size[0])?,
                        filter_w: narrow(layer, "pool size", pool_size[1])?,
                        activation: FusedActivation::None,
                    },
                );
                self.values.insert(layer.to_string(), out);
            }
            LayerKind::Custom { function, .. } => {
                let primitive = self.plan.primitives.get(layer).copied().ok_or_else(|| {
                    ConversionError::UnresolvedOperation {
                        layer: layer.to_string(),
                        function: function.clone(),
                    }
                })?;
                match primitive {
                    Primitive::ResizeBilinear {
                        size,
                        align_corners,
                        half_pixel_centers,
                    } => {
                        if align_corners && half_pixel_centers {
                            return Err(ConversionError::UnsupportedOperation {
                                layer: layer.to_string(),
                                detail: "RESIZE_BILINEAR with both align_corners and half_pixel_centers"
                                    .to_string(),
                            });
                        }
                        let size_values: [i32; 2] = [
                            narrow(layer, "resize size", size[0])?,
                            narrow(layer, "resize size", size[1])?,
                        ];
                        let size_tensor = self.constant(
                            format!("{layer}/size"),
                            DType::I32,
                            vec![2],
                            Bytes::from(
                                size_values
                                    .iter()
                                    .flat_map(|v| v.to_le_bytes())
                                    .collect::<Vec<u8>>(),
                            ),
                            None,
                        );
                        let out = self.activation(layer.to_string(), hwc);
                        self.push_op(
                            BuiltinOp::ResizeBilinear,
                            vec![args[0], size_tensor],
                            vec![out],
                            OpOptions::ResizeBilinear {
                                align_corners,
                                half_pixel_centers,
                            },
                        );
                        self.values.insert(layer.to_string(), out);
                    }
                }
            }
        }

        debug!(
            layer,
            class = def.layer.class_name(),
            operators = self.operators.len(),
            "lowered layer"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liteport_checkpoint::fixtures;

    #[test]
    fn quantize_parses_cli_spelling() {
        assert_eq!("none".parse::<Quantize>(), Ok(Quantize::None));
        assert_eq!("int8-weights".parse::<Quantize>(), Ok(Quantize::Int8Weights));
        assert!("int4".parse::<Quantize>().is_err());
        assert_eq!(Quantize::Int8Weights.to_string(), "int8-weights");
    }

    #[test]
    fn symmetric_quantization_hits_both_ends() {
        let (data, q) = quantize_symmetric(&[-2.0, 0.0, 1.5, 2.0]);
        assert_eq!(q.zero_point, 0);
        assert!((q.scale - 2.0 / 127.0).abs() < 1e-7);
        let values: Vec<i8> = data.iter().map(|b| *b as i8).collect();
        assert_eq!(values, vec![-127, 0, 95, 127]);

        let (_, zero) = quantize_symmetric(&[0.0; 4]);
        assert_eq!(zero.scale, 1.0);
    }

    #[test]
    fn slim_net_lowers_every_layer_kind() -> anyhow::Result<()> {
        let converter = Converter::new(CustomOps::standard(None), ConverterOptions::default());
        let flat = converter.convert_model(&fixtures::slim_net())?;

        let count = |op| flat.operators_of(op).count();
        assert_eq!(count(BuiltinOp::Conv2d), 4);
        assert_eq!(count(BuiltinOp::DepthwiseConv2d), 1);
        assert_eq!(count(BuiltinOp::BatchNorm), 1);
        assert_eq!(count(BuiltinOp::Relu6), 1);
        assert_eq!(count(BuiltinOp::Add), 1);
        assert_eq!(count(BuiltinOp::MaxPool2d), 1);
        assert_eq!(count(BuiltinOp::Concatenation), 1);
        assert_eq!(count(BuiltinOp::ResizeBilinear), 1);
        // sigmoid conv "gate" plus the "mask" activation
        assert_eq!(count(BuiltinOp::Logistic), 2);

        let head = flat
            .tensors
            .iter()
            .find(|t| t.name == "head/kernel")
            .expect("head kernel tensor");
        // 3x3 conv from 12 merged channels to 2, stored OHWI
        assert_eq!(head.shape, vec![2, 3, 3, 12]);
        assert_eq!(flat.metadata_value("source_model"), Some("slim-net-mini"));
        assert_eq!(flat.metadata_value("weight_quantization"), Some("none"));
        Ok(())
    }

    #[test]
    fn multi_input_add_folds_left() -> anyhow::Result<()> {
        let mut model = fixtures::resize_net(4);
        model.architecture.layers.push(LayerDef::new(
            "sum",
            LayerKind::Add,
            &["resize", "resize", "resize"],
        ));
        model.architecture.outputs = vec!["sum".to_string()];

        let converter = Converter::new(CustomOps::standard(None), ConverterOptions::default());
        let flat = converter.convert_model(&model)?;
        let adds: Vec<_> = flat.operators_of(BuiltinOp::Add).collect();
        assert_eq!(adds.len(), 2);
        assert_eq!(adds[1].inputs[0], adds[0].outputs[0]);
        assert_eq!(flat.tensor(adds[1].outputs[0])?.name, "sum");
        Ok(())
    }

    #[test]
    fn unregistered_resize_is_unresolved() {
        let converter = Converter::new(CustomOps::new(), ConverterOptions::default());
        let err = converter.convert_model(&fixtures::resize_net(157)).unwrap_err();
        assert!(matches!(err, ConversionError::UnresolvedOperation { .. }));
    }

    #[test]
    fn resize_size_beyond_i32_is_rejected() {
        let converter = Converter::new(CustomOps::standard(None), ConverterOptions::default());
        let err = converter
            .convert_model(&fixtures::resize_net(3_000_000_000))
            .unwrap_err();
        match err {
            ConversionError::UnsupportedOperation { layer, detail } => {
                assert_eq!(layer, "resize");
                assert!(detail.contains("3000000000"), "{detail}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn largest_i32_resize_size_is_kept_exactly() -> anyhow::Result<()> {
        let size = i32::MAX as usize;
        let converter = Converter::new(CustomOps::standard(None), ConverterOptions::default());
        let flat = converter.convert_model(&fixtures::resize_net(size))?;
        let resize = flat
            .operators_of(BuiltinOp::ResizeBilinear)
            .next()
            .expect("resize operator");
        let tensor = flat.constant(resize.inputs[1])?.expect("constant size");
        assert_eq!(tensor.to_i32()?, vec![i32::MAX, i32::MAX]);
        Ok(())
    }
}
