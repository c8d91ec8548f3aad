//! In-memory model artifact: architecture, trained parameters and the shape
//! plan derived from them.
//!
//! Layers are stored in topological order, Keras style: every inbound
//! reference must name a layer that appears earlier in the list. All
//! activations are NHWC with an implicit batch dimension.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{CustomOps, GraphError, ModelSpec, Primitive, Tensor, TensorSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

impl Padding {
    /// Output length along one axis, `None` when the window does not fit.
    pub fn output_len(&self, input: usize, kernel: usize, stride: usize) -> Option<usize> {
        match self {
            Padding::Same => Some(input.div_ceil(stride)),
            Padding::Valid => {
                if kernel > input {
                    None
                } else {
                    Some((input - kernel) / stride + 1)
                }
            }
        }
    }

    /// Zero rows/columns inserted before the first input element. Any odd
    /// remainder of the total padding goes after the last element.
    pub fn pad_before(&self, input: usize, kernel: usize, stride: usize) -> usize {
        match self {
            Padding::Valid => 0,
            Padding::Same => {
                let out = input.div_ceil(stride);
                let total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(input);
                total / 2
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Relu6,
    Sigmoid,
}

impl Activation {
    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Activation::Linear => x,
            Activation::Relu => x.max(0.0),
            Activation::Relu6 => x.clamp(0.0, 6.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

fn unit_strides() -> [usize; 2] {
    [1, 1]
}

fn enabled() -> bool {
    true
}

fn default_epsilon() -> f32 {
    1e-3
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum LayerKind {
    #[serde(rename = "InputLayer")]
    Input { shape: [usize; 3] },
    Conv2D {
        filters: usize,
        kernel_size: [usize; 2],
        #[serde(default = "unit_strides")]
        strides: [usize; 2],
        #[serde(default)]
        padding: Padding,
        #[serde(default)]
        activation: Activation,
        #[serde(default = "enabled")]
        use_bias: bool,
    },
    DepthwiseConv2D {
        kernel_size: [usize; 2],
        #[serde(default = "unit_strides")]
        strides: [usize; 2],
        #[serde(default)]
        padding: Padding,
        #[serde(default)]
        activation: Activation,
        #[serde(default = "enabled")]
        use_bias: bool,
    },
    BatchNormalization {
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
    Activation { activation: Activation },
    Add,
    Concatenate,
    MaxPooling2D {
        pool_size: [usize; 2],
        /// Defaults to `pool_size`.
        #[serde(default)]
        strides: Option<[usize; 2]>,
        #[serde(default)]
        padding: Padding,
    },
    /// A named custom operation, resolved against [`CustomOps`].
    #[serde(rename = "Lambda")]
    Custom {
        function: String,
        #[serde(default)]
        arguments: Json,
    },
}

impl LayerKind {
    pub fn class_name(&self) -> &'static str {
        match self {
            LayerKind::Input { .. } => "InputLayer",
            LayerKind::Conv2D { .. } => "Conv2D",
            LayerKind::DepthwiseConv2D { .. } => "DepthwiseConv2D",
            LayerKind::BatchNormalization { .. } => "BatchNormalization",
            LayerKind::Activation { .. } => "Activation",
            LayerKind::Add => "Add",
            LayerKind::Concatenate => "Concatenate",
            LayerKind::MaxPooling2D { .. } => "MaxPooling2D",
            LayerKind::Custom { .. } => "Lambda",
        }
    }

    /// Parameter names and shapes this layer needs, given its input shape.
    pub fn expected_weights(&self, input: Hwc) -> Vec<(&'static str, Vec<usize>)> {
        match self {
            LayerKind::Conv2D {
                filters,
                kernel_size,
                use_bias,
                ..
            } => {
                let mut weights = vec![(
                    "kernel",
                    vec![kernel_size[0], kernel_size[1], input.channels, *filters],
                )];
                if *use_bias {
                    weights.push(("bias", vec![*filters]));
                }
                weights
            }
            LayerKind::DepthwiseConv2D {
                kernel_size,
                use_bias,
                ..
            } => {
                let mut weights = vec![(
                    "depthwise_kernel",
                    vec![kernel_size[0], kernel_size[1], input.channels, 1],
                )];
                if *use_bias {
                    weights.push(("bias", vec![input.channels]));
                }
                weights
            }
            LayerKind::BatchNormalization { .. } => ["gamma", "beta", "moving_mean", "moving_variance"]
                .into_iter()
                .map(|name| (name, vec![input.channels]))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerDef {
    pub name: String,
    pub layer: LayerKind,
    #[serde(default)]
    pub inbound: Vec<String>,
}

impl LayerDef {
    pub fn new(name: &str, layer: LayerKind, inbound: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            layer,
            inbound: inbound.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub name: String,
    pub layers: Vec<LayerDef>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Spatial shape of one activation, batch dimension excluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Hwc {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl Hwc {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }
}

/// Output shape of every layer plus the primitive each custom layer lowers to.
#[derive(Clone, Debug, Default)]
pub struct GraphPlan {
    pub shapes: HashMap<String, Hwc>,
    pub primitives: HashMap<String, Primitive>,
}

impl GraphPlan {
    pub fn shape(&self, layer: &str) -> Option<Hwc> {
        self.shapes.get(layer).copied()
    }

    pub fn model_spec(&self, architecture: &Architecture) -> ModelSpec {
        let describe = |names: &[String]| -> Vec<TensorSpec> {
            names
                .iter()
                .filter_map(|name| {
                    self.shape(name)
                        .map(|s| TensorSpec::nhwc(name, s.height, s.width, s.channels))
                })
                .collect()
        };
        ModelSpec {
            inputs: describe(&architecture.inputs),
            outputs: describe(&architecture.outputs),
        }
    }
}

impl Architecture {
    pub fn layer(&self, name: &str) -> Option<&LayerDef> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Validate structure and infer every layer's output shape.
    pub fn plan(&self, ops: &CustomOps) -> Result<GraphPlan, GraphError> {
        if self.layers.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut plan = GraphPlan::default();
        for def in &self.layers {
            if plan.shapes.contains_key(&def.name) {
                return Err(GraphError::DuplicateLayer(def.name.clone()));
            }
            let inputs = def
                .inbound
                .iter()
                .map(|inbound| {
                    plan.shape(inbound).ok_or_else(|| GraphError::UnknownInbound {
                        layer: def.name.clone(),
                        inbound: inbound.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let shape = self.infer_layer(def, &inputs, ops, &mut plan)?;
            plan.shapes.insert(def.name.clone(), shape);
        }

        let mut seen = HashSet::new();
        for name in &self.inputs {
            let is_input = matches!(
                self.layer(name).map(|l| &l.layer),
                Some(LayerKind::Input { .. })
            );
            if !is_input || !seen.insert(name) {
                return Err(GraphError::UnknownEndpoint {
                    role: "input",
                    name: name.clone(),
                });
            }
        }
        if self.inputs.is_empty() {
            return Err(GraphError::UnknownEndpoint {
                role: "input",
                name: String::new(),
            });
        }
        if self.outputs.is_empty() {
            return Err(GraphError::UnknownEndpoint {
                role: "output",
                name: String::new(),
            });
        }
        for name in &self.outputs {
            if !plan.shapes.contains_key(name) {
                return Err(GraphError::UnknownEndpoint {
                    role: "output",
                    name: name.clone(),
                });
            }
        }

        Ok(plan)
    }

    fn infer_layer(
        &self,
        def: &LayerDef,
        inputs: &[Hwc],
        ops: &CustomOps,
        plan: &mut GraphPlan,
    ) -> Result<Hwc, GraphError> {
        let layer = def.name.as_str();
        let arity = |expected: &str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(GraphError::Arity {
                    layer: layer.to_string(),
                    expected: expected.to_string(),
                    found: inputs.len(),
                })
            }
        };
        let invalid = |reason: &str| GraphError::InvalidConfig {
            layer: layer.to_string(),
            reason: reason.to_string(),
        };

        match &def.layer {
            LayerKind::Input { shape } => {
                arity("0", inputs.is_empty())?;
                if shape.iter().any(|d| *d == 0) {
                    return Err(invalid("input dimensions must be non-zero"));
                }
                Ok(Hwc::new(shape[0], shape[1], shape[2]))
            }
            LayerKind::Conv2D {
                filters,
                kernel_size,
                strides,
                padding,
                ..
            } => {
                arity("1", inputs.len() == 1)?;
                if *filters == 0 {
                    return Err(invalid("filters must be non-zero"));
                }
                let (h, w) = window_output(layer, inputs[0], *kernel_size, *strides, *padding)?;
                Ok(Hwc::new(h, w, *filters))
            }
            LayerKind::DepthwiseConv2D {
                kernel_size,
                strides,
                padding,
                ..
            } => {
                arity("1", inputs.len() == 1)?;
                let (h, w) = window_output(layer, inputs[0], *kernel_size, *strides, *padding)?;
                Ok(Hwc::new(h, w, inputs[0].channels))
            }
            LayerKind::BatchNormalization { epsilon } => {
                arity("1", inputs.len() == 1)?;
                if !epsilon.is_finite() || *epsilon < 0.0 {
                    return Err(invalid("epsilon must be a non-negative finite number"));
                }
                Ok(inputs[0])
            }
            LayerKind::Activation { .. } => {
                arity("1", inputs.len() == 1)?;
                Ok(inputs[0])
            }
            LayerKind::Add => {
                arity("at least 2", inputs.len() >= 2)?;
                if inputs.iter().any(|s| *s != inputs[0]) {
                    return Err(GraphError::Shape {
                        layer: layer.to_string(),
                        detail: format!("add operands differ in shape: {inputs:?}"),
                    });
                }
                Ok(inputs[0])
            }
            LayerKind::Concatenate => {
                arity("at least 2", inputs.len() >= 2)?;
                let first = inputs[0];
                if inputs
                    .iter()
                    .any(|s| s.height != first.height || s.width != first.width)
                {
                    return Err(GraphError::Shape {
                        layer: layer.to_string(),
                        detail: format!("concatenated inputs differ spatially: {inputs:?}"),
                    });
                }
                let channels = inputs.iter().map(|s| s.channels).sum();
                Ok(Hwc::new(first.height, first.width, channels))
            }
            LayerKind::MaxPooling2D {
                pool_size,
                strides,
                padding,
            } => {
                arity("1", inputs.len() == 1)?;
                let strides = strides.unwrap_or(*pool_size);
                let (h, w) = window_output(layer, inputs[0], *pool_size, strides, *padding)?;
                Ok(Hwc::new(h, w, inputs[0].channels))
            }
            LayerKind::Custom {
                function,
                arguments,
            } => {
                arity("1", inputs.len() == 1)?;
                let primitive = ops.resolve(layer, function, arguments)?;
                plan.primitives.insert(layer.to_string(), primitive);
                Ok(primitive.output_hwc(inputs[0]))
            }
        }
    }
}

fn window_output(
    layer: &str,
    input: Hwc,
    kernel: [usize; 2],
    strides: [usize; 2],
    padding: Padding,
) -> Result<(usize, usize), GraphError> {
    if kernel.contains(&0) || strides.contains(&0) {
        return Err(GraphError::InvalidConfig {
            layer: layer.to_string(),
            reason: "kernel size and strides must be non-zero".to_string(),
        });
    }
    let too_small = || GraphError::Shape {
        layer: layer.to_string(),
        detail: format!("window {kernel:?} does not fit input {input:?}"),
    };
    let h = padding
        .output_len(input.height, kernel[0], strides[0])
        .ok_or_else(too_small)?;
    let w = padding
        .output_len(input.width, kernel[1], strides[1])
        .ok_or_else(too_small)?;
    Ok((h, w))
}

/// Architecture plus trained parameters, keyed `"<layer>/<param>"`.
#[derive(Clone, Debug, PartialEq)]
pub struct Model {
    pub architecture: Architecture,
    pub weights: BTreeMap<String, Tensor>,
}

impl Model {
    pub fn weight_key(layer: &str, param: &str) -> String {
        format!("{layer}/{param}")
    }

    pub fn weight(&self, layer: &str, param: &str) -> Option<&Tensor> {
        self.weights.get(&Self::weight_key(layer, param))
    }

    /// Structural validation plus presence, dtype and shape of every weight.
    pub fn validate(&self, ops: &CustomOps) -> Result<GraphPlan, GraphError> {
        let plan = self.architecture.plan(ops)?;
        for def in &self.architecture.layers {
            let Some(input) = def.inbound.first().and_then(|n| plan.shape(n)) else {
                continue;
            };
            for (param, expected) in def.layer.expected_weights(input) {
                let key = Self::weight_key(&def.name, param);
                let tensor = self
                    .weights
                    .get(&key)
                    .ok_or_else(|| GraphError::MissingWeight {
                        layer: def.name.clone(),
                        weight: param.to_string(),
                    })?;
                if tensor.dtype != crate::DType::F32 {
                    return Err(GraphError::WeightDType {
                        name: key,
                        found: tensor.dtype.as_str(),
                    });
                }
                if tensor.shape.dims() != expected.as_slice() {
                    return Err(GraphError::WeightShape {
                        name: key,
                        expected,
                        found: tensor.shape.dims().to_vec(),
                    });
                }
            }
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resize_arch(size: usize) -> Architecture {
        Architecture {
            name: "resize-only".to_string(),
            layers: vec![
                LayerDef::new("image", LayerKind::Input { shape: [8, 8, 3] }, &[]),
                LayerDef::new(
                    "resize",
                    LayerKind::Custom {
                        function: crate::BILINEAR_RESIZE.to_string(),
                        arguments: json!({ "size": size }),
                    },
                    &["image"],
                ),
            ],
            inputs: vec!["image".to_string()],
            outputs: vec!["resize".to_string()],
        }
    }

    #[test]
    fn same_padding_matches_ceil_division() {
        assert_eq!(Padding::Same.output_len(7, 3, 2), Some(4));
        assert_eq!(Padding::Same.pad_before(7, 3, 2), 1);
        assert_eq!(Padding::Same.output_len(8, 3, 2), Some(4));
        // total padding 1 goes entirely after the input
        assert_eq!(Padding::Same.pad_before(8, 3, 2), 0);
        assert_eq!(Padding::Valid.output_len(7, 3, 2), Some(3));
        assert_eq!(Padding::Valid.output_len(2, 3, 1), None);
    }

    #[test]
    fn plan_resolves_custom_resize() {
        let plan = resize_arch(157)
            .plan(&CustomOps::standard(None))
            .unwrap();
        assert_eq!(plan.shape("resize"), Some(Hwc::new(157, 157, 3)));
        assert!(plan.primitives.contains_key("resize"));
    }

    #[test]
    fn plan_without_registration_fails() {
        let err = resize_arch(157).plan(&CustomOps::new()).unwrap_err();
        assert!(matches!(err, GraphError::UnresolvedOperation { .. }));
    }

    #[test]
    fn forward_references_are_rejected() {
        let mut arch = resize_arch(4);
        arch.layers.swap(0, 1);
        let err = arch.plan(&CustomOps::standard(None)).unwrap_err();
        assert!(matches!(err, GraphError::UnknownInbound { .. }));
    }

    #[test]
    fn layer_json_uses_keras_style_tags() {
        let def = LayerDef::new(
            "conv",
            LayerKind::Conv2D {
                filters: 4,
                kernel_size: [3, 3],
                strides: [1, 1],
                padding: Padding::Same,
                activation: Activation::Relu,
                use_bias: true,
            },
            &["image"],
        );
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["layer"]["class_name"], "Conv2D");
        assert_eq!(value["layer"]["config"]["padding"], "same");

        let parsed: LayerDef = serde_json::from_value(json!({
            "name": "pool",
            "layer": { "class_name": "MaxPooling2D", "config": { "pool_size": [2, 2] } },
            "inbound": ["conv"]
        }))
        .unwrap();
        assert_eq!(
            parsed.layer,
            LayerKind::MaxPooling2D {
                pool_size: [2, 2],
                strides: None,
                padding: Padding::Valid
            }
        );
    }

    #[test]
    fn missing_weight_is_reported() {
        let arch = Architecture {
            name: "conv".to_string(),
            layers: vec![
                LayerDef::new("image", LayerKind::Input { shape: [4, 4, 1] }, &[]),
                LayerDef::new(
                    "conv",
                    LayerKind::Conv2D {
                        filters: 2,
                        kernel_size: [1, 1],
                        strides: [1, 1],
                        padding: Padding::Valid,
                        activation: Activation::Linear,
                        use_bias: false,
                    },
                    &["image"],
                ),
            ],
            inputs: vec!["image".to_string()],
            outputs: vec!["conv".to_string()],
        };
        let model = Model {
            architecture: arch,
            weights: BTreeMap::new(),
        };
        let err = model.validate(&CustomOps::new()).unwrap_err();
        assert!(matches!(err, GraphError::MissingWeight { ref weight, .. } if weight == "kernel"));
    }
}
