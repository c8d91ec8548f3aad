use std::collections::HashMap;

use anyhow::{bail, ensure, Context, Result};
use liteport_core::kernels::{self, FeatureMap, Window};
use liteport_core::{
    Activation, Architecture, CustomOps, GraphPlan, InferenceModel, LayerKind, Model, ModelSpec,
    Primitive, Tensor,
};

enum Params {
    Conv {
        filter: Vec<f32>,
        bias: Option<Vec<f32>>,
    },
    Depthwise {
        filter: Vec<f32>,
        bias: Option<Vec<f32>>,
    },
    BatchNorm {
        gamma: Vec<f32>,
        beta: Vec<f32>,
        mean: Vec<f32>,
        variance: Vec<f32>,
    },
}

/// Reference interpreter over the layer graph of a loaded model.
pub struct GraphModel {
    spec: ModelSpec,
    architecture: Architecture,
    plan: GraphPlan,
    params: HashMap<String, Params>,
}

impl GraphModel {
    pub fn new(model: &Model, ops: &CustomOps) -> Result<Self> {
        let plan = model.validate(ops)?;
        let architecture = model.architecture.clone();

        let weight = |layer: &str, param: &str| -> Result<Vec<f32>> {
            model
                .weight(layer, param)
                .with_context(|| format!("layer `{layer}` is missing `{param}`"))?
                .to_f32()
        };

        let mut params = HashMap::new();
        for def in &architecture.layers {
            let name = def.name.as_str();
            let prepared = match &def.layer {
                LayerKind::Conv2D {
                    filters,
                    kernel_size,
                    use_bias,
                    ..
                } => {
                    let input = def
                        .inbound
                        .first()
                        .and_then(|n| plan.shape(n))
                        .context("conv without input shape")?;
                    let hwio = weight(name, "kernel")?;
                    let filter = kernels::hwio_to_ohwi(
                        &hwio,
                        [kernel_size[0], kernel_size[1], input.channels, *filters],
                    )?;
                    let bias = use_bias.then(|| weight(name, "bias")).transpose()?;
                    Params::Conv { filter, bias }
                }
                LayerKind::DepthwiseConv2D { use_bias, .. } => Params::Depthwise {
                    // [kh, kw, c, 1] has the same element order as [kh, kw, c]
                    filter: weight(name, "depthwise_kernel")?,
                    bias: use_bias.then(|| weight(name, "bias")).transpose()?,
                },
                LayerKind::BatchNormalization { .. } => Params::BatchNorm {
                    gamma: weight(name, "gamma")?,
                    beta: weight(name, "beta")?,
                    mean: weight(name, "moving_mean")?,
                    variance: weight(name, "moving_variance")?,
                },
                _ => continue,
            };
            params.insert(def.name.clone(), prepared);
        }

        Ok(Self {
            spec: plan.model_spec(&architecture),
            architecture,
            plan,
            params,
        })
    }

    fn params(&self, layer: &str) -> Result<&Params> {
        self.params
            .get(layer)
            .with_context(|| format!("no parameters prepared for `{layer}`"))
    }
}

impl InferenceModel for GraphModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        ensure!(
            inputs.len() == self.architecture.inputs.len(),
            "expected {} inputs, got {}",
            self.architecture.inputs.len(),
            inputs.len()
        );

        let mut values: HashMap<&str, FeatureMap> = HashMap::new();
        for (name, tensor) in self.architecture.inputs.iter().zip(&inputs) {
            let fm = FeatureMap::from_tensor(tensor)?;
            let expected = self.plan.shape(name).context("input without shape")?;
            ensure!(
                fm.hwc == expected,
                "input `{name}` has shape {:?}, expected {:?}",
                fm.hwc,
                expected
            );
            values.insert(name.as_str(), fm);
        }

        for def in &self.architecture.layers {
            let name = def.name.as_str();
            let args = def
                .inbound
                .iter()
                .map(|n| {
                    values
                        .get(n.as_str())
                        .with_context(|| format!("layer `{name}` evaluated before `{n}`"))
                })
                .collect::<Result<Vec<_>>>()?;

            let out = match &def.layer {
                LayerKind::Input { .. } => continue,
                LayerKind::Conv2D {
                    filters,
                    kernel_size,
                    strides,
                    padding,
                    activation,
                    ..
                } => {
                    let Params::Conv { filter, bias } = self.params(name)? else {
                        bail!("layer `{name}` has mismatched parameters");
                    };
                    let window = Window {
                        kernel: *kernel_size,
                        strides: *strides,
                        padding: *padding,
                    };
                    kernels::conv2d(args[0], filter, *filters, bias.as_deref(), window, *activation)?
                }
                LayerKind::DepthwiseConv2D {
                    kernel_size,
                    strides,
                    padding,
                    activation,
                    ..
                } => {
                    let Params::Depthwise { filter, bias } = self.params(name)? else {
                        bail!("layer `{name}` has mismatched parameters");
                    };
                    let window = Window {
                        kernel: *kernel_size,
                        strides: *strides,
                        padding: *padding,
                    };
                    kernels::depthwise_conv2d(args[0], filter, bias.as_deref(), window, *activation)?
                }
                LayerKind::BatchNormalization { epsilon } => {
                    let Params::BatchNorm {
                        gamma,
                        beta,
                        mean,
                        variance,
                    } = self.params(name)?
                    else {
                        bail!("layer `{name}` has mismatched parameters");
                    };
                    kernels::batch_norm(args[0], gamma, beta, mean, variance, *epsilon)?
                }
                LayerKind::Activation { activation } => kernels::activate(args[0], *activation),
                LayerKind::Add => {
                    let mut acc = kernels::add(args[0], args[1], Activation::Linear)?;
                    for rhs in &args[2..] {
                        acc = kernels::add(&acc, rhs, Activation::Linear)?;
                    }
                    acc
                }
                LayerKind::Concatenate => kernels::concat_channels(&args)?,
                LayerKind::MaxPooling2D {
                    pool_size,
                    strides,
                    padding,
                } => {
                    let window = Window {
                        kernel: *pool_size,
                        strides: strides.unwrap_or(*pool_size),
                        padding: *padding,
                    };
                    kernels::max_pool2d(args[0], window)?
                }
                LayerKind::Custom { .. } => {
                    match self.plan.primitives.get(name).context("unresolved custom layer")? {
                        Primitive::ResizeBilinear {
                            size,
                            align_corners,
                            half_pixel_centers,
                        } => kernels::resize_bilinear(args[0], *size, *align_corners, *half_pixel_centers)?,
                    }
                }
            };
            values.insert(name, out);
        }

        self.architecture
            .outputs
            .iter()
            .map(|name| {
                values
                    .get(name.as_str())
                    .with_context(|| format!("output `{name}` was not computed"))?
                    .to_tensor()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use liteport_core::{Hwc, IOName};

    #[test]
    fn spec_describes_graph_endpoints() -> Result<()> {
        let model = GraphModel::new(&fixtures::slim_net(), &CustomOps::standard(None))?;
        let spec = model.spec();
        assert_eq!(spec.inputs.len(), 1);
        assert_eq!(spec.inputs[0].name, IOName("image".to_string()));
        assert_eq!(spec.outputs[0].dims, vec![None, Some(16), Some(16), Some(2)]);
        Ok(())
    }

    #[test]
    fn resize_net_output_is_corner_aligned() -> Result<()> {
        let mut model = GraphModel::new(&fixtures::resize_net(157), &CustomOps::standard(None))?;
        let input = model.spec().inputs[0].probe(1, 7)?;
        let source = FeatureMap::from_tensor(&input)?;
        let outputs = model.infer(vec![input])?;
        let out = FeatureMap::from_tensor(&outputs[0])?;
        assert_eq!(out.hwc, Hwc::new(157, 157, 3));
        for c in 0..3 {
            assert_eq!(out.at(0, 0, 0, c), source.at(0, 0, 0, c));
            assert_eq!(out.at(0, 156, 156, c), source.at(0, 7, 7, c));
        }
        Ok(())
    }

    #[test]
    fn slim_net_runs_batched() -> Result<()> {
        let mut model = GraphModel::new(&fixtures::slim_net(), &CustomOps::standard(None))?;
        let input = model.spec().inputs[0].probe(3, 1)?;
        let outputs = model.infer(vec![input])?;
        assert_eq!(outputs[0].shape.dims(), &[3, 16, 16, 2]);
        // sigmoid head
        assert!(outputs[0].to_f32()?.iter().all(|v| *v > 0.0 && *v < 1.0));
        Ok(())
    }

    #[test]
    fn rejects_wrong_input_shape() -> Result<()> {
        let mut model = GraphModel::new(&fixtures::resize_net(4), &CustomOps::standard(None))?;
        let wrong = liteport_core::TensorSpec::nhwc("image", 4, 4, 3).probe(1, 0)?;
        assert!(model.infer(vec![wrong]).is_err());
        Ok(())
    }
}
