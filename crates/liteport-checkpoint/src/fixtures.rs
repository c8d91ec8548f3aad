//! Small deterministic models for tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use liteport_core::{
    Activation, Architecture, CustomOps, LayerDef, LayerKind, Model, Padding, Shape, Tensor,
    BILINEAR_RESIZE,
};
use serde_json::json;

use crate::{save_checkpoint, TrainingState};

/// Single input, single output: one corner-aligned resize to `size x size`.
pub fn resize_net(size: usize) -> Model {
    let architecture = Architecture {
        name: format!("resize-{size}"),
        layers: vec![
            LayerDef::new("image", LayerKind::Input { shape: [8, 8, 3] }, &[]),
            LayerDef::new(
                "resize",
                LayerKind::Custom {
                    function: BILINEAR_RESIZE.to_string(),
                    arguments: json!({ "size": size }),
                },
                &["image"],
            ),
        ],
        inputs: vec!["image".to_string()],
        outputs: vec!["resize".to_string()],
    };
    Model {
        architecture,
        weights: BTreeMap::new(),
    }
}

/// A miniature segmentation net touching every supported layer kind.
pub fn slim_net() -> Model {
    let conv = |filters, kernel: usize, strides: usize, padding, activation, use_bias| LayerKind::Conv2D {
        filters,
        kernel_size: [kernel, kernel],
        strides: [strides, strides],
        padding,
        activation,
        use_bias,
    };
    let layers = vec![
        LayerDef::new("image", LayerKind::Input { shape: [16, 16, 3] }, &[]),
        LayerDef::new("stem", conv(8, 3, 2, Padding::Same, Activation::Relu, true), &["image"]),
        LayerDef::new(
            "dw",
            LayerKind::DepthwiseConv2D {
                kernel_size: [3, 3],
                strides: [1, 1],
                padding: Padding::Same,
                activation: Activation::Linear,
                use_bias: false,
            },
            &["stem"],
        ),
        LayerDef::new("dw_bn", LayerKind::BatchNormalization { epsilon: 1e-3 }, &["dw"]),
        LayerDef::new(
            "dw_relu",
            LayerKind::Activation {
                activation: Activation::Relu6,
            },
            &["dw_bn"],
        ),
        LayerDef::new(
            "project",
            conv(8, 1, 1, Padding::Valid, Activation::Linear, true),
            &["dw_relu"],
        ),
        LayerDef::new("residual", LayerKind::Add, &["stem", "project"]),
        LayerDef::new(
            "pool",
            LayerKind::MaxPooling2D {
                pool_size: [2, 2],
                strides: None,
                padding: Padding::Valid,
            },
            &["residual"],
        ),
        LayerDef::new(
            "gate",
            conv(4, 1, 1, Padding::Valid, Activation::Sigmoid, true),
            &["pool"],
        ),
        LayerDef::new("merged", LayerKind::Concatenate, &["pool", "gate"]),
        LayerDef::new(
            "head",
            conv(2, 3, 1, Padding::Same, Activation::Linear, false),
            &["merged"],
        ),
        LayerDef::new(
            "upsample",
            LayerKind::Custom {
                function: BILINEAR_RESIZE.to_string(),
                arguments: json!({ "size": 16 }),
            },
            &["head"],
        ),
        LayerDef::new(
            "mask",
            LayerKind::Activation {
                activation: Activation::Sigmoid,
            },
            &["upsample"],
        ),
    ];
    let architecture = Architecture {
        name: "slim-net-mini".to_string(),
        layers,
        inputs: vec!["image".to_string()],
        outputs: vec!["mask".to_string()],
    };

    let plan = architecture
        .plan(&CustomOps::standard(None))
        .expect("fixture architecture is valid");
    let mut weights = BTreeMap::new();
    let mut seed = 1u64;
    for def in &architecture.layers {
        let Some(input) = def.inbound.first().and_then(|n| plan.shape(n)) else {
            continue;
        };
        for (param, dims) in def.layer.expected_weights(input) {
            seed += 1;
            let count = dims.iter().product::<usize>();
            let values = match param {
                "gamma" => ramp(count, seed, 0.5, 1.5),
                "moving_variance" => ramp(count, seed, 0.25, 2.0),
                _ => ramp(count, seed, -0.5, 0.5),
            };
            let tensor =
                Tensor::from_f32(Shape::from_slice(&dims), &values).expect("fixture weight shape");
            weights.insert(Model::weight_key(&def.name, param), tensor);
        }
    }

    Model {
        architecture,
        weights,
    }
}

/// Adam-style training state with one pair of slots per weight.
pub fn training_state(model: &Model) -> TrainingState {
    let mut slots = BTreeMap::new();
    for (name, tensor) in &model.weights {
        let values = vec![0.125f32; tensor.shape.numel()];
        let slot = Tensor::from_f32(tensor.shape.clone(), &values).expect("slot shape");
        slots.insert(format!("{name}/m"), slot.clone());
        slots.insert(format!("{name}/v"), slot);
    }
    TrainingState {
        config: json!({
            "optimizer": { "class_name": "Adam", "config": { "learning_rate": 0.001 } },
            "loss": "binary_crossentropy",
            "metrics": ["accuracy"],
        }),
        slots,
    }
}

pub fn write_checkpoint(dir: &Path, file: &str, model: &Model) -> anyhow::Result<PathBuf> {
    let path = dir.join(file);
    save_checkpoint(model, &training_state(model), &path)?;
    Ok(path)
}

/// `count` values in `[lo, hi)` from a fixed LCG sequence.
fn ramp(count: usize, seed: u64, lo: f32, hi: f32) -> Vec<f32> {
    let mut state = seed;
    (0..count)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
            lo + unit * (hi - lo)
        })
        .collect()
}
