use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use liteport_checkpoint::CheckpointLoader;
use liteport_core::{CustomOps, InferenceModel, ModelArtifact, ModelLoader};
use liteport_flat::FlatLoader;
use tracing::{debug, info};

pub const DEFAULT_TOLERANCE: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FidelityReport {
    pub samples: usize,
    /// Largest element-wise difference over every output of every sample.
    pub max_abs_diff: f32,
    pub tolerance: f32,
}

impl FidelityReport {
    pub fn passed(&self) -> bool {
        self.max_abs_diff <= self.tolerance
    }
}

/// Run `samples` deterministic inputs through both models and compare
/// their outputs element by element.
pub fn verify_fidelity(
    reference: &mut dyn InferenceModel,
    converted: &mut dyn InferenceModel,
    samples: usize,
    tolerance: f32,
) -> Result<FidelityReport> {
    ensure!(samples > 0, "at least one sample is required");
    let specs = reference.spec().inputs.clone();
    let converted_dims = converted
        .spec()
        .inputs
        .iter()
        .map(|s| s.dims.clone())
        .collect::<Vec<_>>();
    ensure!(
        specs.iter().map(|s| s.dims.clone()).collect::<Vec<_>>() == converted_dims,
        "models disagree on input shapes"
    );

    let mut max_abs_diff = 0.0f32;
    for sample in 0..samples {
        let inputs = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| spec.probe(1, (sample * specs.len() + i) as u64))
            .collect::<Result<Vec<_>>>()?;
        let expected = reference
            .infer(inputs.clone())
            .context("reference inference failed")?;
        let actual = converted
            .infer(inputs)
            .context("converted inference failed")?;
        ensure!(
            expected.len() == actual.len(),
            "reference produced {} outputs, converted {}",
            expected.len(),
            actual.len()
        );

        for (index, (e, a)) in expected.iter().zip(&actual).enumerate() {
            if e.shape != a.shape {
                bail!(
                    "output {index} shape differs: {:?} vs {:?}",
                    e.shape.dims(),
                    a.shape.dims()
                );
            }
            for (x, y) in e.to_f32()?.iter().zip(a.to_f32()?) {
                let diff = (x - y).abs();
                max_abs_diff = max_abs_diff.max(if diff.is_nan() { f32::INFINITY } else { diff });
            }
        }
        debug!(sample, max_abs_diff, "compared sample");
    }

    Ok(FidelityReport {
        samples,
        max_abs_diff,
        tolerance,
    })
}

/// Compare a checkpoint (or intermediate) against the flat file made from it.
pub fn verify_files(
    checkpoint: &Path,
    flat: &Path,
    ops: &CustomOps,
    samples: usize,
    tolerance: f32,
) -> Result<FidelityReport> {
    let mut reference = CheckpointLoader::new()
        .load(&ModelArtifact::CheckpointPath(checkpoint.to_path_buf()), ops)
        .with_context(|| format!("loading {}", checkpoint.display()))?;
    let mut converted = FlatLoader::new()
        .load(&ModelArtifact::FlatPath(flat.to_path_buf()), ops)
        .with_context(|| format!("loading {}", flat.display()))?;

    let report = verify_fidelity(&mut reference, &mut converted, samples, tolerance)?;
    info!(
        samples = report.samples,
        max_abs_diff = report.max_abs_diff,
        tolerance = report.tolerance,
        passed = report.passed(),
        "verified fidelity"
    );
    Ok(report)
}
