use std::path::Path;

use liteport_checkpoint::fixtures;
use liteport_core::{CustomOps, LoadError, PipelineError, WriteError};
use liteport_flat::{BuiltinOp, FlatModel, OpOptions, Quantize};
use liteport_pipeline::{
    verify_files, OverwritePolicy, Pipeline, PipelineConfig, DEFAULT_TOLERANCE,
};
use tempfile::TempDir;

fn config_in(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        input: dir.join("slim.ckpt"),
        intermediate: dir.join("slim.intermediate"),
        output: dir.join("slim.lpfb"),
        ..PipelineConfig::default()
    }
}

fn run(config: &PipelineConfig) -> Result<liteport_pipeline::PipelineReport, PipelineError> {
    config.validate().expect("test config is valid");
    Pipeline::new(config.clone(), CustomOps::standard(Some(config.resize_size))).run()
}

#[test]
fn converts_checkpoint_and_removes_intermediate() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(dir.path());
    fixtures::write_checkpoint(dir.path(), "slim.ckpt", &fixtures::slim_net())?;

    let report = run(&config)?;
    assert_eq!(report.model, "slim-net-mini");
    assert_eq!(report.output, config.output);
    assert!(!config.intermediate.exists());

    let bytes = std::fs::read(&config.output)?;
    assert_eq!(bytes.len(), report.output_bytes);
    let flat = FlatModel::parse(bytes.into())?;
    let resize = flat
        .operators_of(BuiltinOp::ResizeBilinear)
        .next()
        .expect("resize operator");
    assert_eq!(
        resize.options,
        OpOptions::ResizeBilinear {
            align_corners: true,
            half_pixel_centers: false,
        }
    );

    let fidelity = verify_files(
        &config.input,
        &config.output,
        &CustomOps::standard(None),
        3,
        DEFAULT_TOLERANCE,
    )?;
    assert!(fidelity.passed(), "max diff {}", fidelity.max_abs_diff);
    Ok(())
}

#[test]
fn resize_checkpoint_yields_one_aligned_resize() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(dir.path());
    fixtures::write_checkpoint(dir.path(), "slim.ckpt", &fixtures::resize_net(157))?;

    run(&config)?;
    let flat = FlatModel::parse(std::fs::read(&config.output)?.into())?;
    let resizes: Vec<_> = flat.operators_of(BuiltinOp::ResizeBilinear).collect();
    assert_eq!(resizes.len(), 1);
    assert_eq!(
        resizes[0].options,
        OpOptions::ResizeBilinear {
            align_corners: true,
            half_pixel_centers: false,
        }
    );
    let size = flat.constant(resizes[0].inputs[1])?.expect("constant size");
    assert_eq!(size.to_i32()?, vec![157, 157]);
    Ok(())
}

#[test]
fn biases_survive_conversion_bit_for_bit() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(dir.path());
    let model = fixtures::slim_net();
    fixtures::write_checkpoint(dir.path(), "slim.ckpt", &model)?;

    run(&config)?;
    let flat = FlatModel::parse(std::fs::read(&config.output)?.into())?;
    for (index, tensor) in flat.tensors.iter().enumerate() {
        let Some((layer, param)) = tensor.name.split_once('/') else {
            continue;
        };
        if param != "bias" && param != "gamma" && param != "moving_variance" {
            continue;
        }
        let stored = flat.constant(index as i32)?.expect("constant parameter");
        let original = model.weight(layer, param).expect("checkpoint parameter");
        assert_eq!(stored.bytes, original.bytes, "{} changed", tensor.name);
    }
    Ok(())
}

#[test]
fn missing_checkpoint_fails_before_any_file_is_written() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(dir.path());

    let err = run(&config).unwrap_err();
    assert!(matches!(err, PipelineError::Load(LoadError::NotFound(_))));
    assert!(!config.intermediate.exists());
    assert!(!config.output.exists());
    Ok(())
}

#[test]
fn unregistered_resize_fails_at_load() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(dir.path());
    fixtures::write_checkpoint(dir.path(), "slim.ckpt", &fixtures::resize_net(157))?;

    let err = Pipeline::new(config.clone(), CustomOps::new()).run().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Load(LoadError::UnresolvedOperation { .. })
    ));
    assert!(!config.output.exists());
    Ok(())
}

#[test]
fn intermediate_aliasing_the_checkpoint_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    std::fs::create_dir(dir.path().join("sub"))?;
    let config = PipelineConfig {
        intermediate: dir.path().join("sub").join("..").join("slim.ckpt"),
        ..config_in(dir.path())
    };
    fixtures::write_checkpoint(dir.path(), "slim.ckpt", &fixtures::slim_net())?;
    let original = std::fs::read(&config.input)?;

    let err = Pipeline::new(config.clone(), CustomOps::standard(None))
        .run()
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig(_)), "{err}");
    assert_eq!(std::fs::read(&config.input)?, original);
    assert!(!config.output.exists());
    Ok(())
}

#[test]
fn failed_write_keeps_intermediate_and_writes_nothing() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = PipelineConfig {
        output: dir.path().join("missing").join("slim.lpfb"),
        ..config_in(dir.path())
    };
    fixtures::write_checkpoint(dir.path(), "slim.ckpt", &fixtures::slim_net())?;

    let err = run(&config).unwrap_err();
    assert!(matches!(err, PipelineError::Write(WriteError::Io { .. })), "{err}");
    assert!(config.intermediate.exists());
    assert!(!config.output.exists());
    Ok(())
}

#[test]
fn failed_write_removes_intermediate_when_not_kept() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = PipelineConfig {
        output: dir.path().join("missing").join("slim.lpfb"),
        keep_intermediate_on_failure: false,
        ..config_in(dir.path())
    };
    fixtures::write_checkpoint(dir.path(), "slim.ckpt", &fixtures::slim_net())?;

    let err = run(&config).unwrap_err();
    assert!(matches!(err, PipelineError::Write(WriteError::Io { .. })), "{err}");
    assert!(!config.intermediate.exists());
    assert!(!config.output.exists());
    Ok(())
}

#[test]
fn existing_output_is_kept_under_fail_policy() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(dir.path());
    fixtures::write_checkpoint(dir.path(), "slim.ckpt", &fixtures::slim_net())?;
    std::fs::write(&config.output, b"previous model")?;

    let err = run(&config).unwrap_err();
    assert!(matches!(err, PipelineError::Write(WriteError::OutputExists(_))));
    assert_eq!(std::fs::read(&config.output)?, b"previous model");
    assert!(!config.intermediate.exists());

    let replace = PipelineConfig {
        overwrite: OverwritePolicy::Replace,
        ..config.clone()
    };
    run(&replace)?;
    assert_ne!(std::fs::read(&config.output)?, b"previous model");
    Ok(())
}

#[test]
fn repeated_runs_produce_identical_output() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = PipelineConfig {
        overwrite: OverwritePolicy::Replace,
        ..config_in(dir.path())
    };
    fixtures::write_checkpoint(dir.path(), "slim.ckpt", &fixtures::slim_net())?;

    run(&config)?;
    let first = std::fs::read(&config.output)?;
    run(&config)?;
    let second = std::fs::read(&config.output)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn quantized_run_records_scheme() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = PipelineConfig {
        quantize: Quantize::Int8Weights,
        ..config_in(dir.path())
    };
    fixtures::write_checkpoint(dir.path(), "slim.ckpt", &fixtures::slim_net())?;

    run(&config)?;
    let flat = FlatModel::parse(std::fs::read(&config.output)?.into())?;
    assert_eq!(flat.metadata_value("weight_quantization"), Some("int8-weights"));
    Ok(())
}
