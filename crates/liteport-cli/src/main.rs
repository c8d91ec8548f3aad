mod cli;

use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use cli::{Cli, Command, ConvertArgs};
use liteport_core::CustomOps;
use liteport_flat::FlatModel;
use liteport_pipeline::{verify_files, OverwritePolicy, Pipeline, PipelineConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log))
        .with_context(|| format!("invalid log filter `{}`", cli.log))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Convert(args) => convert(args),
        Command::Inspect { path } => inspect(&path),
        Command::Verify {
            checkpoint,
            flat,
            samples,
            tolerance,
            resize_size,
        } => {
            let ops = CustomOps::standard(resize_size);
            let report = verify_files(&checkpoint, &flat, &ops, samples, tolerance)?;
            println!(
                "{} samples, max abs diff {:e} (tolerance {:e})",
                report.samples, report.max_abs_diff, report.tolerance
            );
            if !report.passed() {
                bail!("converted model deviates from the checkpoint beyond tolerance");
            }
            Ok(())
        }
    }
}

fn convert(args: ConvertArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(input) = args.input {
        config.input = input;
    }
    if let Some(intermediate) = args.intermediate {
        config.intermediate = intermediate;
    }
    if let Some(output) = args.output {
        config.output = output;
    }
    if let Some(size) = args.resize_size {
        config.resize_size = size;
    }
    if let Some(quantize) = args.quantize {
        config.quantize = quantize;
    }
    if args.force {
        config.overwrite = OverwritePolicy::Replace;
    }
    if let Some(keep) = args.keep_intermediate_on_failure {
        config.keep_intermediate_on_failure = keep;
    }
    config.validate()?;

    let ops = CustomOps::standard(Some(config.resize_size));
    let report = Pipeline::new(config, ops)
        .run()
        .context("conversion failed")?;
    println!(
        "wrote {} ({} bytes) from model {} in {:.1} ms",
        report.output.display(),
        report.output_bytes,
        report.model,
        report.timings.total_us() as f64 / 1000.0
    );
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let model = FlatModel::parse(Bytes::from(raw))
        .with_context(|| format!("parsing {}", path.display()))?;
    print!("{model}");
    println!("  tensors:");
    for (i, tensor) in model.tensors.iter().enumerate() {
        let quant = tensor
            .quantization
            .map(|q| format!(" scale={} zero_point={}", q.scale, q.zero_point))
            .unwrap_or_default();
        println!(
            "  [{i:>3}] {:<32} {:<4} {:?} buffer={}{quant}",
            tensor.name,
            tensor.dtype.as_str(),
            tensor.shape,
            tensor.buffer
        );
    }
    Ok(())
}
