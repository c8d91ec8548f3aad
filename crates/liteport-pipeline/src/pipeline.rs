use std::path::PathBuf;
use std::time::Instant;

use liteport_checkpoint::{load_model, save_intermediate};
use liteport_core::{CustomOps, PipelineError, WriteError};
use liteport_flat::{Converter, ConverterOptions};
use tracing::info;

use crate::{write_atomic, IntermediateFile, OverwritePolicy, PipelineConfig, Stage};

/// Wall-clock time spent in each stage, in microseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timings {
    pub load_us: u64,
    pub reserialize_us: u64,
    pub convert_us: u64,
    pub write_us: u64,
    pub cleanup_us: u64,
}

impl Timings {
    pub fn total_us(&self) -> u64 {
        self.load_us + self.reserialize_us + self.convert_us + self.write_us + self.cleanup_us
    }
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub model: String,
    pub output: PathBuf,
    pub output_bytes: usize,
    pub timings: Timings,
}

pub struct Pipeline {
    config: PipelineConfig,
    ops: CustomOps,
}

fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

impl Pipeline {
    pub fn new(config: PipelineConfig, ops: CustomOps) -> Self {
        Self { config, ops }
    }

    /// Validate the config, then load, re-serialize, convert, write and clean
    /// up. Any failure stops the run before the next stage; the output is
    /// never partially written.
    pub fn run(&self) -> Result<PipelineReport, PipelineError> {
        let config = &self.config;
        config
            .validate()
            .map_err(|err| PipelineError::InvalidConfig(err.to_string()))?;
        if config.overwrite == OverwritePolicy::Fail && config.output.exists() {
            return Err(WriteError::OutputExists(config.output.clone()).into());
        }
        let mut timings = Timings::default();

        info!(stage = %Stage::Load, path = %config.input.display(), "starting");
        let start = Instant::now();
        let model = load_model(&config.input, &self.ops)?;
        timings.load_us = elapsed_us(start);

        info!(stage = %Stage::Reserialize, path = %config.intermediate.display(), "starting");
        let start = Instant::now();
        // guard first, so a partially written intermediate is covered too
        let intermediate =
            IntermediateFile::new(&config.intermediate, config.keep_intermediate_on_failure);
        save_intermediate(&model, intermediate.path())?;
        timings.reserialize_us = elapsed_us(start);

        info!(stage = %Stage::Convert, quantize = %config.quantize, "starting");
        let start = Instant::now();
        let converter = Converter::new(
            self.ops.clone(),
            ConverterOptions {
                quantize: config.quantize,
                description: format!("{} converted by liteport", model.architecture.name),
            },
        );
        let bytes = converter.convert_file(intermediate.path())?;
        timings.convert_us = elapsed_us(start);

        info!(stage = %Stage::Write, path = %config.output.display(), "starting");
        let start = Instant::now();
        write_atomic(&config.output, &bytes, config.overwrite)?;
        timings.write_us = elapsed_us(start);

        info!(stage = %Stage::Cleanup, path = %config.intermediate.display(), "starting");
        let start = Instant::now();
        intermediate.release()?;
        timings.cleanup_us = elapsed_us(start);

        info!(
            model = %model.architecture.name,
            output = %config.output.display(),
            bytes = bytes.len(),
            total_us = timings.total_us(),
            "conversion finished"
        );
        Ok(PipelineReport {
            model: model.architecture.name,
            output: config.output.clone(),
            output_bytes: bytes.len(),
            timings,
        })
    }
}
