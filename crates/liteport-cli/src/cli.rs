use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use liteport_flat::Quantize;

#[derive(Parser, Debug)]
#[command(name = "liteport", version, about = "Convert trained checkpoints to the flat inference format")]
pub struct Cli {
    /// Log level, used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Convert a checkpoint into a flat model
    Convert(ConvertArgs),

    /// Print the operators, tensors and metadata of a flat model
    Inspect {
        /// Flat model file
        path: PathBuf,
    },

    /// Compare a checkpoint against the flat model converted from it
    Verify {
        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long)]
        flat: PathBuf,

        /// Number of probe inputs
        #[arg(long, default_value_t = 8)]
        samples: usize,

        /// Maximum allowed absolute difference
        #[arg(long, default_value_t = liteport_pipeline::DEFAULT_TOLERANCE)]
        tolerance: f32,

        /// Fallback resize size for layers saved without one
        #[arg(long)]
        resize_size: Option<usize>,
    },
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// TOML file with a [pipeline] table
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Checkpoint to convert
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Where the intermediate model is written
    #[arg(long)]
    pub intermediate: Option<PathBuf>,

    /// Flat model output path
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Resize size for layers saved without one
    #[arg(long)]
    pub resize_size: Option<usize>,

    /// Weight quantization (none or int8-weights)
    #[arg(long)]
    pub quantize: Option<Quantize>,

    /// Replace an existing output file
    #[arg(long)]
    pub force: bool,

    /// Keep the intermediate file when a later stage fails
    #[arg(long)]
    pub keep_intermediate_on_failure: Option<bool>,
}
